use rocket::Route;

mod poll;

pub use poll::{NewPlace, PollView};

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(poll::routes());
    routes
}
