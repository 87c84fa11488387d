#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{Build, Rocket};

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;

pub use config::Config;

use config::{ConfigFairing, LedgerFairing, SharedLedger};
use logging::LoggerFairing;

/// The full server: routes, logging, config and a ledger over the configured store.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(LedgerFairing)
}

/// The server around an already opened ledger.
pub fn rocket_for_ledger(ledger: SharedLedger) -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .manage(ledger)
}

#[cfg(test)]
pub(crate) async fn rocket_for_memory_store() -> Rocket<Build> {
    use std::sync::Arc;

    use model::{
        ledger::{PollPaths, VoteLedger},
        store::MemoryStore,
    };

    let paths = PollPaths::new("test").unwrap();
    let store: config::DynStore = Arc::new(MemoryStore::new());
    let ledger = VoteLedger::open(store, paths).await.unwrap();
    rocket_for_ledger(ledger)
}

/// A fresh database on the server named by `DB_URI`.
#[cfg(test)]
pub(crate) async fn test_database() -> mongodb::Database {
    let db_uri =
        std::env::var("DB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    let client = mongodb::Client::with_uri_str(&db_uri).await.unwrap();
    client.database(&config::get_database_name())
}
