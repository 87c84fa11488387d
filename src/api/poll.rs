use rocket::{
    http::{CookieJar, Status},
    serde::json::Json,
    Route, State,
};
use serde::{Deserialize, Serialize};

use crate::{
    config::SharedLedger,
    error::{Error, Result},
    model::{
        candidate::{Candidate, CandidateKey},
        ledger::LedgerState,
        voter::{CookieIdentity, IdentityStore, VoterId},
    },
    Config,
};

pub fn routes() -> Vec<Route> {
    routes![poll, add_place, previous_vote, vote, delete_poll]
}

/// Everything a client needs to render the poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollView {
    pub candidates: Vec<Candidate>,
    pub leader: Option<Candidate>,
    /// The requesting browser's current choice.
    pub your_vote: Option<CandidateKey>,
}

impl PollView {
    fn new(state: &LedgerState, voter: Option<&VoterId>) -> Self {
        Self {
            candidates: state.candidates().to_vec(),
            leader: state.leader().cloned(),
            your_vote: voter.and_then(|voter| state.vote_of(voter)).cloned(),
        }
    }
}

/// A place submitted by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPlace {
    pub name: String,
}

#[get("/poll")]
fn poll(
    cookies: &CookieJar<'_>,
    ledger: &State<SharedLedger>,
    config: &State<Config>,
) -> Result<Json<PollView>> {
    let voter = CookieIdentity::new(cookies, config.voter_ttl()).existing();
    Ok(Json(PollView::new(&ledger.state()?, voter.as_ref())))
}

#[post("/poll/places", data = "<place>", format = "json")]
async fn add_place(
    place: Json<NewPlace>,
    ledger: &State<SharedLedger>,
) -> Result<(Status, Json<Candidate>)> {
    let candidate = ledger.add_candidate(&place.name).await?;
    Ok((Status::Created, Json(candidate)))
}

#[get("/poll/vote")]
async fn previous_vote(
    cookies: &CookieJar<'_>,
    ledger: &State<SharedLedger>,
    config: &State<Config>,
) -> Result<Json<Option<CandidateKey>>> {
    let voter = match CookieIdentity::new(cookies, config.voter_ttl()).existing() {
        Some(voter) => voter,
        None => return Ok(Json(None)),
    };
    Ok(Json(ledger.load_previous_vote(&voter).await?))
}

#[post("/poll/places/<key>/vote")]
async fn vote(
    key: &str,
    cookies: &CookieJar<'_>,
    ledger: &State<SharedLedger>,
    config: &State<Config>,
) -> Result<Json<PollView>> {
    let state = ledger.state()?;
    if !CandidateKey::parse(key).map_or(false, |key| state.contains(&key)) {
        return Err(Error::not_found(format!("Place '{key}'")));
    }

    let voter = CookieIdentity::new(cookies, config.voter_ttl()).get_or_create();
    ledger.cast_vote(&voter, key).await?;
    Ok(Json(PollView::new(&ledger.state()?, Some(&voter))))
}

#[delete("/poll?<confirm>")]
async fn delete_poll(
    confirm: Option<bool>,
    cookies: &CookieJar<'_>,
    ledger: &State<SharedLedger>,
    config: &State<Config>,
) -> Result<()> {
    if !confirm.unwrap_or(false) {
        return Err(Error::BadRequest(
            "Deleting the poll must be confirmed with `confirm=true`".to_string(),
        ));
    }
    ledger
        .delete_poll(&CookieIdentity::new(cookies, config.voter_ttl()))
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rocket::{http::ContentType, local::asynchronous::Client};

    use super::*;
    use crate::{
        config::DynStore,
        model::{
            ledger::{PollPaths, VoteLedger},
            store::{Adjustment, CounterStore, MemoryStore, StorePath, StoreValue, Subscription},
            voter::VOTER_COOKIE,
        },
        rocket_for_ledger,
    };

    fn ledger(client: &Client) -> &SharedLedger {
        client.rocket().state::<SharedLedger>().unwrap()
    }

    async fn add(client: &Client, name: &str) -> Status {
        client
            .post(uri!(add_place))
            .header(ContentType::JSON)
            .json(&NewPlace {
                name: name.to_string(),
            })
            .dispatch()
            .await
            .status()
    }

    async fn view(client: &Client) -> PollView {
        let response = client.get(uri!(poll)).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        response.into_json().await.unwrap()
    }

    fn my_voter_id(client: &Client) -> Option<String> {
        client
            .cookies()
            .get_private(VOTER_COOKIE)
            .map(|cookie| cookie.value().to_string())
    }

    fn votes_for(view: &PollView, key: &str) -> u64 {
        view.candidates
            .iter()
            .find(|place| place.key.as_str() == key)
            .unwrap()
            .votes
    }

    #[backend_test]
    async fn empty_poll(client: Client) {
        let view = view(&client).await;
        assert!(view.candidates.is_empty());
        assert_eq!(view.leader, None);
        assert_eq!(view.your_vote, None);
    }

    #[backend_test]
    async fn add_places(client: Client) {
        let response = client
            .post(uri!(add_place))
            .header(ContentType::JSON)
            .json(&NewPlace {
                name: "4 Pines".to_string(),
            })
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        let created: Candidate = response.into_json().await.unwrap();
        assert_eq!(created.key.as_str(), "4_pines");
        assert_eq!(created.name, "4 Pines");

        assert_eq!(add(&client, "4-PINES!").await, Status::Conflict);
        assert_eq!(add(&client, "?!").await, Status::BadRequest);
        assert_eq!(add(&client, "Thai").await, Status::Created);

        let view = view(&client).await;
        assert_eq!(view.candidates.len(), 2);
        assert!(view.candidates.iter().all(|place| place.votes == 0));
    }

    #[backend_test]
    async fn voting_mints_identity_and_transfers(client: Client) {
        add(&client, "A").await;
        add(&client, "B").await;
        assert_eq!(my_voter_id(&client), None);

        let response = client.post(uri!(vote("a"))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let view: PollView = response.into_json().await.unwrap();
        assert_eq!(view.your_vote.as_ref().map(|k| k.as_str()), Some("a"));
        assert_eq!(votes_for(&view, "a"), 1);
        let id = my_voter_id(&client).unwrap();

        // Two other browsers vote for B.
        for other in ["other_1", "other_2"] {
            let other = VoterId::parse(other).unwrap();
            ledger(&client).cast_vote(&other, "b").await.unwrap();
        }

        let response = client.post(uri!(vote("b"))).dispatch().await;
        let view: PollView = response.into_json().await.unwrap();
        assert_eq!(votes_for(&view, "a"), 0);
        assert_eq!(votes_for(&view, "b"), 3);
        assert_eq!(view.leader.unwrap().key.as_str(), "b");
        assert_eq!(my_voter_id(&client), Some(id));

        // Clicking the same place again changes nothing.
        let response = client.post(uri!(vote("b"))).dispatch().await;
        let view: PollView = response.into_json().await.unwrap();
        assert_eq!(votes_for(&view, "b"), 3);
    }

    #[backend_test]
    async fn vote_for_unknown_place(client: Client) {
        add(&client, "Thai").await;
        for key in ["pizza", "Thai", "undefined"] {
            let response = client.post(uri!(vote(key))).dispatch().await;
            assert_eq!(response.status(), Status::NotFound, "{key}");
        }
        assert_eq!(my_voter_id(&client), None);
        assert_eq!(view(&client).await.candidates[0].votes, 0);
    }

    #[backend_test]
    async fn previous_vote_round_trip(client: Client) {
        let response = client.get(uri!(previous_vote)).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.into_json::<Option<CandidateKey>>().await.unwrap(), None);

        add(&client, "Thai").await;
        client.post(uri!(vote("thai"))).dispatch().await;

        let response = client.get(uri!(previous_vote)).dispatch().await;
        let previous = response.into_json::<Option<CandidateKey>>().await.unwrap();
        assert_eq!(previous.as_ref().map(|k| k.as_str()), Some("thai"));
    }

    #[backend_test]
    async fn delete_requires_confirmation(client: Client) {
        add(&client, "Thai").await;
        client.post(uri!(vote("thai"))).dispatch().await;
        let id = VoterId::parse(&my_voter_id(&client).unwrap()).unwrap();

        let response = client.delete("/poll").dispatch().await;
        assert_eq!(response.status(), Status::BadRequest);
        let response = client.delete("/poll?confirm=false").dispatch().await;
        assert_eq!(response.status(), Status::BadRequest);
        assert_eq!(view(&client).await.candidates.len(), 1);

        let response = client.delete("/poll?confirm=true").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(my_voter_id(&client), None);

        let view = view(&client).await;
        assert!(view.candidates.is_empty());
        assert_eq!(view.leader, None);
        assert_eq!(ledger(&client).load_previous_vote(&id).await.unwrap(), None);
    }

    /// A store whose counters cannot be adjusted.
    struct CountersDown(MemoryStore);

    #[rocket::async_trait]
    impl CounterStore for CountersDown {
        async fn adjust(&self, _path: &StorePath, _adjustment: Adjustment) -> Result<u64> {
            Err(Error::StoreUnavailable(
                crate::error::StoreError::Other("counters offline".into()),
            ))
        }

        async fn write(&self, path: &StorePath, value: StoreValue) -> Result<()> {
            self.0.write(path, value).await
        }

        async fn create(&self, path: &StorePath, value: StoreValue) -> Result<bool> {
            self.0.create(path, value).await
        }

        async fn read(&self, path: &StorePath) -> Result<Option<StoreValue>> {
            self.0.read(path).await
        }

        async fn subscribe(&self, prefix: &StorePath) -> Result<Subscription> {
            self.0.subscribe(prefix).await
        }

        async fn remove_tree(&self, prefix: &StorePath) -> Result<()> {
            self.0.remove_tree(prefix).await
        }
    }

    #[rocket::async_test]
    async fn store_failure_is_service_unavailable() {
        let store: DynStore = Arc::new(CountersDown(MemoryStore::new()));
        let ledger = VoteLedger::open(store, PollPaths::new("test").unwrap())
            .await
            .unwrap();
        ledger.add_candidate("Thai").await.unwrap();
        let client = Client::tracked(rocket_for_ledger(ledger)).await.unwrap();

        let response = client.post(uri!(vote("thai"))).dispatch().await;
        assert_eq!(response.status(), Status::ServiceUnavailable);

        // Nothing was counted, and the place is still there.
        let view = view(&client).await;
        assert_eq!(view.candidates.len(), 1);
        assert_eq!(view.candidates[0].votes, 0);
        assert_eq!(view.your_vote, None);
    }
}
