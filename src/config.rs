use std::sync::Arc;

use log::{error, info};
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;
use time::Duration;

use crate::model::{
    ledger::{PollPaths, VoteLedger},
    mongodb::MongoStore,
    store::{CounterStore, MemoryStore},
};

/// A store chosen at runtime.
pub type DynStore = Arc<dyn CounterStore>;

/// The ledger placed into managed state.
pub type SharedLedger = VoteLedger<DynStore>;

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_poll_name")]
    poll_name: String,
    #[serde(default = "default_voter_ttl")]
    voter_ttl: u32,
}

fn default_poll_name() -> String {
    "lunch".to_string()
}

fn default_voter_ttl() -> u32 {
    365
}

impl Config {
    /// Name of the poll; the top-level store path all its data lives under.
    pub fn poll_name(&self) -> &str {
        &self.poll_name
    }

    /// How long a browser keeps its voter identity, configured in days.
    pub fn voter_ttl(&self) -> Duration {
        Duration::days(self.voter_ttl.into())
    }

    /// Store paths for the configured poll.
    pub fn poll_paths(&self) -> Option<PollPaths> {
        PollPaths::new(&self.poll_name)
    }
}

/// A fairing that loads the application config and puts it in managed state.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        if config.poll_paths().is_none() {
            error!(
                "Poll name {:?} must be non-empty and use only letters, digits, '_' or '-'",
                config.poll_name
            );
            return Err(rocket);
        }

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Which counter store backs the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Lives and dies with the process.
    #[default]
    Memory,
    Mongodb,
}

/// Configuration for the store.
#[derive(Deserialize)]
struct StoreConfig {
    #[serde(default)]
    store: StoreKind,
    // secrets
    db_uri: Option<String>,
}

/// A fairing that loads the store config, connects to the store, opens the
/// configured poll and places the resulting [`SharedLedger`] into managed
/// state. Must be attached after [`ConfigFairing`].
pub struct LedgerFairing;

#[rocket::async_trait]
impl Fairing for LedgerFairing {
    fn info(&self) -> Info {
        Info {
            name: "Vote ledger",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<StoreConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load store config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let paths = match rocket.state::<Config>().and_then(Config::poll_paths) {
            Some(paths) => paths,
            None => {
                error!("Application config must be loaded before the ledger");
                return Err(rocket);
            }
        };

        let store: DynStore = match config.store {
            StoreKind::Memory => {
                info!("Using in-memory store; votes will not survive a restart");
                Arc::new(MemoryStore::new())
            }
            StoreKind::Mongodb => {
                let Some(db_uri) = config.db_uri else {
                    error!("`db_uri` must be set to use the MongoDB store");
                    return Err(rocket);
                };
                info!("Loaded database config, connecting...");
                let client = match MongoClient::with_uri_str(db_uri).await {
                    Ok(client) => client,
                    Err(e) => {
                        error!("Failed to connect to database: {e}");
                        return Err(rocket);
                    }
                };
                let db = client.database(&get_database_name());
                Arc::new(MongoStore::new(&db))
            }
        };

        // Open the poll, which also proves the store is reachable.
        let ledger = match VoteLedger::open(store, paths).await {
            Ok(ledger) => ledger,
            Err(e) => {
                error!("Failed to open poll: {e}");
                return Err(rocket);
            }
        };
        let places = match ledger.state() {
            Ok(state) => state.candidates().len(),
            Err(e) => {
                error!("Failed to read poll: {e}");
                return Err(rocket);
            }
        };
        info!("...poll {} online with {places} places", ledger.paths().root);

        // Manage the state.
        rocket = rocket.manage(ledger);
        Ok(rocket)
    }
}

/// Get the name of the database to use (production version).
#[cfg(not(test))]
pub(crate) fn get_database_name() -> String {
    "lunch_poll".to_string()
}

/// Get the name of the database to use (test version).
/// Use a random name to avoid collisions between tests.
#[cfg(test)]
pub(crate) fn get_database_name() -> String {
    let random: u32 = rand::random();
    let db = format!("test{random}");
    info!("Using database {db}");
    db
}
