use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use rand::{distributions::Alphanumeric, Rng};
use rocket::http::{Cookie, CookieJar};
use serde::{Deserialize, Serialize};
use time::Duration;

/// Name of the private cookie holding a browser's voter identity.
pub const VOTER_COOKIE: &str = "voter_id";

const PREFIX: &str = "voter_";
const RANDOM_LEN: usize = 16;
const MAX_LEN: usize = 64;

/// Opaque, durable identity of one voting client.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VoterId(String);

impl VoterId {
    /// Mint a fresh random identity.
    pub fn generate() -> Self {
        let random: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_LEN)
            .map(char::from)
            .collect();
        Self(format!("{PREFIX}{random}"))
    }

    /// Accept a stored identity iff it could safely be used as a store path segment.
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed = !raw.is_empty()
            && raw.len() <= MAX_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        well_formed.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for VoterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for VoterId {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("malformed voter ID {raw:?}"))
    }
}

impl From<VoterId> for String {
    fn from(id: VoterId) -> Self {
        id.0
    }
}

/// Durable storage for the local client's voter identity.
pub trait IdentityStore {
    /// Return the persisted identity, creating and persisting one if needed.
    fn get_or_create(&self) -> VoterId;

    /// Forget the persisted identity; the next `get_or_create` mints a new one.
    fn clear(&self);
}

/// Identity held in process memory, for clients embedding the ledger directly.
#[derive(Debug, Default)]
pub struct MemoryIdentity(Mutex<Option<VoterId>>);

impl MemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current identity without creating one.
    pub fn current(&self) -> Option<VoterId> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl IdentityStore for MemoryIdentity {
    fn get_or_create(&self) -> VoterId {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(VoterId::generate)
            .clone()
    }

    fn clear(&self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Identity persisted in a browser's private cookie.
pub struct CookieIdentity<'a, 'r> {
    cookies: &'a CookieJar<'r>,
    ttl: Duration,
}

impl<'a, 'r> CookieIdentity<'a, 'r> {
    pub fn new(cookies: &'a CookieJar<'r>, ttl: Duration) -> Self {
        Self { cookies, ttl }
    }

    /// The identity already held by the browser, if it is well formed.
    pub fn existing(&self) -> Option<VoterId> {
        self.cookies
            .get_private(VOTER_COOKIE)
            .and_then(|cookie| VoterId::parse(cookie.value()))
    }
}

impl IdentityStore for CookieIdentity<'_, '_> {
    fn get_or_create(&self) -> VoterId {
        if let Some(id) = self.existing() {
            return id;
        }
        let id = VoterId::generate();
        let cookie = Cookie::build(VOTER_COOKIE, id.to_string())
            .max_age(self.ttl)
            .http_only(true)
            .finish();
        self.cookies.add_private(cookie);
        id
    }

    fn clear(&self) {
        self.cookies.remove_private(Cookie::named(VOTER_COOKIE));
    }
}
