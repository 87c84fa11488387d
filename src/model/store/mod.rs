//! The external counter store the ledger persists through.
//!
//! A store is a flat map from slash-separated [`StorePath`]s to
//! [`StoreValue`]s. It offers atomic per-key counter adjustment, plain
//! last-write-wins writes and insert-if-absent writes. It also offers
//! one-time reads, subtree subscriptions and recursive subtree deletion. It never offers atomicity across keys.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use rocket::tokio::sync::watch;
use serde::{Deserialize, Serialize};

use crate::error::Result;

mod memory;

pub use memory::MemoryStore;

/// Full key/value contents of a subtree, in store enumeration order.
pub type Snapshot = BTreeMap<StorePath, StoreValue>;

/// Receiving end of a subtree subscription. Always holds the latest snapshot.
pub type Subscription = watch::Receiver<Snapshot>;

/// A slash-separated location in the store.
///
/// Segments are non-empty and drawn from `[A-Za-z0-9_-]`, so a path never
/// needs escaping when embedded in a query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorePath(String);

impl StorePath {
    /// A top-level path. Returns `None` if the segment is not valid.
    pub fn root(segment: &str) -> Option<Self> {
        valid_segment(segment).then(|| Self(segment.to_string()))
    }

    /// Extend this path by one segment. Returns `None` if the segment is not valid.
    pub fn child(&self, segment: &str) -> Option<Self> {
        valid_segment(segment).then(|| Self(format!("{}/{}", self.0, segment)))
    }

    /// Extend this path by a segment already known to be valid, such as a
    /// candidate key or voter ID.
    pub(crate) fn child_trusted(&self, segment: &str) -> Self {
        debug_assert!(valid_segment(segment), "invalid path segment {segment:?}");
        Self(format!("{}/{}", self.0, segment))
    }

    /// True iff `self` is `prefix` or lies underneath it.
    pub fn is_within(&self, prefix: &StorePath) -> bool {
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// True iff one of the two paths lies within the other.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.is_within(other) || other.is_within(self)
    }

    /// Segments of `self` below `prefix`, or `None` if `self` is not within it.
    pub fn segments_below<'a>(&'a self, prefix: &StorePath) -> Option<Vec<&'a str>> {
        if !self.is_within(prefix) {
            return None;
        }
        let rest = &self.0[prefix.0.len()..];
        Some(rest.split('/').filter(|s| !s.is_empty()).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StorePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A value held at a single path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl StoreValue {
    /// Interpret the value as a vote count. Non-numeric values are `None`;
    /// negative numbers clamp to zero.
    pub fn as_count(&self) -> Option<u64> {
        match *self {
            Self::Int(n) => Some(n.max(0) as u64),
            Self::Float(f) if f.is_finite() => Some(f.max(0.0) as u64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for StoreValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<u64> for StoreValue {
    fn from(n: u64) -> Self {
        Self::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

/// A single atomic read-modify-write on a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// Add one; an absent or non-numeric value becomes 1.
    Increment,
    /// Subtract one, never going below zero; an absent or non-numeric value becomes 0.
    Decrement,
}

impl Adjustment {
    /// Apply to the current value of a counter, returning the new count.
    pub fn apply(self, current: Option<&StoreValue>) -> u64 {
        match (self, current.and_then(StoreValue::as_count)) {
            (Self::Increment, Some(n)) => n.saturating_add(1),
            (Self::Increment, None) => 1,
            (Self::Decrement, Some(n)) => n.saturating_sub(1),
            (Self::Decrement, None) => 0,
        }
    }
}

/// Keyed storage the ledger depends on.
#[rocket::async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically adjust the counter at `path`, returning its new value.
    async fn adjust(&self, path: &StorePath, adjustment: Adjustment) -> Result<u64>;

    /// Unconditionally overwrite the value at `path`.
    async fn write(&self, path: &StorePath, value: StoreValue) -> Result<()>;

    /// Atomically set `path` to `value` unless it already holds something.
    /// Returns true iff this call stored the value.
    async fn create(&self, path: &StorePath, value: StoreValue) -> Result<bool>;

    /// Read the value at `path` once.
    async fn read(&self, path: &StorePath) -> Result<Option<StoreValue>>;

    /// Subscribe to the subtree at `prefix`. The returned receiver starts
    /// with the current contents and is updated after every change.
    async fn subscribe(&self, prefix: &StorePath) -> Result<Subscription>;

    /// Delete `prefix` and everything underneath it.
    async fn remove_tree(&self, prefix: &StorePath) -> Result<()>;
}

#[rocket::async_trait]
impl<S> CounterStore for Arc<S>
where
    S: CounterStore + ?Sized,
{
    async fn adjust(&self, path: &StorePath, adjustment: Adjustment) -> Result<u64> {
        (**self).adjust(path, adjustment).await
    }

    async fn write(&self, path: &StorePath, value: StoreValue) -> Result<()> {
        (**self).write(path, value).await
    }

    async fn create(&self, path: &StorePath, value: StoreValue) -> Result<bool> {
        (**self).create(path, value).await
    }

    async fn read(&self, path: &StorePath) -> Result<Option<StoreValue>> {
        (**self).read(path).await
    }

    async fn subscribe(&self, prefix: &StorePath) -> Result<Subscription> {
        (**self).subscribe(prefix).await
    }

    async fn remove_tree(&self, prefix: &StorePath) -> Result<()> {
        (**self).remove_tree(prefix).await
    }
}

/// Sending half of a subscription, as kept by a store implementation.
pub(crate) struct Subscriber {
    pub prefix: StorePath,
    pub sender: Arc<watch::Sender<Snapshot>>,
}

impl Subscriber {
    /// Create a subscriber seeded with `initial`.
    pub fn new(prefix: StorePath, initial: Snapshot) -> (Self, Subscription) {
        let (sender, receiver) = watch::channel(initial);
        let subscriber = Self {
            prefix,
            sender: Arc::new(sender),
        };
        (subscriber, receiver)
    }

    /// The portion of `all` this subscriber cares about.
    pub fn filter(&self, all: &Snapshot) -> Snapshot {
        all.iter()
            .filter(|(path, _)| path.is_within(&self.prefix))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect()
    }
}
