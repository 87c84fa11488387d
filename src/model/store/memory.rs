use std::sync::{Mutex, MutexGuard};

use log::trace;

use super::{
    Adjustment, CounterStore, Snapshot, StorePath, StoreValue, Subscriber, Subscription,
};
use crate::error::Result;

/// A store living entirely in process memory.
///
/// Each operation runs under a single lock, so every adjustment is atomic
/// with respect to every other operation on the same store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: Snapshot,
    subscribers: Vec<Subscriber>,
}

impl Inner {
    /// Push fresh snapshots to every live subscriber whose subtree overlaps `changed`.
    fn publish(&mut self, changed: &StorePath) {
        self.subscribers.retain(|s| !s.sender.is_closed());
        for subscriber in &self.subscribers {
            if subscriber.prefix.overlaps(changed) {
                subscriber.sender.send_replace(subscriber.filter(&self.entries));
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Everything currently stored.
    pub fn dump(&self) -> Snapshot {
        self.lock().entries.clone()
    }
}

#[rocket::async_trait]
impl CounterStore for MemoryStore {
    async fn adjust(&self, path: &StorePath, adjustment: Adjustment) -> Result<u64> {
        let mut inner = self.lock();
        let next = adjustment.apply(inner.entries.get(path));
        inner.entries.insert(path.clone(), next.into());
        inner.publish(path);
        trace!("{adjustment:?} {path} -> {next}");
        Ok(next)
    }

    async fn write(&self, path: &StorePath, value: StoreValue) -> Result<()> {
        let mut inner = self.lock();
        inner.entries.insert(path.clone(), value);
        inner.publish(path);
        Ok(())
    }

    async fn create(&self, path: &StorePath, value: StoreValue) -> Result<bool> {
        let mut inner = self.lock();
        if inner.entries.contains_key(path) {
            return Ok(false);
        }
        inner.entries.insert(path.clone(), value);
        inner.publish(path);
        Ok(true)
    }

    async fn read(&self, path: &StorePath) -> Result<Option<StoreValue>> {
        Ok(self.lock().entries.get(path).cloned())
    }

    async fn subscribe(&self, prefix: &StorePath) -> Result<Subscription> {
        let mut inner = self.lock();
        let initial = inner
            .entries
            .iter()
            .filter(|(path, _)| path.is_within(prefix))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect();
        let (subscriber, receiver) = Subscriber::new(prefix.clone(), initial);
        inner.subscribers.push(subscriber);
        Ok(receiver)
    }

    async fn remove_tree(&self, prefix: &StorePath) -> Result<()> {
        let mut inner = self.lock();
        inner.entries.retain(|path, _| !path.is_within(prefix));
        inner.publish(prefix);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn votes(key: &str) -> StorePath {
        StorePath::root("poll")
            .and_then(|p| p.child("places"))
            .and_then(|p| p.child(key))
            .and_then(|p| p.child("votes"))
            .unwrap()
    }

    #[rocket::async_test]
    async fn adjust_is_read_modify_write() {
        let store = MemoryStore::new();
        assert_eq!(store.adjust(&votes("a"), Adjustment::Increment).await.unwrap(), 1);
        assert_eq!(store.adjust(&votes("a"), Adjustment::Increment).await.unwrap(), 2);
        assert_eq!(store.adjust(&votes("a"), Adjustment::Decrement).await.unwrap(), 1);
        assert_eq!(store.adjust(&votes("b"), Adjustment::Decrement).await.unwrap(), 0);
        assert_eq!(store.read(&votes("a")).await.unwrap(), Some(StoreValue::Int(1)));
    }

    #[rocket::async_test]
    async fn subscription_tracks_its_subtree_only() {
        let store = MemoryStore::new();
        let places = StorePath::root("poll").and_then(|p| p.child("places")).unwrap();
        let other = StorePath::root("other").unwrap();

        let mut sub = store.subscribe(&places).await.unwrap();
        assert!(sub.borrow_and_update().is_empty());

        store.write(&other, "x".into()).await.unwrap();
        assert!(!sub.has_changed().unwrap());

        store.adjust(&votes("a"), Adjustment::Increment).await.unwrap();
        assert!(sub.has_changed().unwrap());
        let snapshot = sub.borrow_and_update().clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&votes("a")), Some(&StoreValue::Int(1)));
    }

    #[rocket::async_test]
    async fn create_keeps_existing_values() {
        let store = MemoryStore::new();
        let places = StorePath::root("poll").and_then(|p| p.child("places")).unwrap();
        let mut sub = store.subscribe(&places).await.unwrap();
        sub.borrow_and_update();

        assert!(store.create(&votes("a"), StoreValue::Int(0)).await.unwrap());
        assert!(sub.has_changed().unwrap());
        store.adjust(&votes("a"), Adjustment::Increment).await.unwrap();
        sub.borrow_and_update();

        assert!(!store.create(&votes("a"), StoreValue::Int(0)).await.unwrap());
        assert!(!sub.has_changed().unwrap());
        assert_eq!(store.read(&votes("a")).await.unwrap(), Some(StoreValue::Int(1)));
    }

    #[rocket::async_test]
    async fn remove_tree_is_recursive() {
        let store = MemoryStore::new();
        let poll = StorePath::root("poll").unwrap();
        let keep = StorePath::root("pollster").unwrap();
        store.adjust(&votes("a"), Adjustment::Increment).await.unwrap();
        store.write(&keep, "kept".into()).await.unwrap();

        let mut sub = store.subscribe(&poll).await.unwrap();
        store.remove_tree(&poll).await.unwrap();

        assert!(sub.borrow_and_update().is_empty());
        assert_eq!(store.read(&votes("a")).await.unwrap(), None);
        assert_eq!(store.read(&keep).await.unwrap(), Some("kept".into()));
    }
}
