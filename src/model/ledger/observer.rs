use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::LedgerState;

type Callback = Arc<dyn Fn(&LedgerState) + Send + Sync>;

/// Registered change callbacks.
#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

impl Observers {
    pub fn register(self: &Arc<Self>, callback: Callback) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, callback));
        ObserverHandle {
            id,
            observers: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(other, _)| *other != id);
    }

    /// Invoke every callback with `state`. Callbacks run without the
    /// registry locked, so they may register or unsubscribe.
    pub fn notify(&self, state: &LedgerState) {
        let callbacks: Vec<Callback> = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(state);
        }
    }
}

/// Keeps a change callback registered. Dropping it unsubscribes.
#[must_use = "the callback is unsubscribed as soon as the handle is dropped"]
pub struct ObserverHandle {
    id: u64,
    observers: Weak<Observers>,
}

impl ObserverHandle {
    pub fn unsubscribe(self) {
        drop(self)
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.remove(self.id);
        }
    }
}
