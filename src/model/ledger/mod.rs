//! The vote ledger: candidates, one active vote per voter, and the transfer
//! of a vote between two counters.
//!
//! A vote transfer is three independent store operations: increment the
//! new candidate, decrement the previous one, then repoint the voter. Each
//! counter adjustment is atomic on its own key, but nothing spans keys, so a
//! failure or a concurrent client between the steps can leave counts and
//! voter pointers briefly out of agreement.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info, warn};
use rocket::futures::future::try_join;
use rocket::tokio::{self, task::JoinHandle};

use crate::error::{Error, Result, StoreError};
use crate::model::{
    candidate::{Candidate, CandidateKey},
    store::{Adjustment, CounterStore, StoreValue, Subscription},
    voter::{IdentityStore, VoterId},
};

mod observer;
mod paths;
mod state;

pub use observer::ObserverHandle;
pub use paths::PollPaths;
pub use state::LedgerState;

use observer::Observers;

/// What a call to [`VoteLedger::cast_vote`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The key was malformed or names no candidate; nothing was written.
    Ignored,
    /// The voter already counts towards this candidate; nothing was written.
    Unchanged,
    /// The vote was recorded, moving it away from `previous` if there was one.
    Cast {
        previous: Option<CandidateKey>,
        current: CandidateKey,
    },
}

/// A poll's ledger, mirroring the store and writing through to it.
///
/// A background task takes in store changes as they are published, so
/// observers hear about other clients' writes without a local call.
pub struct VoteLedger<S> {
    store: S,
    paths: PollPaths,
    mirror: Arc<Mirror>,
    watcher: JoinHandle<()>,
}

/// The in-memory copy of the poll and everyone watching it.
struct Mirror {
    paths: PollPaths,
    updates: Mutex<Subscription>,
    state: Mutex<LedgerState>,
    observers: Arc<Observers>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Mirror {
    /// Take in the latest store snapshot, if it changed.
    ///
    /// Fails with [`StoreError::Closed`] once the store stops publishing.
    fn sync(&self) -> Result<()> {
        let changed = {
            // Held until the state is replaced, so snapshots apply in order.
            let mut updates = lock(&self.updates);
            match updates.has_changed() {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(_) => return Err(StoreError::Closed.into()),
            }
            let next = LedgerState::from_snapshot(&self.paths, &updates.borrow_and_update());
            self.replace(next)
        };
        if let Some(state) = changed {
            self.observers.notify(&state);
        }
        Ok(())
    }

    fn update(&self, update: impl FnOnce(LedgerState) -> LedgerState) {
        let next = update(lock(&self.state).clone());
        if let Some(state) = self.replace(next) {
            self.observers.notify(&state);
        }
    }

    /// Swap in `next`, returning it iff it differs from the current state.
    fn replace(&self, next: LedgerState) -> Option<LedgerState> {
        let mut state = lock(&self.state);
        if *state == next {
            return None;
        }
        *state = next.clone();
        Some(next)
    }

    fn snapshot(&self) -> LedgerState {
        lock(&self.state).clone()
    }
}

/// Sync `mirror` whenever `wakeups` reports a change, until either goes away.
fn follow(mirror: Weak<Mirror>, mut wakeups: Subscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        while wakeups.changed().await.is_ok() {
            let Some(mirror) = mirror.upgrade() else {
                return;
            };
            if let Err(e) = mirror.sync() {
                warn!("Stopped following poll {}: {e}", mirror.paths.root);
                return;
            }
        }
        if let Some(mirror) = mirror.upgrade() {
            warn!("Store subscription for {} closed", mirror.paths.root);
        }
    })
}

impl<S> VoteLedger<S>
where
    S: CounterStore,
{
    /// Subscribe to the poll at `paths` and build the initial mirror.
    pub async fn open(store: S, paths: PollPaths) -> Result<Self> {
        let mut updates = store.subscribe(&paths.root).await?;
        let state = LedgerState::from_snapshot(&paths, &updates.borrow_and_update());
        debug!(
            "Opened poll {} with {} places",
            paths.root,
            state.candidates().len()
        );
        let wakeups = updates.clone();
        let mirror = Arc::new(Mirror {
            paths: paths.clone(),
            updates: Mutex::new(updates),
            state: Mutex::new(state),
            observers: Arc::default(),
        });
        let watcher = follow(Arc::downgrade(&mirror), wakeups);
        Ok(Self {
            store,
            paths,
            mirror,
            watcher,
        })
    }

    pub fn paths(&self) -> &PollPaths {
        &self.paths
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The current mirror, after taking in any pending store changes.
    pub fn state(&self) -> Result<LedgerState> {
        self.mirror.sync()?;
        Ok(self.mirror.snapshot())
    }

    pub fn leader(&self) -> Result<Option<Candidate>> {
        Ok(self.state()?.leader().cloned())
    }

    /// Call `callback` with the new state after every change to the mirror,
    /// including changes written by other clients of the store.
    pub fn on_change<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&LedgerState) + Send + Sync + 'static,
    {
        self.mirror.observers.register(Arc::new(callback))
    }

    /// Create a new candidate with zero votes.
    ///
    /// Fails with [`Error::InvalidKey`] if the name normalizes to nothing and
    /// with [`Error::DuplicateCandidate`] if its key is taken; neither
    /// overwrites anything in the store.
    pub async fn add_candidate(&self, display_name: &str) -> Result<Candidate> {
        let candidate = Candidate::new(display_name)?;
        let key = &candidate.key;

        if self.state()?.contains(key) {
            return Err(Error::DuplicateCandidate(key.to_string()));
        }

        // Counter first, so the place only becomes visible once complete.
        // The mirror may lag another client's submission, so both writes
        // are insert-if-absent and the name decides who added the place.
        self.store
            .create(&self.paths.place_votes(key), StoreValue::Int(0))
            .await?;
        let created = self
            .store
            .create(&self.paths.place_name(key), candidate.name.as_str().into())
            .await?;
        if !created {
            self.mirror.sync()?;
            return Err(Error::DuplicateCandidate(key.to_string()));
        }
        info!("Added place {key} ({:?})", candidate.name);

        self.mirror.sync()?;
        self.mirror.update(|state| state.with_candidate(&candidate));
        Ok(candidate)
    }

    /// Point `voter`'s single vote at `candidate_key`.
    ///
    /// Malformed or unknown keys and re-votes for the current choice are
    /// no-ops. A store failure part way through leaves whatever steps
    /// already succeeded in place and is returned as
    /// [`Error::StoreUnavailable`].
    pub async fn cast_vote(&self, voter: &VoterId, candidate_key: &str) -> Result<VoteOutcome> {
        let key = match CandidateKey::parse(candidate_key) {
            Some(key) => key,
            None => {
                debug!("{voter} tried to vote for malformed key {candidate_key:?}");
                return Ok(VoteOutcome::Ignored);
            }
        };

        let state = self.state()?;
        if !state.contains(&key) {
            debug!("{voter} tried to vote for unknown place {key}");
            return Ok(VoteOutcome::Ignored);
        }
        let previous = state.vote_of(voter).cloned();
        if previous.as_ref() == Some(&key) {
            return Ok(VoteOutcome::Unchanged);
        }

        self.store
            .adjust(&self.paths.place_votes(&key), Adjustment::Increment)
            .await?;
        if let Some(previous) = &previous {
            self.store
                .adjust(&self.paths.place_votes(previous), Adjustment::Decrement)
                .await?;
        }
        self.store
            .write(&self.paths.voter(voter), key.as_str().into())
            .await?;

        match &previous {
            Some(previous) => info!("{voter} moved their vote from {previous} to {key}"),
            None => info!("{voter} voted for {key}"),
        }

        self.mirror.sync()?;
        self.mirror.update(|state| state.with_vote(voter, &key));
        Ok(VoteOutcome::Cast {
            previous,
            current: key,
        })
    }

    /// Remove every place and every voter choice, then forget the local identity.
    pub async fn delete_poll(&self, identity: &impl IdentityStore) -> Result<()> {
        try_join(
            self.store.remove_tree(&self.paths.places),
            self.store.remove_tree(&self.paths.votes),
        )
        .await?;
        identity.clear();
        warn!("Deleted poll {}", self.paths.root);

        self.mirror.sync()?;
        self.mirror.update(|_| LedgerState::default());
        Ok(())
    }

    /// Fetch the choice previously recorded for `voter`.
    ///
    /// Anything other than a well-formed candidate key counts as no prior vote.
    pub async fn load_previous_vote(&self, voter: &VoterId) -> Result<Option<CandidateKey>> {
        let stored = self.store.read(&self.paths.voter(voter)).await?;
        let key = stored
            .as_ref()
            .and_then(StoreValue::as_text)
            .and_then(CandidateKey::parse);
        match &key {
            Some(key) => {
                debug!("{voter} previously voted for {key}");
                self.mirror.update(|state| state.with_vote(voter, key));
            }
            None if stored.is_some() => warn!("Ignoring malformed vote record for {voter}"),
            None => {}
        }
        Ok(key)
    }
}

impl<S> Drop for VoteLedger<S> {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
