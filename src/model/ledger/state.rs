use std::collections::HashMap;

use log::warn;

use super::PollPaths;
use crate::model::{
    candidate::{Candidate, CandidateKey},
    store::Snapshot,
    voter::VoterId,
};

/// In-memory mirror of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    /// Candidates in store enumeration order.
    candidates: Vec<Candidate>,
    votes: HashMap<VoterId, CandidateKey>,
}

/// A place entry while its fields are being gathered from a snapshot.
#[derive(Default)]
struct PartialPlace<'a> {
    name: Option<&'a str>,
    votes: Option<u64>,
}

impl LedgerState {
    /// Rebuild the mirror from a snapshot of the poll's subtree.
    ///
    /// Place entries without a textual name are skipped. Missing or
    /// non-numeric vote counts read as zero. Voter entries that do not hold
    /// a well-formed candidate key are ignored.
    pub fn from_snapshot(paths: &PollPaths, snapshot: &Snapshot) -> Self {
        let mut order: Vec<&str> = Vec::new();
        let mut places: HashMap<&str, PartialPlace> = HashMap::new();
        let mut votes = HashMap::new();

        for (path, value) in snapshot {
            if let Some(segments) = path.segments_below(&paths.places) {
                let (key, field) = match segments.as_slice() {
                    [key, field] => (*key, *field),
                    _ => continue,
                };
                let place = places.entry(key).or_insert_with(|| {
                    order.push(key);
                    PartialPlace::default()
                });
                match field {
                    "name" => place.name = value.as_text(),
                    "votes" => place.votes = value.as_count(),
                    _ => {}
                }
            } else if let Some(segments) = path.segments_below(&paths.votes) {
                if let [voter] = segments.as_slice() {
                    let voter = VoterId::parse(voter);
                    let choice = value.as_text().and_then(CandidateKey::parse);
                    if let (Some(voter), Some(choice)) = (voter, choice) {
                        votes.insert(voter, choice);
                    }
                }
            }
        }

        let candidates = order
            .into_iter()
            .filter_map(|raw_key| {
                let place = places.remove(raw_key)?;
                match (CandidateKey::parse(raw_key), place.name) {
                    (Some(key), Some(name)) => Some(Candidate {
                        key,
                        name: name.to_string(),
                        votes: place.votes.unwrap_or(0),
                    }),
                    _ => {
                        warn!("Skipping invalid place entry at key {raw_key:?}");
                        None
                    }
                }
            })
            .collect();

        Self { candidates, votes }
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn candidate(&self, key: &CandidateKey) -> Option<&Candidate> {
        self.candidates.iter().find(|c| &c.key == key)
    }

    pub fn contains(&self, key: &CandidateKey) -> bool {
        self.candidate(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// The candidate `voter` currently counts towards, as far as this mirror knows.
    pub fn vote_of(&self, voter: &VoterId) -> Option<&CandidateKey> {
        self.votes.get(voter)
    }

    /// Every recorded voter choice.
    pub fn votes(&self) -> impl Iterator<Item = (&VoterId, &CandidateKey)> {
        self.votes.iter()
    }

    /// The candidate with the strictly highest count. On a tie the one
    /// enumerated first wins, which depends on the store's ordering.
    pub fn leader(&self) -> Option<&Candidate> {
        self.candidates.iter().fold(None, |best, candidate| match best {
            Some(best) if candidate.votes <= best.votes => Some(best),
            _ => Some(candidate),
        })
    }

    pub fn total_votes(&self) -> u64 {
        self.candidates.iter().map(|c| c.votes).sum()
    }

    /// This state with `voter` pointing at `key`.
    pub(crate) fn with_vote(mut self, voter: &VoterId, key: &CandidateKey) -> Self {
        self.votes.insert(voter.clone(), key.clone());
        self
    }

    /// This state with `candidate` appended, unless its key is already present.
    pub(crate) fn with_candidate(mut self, candidate: &Candidate) -> Self {
        if !self.contains(&candidate.key) {
            self.candidates.push(candidate.clone());
        }
        self
    }
}
