use crate::model::{candidate::CandidateKey, store::StorePath, voter::VoterId};

/// Where a poll keeps its data in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPaths {
    pub root: StorePath,
    /// Parent of every `<key>/name` and `<key>/votes` entry.
    pub places: StorePath,
    /// Parent of every `<voter>` entry holding that voter's choice.
    pub votes: StorePath,
}

impl PollPaths {
    /// Paths for the poll named `poll_name`, or `None` if the name is not a valid path segment.
    pub fn new(poll_name: &str) -> Option<Self> {
        let root = StorePath::root(poll_name)?;
        Some(Self {
            places: root.child_trusted("places"),
            votes: root.child_trusted("votes"),
            root,
        })
    }

    pub fn place(&self, key: &CandidateKey) -> StorePath {
        self.places.child_trusted(key)
    }

    pub fn place_name(&self, key: &CandidateKey) -> StorePath {
        self.place(key).child_trusted("name")
    }

    pub fn place_votes(&self, key: &CandidateKey) -> StorePath {
        self.place(key).child_trusted("votes")
    }

    pub fn voter(&self, voter: &VoterId) -> StorePath {
        self.votes.child_trusted(voter.as_str())
    }
}
