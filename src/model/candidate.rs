use std::fmt::{Display, Formatter};
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator that replaces each run of non-alphanumeric characters.
pub const SEPARATOR: char = '_';

/// A key that stands for "no value" in the store and must never name a candidate.
const MISSING_PLACEHOLDER: &str = "undefined";

/// The normalized, unique identifier of a candidate.
///
/// A key is non-empty, consists only of `[a-z0-9_]`, never starts or ends
/// with the separator and never contains two separators in a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "String")]
pub struct CandidateKey(String);

impl CandidateKey {
    /// Derive the key for a display name.
    ///
    /// Lower-cases the name and collapses every maximal run of characters
    /// outside `[a-z0-9]` into a single separator, trimming separators from
    /// both ends.
    pub fn normalize(display_name: &str) -> Result<Self> {
        let mut key = String::with_capacity(display_name.len());
        let mut pending_separator = false;
        for c in display_name.chars().flat_map(char::to_lowercase) {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                if pending_separator && !key.is_empty() {
                    key.push(SEPARATOR);
                }
                pending_separator = false;
                key.push(c);
            } else {
                pending_separator = true;
            }
        }

        if key.is_empty() || key == MISSING_PLACEHOLDER {
            return Err(Error::InvalidKey(display_name.to_string()));
        }
        Ok(Self(key))
    }

    /// Accept an already-normalized key, e.g. one read back from the store.
    /// Returns `None` for anything that is not in canonical form.
    pub fn parse(raw: &str) -> Option<Self> {
        match Self::normalize(raw) {
            Ok(key) if key.0 == raw => Some(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for CandidateKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for CandidateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<CandidateKey> for String {
    fn from(key: CandidateKey) -> Self {
        key.0
    }
}

impl<'de> Deserialize<'de> for CandidateKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("malformed candidate key {raw:?}")))
    }
}

/// A pollable option, as mirrored from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub key: CandidateKey,
    /// Display name as originally submitted.
    pub name: String,
    pub votes: u64,
}

impl Candidate {
    /// A freshly submitted candidate with no votes.
    pub fn new(name: &str) -> Result<Self> {
        let name = name.trim();
        let key = CandidateKey::normalize(name)?;
        Ok(Self {
            key,
            name: name.to_string(),
            votes: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_ignores_case_and_punctuation() {
        let a = CandidateKey::normalize("4 Pines").unwrap();
        let b = CandidateKey::normalize("4-PINES!").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "4_pines");
    }

    #[test]
    fn runs_collapse_to_one_separator() {
        let key = CandidateKey::normalize("  Bánh   mì -- Corner  ").unwrap();
        assert_eq!(key.as_str(), "b_nh_m_corner");
        let key = CandidateKey::normalize("Joe's_Pizza").unwrap();
        assert_eq!(key.as_str(), "joe_s_pizza");
    }

    #[test]
    fn empty_and_placeholder_keys_are_rejected() {
        for name in ["", "   ", "!!!", "--", "undefined", "UNDEFINED.", "日本"] {
            assert!(
                matches!(CandidateKey::normalize(name), Err(Error::InvalidKey(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn parse_accepts_only_canonical_keys() {
        assert_eq!(CandidateKey::parse("4_pines").unwrap().as_str(), "4_pines");
        assert!(CandidateKey::parse("4 pines").is_none());
        assert!(CandidateKey::parse("4__pines").is_none());
        assert!(CandidateKey::parse("_4_pines").is_none());
        assert!(CandidateKey::parse("Pines").is_none());
        assert!(CandidateKey::parse("").is_none());
        assert!(CandidateKey::parse("undefined").is_none());
    }

    #[test]
    fn new_candidate_starts_at_zero() {
        let candidate = Candidate::new("  Thai Express ").unwrap();
        assert_eq!(candidate.name, "Thai Express");
        assert_eq!(candidate.key.as_str(), "thai_express");
        assert_eq!(candidate.votes, 0);
    }
}
