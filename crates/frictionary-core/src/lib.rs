//! Core domain model for Frictionary suggestions and votes.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "frictionary-core";

/// Identity key of a suggestion: `site:title`.
pub fn suggestion_id(site: &str, title: &str) -> String {
    format!("{site}:{title}")
}

/// Freshly extracted article excerpt; the handoff contract from adapters into storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionDraft {
    pub site: String,
    pub title: String,
    pub excerpt: String,
    #[serde(rename = "ref")]
    pub reference_url: String,
    pub fetched_at: DateTime<Utc>,
}

impl SuggestionDraft {
    pub fn id(&self) -> String {
        suggestion_id(&self.site, &self.title)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoteTally {
    pub positive: u64,
    pub negative: u64,
    pub total: i64,
}

impl VoteTally {
    pub fn from_counts(positive: u64, negative: u64) -> Self {
        Self {
            positive,
            negative,
            total: positive as i64 - negative as i64,
        }
    }

    pub fn apply(&mut self, sign: VoteSign) {
        match sign {
            VoteSign::Up => self.positive += 1,
            VoteSign::Down => self.negative += 1,
        }
        self.total = self.positive as i64 - self.negative as i64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteSign {
    Up,
    Down,
}

impl VoteSign {
    pub fn as_i64(self) -> i64 {
        match self {
            VoteSign::Up => 1,
            VoteSign::Down => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("vote must be +1 or -1, got {0}")]
pub struct InvalidVote(pub i64);

impl TryFrom<i64> for VoteSign {
    type Error = InvalidVote;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(VoteSign::Up),
            -1 => Ok(VoteSign::Down),
            other => Err(InvalidVote(other)),
        }
    }
}

/// Stored, votable suggestion as owned by the suggestion store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: String,
    pub site: String,
    pub title: String,
    pub excerpt: String,
    #[serde(rename = "ref")]
    pub reference_url: String,
    pub fetched_at: DateTime<Utc>,
    pub votes: VoteTally,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub sampling_key: f64,
}

impl Suggestion {
    pub fn from_draft(draft: SuggestionDraft, votes: VoteTally, sampling_key: f64) -> Self {
        Self {
            id: draft.id(),
            site: draft.site,
            title: draft.title,
            excerpt: draft.excerpt,
            reference_url: draft.reference_url,
            fetched_at: draft.fetched_at,
            votes,
            sampling_key,
        }
    }
}

/// Session-scoped, insertion-ordered set of suggestion ids already shown to a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct SeenSet {
    order: Vec<String>,
    index: HashSet<String>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if !self.index.insert(id.clone()) {
            return false;
        }
        self.order.push(id);
        true
    }

    pub fn extend<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            self.insert(id);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for SeenSet {
    fn from(ids: Vec<String>) -> Self {
        ids.into_iter().collect()
    }
}

impl From<SeenSet> for Vec<String> {
    fn from(set: SeenSet) -> Self {
        set.order
    }
}

impl<S: Into<String>> FromIterator<S> for SeenSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = SeenSet::new();
        set.extend(iter);
        set
    }
}
