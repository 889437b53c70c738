//! Process-local backend, used when no database is configured and in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use frictionary_core::{Suggestion, SuggestionDraft, VoteSign, VoteTally};
use tokio::sync::RwLock;

use crate::store::{SampleRange, StoreError, SuggestionBackend};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    rows: RwLock<HashMap<String, Suggestion>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn get(&self, id: &str) -> Option<Suggestion> {
        self.rows.read().await.get(id).cloned()
    }
}

#[async_trait]
impl SuggestionBackend for MemoryBackend {
    async fn upsert_many(&self, drafts: &[SuggestionDraft]) -> Result<Vec<Suggestion>, StoreError> {
        let mut rows = self.rows.write().await;
        let mut saved = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let id = draft.id();
            let (votes, sampling_key) = match rows.get(&id) {
                Some(existing) => (existing.votes, existing.sampling_key),
                None => (VoteTally::default(), rand::random::<f64>()),
            };
            let suggestion = Suggestion::from_draft(draft.clone(), votes, sampling_key);
            rows.insert(id, suggestion.clone());
            saved.push(suggestion);
        }
        Ok(saved)
    }

    async fn record_vote(&self, id: &str, sign: VoteSign) -> Result<VoteTally, StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.votes.apply(sign);
        Ok(row.votes)
    }

    async fn top_by_score(&self, site: &str, limit: usize) -> Result<Vec<Suggestion>, StoreError> {
        let rows = self.rows.read().await;
        let mut top: Vec<_> = rows.values().filter(|s| s.site == site).cloned().collect();
        top.sort_by(|a, b| b.votes.total.cmp(&a.votes.total).then_with(|| a.id.cmp(&b.id)));
        top.truncate(limit);
        Ok(top)
    }

    async fn sample(
        &self,
        site: &str,
        range: SampleRange,
        limit: usize,
    ) -> Result<Vec<Suggestion>, StoreError> {
        let rows = self.rows.read().await;
        let mut hits: Vec<_> = rows
            .values()
            .filter(|s| s.site == site && range.admits(s.sampling_key))
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.sampling_key.total_cmp(&b.sampling_key));
        if range.descending {
            hits.reverse();
        }
        hits.truncate(limit);
        Ok(hits)
    }

    async fn prune_outdated(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, s| !(s.fetched_at < cutoff && s.votes.total <= 0));
        Ok((before - rows.len()) as u64)
    }
}
