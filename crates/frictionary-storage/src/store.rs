//! Suggestion store contract and the caching/sampling layer on top of a backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use frictionary_core::{Suggestion, SuggestionDraft, VoteSign, VoteTally};
use thiserror::Error;
use tracing::{debug, info};

use crate::top_cache::TopScoreCache;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no suggestion with id {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// One range query over the sampling key: keys `>= pivot` ascending, or `<= pivot` descending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRange {
    pub pivot: f64,
    pub descending: bool,
}

impl SampleRange {
    pub fn random() -> Self {
        Self {
            pivot: rand::random::<f64>(),
            descending: rand::random::<bool>(),
        }
    }

    /// The range covering the other side of the same pivot.
    pub fn complement(self) -> Self {
        Self {
            pivot: self.pivot,
            descending: !self.descending,
        }
    }

    pub fn admits(&self, sampling_key: f64) -> bool {
        if self.descending {
            sampling_key <= self.pivot
        } else {
            sampling_key >= self.pivot
        }
    }
}

/// Keyed suggestion storage. Implementations own the data; callers get copies.
#[async_trait]
pub trait SuggestionBackend: Send + Sync {
    /// Merge-write by identity key. Vote tallies and sampling keys of existing rows are kept.
    async fn upsert_many(&self, drafts: &[SuggestionDraft]) -> Result<Vec<Suggestion>, StoreError>;

    async fn record_vote(&self, id: &str, sign: VoteSign) -> Result<VoteTally, StoreError>;

    /// Site suggestions by descending vote total, ties by id.
    async fn top_by_score(&self, site: &str, limit: usize) -> Result<Vec<Suggestion>, StoreError>;

    async fn sample(
        &self,
        site: &str,
        range: SampleRange,
        limit: usize,
    ) -> Result<Vec<Suggestion>, StoreError>;

    /// Deletes suggestions fetched before `cutoff` whose vote total is `<= 0`.
    async fn prune_outdated(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    pub top_cache_ttl: Duration,
    pub sample_retries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            top_cache_ttl: Duration::from_secs(60 * 60),
            sample_retries: 5,
        }
    }
}

pub struct SuggestionStore {
    backend: Arc<dyn SuggestionBackend>,
    top_cache: TopScoreCache,
    sample_retries: usize,
}

impl SuggestionStore {
    pub fn new(backend: Arc<dyn SuggestionBackend>, config: StoreConfig) -> Self {
        Self {
            backend,
            top_cache: TopScoreCache::new(config.top_cache_ttl),
            sample_retries: config.sample_retries,
        }
    }

    pub async fn upsert_many(&self, drafts: &[SuggestionDraft]) -> Result<Vec<Suggestion>, StoreError> {
        debug!(count = drafts.len(), "saving suggestions");
        self.backend.upsert_many(drafts).await
    }

    pub async fn record_vote(&self, id: &str, sign: VoteSign) -> Result<VoteTally, StoreError> {
        debug!(id, vote = sign.as_i64(), "recording vote");
        self.backend.record_vote(id, sign).await
    }

    /// Top suggestions for `site`, served from a TTL cache keyed by `(site, limit)`.
    /// Concurrent misses on one key share a single backend query.
    pub async fn top_by_score(&self, site: &str, limit: usize) -> Result<Vec<Suggestion>, StoreError> {
        let top = self
            .top_cache
            .get_or_load(site, limit, || async {
                debug!(site, limit, "fetching top suggestions");
                self.backend.top_by_score(site, limit).await
            })
            .await?;
        Ok(top.as_ref().clone())
    }

    /// Up to `limit` distinct suggestions for `site`, picked by random range queries.
    ///
    /// The first retry queries the complementary range of the first one, so a site
    /// holding fewer than `limit` suggestions yields all of them. Further retries use
    /// fresh pivots; after `sample_retries` retries the short list is returned.
    pub async fn random_sample(&self, site: &str, limit: usize) -> Result<Vec<Suggestion>, StoreError> {
        let mut collected: Vec<Suggestion> = Vec::with_capacity(limit);
        let mut ids = HashSet::new();
        let first = SampleRange::random();
        let mut range = first;

        for attempt in 0..=self.sample_retries {
            let wanted = limit - collected.len();
            if wanted == 0 {
                break;
            }
            debug!(site, wanted, attempt, "fetching random suggestions");

            let batch = self.backend.sample(site, range, wanted).await?;
            for suggestion in batch {
                if collected.len() == limit {
                    break;
                }
                if suggestion.site == site && ids.insert(suggestion.id.clone()) {
                    collected.push(suggestion);
                }
            }

            range = if attempt == 0 {
                first.complement()
            } else {
                SampleRange::random()
            };
        }

        debug!(site, limit, loaded = collected.len(), "loaded random suggestions");
        Ok(collected)
    }

    pub async fn prune_outdated(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let removed = self.backend.prune_outdated(cutoff).await?;
        info!(removed, %cutoff, "removed outdated suggestions");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn draft(site: &str, title: &str) -> SuggestionDraft {
        SuggestionDraft {
            site: site.to_string(),
            title: title.to_string(),
            excerpt: format!("<b>{title}</b> is a thing."),
            reference_url: format!("https://{site}.example/w/index.php?title={title}"),
            fetched_at: ts(12),
        }
    }

    fn store_with(backend: Arc<dyn SuggestionBackend>) -> SuggestionStore {
        SuggestionStore::new(backend, StoreConfig::default())
    }

    async fn seeded_store(site: &str, count: usize) -> SuggestionStore {
        let store = store_with(Arc::new(MemoryBackend::new()));
        let drafts: Vec<_> = (0..count).map(|i| draft(site, &format!("T{i}"))).collect();
        store.upsert_many(&drafts).await.unwrap();
        store
    }

    #[tokio::test]
    async fn random_sample_is_bounded_distinct_and_site_scoped() {
        let store = seeded_store("a", 40).await;
        store.upsert_many(&[draft("b", "Other")]).await.unwrap();

        for _ in 0..20 {
            let sample = store.random_sample("a", 10).await.unwrap();
            assert!(sample.len() <= 10);
            assert!(sample.iter().all(|s| s.site == "a"));
            let ids: HashSet<_> = sample.iter().map(|s| s.id.clone()).collect();
            assert_eq!(ids.len(), sample.len());
        }
    }

    #[tokio::test]
    async fn random_sample_returns_everything_when_site_is_small() {
        let store = seeded_store("a", 3).await;
        for _ in 0..20 {
            assert_eq!(store.random_sample("a", 10).await.unwrap().len(), 3);
        }
        assert!(store.random_sample("missing", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn random_sample_gives_up_after_bounded_retries() {
        struct CountingBackend {
            inner: MemoryBackend,
            range_queries: AtomicUsize,
        }

        #[async_trait]
        impl SuggestionBackend for CountingBackend {
            async fn upsert_many(&self, drafts: &[SuggestionDraft]) -> Result<Vec<Suggestion>, StoreError> {
                self.inner.upsert_many(drafts).await
            }
            async fn record_vote(&self, id: &str, sign: VoteSign) -> Result<VoteTally, StoreError> {
                self.inner.record_vote(id, sign).await
            }
            async fn top_by_score(&self, site: &str, limit: usize) -> Result<Vec<Suggestion>, StoreError> {
                self.inner.top_by_score(site, limit).await
            }
            async fn sample(&self, site: &str, range: SampleRange, limit: usize) -> Result<Vec<Suggestion>, StoreError> {
                self.range_queries.fetch_add(1, Ordering::SeqCst);
                self.inner.sample(site, range, limit).await
            }
            async fn prune_outdated(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
                self.inner.prune_outdated(cutoff).await
            }
        }

        let backend = Arc::new(CountingBackend {
            inner: MemoryBackend::new(),
            range_queries: AtomicUsize::new(0),
        });
        let store = store_with(backend.clone());
        store.upsert_many(&[draft("a", "Only")]).await.unwrap();

        let sample = store.random_sample("a", 5).await.unwrap();
        assert_eq!(sample.len(), 1);
        assert_eq!(backend.range_queries.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn top_by_score_is_cached_per_site_and_limit() {
        let store = seeded_store("a", 3).await;
        let before = store.top_by_score("a", 10).await.unwrap();
        assert!(before.iter().all(|s| s.votes.total == 0));

        store.record_vote("a:T2", VoteSign::Up).await.unwrap();
        let cached = store.top_by_score("a", 10).await.unwrap();
        assert_eq!(cached, before);

        let other_limit = store.top_by_score("a", 2).await.unwrap();
        assert_eq!(other_limit[0].id, "a:T2");
        assert_eq!(other_limit.len(), 2);
    }

    #[tokio::test]
    async fn prune_keeps_net_positive_regardless_of_age() {
        let store = store_with(Arc::new(MemoryBackend::new()));
        let mut old = draft("a", "Old");
        old.fetched_at = ts(1);
        let mut old_popular = draft("a", "OldPopular");
        old_popular.fetched_at = ts(1);
        let mut old_disliked = draft("a", "OldDisliked");
        old_disliked.fetched_at = ts(1);
        let fresh = draft("a", "Fresh");
        store
            .upsert_many(&[old, old_popular, old_disliked, fresh])
            .await
            .unwrap();
        store.record_vote("a:OldPopular", VoteSign::Up).await.unwrap();
        store.record_vote("a:OldDisliked", VoteSign::Down).await.unwrap();

        let removed = store.prune_outdated(ts(1) + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(removed, 2);

        let remaining: HashSet<_> = store
            .random_sample("a", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.title)
            .collect();
        assert_eq!(
            remaining,
            HashSet::from(["OldPopular".to_string(), "Fresh".to_string()])
        );
    }

    #[test]
    fn complement_range_covers_the_other_side() {
        let range = SampleRange {
            pivot: 0.4,
            descending: false,
        };
        assert!(range.admits(0.9));
        assert!(!range.admits(0.1));
        assert!(range.complement().admits(0.1));
        assert!(range.complement().admits(0.4));
    }
}
