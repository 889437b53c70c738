//! Request-level orchestration: suggestion pages, background refills and votes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use frictionary_adapters::{AdapterError, FetchOutcome, SuggestionFetcher};
use frictionary_core::{SeenSet, Suggestion, VoteTally};
use frictionary_storage::{StoreError, SuggestionStore};
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::vote_gate::{VoteGate, VoteRejection};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown site {0}")]
    UnknownSite(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("invalid vote")]
    InvalidVote,
    #[error("already voted")]
    AlreadyVoted,
    #[error("rate limited")]
    RateLimited,
    #[error("no suggestion with id {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<VoteRejection> for VoteError {
    fn from(rejection: VoteRejection) -> Self {
        match rejection {
            VoteRejection::InvalidVote => VoteError::InvalidVote,
            VoteRejection::AlreadyVoted => VoteError::AlreadyVoted,
            VoteRejection::RateLimited => VoteError::RateLimited,
        }
    }
}

impl From<StoreError> for VoteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => VoteError::NotFound(id),
            other => VoteError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteInfo {
    pub id: String,
    pub info: Option<String>,
}

/// A configured site together with the fetcher that fills it.
pub struct SiteHandle {
    pub info: SiteInfo,
    pub fetcher: Arc<SuggestionFetcher>,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    pub page_size: usize,
    /// Random sample size as a multiple of `page_size`.
    pub random_multiplier: usize,
    pub top_limit: usize,
    pub outdated_after: chrono::Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            random_multiplier: 4,
            top_limit: 2048,
            outdated_after: chrono::Duration::days(14),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuggestionPage {
    pub suggestions: Vec<Suggestion>,
    /// Ids to merge into the caller's seen set.
    pub newly_seen: Vec<String>,
}

struct ServiceInner {
    store: Arc<SuggestionStore>,
    sites: Vec<SiteInfo>,
    fetchers: HashMap<String, Arc<SuggestionFetcher>>,
    vote_gate: VoteGate,
    config: ServiceConfig,
}

#[derive(Clone)]
pub struct SuggestionService {
    inner: Arc<ServiceInner>,
}

impl SuggestionService {
    pub fn new(
        store: Arc<SuggestionStore>,
        sites: Vec<SiteHandle>,
        vote_gate: VoteGate,
        config: ServiceConfig,
    ) -> Self {
        let mut infos = Vec::with_capacity(sites.len());
        let mut fetchers = HashMap::with_capacity(sites.len());
        for handle in sites {
            fetchers.insert(handle.info.id.clone(), handle.fetcher);
            infos.push(handle.info);
        }
        Self {
            inner: Arc::new(ServiceInner {
                store,
                sites: infos,
                fetchers,
                vote_gate,
                config,
            }),
        }
    }

    pub fn sites(&self) -> &[SiteInfo] {
        &self.inner.sites
    }

    pub fn store(&self) -> &Arc<SuggestionStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    fn fetcher(&self, site: &str) -> Result<&Arc<SuggestionFetcher>, ServiceError> {
        self.inner
            .fetchers
            .get(site)
            .ok_or_else(|| ServiceError::UnknownSite(site.to_string()))
    }

    /// One page of suggestions for `site` that the session has not seen yet.
    ///
    /// Stored top-scored and random suggestions are merged first; when that leaves
    /// fewer than a page, one fetch-and-store cycle tops it up. The page never
    /// exceeds twice the page size.
    pub async fn get_suggestions(
        &self,
        site: &str,
        seen: &SeenSet,
    ) -> Result<SuggestionPage, ServiceError> {
        let fetcher = self.fetcher(site)?;
        let config = &self.inner.config;
        let cap = config.page_size * 2;

        let (top, random) = tokio::try_join!(
            self.inner.store.top_by_score(site, config.top_limit),
            self.inner
                .store
                .random_sample(site, config.page_size * config.random_multiplier),
        )?;
        let mut suggestions = merge_unseen(random, top, seen, cap);
        debug!(site, stored = suggestions.len(), page_size = config.page_size, "merged stored suggestions");

        if suggestions.len() < config.page_size {
            let fresh = self.fetch_and_store_with(site, fetcher).await?;
            suggestions = merge_unseen(suggestions, fresh, seen, cap);
            debug!(site, total = suggestions.len(), "backfilled suggestions");
        }

        let newly_seen = suggestions.iter().map(|s| s.id.clone()).collect();
        Ok(SuggestionPage {
            suggestions,
            newly_seen,
        })
    }

    /// Serves a page, then kicks off a detached refill for the site whatever the outcome.
    pub async fn request_suggestions(
        &self,
        site: &str,
        seen: &SeenSet,
    ) -> Result<SuggestionPage, ServiceError> {
        let page = self.get_suggestions(site, seen).await;
        self.spawn_refill(site);
        page
    }

    /// Runs one fetch-and-store cycle in the background. Failures are logged only.
    pub fn spawn_refill(&self, site: &str) -> Option<JoinHandle<()>> {
        if !self.inner.fetchers.contains_key(site) {
            return None;
        }
        let service = self.clone();
        let site = site.to_string();
        Some(tokio::spawn(async move {
            match service.fetch_and_store(&site).await {
                Ok(saved) => debug!(site, saved = saved.len(), "background refill finished"),
                Err(err) => warn!(site, error = %err, "background refill failed"),
            }
        }))
    }

    pub async fn fetch_and_store(&self, site: &str) -> Result<Vec<Suggestion>, ServiceError> {
        let fetcher = self.fetcher(site)?;
        self.fetch_and_store_with(site, fetcher).await
    }

    async fn fetch_and_store_with(
        &self,
        site: &str,
        fetcher: &SuggestionFetcher,
    ) -> Result<Vec<Suggestion>, ServiceError> {
        let outcome = fetcher.fetch_some(fetcher.batch_size()).await?;
        if let FetchOutcome::Exhausted { missing, .. } = &outcome {
            info!(site, missing, "storing short batch");
        }
        let drafts = outcome.into_suggestions();
        Ok(self.inner.store.upsert_many(&drafts).await?)
    }

    pub async fn cast_vote(
        &self,
        remote_address: &str,
        suggestion_id: &str,
        vote: i64,
    ) -> Result<VoteTally, VoteError> {
        self.cast_vote_at(remote_address, suggestion_id, vote, Utc::now())
            .await
    }

    pub async fn cast_vote_at(
        &self,
        remote_address: &str,
        suggestion_id: &str,
        vote: i64,
        now: DateTime<Utc>,
    ) -> Result<VoteTally, VoteError> {
        let sign = self
            .inner
            .vote_gate
            .admit(remote_address, suggestion_id, vote, now)?;
        match self.inner.store.record_vote(suggestion_id, sign).await {
            Ok(tally) => {
                debug!(remote_address, suggestion_id, total = tally.total, "vote recorded");
                Ok(tally)
            }
            // unknown ids still use up a rate-limit slot
            Err(err @ StoreError::NotFound(_)) => Err(err.into()),
            Err(err) => {
                self.inner
                    .vote_gate
                    .rollback(remote_address, suggestion_id, now);
                warn!(remote_address, suggestion_id, error = %err, "vote not stored");
                Err(err.into())
            }
        }
    }

    /// Deletes suggestions older than the configured age that have no positive net vote.
    pub async fn prune_outdated(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = now - self.inner.config.outdated_after;
        self.inner.store.prune_outdated(cutoff).await
    }

    pub fn sweep_vote_gate(&self, now: DateTime<Utc>) -> usize {
        let dropped = self.inner.vote_gate.sweep_idle(now);
        debug!(dropped, "swept idle vote histories");
        dropped
    }
}

/// Drops seen ids from both lists, shuffles `extra` behind `head`, reshuffles,
/// keeps the first occurrence of each id and truncates to `cap`.
fn merge_unseen(
    head: Vec<Suggestion>,
    extra: Vec<Suggestion>,
    seen: &SeenSet,
    cap: usize,
) -> Vec<Suggestion> {
    let mut rng = rand::rng();
    let mut extra: Vec<_> = extra.into_iter().filter(|s| !seen.contains(&s.id)).collect();
    extra.shuffle(&mut rng);

    let mut merged: Vec<_> = head.into_iter().filter(|s| !seen.contains(&s.id)).collect();
    merged.extend(extra);
    merged.shuffle(&mut rng);

    let mut ids = HashSet::with_capacity(merged.len());
    merged.retain(|s| ids.insert(s.id.clone()));
    merged.truncate(cap);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use frictionary_adapters::{
        ArticleSource, FixtureArticleSource, LeadParagraphExtractor, ListingRequest, RandomBatch,
        WikiSite,
    };
    use frictionary_core::{SuggestionDraft, VoteSign};
    use frictionary_storage::{MemoryBackend, SampleRange, StoreConfig, SuggestionBackend};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct UnreachableSource;

    #[async_trait]
    impl ArticleSource for UnreachableSource {
        async fn random_titles(&self, _: ListingRequest<'_>) -> Result<RandomBatch, AdapterError> {
            Err(AdapterError::Message("connection refused".into()))
        }

        async fn render_article(&self, _: &str) -> Result<String, AdapterError> {
            Err(AdapterError::Message("connection refused".into()))
        }

        fn article_url(&self, title: &str) -> String {
            title.to_string()
        }
    }

    /// Fails the first listing call, then serves the wrapped fixtures.
    struct FirstListingFails {
        inner: Arc<FixtureArticleSource>,
        failed_once: AtomicBool,
    }

    #[async_trait]
    impl ArticleSource for FirstListingFails {
        async fn random_titles(&self, request: ListingRequest<'_>) -> Result<RandomBatch, AdapterError> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(AdapterError::Message("listing timed out".into()));
            }
            self.inner.random_titles(request).await
        }

        async fn render_article(&self, title: &str) -> Result<String, AdapterError> {
            self.inner.render_article(title).await
        }

        fn article_url(&self, title: &str) -> String {
            self.inner.article_url(title)
        }
    }

    fn fixture_articles(titles: &[&str]) -> Arc<FixtureArticleSource> {
        Arc::new(FixtureArticleSource::new(
            "https://wiki-a.example",
            titles
                .iter()
                .map(|t| (t.to_string(), format!("<p><b>{t}</b> is a thing.</p>")))
                .collect(),
        ))
    }

    /// Memory backend whose first `record_vote` fails like a dropped connection.
    #[derive(Default)]
    struct FlakyVotes {
        inner: MemoryBackend,
        failed_once: AtomicBool,
    }

    #[async_trait]
    impl SuggestionBackend for FlakyVotes {
        async fn upsert_many(&self, drafts: &[SuggestionDraft]) -> Result<Vec<Suggestion>, StoreError> {
            self.inner.upsert_many(drafts).await
        }

        async fn record_vote(&self, id: &str, sign: VoteSign) -> Result<VoteTally, StoreError> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.record_vote(id, sign).await
        }

        async fn top_by_score(&self, site: &str, limit: usize) -> Result<Vec<Suggestion>, StoreError> {
            self.inner.top_by_score(site, limit).await
        }

        async fn sample(
            &self,
            site: &str,
            range: SampleRange,
            limit: usize,
        ) -> Result<Vec<Suggestion>, StoreError> {
            self.inner.sample(site, range, limit).await
        }

        async fn prune_outdated(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.prune_outdated(cutoff).await
        }
    }

    fn service_with(source: Arc<dyn ArticleSource>, page_size: usize) -> SuggestionService {
        service_on(Arc::new(MemoryBackend::new()), source, page_size)
    }

    fn service_on(
        backend: Arc<dyn SuggestionBackend>,
        source: Arc<dyn ArticleSource>,
        page_size: usize,
    ) -> SuggestionService {
        let store = Arc::new(SuggestionStore::new(backend, StoreConfig::default()));
        let fetcher = Arc::new(SuggestionFetcher::new(
            WikiSite::new("wiki-a"),
            source,
            Arc::new(LeadParagraphExtractor::new().unwrap()),
            3,
        ));
        SuggestionService::new(
            store,
            vec![SiteHandle {
                info: SiteInfo {
                    id: "wiki-a".into(),
                    info: Some("Wiki A".into()),
                },
                fetcher,
            }],
            VoteGate::default(),
            ServiceConfig {
                page_size,
                ..ServiceConfig::default()
            },
        )
    }

    fn draft(title: &str) -> SuggestionDraft {
        SuggestionDraft {
            site: "wiki-a".into(),
            title: title.into(),
            excerpt: format!("<b>{title}</b>"),
            reference_url: format!("https://wiki-a.example/w/index.php?title={title}"),
            fetched_at: Utc::now(),
        }
    }

    async fn seed(service: &SuggestionService, count: usize) -> Vec<String> {
        let drafts: Vec<_> = (0..count).map(|i| draft(&format!("Stored{i}"))).collect();
        service
            .store()
            .upsert_many(&drafts)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect()
    }

    #[tokio::test]
    async fn empty_site_is_filled_by_one_fetch_cycle() {
        let source = fixture_articles(&["Ferrocene", "Osmium", "Kelp", "Quine", "Tensor", "Zymurgy"]);
        let service = service_with(source.clone(), 4);

        let page = service
            .get_suggestions("wiki-a", &SeenSet::new())
            .await
            .unwrap();

        assert_eq!(source.listing_calls(), 1);
        assert!(!page.suggestions.is_empty());
        assert!(page.suggestions.len() <= 8);
        let ids: Vec<_> = page.suggestions.iter().map(|s| s.id.clone()).collect();
        assert_eq!(page.newly_seen, ids);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
    }

    #[tokio::test]
    async fn stored_suggestions_skip_the_fetch_and_exclude_seen() {
        let source = fixture_articles(&["Ferrocene"]);
        let service = service_with(source.clone(), 10);
        let ids = seed(&service, 30).await;
        let seen: SeenSet = ids[..20].iter().cloned().collect();

        let page = service.get_suggestions("wiki-a", &seen).await.unwrap();

        assert_eq!(source.listing_calls(), 0);
        assert_eq!(page.suggestions.len(), 10);
        assert!(page.suggestions.iter().all(|s| !seen.contains(&s.id)));
    }

    #[tokio::test]
    async fn page_is_capped_at_twice_the_page_size() {
        let service = service_with(fixture_articles(&[]), 5);
        seed(&service, 40).await;

        let page = service
            .get_suggestions("wiki-a", &SeenSet::new())
            .await
            .unwrap();
        assert_eq!(page.suggestions.len(), 10);
    }

    #[tokio::test]
    async fn fresh_suggestions_already_seen_are_not_returned() {
        let source = fixture_articles(&["Ferrocene", "Osmium"]);
        let service = service_with(source, 4);
        let seen: SeenSet = ["wiki-a:Ferrocene".to_string(), "wiki-a:Osmium".to_string()]
            .into_iter()
            .collect();

        let page = service.get_suggestions("wiki-a", &seen).await.unwrap();
        assert!(page.suggestions.is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_propagates_and_unknown_site_is_reported() {
        let service = service_with(Arc::new(UnreachableSource), 4);

        let err = service
            .get_suggestions("wiki-a", &SeenSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Adapter(_)));

        let err = service
            .get_suggestions("wiki-z", &SeenSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownSite(site) if site == "wiki-z"));
        assert!(service.spawn_refill("wiki-z").is_none());
    }

    #[tokio::test]
    async fn background_refill_populates_the_store() {
        let service = service_with(fixture_articles(&["Ferrocene", "Osmium"]), 4);

        service.spawn_refill("wiki-a").unwrap().await.unwrap();

        let stored = service.store().random_sample("wiki-a", 10).await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn background_refill_failure_is_swallowed() {
        let service = service_with(Arc::new(UnreachableSource), 4);
        service.spawn_refill("wiki-a").unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn refill_runs_even_when_the_page_fails() {
        let source = Arc::new(FirstListingFails {
            inner: fixture_articles(&["Ferrocene", "Osmium"]),
            failed_once: AtomicBool::new(false),
        });
        let service = service_with(source, 4);

        let err = service
            .request_suggestions("wiki-a", &SeenSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Adapter(_)));

        let mut stored = Vec::new();
        for _ in 0..100 {
            stored = service.store().random_sample("wiki-a", 10).await.unwrap();
            if !stored.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn votes_pass_through_the_gate_to_the_store() {
        let service = service_with(fixture_articles(&[]), 4);
        let ids = seed(&service, 1).await;

        let tally = service.cast_vote("10.0.0.1", &ids[0], 1).await.unwrap();
        assert_eq!((tally.positive, tally.negative, tally.total), (1, 0, 1));

        assert!(matches!(
            service.cast_vote("10.0.0.1", &ids[0], 1).await,
            Err(VoteError::AlreadyVoted)
        ));
        assert!(matches!(
            service.cast_vote("10.0.0.1", &ids[0], 7).await,
            Err(VoteError::InvalidVote)
        ));
        assert!(matches!(
            service.cast_vote("10.0.0.2", "wiki-a:Nope", -1).await,
            Err(VoteError::NotFound(id)) if id == "wiki-a:Nope"
        ));

        let tally = service.cast_vote("10.0.0.2", &ids[0], -1).await.unwrap();
        assert_eq!((tally.positive, tally.negative, tally.total), (1, 1, 0));
    }

    #[tokio::test]
    async fn store_failure_gives_the_vote_back() {
        let service = service_on(Arc::new(FlakyVotes::default()), fixture_articles(&[]), 4);
        let ids = seed(&service, 1).await;
        let now = Utc::now();

        assert!(matches!(
            service.cast_vote_at("10.0.0.1", &ids[0], 1, now).await,
            Err(VoteError::Store(StoreError::Database(_)))
        ));
        let tally = service.cast_vote_at("10.0.0.1", &ids[0], 1, now).await.unwrap();
        assert_eq!((tally.positive, tally.total), (1, 1));
    }

    #[tokio::test]
    async fn unknown_ids_use_up_the_rate_limit() {
        let service = service_with(fixture_articles(&[]), 4);
        let ids = seed(&service, 1).await;
        let now = Utc::now();

        for i in 0..50 {
            let missing = format!("wiki-a:Missing{i}");
            assert!(matches!(
                service.cast_vote_at("10.0.0.1", &missing, 1, now).await,
                Err(VoteError::NotFound(_))
            ));
        }
        assert!(matches!(
            service.cast_vote_at("10.0.0.1", &ids[0], 1, now).await,
            Err(VoteError::RateLimited)
        ));
    }

    #[tokio::test]
    async fn prune_uses_the_configured_age() {
        let service = service_with(fixture_articles(&[]), 4);
        let ids = seed(&service, 2).await;
        service.cast_vote("10.0.0.1", &ids[0], 1).await.unwrap();

        let removed = service
            .prune_outdated(Utc::now() + chrono::Duration::days(15))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(service.prune_outdated(Utc::now()).await.unwrap(), 0);
    }
}
