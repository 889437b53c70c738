//! Random-article ingestion: list, filter, render, extract.

use std::sync::Arc;

use chrono::Utc;
use frictionary_core::SuggestionDraft;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::extract::{ExcerptExtractor, Extraction};
use crate::source::{ArticleSource, Continuation, ListingRequest};
use crate::AdapterError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiSite {
    pub site: String,
    pub batch_size: usize,
    pub namespace: i64,
}

impl WikiSite {
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            batch_size: 10,
            namespace: 0,
        }
    }
}

/// Result of a quota-driven fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Filled(Vec<SuggestionDraft>),
    /// Attempts ran out before the target was met.
    Exhausted {
        suggestions: Vec<SuggestionDraft>,
        missing: usize,
    },
}

impl FetchOutcome {
    pub fn suggestions(&self) -> &[SuggestionDraft] {
        match self {
            FetchOutcome::Filled(s) => s,
            FetchOutcome::Exhausted { suggestions, .. } => suggestions,
        }
    }

    pub fn into_suggestions(self) -> Vec<SuggestionDraft> {
        match self {
            FetchOutcome::Filled(s) => s,
            FetchOutcome::Exhausted { suggestions, .. } => suggestions,
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(self, FetchOutcome::Filled(_))
    }
}

/// Pulls random articles for one site and keeps those the extractor accepts.
pub struct SuggestionFetcher {
    site: WikiSite,
    source: Arc<dyn ArticleSource>,
    extractor: Arc<dyn ExcerptExtractor>,
    cursor: Mutex<Option<Continuation>>,
    max_attempts: usize,
}

impl SuggestionFetcher {
    pub fn new(
        site: WikiSite,
        source: Arc<dyn ArticleSource>,
        extractor: Arc<dyn ExcerptExtractor>,
        max_attempts: usize,
    ) -> Self {
        Self {
            site,
            source,
            extractor,
            cursor: Mutex::new(None),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn site(&self) -> &str {
        &self.site.site
    }

    pub fn batch_size(&self) -> usize {
        self.site.batch_size
    }

    pub async fn cursor(&self) -> Option<Continuation> {
        self.cursor.lock().await.clone()
    }

    /// Runs listing rounds until `target` suggestions are accepted or attempts run out.
    /// A listing failure aborts the whole call; single article failures are skipped.
    pub async fn fetch_some(&self, target: usize) -> Result<FetchOutcome, AdapterError> {
        let mut accepted = Vec::new();

        for attempt in 1..=self.max_attempts {
            accepted.extend(self.fetch_round().await?);
            if accepted.len() >= target {
                info!(site = self.site(), accepted = accepted.len(), attempt, "fetched suggestions");
                return Ok(FetchOutcome::Filled(accepted));
            }
            debug!(
                site = self.site(),
                accepted = accepted.len(),
                target,
                attempt,
                "fetching more suggestions"
            );
        }

        let missing = target - accepted.len();
        warn!(
            site = self.site(),
            accepted = accepted.len(),
            missing,
            attempts = self.max_attempts,
            "giving up on fetch quota"
        );
        Ok(FetchOutcome::Exhausted {
            suggestions: accepted,
            missing,
        })
    }

    /// One listing call plus article fetches for its candidate titles.
    async fn fetch_round(&self) -> Result<Vec<SuggestionDraft>, AdapterError> {
        // held across the listing call; each continuation is used once
        let mut cursor = self.cursor.lock().await;
        let batch = self
            .source
            .random_titles(ListingRequest {
                batch_size: self.site.batch_size,
                namespace: self.site.namespace,
                cursor: (*cursor).as_ref(),
            })
            .await?;
        if let Some(next) = batch.next {
            *cursor = Some(next);
        }
        drop(cursor);

        // single-word titles only; multi-word entries are mostly people
        let candidates: Vec<_> = batch
            .titles
            .into_iter()
            .filter(|t| !t.is_empty() && !t.chars().any(char::is_whitespace))
            .collect();

        let results = join_all(candidates.iter().map(|title| self.fetch_article(title))).await;

        let mut accepted = Vec::with_capacity(results.len());
        for (title, result) in candidates.iter().zip(results) {
            match result {
                Ok(Some(draft)) => accepted.push(draft),
                Ok(None) => {}
                Err(err) => warn!(site = self.site(), title, error = %err, "article fetch failed"),
            }
        }
        Ok(accepted)
    }

    pub async fn fetch_article(&self, title: &str) -> Result<Option<SuggestionDraft>, AdapterError> {
        let html = self.source.render_article(title).await?;

        match self.extractor.extract(&html) {
            Extraction::Accepted(excerpt) => {
                debug!(site = self.site(), title, "accepting title");
                Ok(Some(SuggestionDraft {
                    site: self.site.site.clone(),
                    title: title.to_string(),
                    excerpt,
                    reference_url: self.source.article_url(title),
                    fetched_at: Utc::now(),
                }))
            }
            Extraction::Rejected(reason) => {
                debug!(site = self.site(), title, ?reason, "rejecting title");
                Ok(None)
            }
        }
    }
}
