//! Remote article sources: the MediaWiki HTTP API and a local fixture directory.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use frictionary_storage::HttpFetcher;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use crate::AdapterError;

/// Opaque continuation parameters handed back by a paginated random listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Continuation(BTreeMap<String, String>);

impl Continuation {
    pub fn new(params: BTreeMap<String, String>) -> Self {
        Self(params)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn from_json(map: &Map<String, JsonValue>) -> Self {
        Self(
            map.iter()
                .map(|(k, v)| {
                    let value = v.as_str().map(ToString::to_string).unwrap_or_else(|| v.to_string());
                    (k.clone(), value)
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RandomBatch {
    pub titles: Vec<String>,
    pub next: Option<Continuation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingRequest<'a> {
    pub batch_size: usize,
    pub namespace: i64,
    pub cursor: Option<&'a Continuation>,
}

#[async_trait]
pub trait ArticleSource: Send + Sync {
    async fn random_titles(&self, request: ListingRequest<'_>) -> Result<RandomBatch, AdapterError>;

    /// Raw rendered markup of one article.
    async fn render_article(&self, title: &str) -> Result<String, AdapterError>;

    fn article_url(&self, title: &str) -> String;
}

#[derive(Debug, Deserialize)]
struct RandomListResponse {
    #[serde(rename = "continue")]
    continuation: Option<Map<String, JsonValue>>,
    query: RandomListQuery,
}

#[derive(Debug, Deserialize)]
struct RandomListQuery {
    random: Vec<RandomListEntry>,
}

#[derive(Debug, Deserialize)]
struct RandomListEntry {
    title: String,
}

pub fn normalize_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}

/// MediaWiki site reached through `api.php` (random listing) and `index.php?action=render`.
#[derive(Debug, Clone)]
pub struct MediaWikiSource {
    site: String,
    base: String,
    http: Arc<HttpFetcher>,
}

impl MediaWikiSource {
    pub fn new(site: impl Into<String>, base: &str, http: Arc<HttpFetcher>) -> Self {
        Self {
            site: site.into(),
            base: normalize_base(base),
            http,
        }
    }

    pub fn listing_url(&self, request: ListingRequest<'_>) -> Result<Url, AdapterError> {
        let mut params = vec![
            ("action".to_string(), "query".to_string()),
            ("list".to_string(), "random".to_string()),
            ("rnlimit".to_string(), request.batch_size.to_string()),
            ("rnnamespace".to_string(), request.namespace.to_string()),
            ("format".to_string(), "json".to_string()),
        ];
        if let Some(cursor) = request.cursor {
            params.extend(cursor.params().map(|(k, v)| (k.to_string(), v.to_string())));
        }
        Url::parse_with_params(&format!("{}/w/api.php", self.base), params)
            .map_err(|e| AdapterError::Message(format!("invalid listing url for {}: {e}", self.site)))
    }

    fn render_url(&self, title: &str) -> Result<Url, AdapterError> {
        Url::parse_with_params(
            &format!("{}/w/index.php", self.base),
            [("title", title), ("action", "render")],
        )
        .map_err(|e| AdapterError::Message(format!("invalid render url for {title}: {e}")))
    }
}

pub fn parse_random_listing(body: &str) -> Result<RandomBatch, AdapterError> {
    let parsed: RandomListResponse = serde_json::from_str(body)
        .map_err(|e| AdapterError::Decode(format!("random listing: {e}")))?;
    Ok(RandomBatch {
        titles: parsed.query.random.into_iter().map(|e| e.title).collect(),
        next: parsed.continuation.as_ref().map(Continuation::from_json),
    })
}

#[async_trait]
impl ArticleSource for MediaWikiSource {
    async fn random_titles(&self, request: ListingRequest<'_>) -> Result<RandomBatch, AdapterError> {
        let url = self.listing_url(request)?;
        let response = self.http.get(&self.site, url).await?;
        parse_random_listing(&response.text())
    }

    async fn render_article(&self, title: &str) -> Result<String, AdapterError> {
        let url = self.render_url(title)?;
        Ok(self.http.get(&self.site, url).await?.text())
    }

    fn article_url(&self, title: &str) -> String {
        match Url::parse_with_params(&format!("{}/w/index.php", self.base), [("title", title)]) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}/w/index.php?title={title}", self.base),
        }
    }
}

/// Serves articles from memory, cycling through them in listing order.
///
/// The continuation carries the next offset, so the cursor handling of the fetch
/// loop behaves the same as against a live wiki.
#[derive(Debug, Default)]
pub struct FixtureArticleSource {
    base: String,
    articles: Vec<(String, String)>,
    listing_calls: AtomicUsize,
}

impl FixtureArticleSource {
    pub fn new(base: &str, articles: Vec<(String, String)>) -> Self {
        Self {
            base: normalize_base(base),
            articles,
            listing_calls: AtomicUsize::new(0),
        }
    }

    /// Loads every `*.html` file in `dir`; the file stem is the article title.
    pub async fn from_dir(base: &str, dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("reading fixture dir {}", dir.display()))?;
        let mut articles = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("html") {
                continue;
            }
            let Some(title) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let html = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading fixture {}", path.display()))?;
            articles.push((title.to_string(), html));
        }
        articles.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self::new(base, articles))
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }
}

#[async_trait]
impl ArticleSource for FixtureArticleSource {
    async fn random_titles(&self, request: ListingRequest<'_>) -> Result<RandomBatch, AdapterError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        if self.articles.is_empty() {
            return Ok(RandomBatch::default());
        }

        let offset = request
            .cursor
            .and_then(|c| c.get("offset"))
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let titles = (0..request.batch_size)
            .map(|i| self.articles[(offset + i) % self.articles.len()].0.clone())
            .collect();
        let next = (offset + request.batch_size) % self.articles.len();

        Ok(RandomBatch {
            titles,
            next: Some(Continuation::new(BTreeMap::from([(
                "offset".to_string(),
                next.to_string(),
            )]))),
        })
    }

    async fn render_article(&self, title: &str) -> Result<String, AdapterError> {
        self.articles
            .iter()
            .find(|(t, _)| t == title)
            .map(|(_, html)| html.clone())
            .ok_or_else(|| AdapterError::Message(format!("no fixture article {title}")))
    }

    fn article_url(&self, title: &str) -> String {
        format!("{}/w/index.php?title={title}", self.base)
    }
}
