//! Shared MediaWiki HTTP client: small per-wiki concurrency, retries on throttling
//! and gateway failures, `Retry-After` respected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::{AcquireError, Mutex, Semaphore};
use tracing::{debug, warn, Instrument};

/// Throttling and overloaded-gateway answers; anything else is final.
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Delay-seconds form of `Retry-After`. HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    /// Upper bound for both the doubled delay and a server-sent `Retry-After`.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let delay = match retry_after {
            Some(wait) => wait,
            None => {
                let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across all wikis.
    pub global_concurrency: usize,
    /// Requests in flight against one wiki.
    pub per_site_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_site_concurrency: 2,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client shut down")]
    Closed(#[from] AcquireError),
}

/// One client for every configured wiki. Permits are taken per wiki first, then globally.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_site_limit: usize,
    per_site: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building wiki http client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_site_limit: config.per_site_concurrency.max(1),
            per_site: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn site_limit(&self, site: &str) -> Arc<Semaphore> {
        let mut limits = self.per_site.lock().await;
        limits
            .entry(site.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_site_limit)))
            .clone()
    }

    pub async fn get(&self, site: &str, url: Url) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("wiki_request", site, url = %url);
        self.get_politely(site, url).instrument(span).await
    }

    async fn get_politely(&self, site: &str, url: Url) -> Result<FetchedResponse, FetchError> {
        let site_limit = self.site_limit(site).await;
        let _site_permit = site_limit.acquire().await?;
        let _global_permit = self.global_limit.acquire().await?;

        let mut attempt = 0;
        loop {
            let retries_left = attempt < self.retry.max_retries;
            let resp = match self.client.get(url.clone()).send().await {
                Ok(resp) => resp,
                Err(err) if retries_left && is_transient_error(&err) => {
                    debug!(error = %err, attempt, "request failed, retrying");
                    tokio::time::sleep(self.retry.delay_for(attempt, None)).await;
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let status = resp.status();
            let final_url = resp.url().to_string();
            if status.is_success() {
                debug!(status = status.as_u16(), attempt, "loaded");
                let body = resp.bytes().await?.to_vec();
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                });
            }

            if retries_left && is_transient_status(status) {
                let delay = self.retry.delay_for(attempt, retry_after(resp.headers()));
                warn!(status = status.as_u16(), attempt, delay_ms = delay.as_millis() as u64, "wiki asked us to back off");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
    }
}
