use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRegistry {
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Mediawiki,
    Fixture,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SiteConfig {
    pub site: String,
    pub base: String,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub namespace: i64,
    #[serde(default)]
    pub mode: SourceMode,
    /// Directory of `*.html` articles; only read in `fixture` mode.
    #[serde(default)]
    pub fixtures_dir: Option<PathBuf>,
}

fn default_batch_size() -> usize {
    10
}

impl SiteRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: SiteRegistry =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for site in &self.sites {
            anyhow::ensure!(!site.site.is_empty(), "site entry with empty id");
            anyhow::ensure!(seen.insert(site.site.as_str()), "duplicate site {}", site.site);
            anyhow::ensure!(site.batch_size > 0, "site {} has batch_size 0", site.site);
            if site.mode == SourceMode::Fixture {
                anyhow::ensure!(
                    site.fixtures_dir.is_some(),
                    "fixture site {} needs fixtures_dir",
                    site.site
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Postgres connection string; the in-memory backend is used when unset.
    pub database_url: Option<String>,
    pub http_port: u16,
    pub user_agent_contact: String,
    pub outdated_days: i64,
    pub page_size: usize,
    pub random_multiplier: usize,
    pub top_limit: usize,
    pub top_cache_secs: u64,
    pub http_timeout_secs: u64,
    pub max_fetch_attempts: usize,
    pub sites_file: PathBuf,
    pub scheduler_enabled: bool,
    pub prune_cron: String,
    pub vote_sweep_cron: String,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// `1/true/yes/on` and `0/false/no/off`, any case.
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn flag_or(key: &str, default: bool) -> bool {
    let Ok(value) = std::env::var(key) else {
        return default;
    };
    parse_flag(&value).unwrap_or_else(|| {
        warn!(key, value, default, "unrecognised boolean, using default");
        default
    })
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            http_port: env_or("FRICTIONARY_HTTP_PORT", 3000),
            user_agent_contact: std::env::var("FRICTIONARY_USER_AGENT_CONTACT")
                .unwrap_or_else(|_| "https://github.com/frictionary/frictionary".to_string()),
            outdated_days: env_or("FRICTIONARY_OUTDATED_DAYS", 14),
            page_size: env_or("FRICTIONARY_PAGE_SIZE", 10),
            random_multiplier: env_or("FRICTIONARY_RANDOM_MULTIPLIER", 4),
            top_limit: env_or("FRICTIONARY_TOP_LIMIT", 2048),
            top_cache_secs: env_or("FRICTIONARY_TOP_CACHE_SECS", 3600),
            http_timeout_secs: env_or("FRICTIONARY_HTTP_TIMEOUT_SECS", 20),
            max_fetch_attempts: env_or("FRICTIONARY_MAX_FETCH_ATTEMPTS", 8),
            sites_file: std::env::var("FRICTIONARY_SITES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sites.yaml")),
            scheduler_enabled: flag_or("FRICTIONARY_SCHEDULER_ENABLED", true),
            prune_cron: std::env::var("FRICTIONARY_PRUNE_CRON")
                .unwrap_or_else(|_| "0 0 4 * * *".to_string()),
            vote_sweep_cron: std::env::var("FRICTIONARY_VOTE_SWEEP_CRON")
                .unwrap_or_else(|_| "0 30 * * * *".to_string()),
        }
    }

    pub fn user_agent(&self) -> String {
        format!("Frictionary/1.0 (+{}) reqwest", self.user_agent_contact)
    }

    pub fn outdated_after(&self) -> chrono::Duration {
        chrono::Duration::days(self.outdated_days)
    }
}
