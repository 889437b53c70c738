//! Service wiring: configuration, vote gating, request orchestration and scheduled upkeep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use frictionary_adapters::{
    ArticleSource, ExcerptExtractor, FixtureArticleSource, LeadParagraphExtractor, MediaWikiSource,
    SuggestionFetcher, WikiSite,
};
use frictionary_storage::{
    HttpClientConfig, HttpFetcher, MemoryBackend, PgBackend, StoreConfig, SuggestionBackend,
    SuggestionStore,
};
use tracing::{info, warn};

pub mod config;
pub mod scheduler;
pub mod service;
pub mod vote_gate;

pub use config::{AppConfig, SiteConfig, SiteRegistry, SourceMode};
pub use scheduler::build_scheduler;
pub use service::{
    ServiceConfig, ServiceError, SiteHandle, SiteInfo, SuggestionPage, SuggestionService, VoteError,
};
pub use vote_gate::{VoteGate, VoteGateConfig, VoteRejection};

pub const CRATE_NAME: &str = "frictionary-sync";

/// Opens the configured backend: Postgres (migrated) when `DATABASE_URL` is set,
/// the in-memory backend otherwise.
pub async fn open_backend(config: &AppConfig) -> Result<Arc<dyn SuggestionBackend>> {
    match &config.database_url {
        Some(url) => {
            let backend = PgBackend::connect(url)
                .await
                .context("connecting to suggestion database")?;
            backend
                .migrate()
                .await
                .context("running suggestion migrations")?;
            info!("using postgres suggestion store");
            Ok(Arc::new(backend))
        }
        None => {
            warn!("DATABASE_URL not set; suggestions are kept in memory and lost on restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

pub async fn build_service_from_env() -> Result<(AppConfig, SuggestionService)> {
    let config = AppConfig::from_env();
    let registry = SiteRegistry::load(&config.sites_file).await?;
    let backend = open_backend(&config).await?;
    let service = build_service(&config, &registry, backend).await?;
    Ok((config, service))
}

pub async fn build_service(
    config: &AppConfig,
    registry: &SiteRegistry,
    backend: Arc<dyn SuggestionBackend>,
) -> Result<SuggestionService> {
    let store = Arc::new(SuggestionStore::new(
        backend,
        StoreConfig {
            top_cache_ttl: Duration::from_secs(config.top_cache_secs),
            ..StoreConfig::default()
        },
    ));
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent()),
        ..Default::default()
    })?);
    let extractor: Arc<dyn ExcerptExtractor> = Arc::new(LeadParagraphExtractor::new()?);
    let registry_dir = config.sites_file.parent().unwrap_or(Path::new("."));

    let mut sites = Vec::with_capacity(registry.sites.len());
    for site in &registry.sites {
        let source: Arc<dyn ArticleSource> = match site.mode {
            SourceMode::Mediawiki => {
                Arc::new(MediaWikiSource::new(site.site.clone(), &site.base, http.clone()))
            }
            SourceMode::Fixture => {
                let dir = site
                    .fixtures_dir
                    .as_deref()
                    .with_context(|| format!("fixture site {} has no fixtures_dir", site.site))?;
                let dir = resolve_relative(registry_dir, dir);
                let fixtures = FixtureArticleSource::from_dir(&site.base, &dir).await?;
                info!(site = %site.site, articles = fixtures.len(), "loaded fixture articles");
                Arc::new(fixtures)
            }
        };
        let fetcher = SuggestionFetcher::new(
            WikiSite {
                site: site.site.clone(),
                batch_size: site.batch_size,
                namespace: site.namespace,
            },
            source,
            extractor.clone(),
            config.max_fetch_attempts,
        );
        sites.push(SiteHandle {
            info: SiteInfo {
                id: site.site.clone(),
                info: site.info.clone(),
            },
            fetcher: Arc::new(fetcher),
        });
    }
    info!(sites = sites.len(), "configured sites");

    Ok(SuggestionService::new(
        store,
        sites,
        VoteGate::default(),
        ServiceConfig {
            page_size: config.page_size,
            random_multiplier: config.random_multiplier,
            top_limit: config.top_limit,
            outdated_after: config.outdated_after(),
        },
    ))
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
