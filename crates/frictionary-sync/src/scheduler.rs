use anyhow::{Context, Result};
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::service::SuggestionService;

/// Daily pruning of outdated suggestions plus the periodic vote-history sweep.
/// Returns `None` when scheduling is disabled.
pub async fn build_scheduler(
    service: &SuggestionService,
    config: &AppConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let prune_service = service.clone();
    let cron = &config.prune_cron;
    let prune = Job::new_async(cron, move |_uuid, _l| {
        let service = prune_service.clone();
        Box::pin(async move {
            if let Err(err) = service.prune_outdated(Utc::now()).await {
                warn!(error = %err, "scheduled prune failed");
            }
        })
    })
    .with_context(|| format!("creating prune job for cron {cron}"))?;
    sched.add(prune).await.context("adding prune job")?;

    let sweep_service = service.clone();
    let cron = &config.vote_sweep_cron;
    let sweep = Job::new_async(cron, move |_uuid, _l| {
        let service = sweep_service.clone();
        Box::pin(async move {
            service.sweep_vote_gate(Utc::now());
        })
    })
    .with_context(|| format!("creating vote sweep job for cron {cron}"))?;
    sched.add(sweep).await.context("adding vote sweep job")?;

    info!(prune = %config.prune_cron, sweep = %config.vote_sweep_cron, "scheduler configured");
    Ok(Some(sched))
}
