use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use frictionary_storage::PgBackend;
use frictionary_sync::{build_scheduler, build_service_from_env, AppConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "frictionary")]
#[command(about = "Frictionary suggestion service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API with scheduled upkeep.
    Serve,
    /// Delete outdated suggestions without positive votes.
    Prune,
    /// Run fetch-and-store cycles for one site.
    Fetch {
        site: String,
        #[arg(long, default_value_t = 1)]
        cycles: usize,
    },
    /// Apply database migrations.
    Migrate,
    /// List configured sites.
    Sites,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("frictionary=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let (config, service) = build_service_from_env().await?;
            if let Err(err) = service.prune_outdated(Utc::now()).await {
                warn!(error = %err, "startup prune failed");
            }
            let scheduler = build_scheduler(&service, &config).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
            }
            frictionary_web::serve(service, config.http_port).await?;
        }
        Commands::Prune => {
            let (_, service) = build_service_from_env().await?;
            let removed = service.prune_outdated(Utc::now()).await?;
            println!("pruned {removed} outdated suggestions");
        }
        Commands::Fetch { site, cycles } => {
            let (_, service) = build_service_from_env().await?;
            let mut saved = 0;
            for cycle in 1..=cycles {
                let batch = service.fetch_and_store(&site).await?;
                info!(site, cycle, saved = batch.len(), "fetch cycle finished");
                saved += batch.len();
            }
            println!("stored {saved} suggestions for {site}");
        }
        Commands::Migrate => {
            let config = AppConfig::from_env();
            let url = config
                .database_url
                .context("DATABASE_URL must be set to run migrations")?;
            PgBackend::connect(&url)
                .await
                .context("connecting to suggestion database")?
                .migrate()
                .await
                .context("running suggestion migrations")?;
            println!("migrations applied");
        }
        Commands::Sites => {
            let (_, service) = build_service_from_env().await?;
            for site in service.sites() {
                println!("{}\t{}", site.id, site.info.as_deref().unwrap_or(""));
            }
        }
    }

    Ok(())
}
