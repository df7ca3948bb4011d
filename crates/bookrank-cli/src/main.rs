use std::sync::Arc;

use anyhow::{Context, Result};
use bookrank_core::PeriodType;
use bookrank_storage::SqliteRepository;
use bookrank_sync::{build_source, service_from_config, Scheduler, SyncConfig};
use bookrank_web::AppState;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "bookrank")]
#[command(about = "Book ranking ingestion and read API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply schema migrations and exit.
    Migrate,
    /// Run one ingestion for a category key and period.
    Ingest {
        #[arg(long)]
        category: String,
        #[arg(long, default_value = "daily")]
        period: String,
    },
    /// Run the tick scheduler until Ctrl-C.
    Schedule,
    /// Serve the read API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Schedule) {
        Commands::Migrate => {
            let repo = SqliteRepository::connect(&config.database_url)
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            repo.migrate().await?;
            let counts = repo.table_counts().await?;
            println!(
                "migrations applied: sites={} categories={} books={} rankings={}",
                counts.sites, counts.categories, counts.books, counts.rankings
            );
        }
        Commands::Ingest { category, period } => {
            let (_repo, service) = service_from_config(&config).await?;
            if period.parse::<PeriodType>().is_err() {
                warn!(period = %period, "unrecognized period; ingesting daily");
            }
            let summary = service
                .run(&category, &period)
                .await
                .with_context(|| format!("ingesting {category}"))?;
            println!(
                "ingest complete: run_id={} job={} window={}..{} items={} rankings={}",
                summary.run_id,
                summary.job,
                summary.window.date_from,
                summary.window.date_to,
                summary.items_fetched,
                summary.rankings_written
            );
        }
        Commands::Schedule => {
            let (_repo, service) = service_from_config(&config).await?;
            let scheduler = Scheduler::new(Arc::new(service), config.scheduler_config());
            let control = scheduler
                .start()
                .context("scheduler control loop already running")?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("shutdown requested; draining in-flight jobs");
            scheduler.stop();
            control.await.context("scheduler control loop")?;
        }
        Commands::Serve => {
            let repo = SqliteRepository::connect(&config.database_url)
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            repo.migrate().await?;
            let state = match build_source(&config) {
                Ok(source) => AppState::new(repo).with_source(source),
                Err(err) => {
                    warn!(error = %err, "live ranking route disabled");
                    AppState::new(repo)
                }
            };
            bookrank_web::serve(state, config.web_port).await?;
        }
    }

    Ok(())
}
