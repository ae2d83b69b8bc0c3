use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qjr_sync::{pipeline_from_config, CollectorConfig, CycleOutcome};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "qjr-cli")]
#[command(about = "Quant Job Radar command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection cycle and exit.
    Collect,
    /// Run the cron-scheduled collector with the health server.
    Serve {
        /// Listen address for the health endpoints.
        #[arg(long, default_value = "0.0.0.0:3000")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = CollectorConfig::from_env();

    match cli.command.unwrap_or(Commands::Collect) {
        Commands::Collect => {
            let pipeline = pipeline_from_config(&config)?;
            match pipeline.run_cycle(&config.search_url()?).await? {
                CycleOutcome::Completed(summary) => {
                    println!(
                        "cycle complete: scraped={} new={} processed={} errors={}",
                        summary.total_scraped,
                        summary.new_listings,
                        summary.processed,
                        summary.errors
                    );
                }
                CycleOutcome::Skipped => {
                    println!("cycle skipped: another cycle is already running");
                }
            }
        }
        Commands::Serve { addr } => {
            let pipeline = Arc::new(pipeline_from_config(&config)?);
            let search_url = config.search_url()?;

            if config.scheduler_enabled {
                let scheduler = qjr_sync::build_scheduler(
                    pipeline.clone(),
                    &config.sync_cron,
                    search_url.clone(),
                )
                .await?;
                scheduler.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "collection scheduler started");
            } else {
                info!("scheduler disabled; set QJR_SCHEDULER_ENABLED=1 to enable");
            }

            // Run an initial cycle on startup, then serve health checks.
            let startup = pipeline.clone();
            tokio::spawn(async move {
                let _ = startup.run_cycle(&search_url).await;
            });

            info!(%addr, "health server listening");
            qjr_web::serve(&addr, qjr_web::AppState::new(pipeline)).await?;
        }
    }

    Ok(())
}
