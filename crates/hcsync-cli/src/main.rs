use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hcsync_core::Base;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hcsync-cli")]
#[command(about = "Healthy Corners delivery sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile a base's store/product links against the delivery feed.
    Reconcile {
        #[arg(long, default_value = "PROD")]
        base: Base,
        /// Plan and report without writing to the record store.
        #[arg(long)]
        dry_run: bool,
    },
    /// Copy DEV store and product fields to PROD, creating missing records.
    Replicate,
    /// List customers with a favorite store delivered to today.
    Notify {
        #[arg(long, default_value = "PROD")]
        base: Base,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Summarise recent reconcile runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("HCSYNC_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Reconcile {
        base: Base::Prod,
        dry_run: false,
    }) {
        Commands::Reconcile { base, dry_run } => {
            let pipeline = hcsync_sync::pipeline_from_env()?;
            let summary = pipeline.run_reconcile(base, dry_run).await?;
            let result = &summary.result;
            println!(
                "reconcile complete: run_id={} base={} updated={} no_delivery={} missing_stores={} missing_products={} reports={}",
                summary.run_id,
                summary.base,
                result.updated_store_names.len(),
                result.no_delivery_store_names.len(),
                result.missing_store_names.len(),
                result.missing_product_names.len(),
                summary.reports_dir
            );
        }
        Commands::Replicate => {
            let pipeline = hcsync_sync::pipeline_from_env()?;
            let outcome = pipeline.run_replicate().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome).context("serializing replication outcome")?
            );
        }
        Commands::Notify { base } => {
            let pipeline = hcsync_sync::pipeline_from_env()?;
            let selected = pipeline.select_notifiable(base).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&selected).context("serializing customers")?
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(hcsync_sync::pipeline_from_env()?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set HCSYNC_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                reconcile = %pipeline.config().reconcile_cron,
                notify = %pipeline.config().notify_cron,
                base = %pipeline.config().scheduled_base,
                "scheduler running"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let root = std::env::var("HCSYNC_WORKSPACE_ROOT").ok().map(PathBuf::from);
            println!("{}", hcsync_sync::report_recent_markdown(runs, root)?);
        }
    }

    Ok(())
}
