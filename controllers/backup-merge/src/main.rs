//! KuberDock Backup Merge
//!
//! Folds node backup snapshots taken within `precision` hours of each other
//! into the first snapshot of their group. Runs under a lock named after the
//! backups root, so overlapping cron runs on a node skip instead of racing.

mod cli;

use clap::Parser;
use cli::Cli;
use kd_core::lock::FileLeaseBackend;
use kd_core::{BackupMerger, Blocking, KdConfig, LockClient, MergeReport};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Merge failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = KdConfig::load(cli.config.as_deref())?;
    let root = cli.backups.clone().unwrap_or_else(|| config.backups.root.clone());
    let options = cli.merge_options(config.backups.precision_hours);

    info!("Configuration:");
    info!("  Backups: {}", root.display());
    info!("  Precision: {}h", options.precision_hours);
    info!("  Lock dir: {}", config.locks.dir.display());

    let (poll_min, poll_max) = config.locks.poll_bounds();
    let locks = LockClient::new(Arc::new(FileLeaseBackend::new(&config.locks.dir)?))
        .with_polling(poll_min, poll_max);
    let merger = BackupMerger::new(&root, options);

    let outcome = locks
        .run_exclusive(
            &format!("backup-merge.{}", root.display()),
            Some(Duration::from_secs(config.backups.lock_ttl_secs)),
            Blocking::No,
            || async move {
                let report = tokio::task::spawn_blocking(move || merger.do_merge()).await??;
                Ok::<_, anyhow::Error>(report)
            },
        )
        .await?;

    match outcome {
        Some(report) => log_report(&report),
        None => info!("Another merge of {} is running, nothing to do", root.display()),
    }
    Ok(())
}

fn log_report(report: &MergeReport) {
    if report.merged.is_empty() {
        info!("Nothing to merge");
    }
    let verb = if report.dry_run { "Would merge" } else { "Merged" };
    for group in &report.merged {
        info!("{} {} snapshot(s) into {}", verb, group.sources.len(), group.target);
    }
}
