use std::sync::Arc;

use brisk_sync::{CycleReport, NoopProvider, ProviderError, SyncWorker, TaskProvider};
use brisk_task::SharedTaskStore;
use color_eyre::{eyre::eyre, Result};
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;

/// `brisk sync`: one drain-and-poll cycle, or a background loop until
/// Ctrl-C with `--watch`.
pub async fn run(store: SharedTaskStore, cfg: &Config, watch: bool) -> Result<()> {
    // No network client ships with the CLI yet; changes are acknowledged locally.
    let provider: Arc<dyn TaskProvider> = Arc::new(NoopProvider);
    let worker = SyncWorker::new(store, provider).with_settings(cfg.worker_settings());
    if watch {
        watch_until_interrupted(&worker).await
    } else {
        let report = run_once(&worker).await?;
        println!("{}", render_report(&report));
        Ok(())
    }
}

async fn run_once(worker: &SyncWorker) -> Result<CycleReport> {
    worker.run_cycle().await.map_err(reauth_error)
}

async fn watch_until_interrupted(worker: &SyncWorker) -> Result<()> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping sync");
        }
        let _ = tx.send(true);
    });
    println!("Syncing every {:?}; press Ctrl-C to stop.", worker.settings().drain_interval);
    worker.run(rx).await.map_err(reauth_error)?;
    println!("Sync stopped.");
    Ok(())
}

fn reauth_error(err: ProviderError) -> color_eyre::Report {
    match err {
        ProviderError::Unauthorized => {
            eyre!("the sync provider rejected your credentials; sign in again and rerun `brisk sync`")
        }
        other => eyre!("sync failed: {other}"),
    }
}

fn render_report(report: &CycleReport) -> String {
    let drained = &report.drained;
    let mut out = format!(
        "Pushed {} change(s), {} skipped, {} failed.",
        drained.resolved, drained.skipped, drained.failed
    );
    if drained.retried > 0 {
        out.push_str(&format!(" Retried {} earlier failure(s).", drained.retried));
    }
    match &report.polled {
        Some(poll) => out.push_str(&format!(
            " Pulled {} list(s) and {} task(s); removed {} deleted remotely.",
            poll.lists, poll.tasks, poll.pruned
        )),
        None => out.push_str(" Remote poll not due yet."),
    }
    if drained.failed > 0 {
        out.push_str(" See `brisk queue list`.");
    }
    out
}
