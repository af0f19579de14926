use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;
use crate::pipeline::Converter;
use crate::queue::JobStore;
use crate::temp::cleanup_orphaned_temp_files;

/// Run `worker_count` workers plus the sweeper until `shutdown` flips to true
///
/// Workers stop claiming once shutdown is signalled; a job already being
/// processed runs to completion first.
pub async fn run_workers(converter: Arc<Converter>, store: Arc<JobStore>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let cfg = converter.config().clone();
    let worker_count = cfg.worker_count();
    info!("🚀 Starting {} worker(s) on {}", worker_count, converter.host());

    let mut tasks = JoinSet::new();
    for idx in 0..worker_count {
        tasks.spawn(worker_loop(
            idx,
            converter.clone(),
            store.clone(),
            Duration::from_millis(cfg.poll_interval_ms),
            shutdown.clone(),
        ));
    }
    tasks.spawn(sweep_loop(
        store.clone(),
        SweepSettings {
            every: Duration::from_secs(cfg.sweep_interval_secs.max(1)),
            retention: cfg.retention(),
            temp_dir: cfg.temp_dir.clone(),
            orphan_age: cfg.stale_after(),
        },
        shutdown.clone(),
    ));

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Worker task panicked: {}", e);
        }
    }

    info!("👋 All workers stopped");
    Ok(())
}

async fn worker_loop(
    idx: usize,
    converter: Arc<Converter>,
    store: Arc<JobStore>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Worker {} ready", idx);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match store.claim_next().await {
            Ok(Some(job)) => {
                info!("Worker {}: starting job {}", idx, job.id);
                let outcome = converter.process(&job).await;
                if let Err(e) = store.complete(&job.id, outcome).await {
                    error!("Worker {}: failed to record outcome of job {}: {:#}", idx, job.id, e);
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => warn!("Worker {}: failed to claim a job: {:#}", idx, e),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Worker {} stopped", idx);
}

struct SweepSettings {
    every: Duration,
    retention: Duration,
    temp_dir: PathBuf,
    /// Temp files untouched for this long belong to no running job
    orphan_age: Duration,
}

/// Prune finished records and orphaned temp files on every tick
async fn sweep_loop(store: Arc<JobStore>, settings: SweepSettings, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(settings.every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.clean(settings.retention, Utc::now()).await {
                    warn!("Job record sweep failed: {:#}", e);
                }
                if let Err(e) = cleanup_orphaned_temp_files(&settings.temp_dir, settings.orphan_age).await {
                    warn!("Temp file sweep failed: {:#}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
