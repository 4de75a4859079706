//! Startup pass and scheduled re-runs.

use anyhow::{Context, Result};
use rowsync_sync::{OperationId, SyncOrchestrator, SyncReport, SyncResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Run flags taken from the config file and the command line.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub dry_run: bool,
    pub sync_on_init: bool,
}

/// Drives an orchestrator: authenticates, runs the startup pass and
/// schedules operations that carry a frequency.
pub struct AgentRunner {
    orchestrator: Arc<SyncOrchestrator>,
    options: RunOptions,
    // Serializes runs so two schedules never overlap.
    run_lock: Arc<Mutex<()>>,
}

impl AgentRunner {
    pub fn new(orchestrator: SyncOrchestrator, options: RunOptions) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            options,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Authenticates and runs every operation once if `sync_on_init` is
    /// set. Returns the per-operation results of that pass.
    pub async fn start(&self) -> Result<Vec<(OperationId, SyncResult<SyncReport>)>> {
        if self.options.dry_run {
            warn!("Dry run enabled: no data will be committed");
        }

        self.orchestrator
            .authenticate()
            .await
            .context("Authentication failed")?;

        if !self.options.sync_on_init {
            info!("Skipping the initial sync");
            return Ok(Vec::new());
        }

        let _guard = self.run_lock.lock().await;
        let results = self.orchestrator.run_all().await;
        log_results(&results);
        Ok(results)
    }

    /// Spawns one interval task per scheduled operation.
    pub fn schedule(&self) -> Vec<JoinHandle<()>> {
        self.orchestrator
            .operations()
            .filter_map(|(id, operation)| operation.frequency_secs().map(|secs| (id, secs)))
            .map(|(id, secs)| {
                info!("Scheduling operation {} every {} seconds", id, secs);
                let orchestrator = Arc::clone(&self.orchestrator);
                let run_lock = Arc::clone(&self.run_lock);
                tokio::spawn(run_every(orchestrator, run_lock, id, Duration::from_secs(secs)))
            })
            .collect()
    }

    /// Runs the agent until interrupted. A dry run, or a config without
    /// scheduled operations, returns after the startup pass.
    pub async fn run(self) -> Result<()> {
        self.start().await?;

        if self.options.dry_run {
            info!("Dry run finished");
            return Ok(());
        }

        let handles = self.schedule();
        if handles.is_empty() {
            info!("No scheduled operations, exiting");
            return Ok(());
        }

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutting down");
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }
}

async fn run_every(
    orchestrator: Arc<SyncOrchestrator>,
    run_lock: Arc<Mutex<()>>,
    id: OperationId,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        if orchestrator.auth_failed().await {
            error!("Stopping schedule of operation {}: authentication failed", id);
            return;
        }

        let _guard = run_lock.lock().await;
        match orchestrator.run_operation(id).await {
            Ok(report) => info!(
                "Scheduled run of operation {} done ({} inserted, {} updated, {} deleted)",
                id, report.inserted, report.updated, report.deleted
            ),
            Err(e) => error!("Scheduled run of operation {} failed: {}", id, e),
        }
    }
}

fn log_results(results: &[(OperationId, SyncResult<SyncReport>)]) {
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed > 0 {
        warn!("{} of {} operations failed", failed, results.len());
    }
}
