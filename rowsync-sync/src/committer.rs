//! Batch commits with bounded retry.
//!
//! Each submission runs in its own task. While it waits between attempts its
//! [`AbortHandle`] sits in the [`RetryRegistry`], so a newer run of the same
//! operation can cancel it before the stale retry fires.

use crate::api::{CommitRequest, RemoteApi};
use crate::config::{PushOperation, RetryPolicy, SyncMode};
use crate::error::{SyncError, SyncResult};
use rowsync_types::{CommitPlan, Row};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Identifies a registered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub usize);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Splits the rows of a run into commit batches.
///
/// `update` runs are a single batch; `replace` runs are sliced into
/// `batch_size` rows. There is always at least one batch, possibly empty.
pub fn batch_rows(rows: Vec<Row>, mode: SyncMode, batch_size: usize) -> Vec<Vec<Row>> {
    let batch_size = batch_size.max(1);
    if mode == SyncMode::Update || rows.len() <= batch_size {
        return vec![rows];
    }
    let mut batches = Vec::with_capacity(rows.len().div_ceil(batch_size));
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        batches.push(rows.by_ref().take(batch_size).collect());
    }
    batches
}

/// Builds the request body for one batch.
pub fn build_request(operation: &PushOperation, plan: CommitPlan) -> CommitRequest {
    CommitRequest {
        append: true,
        entries: plan.commits,
        delete: if plan.to_delete.is_empty() {
            None
        } else {
            Some(plan.to_delete)
        },
        run_hooks: operation.run_hooks.clone(),
        extend: operation.merge.then_some(true),
    }
}

/// Pending commit tasks, by operation.
#[derive(Debug, Default)]
pub struct RetryRegistry {
    pending: Mutex<HashMap<OperationId, (u64, AbortHandle)>>,
    generation: AtomicU64,
}

impl RetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the task committing for `operation`, aborting any task still
    /// registered for it. Returns the registration's generation.
    pub fn register(&self, operation: OperationId, handle: AbortHandle) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let previous = match self.pending.lock() {
            Ok(mut pending) => pending.insert(operation, (generation, handle)),
            Err(poisoned) => poisoned.into_inner().insert(operation, (generation, handle)),
        };
        if let Some((_, stale)) = previous {
            stale.abort();
        }
        generation
    }

    /// Aborts the pending commit of `operation`. Returns true if one was
    /// pending.
    pub fn cancel(&self, operation: OperationId) -> bool {
        let removed = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&operation),
            Err(poisoned) => poisoned.into_inner().remove(&operation),
        };
        match removed {
            Some((_, handle)) if !handle.is_finished() => {
                info!("Cancelled pending commit retry of operation {}", operation);
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Removes the registration of `operation` if it is still `generation`.
    pub fn clear(&self, operation: OperationId, generation: u64) {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        if pending.get(&operation).is_some_and(|(g, _)| *g == generation) {
            pending.remove(&operation);
        }
    }

    /// Returns true if a commit of `operation` is still running.
    pub fn is_pending(&self, operation: OperationId) -> bool {
        let pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending
            .get(&operation)
            .is_some_and(|(_, handle)| !handle.is_finished())
    }
}

/// Result of committing one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The service accepted the commit.
    Committed { affected: usize },
    /// Dry run: the payload that would have been sent.
    DryRun { payload: serde_json::Value },
    /// Nothing to commit.
    Skipped,
}

/// Submits a commit, retrying retryable failures up to the policy's bound.
pub async fn submit_with_retry(
    api: Arc<dyn RemoteApi>,
    data_source_id: u64,
    request: CommitRequest,
    policy: RetryPolicy,
) -> SyncResult<usize> {
    let mut attempt = 1;
    loop {
        match api.commit(data_source_id, &request).await {
            Ok(response) => return Ok(response.affected()),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                return Err(SyncError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                warn!(
                    "Commit attempt {}/{} to data source {} failed: {}. Retrying in {:?}",
                    attempt, policy.max_attempts, data_source_id, e, policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

/// Sends commit batches to the remote service.
pub struct BatchCommitter {
    api: Arc<dyn RemoteApi>,
    retry: RetryPolicy,
    dry_run: bool,
    registry: Arc<RetryRegistry>,
}

impl BatchCommitter {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        retry: RetryPolicy,
        dry_run: bool,
        registry: Arc<RetryRegistry>,
    ) -> Self {
        Self {
            api,
            retry,
            dry_run,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<RetryRegistry> {
        &self.registry
    }

    /// Commits one batch of `operation`.
    pub async fn commit(
        &self,
        id: OperationId,
        operation: &PushOperation,
        plan: CommitPlan,
    ) -> SyncResult<CommitOutcome> {
        if plan.is_empty() {
            info!("Nothing to commit");
            return Ok(CommitOutcome::Skipped);
        }

        debug!(
            "Committing {} inserts, {} updates and {} deletions",
            plan.insert_count(),
            plan.update_count(),
            plan.to_delete.len()
        );

        if self.dry_run {
            info!("Dry run mode is enabled. This is the commit that would have been sent:");
            info!("{}", serde_json::to_string_pretty(&plan.commits)?);
            if !plan.to_delete.is_empty() {
                info!("Entries to delete: {}", serde_json::to_string_pretty(&plan.to_delete)?);
            }
            let payload = serde_json::to_value(build_request(operation, plan))?;
            return Ok(CommitOutcome::DryRun { payload });
        }

        let request = build_request(operation, plan);
        let task = tokio::spawn(submit_with_retry(
            Arc::clone(&self.api),
            operation.target_data_source_id,
            request,
            self.retry.clone(),
        ));
        let generation = self.registry.register(id, task.abort_handle());
        let result = task.await;
        self.registry.clear(id, generation);

        match result {
            Ok(Ok(affected)) => {
                info!("Sync finished. {} data source entries have been affected", affected);
                Ok(CommitOutcome::Committed { affected })
            }
            Ok(Err(e)) => Err(e),
            Err(e) if e.is_cancelled() => Err(SyncError::Cancelled),
            Err(e) => Err(SyncError::Network(format!("commit task failed: {e}"))),
        }
    }
}
