//! Runs push and pull operations.

use crate::action::PullAction;
use crate::api::{ApiClient, PullQuery, RemoteApi, User};
use crate::attachments::AttachmentResolver;
use crate::committer::{batch_rows, BatchCommitter, CommitOutcome, OperationId, RetryRegistry};
use crate::config::{PullOperation, PushOperation, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::file_store::FileStore;
use crate::keystore::{EncryptionContext, Keystore};
use crate::reconciler::{Classified, Reconciler, RowOutcome};
use crate::source::RowSource;
use futures::future::join_all;
use rowsync_types::{CommitEntry, CommitPlan};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

/// Receives completion notifications.
pub trait SyncObserver: Send + Sync {
    /// Called after each push batch, with the committed entries. Empty
    /// batches report an empty slice. Not called in dry-run mode.
    fn on_batch_committed(&self, operation: OperationId, commits: &[CommitEntry]);

    /// Called after a pull handed its entries to the action.
    fn on_pull_completed(&self, _operation: OperationId, _entries: usize) {}
}

/// A push from a local row source.
pub struct PushTask {
    pub descriptor: PushOperation,
    pub source: Arc<dyn RowSource>,
}

/// A pull into a local action.
pub struct PullTask {
    pub descriptor: PullOperation,
    pub action: Arc<dyn PullAction>,
}

/// A registered operation.
pub enum Operation {
    Push(PushTask),
    Pull(PullTask),
}

impl Operation {
    pub fn description(&self) -> &str {
        match self {
            Operation::Push(task) => &task.descriptor.description,
            Operation::Pull(task) => &task.descriptor.description,
        }
    }

    pub fn target_data_source_id(&self) -> u64 {
        match self {
            Operation::Push(task) => task.descriptor.target_data_source_id,
            Operation::Pull(task) => task.descriptor.target_data_source_id,
        }
    }

    /// Re-run interval in seconds, if the operation is scheduled.
    pub fn frequency_secs(&self) -> Option<u64> {
        let frequency = match self {
            Operation::Push(task) => task.descriptor.frequency_secs,
            Operation::Pull(task) => task.descriptor.frequency_secs,
        };
        frequency.filter(|secs| *secs > 0)
    }

    fn kind(&self) -> &'static str {
        match self {
            Operation::Push(_) => "push",
            Operation::Pull(_) => "pull",
        }
    }
}

/// Counters for one operation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Rows skipped for a missing or duplicate key, or marked deleted
    /// without a remote entry.
    pub skipped: usize,
    pub batches: usize,
    /// Entries the service reported as written.
    pub affected: usize,
    /// Entries handed to a pull action.
    pub pulled: usize,
    /// Request bodies that would have been sent, in dry-run mode.
    pub dry_run_payloads: Vec<serde_json::Value>,
}

impl SyncReport {
    fn count(&mut self, outcome: &RowOutcome) {
        match outcome {
            RowOutcome::Insert => self.inserted += 1,
            RowOutcome::Update(_) => self.updated += 1,
            RowOutcome::Delete(_) => {}
            RowOutcome::Unchanged(_) => self.unchanged += 1,
            RowOutcome::SkipDeleted | RowOutcome::MissingKey | RowOutcome::DuplicateRejected => {
                self.skipped += 1
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Unknown,
    Verified,
    Failed,
}

/// Owns the operations of an agent and the state shared by their runs: the
/// upload folder cache, pending commit retries and the authentication
/// status.
pub struct SyncOrchestrator {
    config: SyncConfig,
    api: Arc<dyn RemoteApi>,
    files: Arc<FileStore>,
    attachments: AttachmentResolver,
    keystore: Keystore,
    committer: BatchCommitter,
    operations: Vec<Operation>,
    observers: Vec<Arc<dyn SyncObserver>>,
    auth: RwLock<AuthState>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator talking to the service over HTTP.
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        let api = Arc::new(ApiClient::new(&config)?);
        Self::with_api(config, api)
    }

    /// Creates an orchestrator on top of an existing API implementation.
    pub fn with_api(config: SyncConfig, api: Arc<dyn RemoteApi>) -> SyncResult<Self> {
        let files = Arc::new(FileStore::new(Arc::clone(&api)));
        let attachments = AttachmentResolver::new(Arc::clone(&files), config.request_timeout)?;
        let keystore =
            Keystore::new(Arc::clone(&api), config.kdf.clone()).with_dry_run(config.dry_run);
        let committer = BatchCommitter::new(
            Arc::clone(&api),
            config.retry.clone(),
            config.dry_run,
            Arc::new(RetryRegistry::new()),
        );

        Ok(Self {
            config,
            api,
            files,
            attachments,
            keystore,
            committer,
            operations: Vec::new(),
            observers: Vec::new(),
            auth: RwLock::new(AuthState::Unknown),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Registers a push operation.
    pub fn push(
        &mut self,
        descriptor: PushOperation,
        source: Arc<dyn RowSource>,
    ) -> SyncResult<OperationId> {
        descriptor.validate()?;
        info!(
            "Configured push to data source {}",
            descriptor.target_data_source_id
        );
        Ok(self.register(Operation::Push(PushTask { descriptor, source })))
    }

    /// Registers a pull operation.
    pub fn pull(
        &mut self,
        descriptor: PullOperation,
        action: Arc<dyn PullAction>,
    ) -> SyncResult<OperationId> {
        descriptor.validate()?;
        info!(
            "Configured pull from data source {}",
            descriptor.target_data_source_id
        );
        Ok(self.register(Operation::Pull(PullTask { descriptor, action })))
    }

    fn register(&mut self, operation: Operation) -> OperationId {
        self.operations.push(operation);
        OperationId(self.operations.len() - 1)
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SyncObserver>) {
        self.observers.push(observer);
    }

    /// The registered operations.
    pub fn operations(&self) -> impl Iterator<Item = (OperationId, &Operation)> {
        self.operations
            .iter()
            .enumerate()
            .map(|(i, op)| (OperationId(i), op))
    }

    /// The retry registry shared by all commits.
    pub fn retries(&self) -> &Arc<RetryRegistry> {
        self.committer.registry()
    }

    /// Verifies the API token.
    pub async fn authenticate(&self) -> SyncResult<User> {
        info!("Authenticating with the data source service...");
        match self.api.current_user().await {
            Ok(user) => {
                *self.auth.write().await = AuthState::Verified;
                info!(
                    "Authentication has been verified successfully. Logged in as {}",
                    user.email.as_deref().unwrap_or("user")
                );
                Ok(user)
            }
            Err(e) => {
                if e.is_auth_failure() {
                    *self.auth.write().await = AuthState::Failed;
                }
                error!("Unable to authenticate: {}", e);
                Err(e)
            }
        }
    }

    /// Returns true once authentication has been rejected.
    pub async fn auth_failed(&self) -> bool {
        *self.auth.read().await == AuthState::Failed
    }

    /// Runs one operation.
    pub async fn run_operation(&self, id: OperationId) -> SyncResult<SyncReport> {
        if self.auth_failed().await {
            return Err(SyncError::Auth(
                "authentication failed, operation not run".to_string(),
            ));
        }

        let operation = self
            .operations
            .get(id.0)
            .ok_or_else(|| SyncError::Config(format!("unknown operation {id}")))?;

        debug!(
            "Running {} operation {} ({})",
            operation.kind(),
            id,
            operation.description()
        );

        let result = match operation {
            Operation::Push(task) => self.run_push(id, task).await,
            Operation::Pull(task) => self.run_pull(id, task).await,
        };

        if let Err(e) = &result {
            if e.is_auth_failure() {
                *self.auth.write().await = AuthState::Failed;
            }
            if matches!(e, SyncError::PermissionDenied(_)) {
                error!(
                    "You don't have access to the data source {}. Please check the permissions of your user",
                    operation.target_data_source_id()
                );
            }
        }
        result
    }

    /// Runs every operation in registration order. A failing operation is
    /// logged and does not stop the others.
    pub async fn run_all(&self) -> Vec<(OperationId, SyncResult<SyncReport>)> {
        let mut results = Vec::with_capacity(self.operations.len());
        for (id, _) in self.operations() {
            let result = self.run_operation(id).await;
            if let Err(e) = &result {
                error!("Operation {} failed: {}", id, e);
            }
            results.push((id, result));
        }
        if self.operations.len() > 1 {
            info!("Finished running all operations");
        }
        results
    }

    async fn run_push(&self, id: OperationId, task: &PushTask) -> SyncResult<SyncReport> {
        let descriptor = &task.descriptor;
        self.files.reset().await;
        self.retries().cancel(id);

        let entries = self.api.fetch_entries(descriptor.target_data_source_id).await?;
        debug!("Fetched {} entries from the data source", entries.len());

        let encryption = match &descriptor.encrypt {
            Some(encrypt) => Some(self.keystore.ensure_key(encrypt).await?),
            None => None,
        };

        info!("Fetching data from {}", task.source.describe());
        let rows = task.source.fetch_rows().await?;
        debug!("Fetched {} rows from the source", rows.len());

        if descriptor.run_hooks.is_empty() {
            debug!("No post-sync hooks have been enabled");
        } else {
            debug!("Post-sync hooks enabled: {}", descriptor.run_hooks.join(", "));
        }

        let mut reconciler = Reconciler::new(descriptor, entries, &rows);
        let batches = batch_rows(rows, descriptor.mode, descriptor.batch_size);
        let last = batches.len().saturating_sub(1);
        let mut report = SyncReport::default();

        for (index, batch) in batches.into_iter().enumerate() {
            let classified = reconciler.classify_rows(batch);

            let mut plan = CommitPlan::new();
            let mut to_commit = Vec::new();
            for item in classified {
                report.count(&item.outcome);
                match &item.outcome {
                    RowOutcome::Delete(entry_id) => plan.to_delete.push(entry_id.clone()),
                    outcome if outcome.is_commit() => to_commit.push(item),
                    _ => {}
                }
            }

            plan.commits = self
                .prepare_commits(descriptor, to_commit, encryption.as_ref())
                .await?;
            if index == last {
                plan.to_delete.extend(reconciler.finish());
            }
            plan.compact_deletions();
            report.deleted += plan.to_delete.len();
            report.batches += 1;

            let commits = plan.commits.clone();
            match self.committer.commit(id, descriptor, plan).await? {
                CommitOutcome::Committed { affected } => {
                    report.affected += affected;
                    self.notify_batch(id, &commits);
                }
                CommitOutcome::Skipped if self.config.dry_run => {}
                CommitOutcome::Skipped => self.notify_batch(id, &[]),
                CommitOutcome::DryRun { payload } => report.dry_run_payloads.push(payload),
            }
        }

        info!(
            "Push {} finished: {} inserted, {} updated, {} deleted, {} unchanged, {} skipped",
            id, report.inserted, report.updated, report.deleted, report.unchanged, report.skipped
        );
        Ok(report)
    }

    /// Runs the attachment and encryption stages over the rows to commit,
    /// with at most `concurrency` rows in flight.
    async fn prepare_commits(
        &self,
        descriptor: &PushOperation,
        rows: Vec<Classified>,
        encryption: Option<&EncryptionContext>,
    ) -> SyncResult<Vec<CommitEntry>> {
        let resolve_files = !descriptor.files.is_empty() && !self.config.dry_run;
        if !descriptor.files.is_empty() && self.config.dry_run {
            debug!("Dry run: attachments are not uploaded");
        }

        let limiter = Arc::new(Semaphore::new(descriptor.concurrency.max(1)));
        let prepared = join_all(rows.into_iter().map(|mut item| {
            let limiter = Arc::clone(&limiter);
            async move {
                let _permit = limiter.acquire_owned().await.map_err(|_| SyncError::Cancelled)?;
                if resolve_files {
                    item.row = self
                        .attachments
                        .resolve(item.row, &descriptor.files, item.primary_value.as_deref())
                        .await;
                }
                if let Some(context) = encryption {
                    item.row = context.encrypt_row(item.row)?;
                }
                Ok::<_, SyncError>(item.into_commit())
            }
        }))
        .await;

        let mut commits = Vec::with_capacity(prepared.len());
        for entry in prepared {
            if let Some(entry) = entry? {
                commits.push(entry);
            }
        }
        Ok(commits)
    }

    fn notify_batch(&self, id: OperationId, commits: &[CommitEntry]) {
        for observer in &self.observers {
            observer.on_batch_committed(id, commits);
        }
    }

    async fn run_pull(&self, id: OperationId, task: &PullTask) -> SyncResult<SyncReport> {
        let descriptor = &task.descriptor;
        info!("[PULL] Fetching data from data source {}", descriptor.target_data_source_id);

        let query = PullQuery {
            filter: descriptor.filter.clone(),
            attributes: descriptor.attributes.clone(),
            join: descriptor.join.clone(),
            distinct: descriptor.distinct,
        };
        let entries = self.api.query(descriptor.target_data_source_id, &query).await?;
        let count = entries.len();
        debug!("Fetched {} entries from the data source", count);

        if self.config.dry_run {
            warn!("Dry run mode does not apply to pull actions");
        }
        task.action.apply(descriptor, entries).await?;
        for observer in &self.observers {
            observer.on_pull_completed(id, count);
        }
        info!("Pull {} finished", id);

        Ok(SyncReport {
            pulled: count,
            ..Default::default()
        })
    }
}
