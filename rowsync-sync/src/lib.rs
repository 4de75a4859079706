//! Reconciliation and commit engine for rowsync.
//!
//! A push fetches the entries of a remote data source, reads rows from a
//! local [`RowSource`], classifies every row with the [`Reconciler`],
//! uploads referenced files, encrypts designated fields and commits the
//! result in batches through the [`BatchCommitter`]. A pull queries a data
//! source and hands the entries to a [`PullAction`].
//!
//! The [`SyncOrchestrator`] owns the registered operations and the state
//! their runs share:
//! - the upload folder cache of the [`FileStore`], reset per operation
//! - the [`RetryRegistry`] of pending commit retries
//! - the authentication status, which short-circuits every operation once
//!   the token has been rejected

pub mod action;
pub mod api;
pub mod attachments;
pub mod committer;
pub mod config;
pub mod error;
pub mod file_store;
pub mod keystore;
pub mod orchestrator;
pub mod reconciler;
pub mod source;

pub use action::{JsonFileAction, PullAction, SqliteTableAction};
pub use api::{ApiClient, RemoteApi};
pub use attachments::{AttachmentOutcome, AttachmentResolver};
pub use committer::{BatchCommitter, CommitOutcome, OperationId, RetryRegistry};
pub use config::{
    AttachmentDefinition, AttachmentKind, ComparePolicy, EncryptConfig, FileNamePolicy,
    PullOperation, PushOperation, RetryPolicy, SharepointConfig, SyncConfig, SyncMode,
};
pub use error::{SyncError, SyncResult};
pub use file_store::FileStore;
pub use keystore::{EncryptionContext, Keystore};
pub use orchestrator::{Operation, SyncObserver, SyncOrchestrator, SyncReport};
pub use reconciler::{reconcile, Classified, Reconciler, RowOutcome};
pub use source::{HttpSource, RowSource, SqliteSource, StaticSource};

pub use rowsync_crypto::KdfParams;
