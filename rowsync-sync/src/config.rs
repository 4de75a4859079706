//! Agent and operation configuration.
//!
//! Operation descriptors are plain serde structs so they can be loaded from
//! a config file as-is; [`PushOperation::validate`] enforces the rules that
//! cannot be expressed in the types.

use crate::error::{SyncError, SyncResult};
use rowsync_crypto::KdfParams;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of rows per committed batch in `replace` mode.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default number of rows processed concurrently.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Maximum number of commit submissions per batch.
pub const MAX_RETRIES: u32 = 5;

/// Delay between commit submissions.
pub const RETRY_DELAY: Duration = Duration::from_secs(60);

/// API endpoint for European accounts (the default region).
pub const EU_API_URL: &str = "https://api.fliplet.com";

/// API endpoint for US accounts.
pub const US_API_URL: &str = "https://us.api.fliplet.com";

/// Agent-wide configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// API token; its first two characters select the region.
    pub auth_token: String,
    /// Overrides the regional API URL.
    pub api_base_url: Option<String>,
    /// Log commit payloads instead of sending them.
    pub dry_run: bool,
    /// Timeout for each API request.
    pub request_timeout: Duration,
    /// Commit retry behavior.
    pub retry: RetryPolicy,
    /// Key derivation cost for field encryption and the keystore.
    pub kdf: KdfParams,
}

impl SyncConfig {
    /// Creates a configuration for the given API token.
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            api_base_url: None,
            dry_run: false,
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            kdf: KdfParams::default(),
        }
    }

    /// Sets an explicit API base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Enables or disables dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the key derivation parameters.
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Returns the API base URL, without a trailing slash.
    pub fn base_url(&self) -> String {
        match &self.api_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => region_base_url(&self.auth_token).to_string(),
        }
    }
}

/// Picks the regional API URL from the token prefix (`us...` or `eu...`).
pub fn region_base_url(auth_token: &str) -> &'static str {
    let region: String = auth_token.chars().take(2).collect();
    if region.eq_ignore_ascii_case("us") {
        US_API_URL
    } else {
        EU_API_URL
    }
}

/// Bounded, fixed-delay retry for commit submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of submissions, including the first one.
    pub max_attempts: u32,
    /// Delay between two submissions.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given bound and delay.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// A single submission with no retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(MAX_RETRIES, RETRY_DELAY)
    }
}

/// How a push treats remote entries that have no local counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Additive: orphaned remote entries are kept, unchanged rows skipped.
    #[default]
    Update,
    /// Authoritative: orphaned remote entries are deleted and every row is
    /// re-sent.
    Replace,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Update => f.write_str("update"),
            SyncMode::Replace => f.write_str("replace"),
        }
    }
}

/// Where an attachment column's file comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// The column holds an HTTP(S) URL.
    Remote,
    /// The column holds a local file path.
    Local,
    /// The column holds a SharePoint server-relative path or URL.
    Sharepoint,
}

/// How an attachment is matched against files already uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparePolicy {
    /// Same content checksum.
    #[default]
    Checksum,
    /// Same file name.
    Name,
    /// Same checksum and same file name.
    Both,
}

/// How a SharePoint attachment gets its file name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileNamePolicy {
    /// Use the last segment of the referenced path.
    #[default]
    Inherit,
    /// Always use the given name.
    Fixed(String),
}

/// Credentials for fetching SharePoint attachments (client-credentials
/// flow).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharepointConfig {
    /// Site URL, e.g. `https://contoso.sharepoint.com/sites/hr`.
    pub site_url: String,
    /// Azure AD tenant id.
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Token endpoint; defaults to the Microsoft identity platform.
    #[serde(default)]
    pub token_url: Option<String>,
}

impl SharepointConfig {
    /// Returns the OAuth2 token endpoint.
    pub fn token_url(&self) -> String {
        self.token_url.clone().unwrap_or_else(|| {
            format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                self.tenant_id
            )
        })
    }
}

/// A row column that references a file to upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDefinition {
    /// Column holding the reference. After upload it holds the file URL,
    /// and `{column}MediaFileId` holds the file id.
    pub column: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    /// Base directory for `local` paths.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Extra request headers for `remote` downloads.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub compare: ComparePolicy,
    #[serde(default)]
    pub file_name: FileNamePolicy,
    /// Required for `sharepoint` attachments.
    #[serde(default)]
    pub sharepoint: Option<SharepointConfig>,
}

impl AttachmentDefinition {
    /// Name of the column that receives the uploaded file id.
    pub fn media_file_id_column(&self) -> String {
        format!("{}MediaFileId", self.column)
    }
}

/// Field encryption settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptConfig {
    /// Columns to encrypt.
    pub fields: Vec<String>,
    /// Passphrase. When absent, one is created in (or read from) the
    /// remote keystore.
    #[serde(default)]
    pub key: Option<String>,
}

/// Describes a push from a local row source into a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushOperation {
    #[serde(default)]
    pub description: String,
    pub target_data_source_id: u64,
    /// Column identifying a row. Without it every row is inserted.
    #[serde(default)]
    pub primary_column: Option<String>,
    /// Column holding the last-modified time of a row.
    #[serde(default)]
    pub timestamp_column: Option<String>,
    /// Column that, when truthy, marks a row as deleted.
    #[serde(default)]
    pub delete_column: Option<String>,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default)]
    pub case_insensitive_primary_column: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub files: Vec<AttachmentDefinition>,
    #[serde(default)]
    pub encrypt: Option<EncryptConfig>,
    /// Post-sync hooks the remote service runs after each commit.
    #[serde(default)]
    pub run_hooks: Vec<String>,
    /// Merge committed columns into existing entries instead of replacing
    /// their data.
    #[serde(default)]
    pub merge: bool,
    /// Re-run interval when scheduled.
    #[serde(default)]
    pub frequency_secs: Option<u64>,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl PushOperation {
    /// Creates a push into `target_data_source_id` with default settings.
    pub fn new(target_data_source_id: u64) -> Self {
        Self {
            description: String::new(),
            target_data_source_id,
            primary_column: None,
            timestamp_column: None,
            delete_column: None,
            mode: SyncMode::default(),
            case_insensitive_primary_column: false,
            concurrency: DEFAULT_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            files: Vec::new(),
            encrypt: None,
            run_hooks: Vec::new(),
            merge: false,
            frequency_secs: None,
        }
    }

    /// Checks the rules a descriptor must satisfy before it can run.
    pub fn validate(&self) -> SyncResult<()> {
        if self.target_data_source_id == 0 {
            return Err(SyncError::Config(
                "target_data_source_id is required".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(SyncError::Config("concurrency must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".to_string()));
        }

        if let (Some(encrypt), Some(primary)) = (&self.encrypt, &self.primary_column) {
            if encrypt.fields.iter().any(|f| f == primary) {
                return Err(SyncError::Config(format!(
                    "the primary column \"{primary}\" cannot be encrypted"
                )));
            }
        }
        if let Some(key) = self.encrypt.as_ref().and_then(|e| e.key.as_deref()) {
            if key.is_empty() {
                return Err(SyncError::Config("encryption key cannot be empty".to_string()));
            }
        }

        for definition in &self.files {
            if definition.column.is_empty() {
                return Err(SyncError::Config("file column name cannot be empty".to_string()));
            }
            if definition.kind == AttachmentKind::Sharepoint && definition.sharepoint.is_none() {
                return Err(SyncError::Config(format!(
                    "file column \"{}\" is a sharepoint file but has no sharepoint settings",
                    definition.column
                )));
            }
        }
        Ok(())
    }

    /// Returns the fields to encrypt, if any.
    pub fn encrypted_fields(&self) -> &[String] {
        self.encrypt.as_ref().map_or(&[], |e| e.fields.as_slice())
    }
}

/// Describes a pull of remote entries handed to a local action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullOperation {
    #[serde(default)]
    pub description: String,
    pub target_data_source_id: u64,
    /// Remote filter, passed through as-is.
    #[serde(default, rename = "where")]
    pub filter: Option<serde_json::Value>,
    #[serde(default)]
    pub attributes: Option<Vec<String>>,
    #[serde(default)]
    pub join: Option<serde_json::Value>,
    #[serde(default)]
    pub distinct: Option<bool>,
    #[serde(default)]
    pub frequency_secs: Option<u64>,
}

impl PullOperation {
    /// Checks the rules a descriptor must satisfy before it can run.
    pub fn validate(&self) -> SyncResult<()> {
        if self.target_data_source_id == 0 {
            return Err(SyncError::Config(
                "target_data_source_id is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_from_token() {
        assert_eq!(region_base_url("us--abc"), US_API_URL);
        assert_eq!(region_base_url("US--abc"), US_API_URL);
        assert_eq!(region_base_url("eu--abc"), EU_API_URL);
        assert_eq!(region_base_url("zz"), EU_API_URL);
        assert_eq!(region_base_url(""), EU_API_URL);
    }

    #[test]
    fn base_url_override_trims_slash() {
        let config = SyncConfig::new("us--x").with_base_url("http://localhost:1234/");
        assert_eq!(config.base_url(), "http://localhost:1234");
        assert_eq!(SyncConfig::new("us--x").base_url(), US_API_URL);
    }

    #[test]
    fn retry_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(60));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn primary_column_cannot_be_encrypted() {
        let mut op = PushOperation::new(7);
        op.primary_column = Some("email".into());
        op.encrypt = Some(EncryptConfig {
            fields: vec!["name".into(), "email".into()],
            key: None,
        });
        assert!(matches!(op.validate(), Err(SyncError::Config(_))));

        op.encrypt = Some(EncryptConfig {
            fields: vec!["name".into()],
            key: None,
        });
        assert!(op.validate().is_ok());
    }

    #[test]
    fn invalid_sizes_rejected() {
        let mut op = PushOperation::new(1);
        op.batch_size = 0;
        assert!(op.validate().is_err());

        let mut op = PushOperation::new(1);
        op.concurrency = 0;
        assert!(op.validate().is_err());

        assert!(PushOperation::new(0).validate().is_err());
    }

    #[test]
    fn sharepoint_requires_settings() {
        let mut op = PushOperation::new(1);
        op.files.push(AttachmentDefinition {
            column: "doc".into(),
            kind: AttachmentKind::Sharepoint,
            directory: None,
            headers: BTreeMap::new(),
            compare: ComparePolicy::default(),
            file_name: FileNamePolicy::default(),
            sharepoint: None,
        });
        assert!(op.validate().is_err());
    }

    #[test]
    fn push_descriptor_defaults_from_json() {
        let op: PushOperation = serde_json::from_value(serde_json::json!({
            "target_data_source_id": 123,
            "primary_column": "id",
            "mode": "replace",
            "files": [{"column": "photo", "type": "remote"}]
        }))
        .unwrap();
        assert_eq!(op.mode, SyncMode::Replace);
        assert_eq!(op.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(op.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(op.files[0].compare, ComparePolicy::Checksum);
        assert_eq!(op.files[0].file_name, FileNamePolicy::Inherit);
        assert_eq!(op.files[0].media_file_id_column(), "photoMediaFileId");
    }

    #[test]
    fn pull_where_is_renamed() {
        let op: PullOperation = serde_json::from_value(serde_json::json!({
            "target_data_source_id": 9,
            "where": {"Foo": "Bar"}
        }))
        .unwrap();
        assert_eq!(op.filter, Some(serde_json::json!({"Foo": "Bar"})));
    }
}
