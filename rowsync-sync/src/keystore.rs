//! Field encryption keys and the remote keystore.
//!
//! When a push configures encryption without a passphrase, the passphrase
//! lives in a reserved data source of the first organization:
//!
//! - one entry `{ organizationId, salt }` holds the organization salt
//! - one entry `{ content }` holds the passphrase sealed under a key derived
//!   from that salt
//!
//! Both entries are created on first use. A stored passphrase that does not
//! open under the current salt is a configuration error.

use crate::api::{CommitRequest, DataSourceInfo, RemoteApi};
use crate::config::EncryptConfig;
use crate::error::{SyncError, SyncResult};
use rowsync_crypto::{
    decrypt_string, encrypt_fields, encrypt_string, field_key, generate_passphrase,
    generate_salt_text, wrapping_key, DerivedKey, KdfParams,
};
use rowsync_types::{CommitEntry, RemoteEntry, Row};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the keystore data source.
pub const KEYSTORE_NAME: &str = "Keystore";

/// Type of the keystore data source.
pub const KEYSTORE_TYPE: &str = "keystore";

/// Resolved key and fields for one push.
#[derive(Debug, Clone)]
pub struct EncryptionContext {
    fields: Vec<String>,
    key: DerivedKey,
}

impl EncryptionContext {
    pub fn new(fields: Vec<String>, key: DerivedKey) -> Self {
        Self { fields, key }
    }

    /// Columns this context encrypts.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Key the fields are sealed with.
    pub fn key(&self) -> &DerivedKey {
        &self.key
    }

    /// Encrypts the designated fields of `row`.
    pub fn encrypt_row(&self, row: Row) -> SyncResult<Row> {
        Ok(encrypt_fields(row, &self.fields, &self.key)?)
    }
}

/// Resolves field encryption keys, backed by the remote keystore.
pub struct Keystore {
    api: Arc<dyn RemoteApi>,
    kdf: KdfParams,
    dry_run: bool,
}

impl Keystore {
    pub fn new(api: Arc<dyn RemoteApi>, kdf: KdfParams) -> Self {
        Self {
            api,
            kdf,
            dry_run: false,
        }
    }

    /// In dry-run mode nothing is written to the keystore; a missing key is
    /// replaced by a throwaway one.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Returns the encryption context for `config`, creating the stored
    /// passphrase when none exists yet.
    pub async fn ensure_key(&self, config: &EncryptConfig) -> SyncResult<EncryptionContext> {
        let passphrase = match &config.key {
            Some(key) => key.clone(),
            None => self.stored_passphrase().await?,
        };
        let key = field_key(&passphrase, &self.kdf)?;
        Ok(EncryptionContext::new(config.fields.clone(), key))
    }

    async fn keystore_data_source(&self, organization_id: u64) -> SyncResult<Option<DataSourceInfo>> {
        let existing = self
            .api
            .find_data_sources(organization_id, KEYSTORE_TYPE)
            .await?
            .into_iter()
            .find(|ds| ds.name == KEYSTORE_NAME);

        match existing {
            Some(ds) => Ok(Some(ds)),
            None if self.dry_run => Ok(None),
            None => {
                info!("Creating keystore in organization {}", organization_id);
                let ds = self
                    .api
                    .create_data_source(organization_id, KEYSTORE_NAME, KEYSTORE_TYPE)
                    .await?;
                Ok(Some(ds))
            }
        }
    }

    /// Reads (or creates) the passphrase stored in the keystore.
    async fn stored_passphrase(&self) -> SyncResult<String> {
        let organization = self
            .api
            .organizations()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Config("the user does not belong to any organization".to_string()))?;
        let Some(keystore) = self.keystore_data_source(organization.id).await? else {
            info!("Dry run: no keystore exists yet, using a temporary encryption key");
            return Ok(generate_passphrase());
        };
        let entries = self.api.fetch_entries(keystore.id).await?;

        let mut new_entries = Vec::new();
        let salt = match find_salt(&entries, organization.id) {
            Some(salt) => salt,
            None => {
                debug!("Generating salt for organization {}", organization.id);
                let salt = generate_salt_text();
                let mut data = Row::new();
                data.insert("organizationId".into(), Value::from(organization.id));
                data.insert("salt".into(), Value::from(salt.clone()));
                new_entries.push(CommitEntry::insert(data));
                salt
            }
        };

        let wrap = wrapping_key(&salt, &organization.id.to_string(), &self.kdf)?;

        let passphrase = match find_content(&entries) {
            Some(content) => decrypt_string(&wrap, &content).map_err(|_| {
                SyncError::Config(
                    "the stored encryption key cannot be decrypted with the organization salt"
                        .to_string(),
                )
            })?,
            None => {
                info!("Generating a new encryption key");
                let passphrase = generate_passphrase();
                let mut data = Row::new();
                data.insert("content".into(), Value::from(encrypt_string(&wrap, &passphrase)?));
                new_entries.push(CommitEntry::insert(data));
                passphrase
            }
        };

        if !new_entries.is_empty() && self.dry_run {
            info!("Dry run: the generated encryption key has not been stored");
        } else if !new_entries.is_empty() {
            let request = CommitRequest {
                append: true,
                entries: new_entries,
                delete: None,
                run_hooks: Vec::new(),
                extend: None,
            };
            self.api.commit(keystore.id, &request).await?;
        }

        Ok(passphrase)
    }
}

fn find_salt(entries: &[RemoteEntry], organization_id: u64) -> Option<String> {
    entries.iter().find_map(|entry| {
        let org = entry.data.get("organizationId")?;
        let matches = org.as_u64() == Some(organization_id)
            || org.as_str() == Some(organization_id.to_string().as_str());
        if !matches {
            return None;
        }
        entry
            .data
            .get("salt")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn find_content(entries: &[RemoteEntry]) -> Option<String> {
    entries.iter().find_map(|entry| {
        entry
            .data
            .get("content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}
