//! Deduplicating uploads into the media library.
//!
//! The upload folder and its file listing are loaded once and cached until
//! [`FileStore::reset`] is called, which the orchestrator does at the start
//! of every operation. The cache lock is only held for lookups; the upload
//! itself runs under a lock keyed by what the compare policy matches on, so
//! two uploads of the same content within one run store a single file while
//! different files upload concurrently.

use crate::api::{FileUpload, MediaFile, MediaFolder, RemoteApi};
use crate::config::ComparePolicy;
use crate::error::{SyncError, SyncResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Name of the media folder uploads go to.
pub const UPLOAD_FOLDER_NAME: &str = "Files uploaded from rowsync";

/// Returns the SHA-256 hex digest of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
struct UploadFolder {
    organization_id: u64,
    folder: MediaFolder,
    files: Vec<MediaFile>,
}

impl UploadFolder {
    fn find(&self, file: &FileUpload, compare: ComparePolicy) -> Option<&MediaFile> {
        self.files.iter().find(|existing| match compare {
            ComparePolicy::Checksum => existing.has_checksum(&file.checksum),
            ComparePolicy::Name => existing.name == file.name,
            ComparePolicy::Both => existing.has_checksum(&file.checksum) && existing.name == file.name,
        })
    }
}

enum Lookup {
    Found(MediaFile),
    Missing { organization_id: u64, folder_id: u64 },
}

fn upload_key(file: &FileUpload, compare: ComparePolicy) -> String {
    match compare {
        ComparePolicy::Checksum | ComparePolicy::Both => format!("checksum:{}", file.checksum),
        ComparePolicy::Name => format!("name:{}", file.name),
    }
}

/// Uploads files into the organization's upload folder, reusing files that
/// are already there.
pub struct FileStore {
    api: Arc<dyn RemoteApi>,
    folder_name: String,
    folder: Mutex<Option<UploadFolder>>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStore {
    pub fn new(api: Arc<dyn RemoteApi>) -> Self {
        Self::with_folder_name(api, UPLOAD_FOLDER_NAME)
    }

    pub fn with_folder_name(api: Arc<dyn RemoteApi>, folder_name: impl Into<String>) -> Self {
        Self {
            api,
            folder_name: folder_name.into(),
            folder: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Forgets the cached folder and listing.
    pub async fn reset(&self) {
        *self.folder.lock().await = None;
        self.in_flight.lock().await.clear();
    }

    /// Loads the upload folder of the first organization, creating it if it
    /// does not exist yet.
    async fn load_folder(&self) -> SyncResult<UploadFolder> {
        let organization = self
            .api
            .organizations()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Config("the user does not belong to any organization".to_string()))?;

        let folders = self.api.list_folders(organization.id).await?;
        let folder = match folders.into_iter().find(|f| f.name == self.folder_name) {
            Some(folder) => folder,
            None => {
                debug!(
                    "Creating new media folder named \"{}\" in organization {}",
                    self.folder_name, organization.name
                );
                self.api.create_folder(organization.id, &self.folder_name).await?
            }
        };

        let files = self.api.list_files(organization.id, folder.id).await?;
        Ok(UploadFolder {
            organization_id: organization.id,
            folder,
            files,
        })
    }

    /// Returns the cached file matching `file` under `compare`, loading the
    /// folder first if needed. On a miss, returns the folder to upload to.
    async fn lookup(
        &self,
        file: &FileUpload,
        compare: ComparePolicy,
    ) -> SyncResult<Lookup> {
        let mut guard = self.folder.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_folder().await?);
        }
        let Some(folder) = guard.as_ref() else {
            return Err(SyncError::Config("upload folder unavailable".to_string()));
        };
        Ok(match folder.find(file, compare) {
            Some(existing) => Lookup::Found(existing.clone()),
            None => Lookup::Missing {
                organization_id: folder.organization_id,
                folder_id: folder.folder.id,
            },
        })
    }

    /// Returns an existing file matching `file` under `compare`, or uploads
    /// it.
    pub async fn upload(&self, file: FileUpload, compare: ComparePolicy) -> SyncResult<MediaFile> {
        let slot = {
            let mut in_flight = self.in_flight.lock().await;
            Arc::clone(in_flight.entry(upload_key(&file, compare)).or_default())
        };
        let _uploading = slot.lock().await;

        let (organization_id, folder_id) = match self.lookup(&file, compare).await? {
            Lookup::Found(existing) => {
                debug!(
                    "[FILES] File {} with checksum {} does not need an update",
                    file.name, file.checksum
                );
                return Ok(existing);
            }
            Lookup::Missing {
                organization_id,
                folder_id,
            } => (organization_id, folder_id),
        };

        info!("[FILES] Uploading {} with checksum {}", file.name, file.checksum);
        let mut stored = self.api.upload_file(organization_id, folder_id, &file).await?;
        if stored.metadata.checksum.is_none() {
            stored.metadata.checksum = Some(file.checksum.clone());
        }
        if let Some(folder) = self.folder.lock().await.as_mut() {
            folder.files.push(stored.clone());
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
