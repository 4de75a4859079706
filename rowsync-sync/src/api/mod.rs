//! Remote data-source service.
//!
//! [`RemoteApi`] is the seam the engine talks through; [`ApiClient`] is the
//! HTTP implementation. Tests substitute their own implementation to count
//! or fail calls.

mod client;

pub use client::ApiClient;

use crate::error::SyncResult;
use async_trait::async_trait;
use rowsync_types::{CommitEntry, EntryId, RemoteEntry};
use serde::{Deserialize, Serialize};

/// The authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub id: u64,
    #[serde(default)]
    pub email: Option<String>,
}

/// An organization the user belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

/// Summary of a remote data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceInfo {
    pub id: u64,
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// A folder in the media library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFolder {
    pub id: u64,
    pub name: String,
}

/// Checksums recorded with an uploaded file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(
        default,
        rename = "clientChecksum",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_checksum: Option<String>,
}

/// A file in the media library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    pub id: u64,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub metadata: MediaFileMetadata,
}

impl MediaFile {
    /// Returns true if the file was stored with the given checksum.
    pub fn has_checksum(&self, checksum: &str) -> bool {
        self.metadata.checksum.as_deref() == Some(checksum)
            || self.metadata.client_checksum.as_deref() == Some(checksum)
    }
}

/// File content to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// SHA-256 hex digest of `bytes`.
    pub checksum: String,
}

/// Body of a commit request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitRequest {
    pub append: bool,
    pub entries: Vec<CommitEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<Vec<EntryId>>,
    #[serde(rename = "runHooks")]
    pub run_hooks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extend: Option<bool>,
}

/// Entries affected by a commit.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CommitResponse {
    #[serde(default)]
    pub entries: Vec<serde_json::Value>,
}

impl CommitResponse {
    /// Number of entries the service reports as written.
    pub fn affected(&self) -> usize {
        self.entries.len()
    }
}

/// Filter for a pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PullQuery {
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct: Option<bool>,
}

/// Operations the engine needs from the remote service.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Returns the user the token belongs to.
    async fn current_user(&self) -> SyncResult<User>;

    /// Fetches every entry of a data source.
    async fn fetch_entries(&self, data_source_id: u64) -> SyncResult<Vec<RemoteEntry>>;

    /// Submits a commit to a data source.
    async fn commit(&self, data_source_id: u64, request: &CommitRequest)
    -> SyncResult<CommitResponse>;

    /// Fetches the entries matching a query.
    async fn query(&self, data_source_id: u64, query: &PullQuery) -> SyncResult<Vec<RemoteEntry>>;

    /// Lists the user's organizations.
    async fn organizations(&self) -> SyncResult<Vec<Organization>>;

    /// Lists data sources of the given type in an organization.
    async fn find_data_sources(
        &self,
        organization_id: u64,
        kind: &str,
    ) -> SyncResult<Vec<DataSourceInfo>>;

    /// Creates a data source.
    async fn create_data_source(
        &self,
        organization_id: u64,
        name: &str,
        kind: &str,
    ) -> SyncResult<DataSourceInfo>;

    /// Lists the top-level media folders of an organization.
    async fn list_folders(&self, organization_id: u64) -> SyncResult<Vec<MediaFolder>>;

    /// Creates a media folder.
    async fn create_folder(&self, organization_id: u64, name: &str) -> SyncResult<MediaFolder>;

    /// Lists the files of a media folder.
    async fn list_files(&self, organization_id: u64, folder_id: u64)
    -> SyncResult<Vec<MediaFile>>;

    /// Uploads a file into a media folder.
    async fn upload_file(
        &self,
        organization_id: u64,
        folder_id: u64,
        file: &FileUpload,
    ) -> SyncResult<MediaFile>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_request_omits_empty_optionals() {
        let request = CommitRequest {
            append: true,
            entries: vec![],
            delete: None,
            run_hooks: vec!["email".into()],
            extend: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"append": true, "entries": [], "runHooks": ["email"]})
        );
    }

    #[test]
    fn media_file_checksum_matches_either_field() {
        let file: MediaFile = serde_json::from_value(json!({
            "id": 1,
            "name": "a.png",
            "url": "https://cdn/a.png",
            "metadata": {"clientChecksum": "abc"}
        }))
        .unwrap();
        assert!(file.has_checksum("abc"));
        assert!(!file.has_checksum("def"));
    }

    #[test]
    fn pull_query_renames_where() {
        let query = PullQuery {
            filter: Some(json!({"x": 1})),
            distinct: Some(true),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({"where": {"x": 1}, "distinct": true})
        );
    }
}
