#![allow(dead_code)]

use async_trait::async_trait;
use rowsync_sync::api::{
    CommitRequest, CommitResponse, DataSourceInfo, FileUpload, MediaFile, MediaFileMetadata,
    MediaFolder, Organization, PullQuery, RemoteApi, User,
};
use rowsync_sync::{SyncError, SyncResult};
use rowsync_types::{EntryId, RemoteEntry, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn row(value: Value) -> Row {
    value.as_object().cloned().expect("row literal must be an object")
}

pub fn entry(id: i64, data: Value) -> RemoteEntry {
    RemoteEntry::new(id, row(data))
}

/// In-memory data-source service. Commits are applied to the stored
/// entries so consecutive runs see each other's writes.
pub struct FakeApi {
    pub entries: Mutex<HashMap<u64, Vec<RemoteEntry>>>,
    pub commits: Mutex<Vec<(u64, CommitRequest)>>,
    pub commit_attempts: AtomicUsize,
    pub commit_error: Mutex<Option<u16>>,
    pub user_error: Mutex<Option<u16>>,
    pub user_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub queries: Mutex<Vec<(u64, PullQuery)>>,
    pub data_sources: Mutex<Vec<DataSourceInfo>>,
    pub folders: Mutex<Vec<MediaFolder>>,
    pub files: Mutex<Vec<MediaFile>>,
    pub uploads: Mutex<Vec<FileUpload>>,
    pub upload_delay: Mutex<Option<Duration>>,
    pub uploads_in_flight: AtomicUsize,
    pub max_uploads_in_flight: AtomicUsize,
    next_id: AtomicI64,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            commits: Mutex::new(Vec::new()),
            commit_attempts: AtomicUsize::new(0),
            commit_error: Mutex::new(None),
            user_error: Mutex::new(None),
            user_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
            data_sources: Mutex::new(Vec::new()),
            folders: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            upload_delay: Mutex::new(None),
            uploads_in_flight: AtomicUsize::new(0),
            max_uploads_in_flight: AtomicUsize::new(0),
            next_id: AtomicI64::new(1000),
        }
    }
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(self, data_source_id: u64, entries: Vec<RemoteEntry>) -> Self {
        self.entries.lock().unwrap().insert(data_source_id, entries);
        self
    }

    pub fn fail_commits(&self, status: u16) {
        *self.commit_error.lock().unwrap() = Some(status);
    }

    pub fn fail_user(&self, status: u16) {
        *self.user_error.lock().unwrap() = Some(status);
    }

    pub fn stored(&self, data_source_id: u64) -> Vec<RemoteEntry> {
        self.entries
            .lock()
            .unwrap()
            .get(&data_source_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }

    pub fn last_commit(&self) -> Option<CommitRequest> {
        self.commits.lock().unwrap().last().map(|(_, r)| r.clone())
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn current_user(&self) -> SyncResult<User> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.user_error.lock().unwrap() {
            return Err(SyncError::from_status(status, "rejected"));
        }
        Ok(User {
            id: 1,
            email: Some("ops@example.com".into()),
        })
    }

    async fn fetch_entries(&self, data_source_id: u64) -> SyncResult<Vec<RemoteEntry>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.user_error.lock().unwrap() {
            return Err(SyncError::from_status(status, "rejected"));
        }
        Ok(self.stored(data_source_id))
    }

    async fn commit(
        &self,
        data_source_id: u64,
        request: &CommitRequest,
    ) -> SyncResult<CommitResponse> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.commit_error.lock().unwrap() {
            return Err(SyncError::from_status(status, "commit rejected"));
        }
        self.commits
            .lock()
            .unwrap()
            .push((data_source_id, request.clone()));

        let mut all = self.entries.lock().unwrap();
        let stored = all.entry(data_source_id).or_default();
        let mut affected = Vec::new();
        for commit in &request.entries {
            match &commit.id {
                Some(id) => {
                    if let Some(existing) = stored.iter_mut().find(|e| &e.id == id) {
                        existing.data = commit.data.clone();
                    }
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    stored.push(RemoteEntry::new(id, commit.data.clone()));
                }
            }
            affected.push(Value::Object(commit.data.clone()));
        }
        if let Some(delete) = &request.delete {
            stored.retain(|e| !delete.contains(&e.id));
        }
        Ok(CommitResponse { entries: affected })
    }

    async fn query(&self, data_source_id: u64, query: &PullQuery) -> SyncResult<Vec<RemoteEntry>> {
        self.queries
            .lock()
            .unwrap()
            .push((data_source_id, query.clone()));
        Ok(self.stored(data_source_id))
    }

    async fn organizations(&self) -> SyncResult<Vec<Organization>> {
        Ok(vec![Organization {
            id: 7,
            name: "Acme".into(),
        }])
    }

    async fn find_data_sources(
        &self,
        _organization_id: u64,
        kind: &str,
    ) -> SyncResult<Vec<DataSourceInfo>> {
        Ok(self
            .data_sources
            .lock()
            .unwrap()
            .iter()
            .filter(|ds| ds.kind.as_deref() == Some(kind))
            .cloned()
            .collect())
    }

    async fn create_data_source(
        &self,
        _organization_id: u64,
        name: &str,
        kind: &str,
    ) -> SyncResult<DataSourceInfo> {
        let info = DataSourceInfo {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) as u64,
            name: name.to_string(),
            kind: Some(kind.to_string()),
        };
        self.data_sources.lock().unwrap().push(info.clone());
        Ok(info)
    }

    async fn list_folders(&self, _organization_id: u64) -> SyncResult<Vec<MediaFolder>> {
        Ok(self.folders.lock().unwrap().clone())
    }

    async fn create_folder(&self, _organization_id: u64, name: &str) -> SyncResult<MediaFolder> {
        let folder = MediaFolder {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) as u64,
            name: name.to_string(),
        };
        self.folders.lock().unwrap().push(folder.clone());
        Ok(folder)
    }

    async fn list_files(
        &self,
        _organization_id: u64,
        _folder_id: u64,
    ) -> SyncResult<Vec<MediaFile>> {
        Ok(self.files.lock().unwrap().clone())
    }

    async fn upload_file(
        &self,
        _organization_id: u64,
        _folder_id: u64,
        file: &FileUpload,
    ) -> SyncResult<MediaFile> {
        let in_flight = self.uploads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_uploads_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let delay = *self.upload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.uploads_in_flight.fetch_sub(1, Ordering::SeqCst);

        self.uploads.lock().unwrap().push(file.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
        let stored = MediaFile {
            id,
            name: file.name.clone(),
            url: format!("https://cdn.example.com/{id}/{}", file.name),
            metadata: MediaFileMetadata {
                checksum: Some(file.checksum.clone()),
                client_checksum: None,
            },
        };
        self.files.lock().unwrap().push(stored.clone());
        Ok(stored)
    }
}

pub fn entry_ids(entries: &[RemoteEntry]) -> Vec<EntryId> {
    entries.iter().map(|e| e.id.clone()).collect()
}
