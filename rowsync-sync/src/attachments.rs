//! Attachment resolution: fetch the file a column references, store it in
//! the media library and rewrite the column to the stored file.

use crate::api::{FileUpload, MediaFile};
use crate::config::{AttachmentDefinition, AttachmentKind, FileNamePolicy, SharepointConfig};
use crate::error::{SyncError, SyncResult};
use crate::file_store::{checksum, FileStore};
use futures::future::join_all;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use rowsync_types::Row;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// File content fetched for an attachment column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// What happened to one attachment column.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentOutcome {
    /// The column was empty.
    Skipped,
    /// The file could not be fetched; the column is cleared.
    FetchFailed,
    /// The file could not be stored; the column is left as it was.
    UploadFailed,
    /// The column now references this file.
    Stored(MediaFile),
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// Resolves attachment columns of outgoing rows.
pub struct AttachmentResolver {
    client: Client,
    files: Arc<FileStore>,
    sharepoint_tokens: RwLock<HashMap<String, CachedToken>>,
}

impl AttachmentResolver {
    pub fn new(files: Arc<FileStore>, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            files,
            sharepoint_tokens: RwLock::new(HashMap::new()),
        })
    }

    /// Resolves every attachment column of `row` concurrently and returns the
    /// rewritten row. `entry_id` prefixes uploaded file names when known.
    pub async fn resolve(
        &self,
        mut row: Row,
        definitions: &[AttachmentDefinition],
        entry_id: Option<&str>,
    ) -> Row {
        if definitions.is_empty() {
            return row;
        }

        let outcomes = join_all(
            definitions
                .iter()
                .map(|definition| self.resolve_column(&row, definition, entry_id)),
        )
        .await;

        for (definition, outcome) in definitions.iter().zip(outcomes) {
            apply_outcome(&mut row, definition, outcome);
        }
        row
    }

    /// Fetches and stores the file referenced by one column.
    pub async fn resolve_column(
        &self,
        row: &Row,
        definition: &AttachmentDefinition,
        entry_id: Option<&str>,
    ) -> AttachmentOutcome {
        let reference = match row.get(&definition.column) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return AttachmentOutcome::Skipped,
        };

        let fetched = match self.fetch(&reference, definition).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!("[FILES] Cannot fetch file {}: {}", reference, e);
                return AttachmentOutcome::FetchFailed;
            }
        };

        let name = match entry_id {
            Some(id) => format!("{id}-{}", fetched.name),
            None => fetched.name,
        };
        let upload = FileUpload {
            checksum: checksum(&fetched.bytes),
            name,
            content_type: fetched.content_type,
            bytes: fetched.bytes,
        };

        match self.files.upload(upload, definition.compare).await {
            Ok(file) => AttachmentOutcome::Stored(file),
            Err(e) => {
                error!("[FILES] Cannot upload file {}: {}", reference, e);
                AttachmentOutcome::UploadFailed
            }
        }
    }

    async fn fetch(&self, reference: &str, definition: &AttachmentDefinition) -> SyncResult<FetchedFile> {
        match definition.kind {
            AttachmentKind::Remote => self.fetch_remote(reference, definition).await,
            AttachmentKind::Local => fetch_local(reference, definition.directory.as_deref()).await,
            AttachmentKind::Sharepoint => {
                let config = definition.sharepoint.as_ref().ok_or_else(|| {
                    SyncError::Config(format!(
                        "file column \"{}\" has no sharepoint settings",
                        definition.column
                    ))
                })?;
                self.fetch_sharepoint(reference, config, &definition.file_name).await
            }
        }
    }

    async fn fetch_remote(
        &self,
        reference: &str,
        definition: &AttachmentDefinition,
    ) -> SyncResult<FetchedFile> {
        debug!("[FILES] Requesting remote file: {}", reference);
        let url = Url::parse(reference)
            .map_err(|e| SyncError::Source(format!("invalid file URL {reference}: {e}")))?;

        let mut request = self.client.get(url.clone());
        for (name, value) in &definition.headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SyncError::Source(format!(
                "{reference} responded with status {}",
                response.status().as_u16()
            )));
        }

        let content_type = header_content_type(&response);
        let bytes = response.bytes().await?.to_vec();
        let name = with_extension(&url_basename(&url), content_type.as_deref());

        Ok(FetchedFile {
            name,
            content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            bytes,
        })
    }

    /// Returns a SharePoint app token, requesting a new one when the cached
    /// token is missing or expired.
    async fn sharepoint_token(&self, config: &SharepointConfig) -> SyncResult<String> {
        let cache_key = format!("{}:{}", config.tenant_id, config.client_id);
        {
            let tokens = self.sharepoint_tokens.read().await;
            if let Some(token) = tokens.get(&cache_key) {
                let expired = token.expires_at.is_some_and(|exp| Instant::now() >= exp);
                if !expired {
                    return Ok(token.access_token.clone());
                }
            }
        }

        debug!("Requesting SharePoint access token for client {}", config.client_id);
        let site = Url::parse(&config.site_url)
            .map_err(|e| SyncError::Config(format!("invalid sharepoint site URL: {e}")))?;
        let scope = format!("{}/.default", site.origin().ascii_serialization());

        let response = self
            .client
            .post(config.token_url())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", config.client_id.as_str()),
                ("client_secret", config.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(SyncError::Auth(format!("sharepoint token request failed: {error}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Auth(format!("failed to parse token response: {e}")))?;

        let expires_at = token
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs.saturating_sub(60)));
        self.sharepoint_tokens.write().await.insert(
            cache_key,
            CachedToken {
                access_token: token.access_token.clone(),
                expires_at,
            },
        );
        Ok(token.access_token)
    }

    async fn fetch_sharepoint(
        &self,
        reference: &str,
        config: &SharepointConfig,
        policy: &FileNamePolicy,
    ) -> SyncResult<FetchedFile> {
        let relative = server_relative_path(reference);
        debug!("[FILES] Requesting SharePoint file: {}", relative);

        let token = self.sharepoint_token(config).await?;
        let url = sharepoint_file_url(&config.site_url, &relative);
        let response = self.client.get(url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            return Err(SyncError::Source(format!(
                "sharepoint responded with status {} for {relative}",
                response.status().as_u16()
            )));
        }

        let content_type = header_content_type(&response);
        let bytes = response.bytes().await?.to_vec();
        let name = match policy {
            FileNamePolicy::Fixed(name) => name.clone(),
            FileNamePolicy::Inherit => path_basename(&relative),
        };
        let content_type = content_type.unwrap_or_else(|| {
            mime_guess::from_path(&name).first_or_octet_stream().to_string()
        });

        Ok(FetchedFile {
            name,
            content_type,
            bytes,
        })
    }
}

fn apply_outcome(row: &mut Row, definition: &AttachmentDefinition, outcome: AttachmentOutcome) {
    match outcome {
        AttachmentOutcome::Skipped | AttachmentOutcome::UploadFailed => {}
        AttachmentOutcome::FetchFailed => {
            row.insert(definition.column.clone(), Value::Null);
        }
        AttachmentOutcome::Stored(file) => {
            row.insert(definition.column.clone(), Value::String(file.url));
            row.insert(definition.media_file_id_column(), Value::from(file.id));
        }
    }
}

/// Resolves a local file reference. With a directory, the reference must be
/// a relative path that stays inside it.
pub fn local_path(reference: &str, directory: Option<&Path>) -> SyncResult<PathBuf> {
    let Some(dir) = directory else {
        return Ok(PathBuf::from(reference));
    };
    let relative = Path::new(reference);
    let contained = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !contained {
        return Err(SyncError::Source(format!(
            "file reference \"{}\" points outside {}",
            reference,
            dir.display()
        )));
    }
    Ok(dir.join(relative))
}

async fn fetch_local(reference: &str, directory: Option<&Path>) -> SyncResult<FetchedFile> {
    let path = local_path(reference, directory)?;
    debug!("[FILES] Requesting local file: {}", path.display());

    let bytes = tokio::fs::read(&path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| reference.to_string());
    let content_type = mime_guess::from_path(&path).first_or_octet_stream().to_string();

    Ok(FetchedFile {
        name,
        content_type,
        bytes,
    })
}

fn header_content_type(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
}

fn path_basename(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

fn url_basename(url: &Url) -> String {
    let name = path_basename(url.path());
    let name = urlencoding::decode(&name).map(|n| n.into_owned()).unwrap_or(name);
    if name.is_empty() { "file".to_string() } else { name }
}

/// Appends the extension registered for `content_type` unless the name
/// already ends with one of its extensions.
pub fn with_extension(name: &str, content_type: Option<&str>) -> String {
    let Some(extensions) = content_type.and_then(mime_guess::get_mime_extensions_str) else {
        return name.to_string();
    };
    let lower = name.to_ascii_lowercase();
    if extensions.iter().any(|ext| lower.ends_with(&format!(".{ext}"))) {
        return name.to_string();
    }
    match extensions.first() {
        Some(ext) => format!("{name}.{ext}"),
        None => name.to_string(),
    }
}

/// Reduces a SharePoint reference (absolute URL or server-relative path) to
/// its server-relative path.
pub fn server_relative_path(reference: &str) -> String {
    let path = match Url::parse(reference) {
        Ok(url) => url.path().to_string(),
        Err(_) => reference.to_string(),
    };
    let path = urlencoding::decode(&path).map(|p| p.into_owned()).unwrap_or(path);
    if path.starts_with('/') { path } else { format!("/{path}") }
}

fn sharepoint_file_url(site_url: &str, relative: &str) -> String {
    let escaped = relative.replace('\'', "''");
    let encoded: Vec<String> = escaped
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!(
        "{}/_api/web/GetFileByServerRelativeUrl('{}')/$value",
        site_url.trim_end_matches('/'),
        encoded.join("/")
    )
}
