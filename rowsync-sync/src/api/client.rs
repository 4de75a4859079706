//! HTTP client for the data-source service.

use super::{
    CommitRequest, CommitResponse, DataSourceInfo, FileUpload, MediaFile, MediaFolder,
    Organization, PullQuery, RemoteApi, User,
};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use rowsync_types::RemoteEntry;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

const AUTH_HEADER: &str = "Auth-token";

#[derive(Debug, Deserialize)]
struct EntriesResponse {
    #[serde(default)]
    entries: Vec<RemoteEntry>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    user: User,
}

#[derive(Debug, Deserialize)]
struct OrganizationsResponse {
    #[serde(default)]
    organizations: Vec<Organization>,
}

#[derive(Debug, Deserialize)]
struct DataSourcesResponse {
    #[serde(default, rename = "dataSources")]
    data_sources: Vec<DataSourceInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CreatedDataSource {
    Wrapped {
        #[serde(rename = "dataSource")]
        data_source: DataSourceInfo,
    },
    Bare(DataSourceInfo),
}

#[derive(Debug, Deserialize)]
struct FoldersResponse {
    #[serde(default)]
    folders: Vec<MediaFolder>,
}

#[derive(Debug, Deserialize)]
struct FilesResponse {
    #[serde(default)]
    files: Vec<MediaFile>,
}

/// Client for the data-source service, authenticated with an API token.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Creates a client for the region (or explicit base URL) in `config`.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(&config.auth_token)
            .map_err(|_| SyncError::Config("auth token contains invalid characters".to_string()))?;
        headers.insert(AUTH_HEADER, token);

        let client = Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url(),
        })
    }

    /// Returns the base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> SyncResult<T> {
        let response = request.send().await?;
        let response = check_status(response).await?;
        response.json().await.map_err(SyncError::from)
    }
}

/// Turns an unsuccessful response into an error carrying the service's
/// `message` when it sent one.
async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            if body.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body
            }
        });

    Err(SyncError::from_status(status.as_u16(), message))
}

/// Builds a `multipart/form-data` body with a `checksum` field and the file
/// under `files`.
fn multipart_body(boundary: &str, file: &FileUpload) -> Vec<u8> {
    let name = file.name.replace('"', "%22");
    let mut body = Vec::with_capacity(file.bytes.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"checksum\"\r\n\r\n{}\r\n",
            file.checksum
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\nContent-Type: {}\r\n\r\n",
            file.content_type
        )
        .as_bytes(),
    );
    body.extend_from_slice(&file.bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn current_user(&self) -> SyncResult<User> {
        let response: UserResponse = self.send(self.client.get(self.url("v1/user"))).await?;
        Ok(response.user)
    }

    async fn fetch_entries(&self, data_source_id: u64) -> SyncResult<Vec<RemoteEntry>> {
        debug!("Fetching entries of data source {}", data_source_id);
        let url = self.url(&format!("v1/data-sources/{data_source_id}/data"));
        let response: EntriesResponse = self.send(self.client.get(url)).await?;
        Ok(response.entries)
    }

    async fn commit(
        &self,
        data_source_id: u64,
        request: &CommitRequest,
    ) -> SyncResult<CommitResponse> {
        let url = self.url(&format!("v1/data-sources/{data_source_id}/commit"));
        self.send(self.client.post(url).json(request)).await
    }

    async fn query(&self, data_source_id: u64, query: &PullQuery) -> SyncResult<Vec<RemoteEntry>> {
        let url = self.url(&format!("v1/data-sources/{data_source_id}/data/query"));
        let response: EntriesResponse = self.send(self.client.post(url).json(query)).await?;
        Ok(response.entries)
    }

    async fn organizations(&self) -> SyncResult<Vec<Organization>> {
        let response: OrganizationsResponse =
            self.send(self.client.get(self.url("v1/organizations"))).await?;
        Ok(response.organizations)
    }

    async fn find_data_sources(
        &self,
        organization_id: u64,
        kind: &str,
    ) -> SyncResult<Vec<DataSourceInfo>> {
        let request = self
            .client
            .get(self.url("v1/data-sources"))
            .query(&[("organizationId", organization_id.to_string()), ("type", kind.to_string())]);
        let response: DataSourcesResponse = self.send(request).await?;
        Ok(response.data_sources)
    }

    async fn create_data_source(
        &self,
        organization_id: u64,
        name: &str,
        kind: &str,
    ) -> SyncResult<DataSourceInfo> {
        let body = serde_json::json!({
            "name": name,
            "organizationId": organization_id,
            "type": kind,
        });
        let created: CreatedDataSource = self
            .send(self.client.post(self.url("v1/data-sources")).json(&body))
            .await?;
        let data_source = match created {
            CreatedDataSource::Wrapped { data_source } => data_source,
            CreatedDataSource::Bare(data_source) => data_source,
        };
        info!("Created data source \"{}\" ({})", data_source.name, data_source.id);
        Ok(data_source)
    }

    async fn list_folders(&self, organization_id: u64) -> SyncResult<Vec<MediaFolder>> {
        let request = self
            .client
            .get(self.url("v1/media"))
            .query(&[("organizationId", organization_id)]);
        let response: FoldersResponse = self.send(request).await?;
        Ok(response.folders)
    }

    async fn create_folder(&self, organization_id: u64, name: &str) -> SyncResult<MediaFolder> {
        let body = serde_json::json!({ "name": name, "organizationId": organization_id });
        self.send(self.client.post(self.url("v1/media/folders")).json(&body))
            .await
    }

    async fn list_files(
        &self,
        organization_id: u64,
        folder_id: u64,
    ) -> SyncResult<Vec<MediaFile>> {
        let request = self
            .client
            .get(self.url("v1/media"))
            .query(&[("folderId", folder_id), ("organizationId", organization_id)]);
        let response: FilesResponse = self.send(request).await?;
        Ok(response.files)
    }

    async fn upload_file(
        &self,
        organization_id: u64,
        folder_id: u64,
        file: &FileUpload,
    ) -> SyncResult<MediaFile> {
        let boundary = format!("rowsync-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_body(&boundary, file);

        let url = format!(
            "{}?folderId={}&name={}&organizationId={}",
            self.url("v1/media/files"),
            folder_id,
            urlencoding::encode(&file.name),
            organization_id
        );
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(body);

        let response: FilesResponse = self.send(request).await?;
        response
            .files
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Api {
                status: 200,
                message: "upload response did not contain a file".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_layout() {
        let file = FileUpload {
            name: "a.txt".into(),
            content_type: "text/plain".into(),
            bytes: b"hello".to_vec(),
            checksum: "abc".into(),
        };
        let body = String::from_utf8(multipart_body("B", &file)).unwrap();
        assert!(body.starts_with("--B\r\nContent-Disposition: form-data; name=\"checksum\"\r\n\r\nabc\r\n"));
        assert!(body.contains("name=\"files\"; filename=\"a.txt\"\r\nContent-Type: text/plain\r\n\r\nhello\r\n"));
        assert!(body.ends_with("--B--\r\n"));
    }

    #[test]
    fn url_joins_paths() {
        let client = ApiClient::new(&SyncConfig::new("eu--t").with_base_url("http://host/")).unwrap();
        assert_eq!(client.url("v1/user"), "http://host/v1/user");
        assert_eq!(client.url("/v1/user"), "http://host/v1/user");
    }
}
