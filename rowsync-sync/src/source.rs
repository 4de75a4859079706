//! Local row sources for push operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use rowsync_types::Row;
use rusqlite::types::ValueRef;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Produces the rows a push reconciles against the remote data source.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Short description used in log messages.
    fn describe(&self) -> String;

    /// Fetches the current set of rows.
    async fn fetch_rows(&self) -> SyncResult<Vec<Row>>;
}

/// Runs a query against a SQLite database.
///
/// Queries run on the blocking pool with a fresh read-only connection per
/// fetch. BLOB columns are returned base64-encoded.
#[derive(Debug, Clone)]
pub struct SqliteSource {
    path: PathBuf,
    query: String,
}

impl SqliteSource {
    pub fn new(path: impl Into<PathBuf>, query: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: query.into(),
        }
    }
}

fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(BASE64.encode(b)),
    }
}

fn run_query(path: &Path, query: &str) -> SyncResult<Vec<Row>> {
    let conn = rusqlite::Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut stmt = conn.prepare(query)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt.query([])?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let mut out = Row::new();
        for (i, name) in columns.iter().enumerate() {
            out.insert(name.clone(), column_value(row.get_ref(i)?));
        }
        result.push(out);
    }
    Ok(result)
}

#[async_trait]
impl RowSource for SqliteSource {
    fn describe(&self) -> String {
        format!("query on {}", self.path.display())
    }

    async fn fetch_rows(&self) -> SyncResult<Vec<Row>> {
        if self.query.trim().is_empty() {
            return Err(SyncError::Config("source query is empty".to_string()));
        }
        debug!("[QUERY] {}", self.query);

        let path = self.path.clone();
        let query = self.query.clone();
        tokio::task::spawn_blocking(move || run_query(&path, &query))
            .await
            .map_err(|e| SyncError::Source(format!("query task failed: {e}")))?
    }
}

/// Fetches rows from a JSON HTTP endpoint.
///
/// The body may be an array of objects or an object with a `data` array.
/// Any other shape is logged and yields no rows.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl HttpSource {
    pub fn new(url: impl Into<String>, headers: BTreeMap<String, String>) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            headers,
        })
    }
}

/// Extracts rows from a source response body.
pub fn rows_from_json(body: Value) -> Option<Vec<Row>> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };

    let total = items.len();
    let rows: Vec<Row> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(row) => Some(row),
            _ => None,
        })
        .collect();
    if rows.len() != total {
        warn!("Ignored {} source items that are not objects", total - rows.len());
    }
    Some(rows)
}

#[async_trait]
impl RowSource for HttpSource {
    fn describe(&self) -> String {
        format!("GET {}", self.url)
    }

    async fn fetch_rows(&self) -> SyncResult<Vec<Row>> {
        let mut request = self.client.get(&self.url);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Source(format!("request to {} failed: {e}", self.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Source(format!(
                "{} responded with status {}",
                self.url,
                status.as_u16()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SyncError::Source(format!("invalid JSON from {}: {e}", self.url)))?;

        match rows_from_json(body) {
            Some(rows) => {
                debug!("Fetched {} rows from manual source", rows.len());
                Ok(rows)
            }
            None => {
                error!("Response from source did not return an array of entries");
                Ok(Vec::new())
            }
        }
    }
}

/// A fixed set of rows, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    rows: Vec<Row>,
}

impl StaticSource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl RowSource for StaticSource {
    fn describe(&self) -> String {
        format!("{} static rows", self.rows.len())
    }

    async fn fetch_rows(&self) -> SyncResult<Vec<Row>> {
        Ok(self.rows.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn array_and_data_wrapper_accepted() {
        let rows = rows_from_json(json!([{"id": 1}, {"id": 2}])).unwrap();
        assert_eq!(rows.len(), 2);

        let rows = rows_from_json(json!({"data": [{"id": 1}]})).unwrap();
        assert_eq!(rows[0]["id"], json!(1));
    }

    #[test]
    fn other_shapes_rejected() {
        assert!(rows_from_json(json!({"rows": []})).is_none());
        assert!(rows_from_json(json!("text")).is_none());
        assert!(rows_from_json(json!({"data": {"id": 1}})).is_none());
    }

    #[test]
    fn non_object_items_dropped() {
        let rows = rows_from_json(json!([{"id": 1}, 5, null])).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn sqlite_query_maps_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE users (id INTEGER, name TEXT, score REAL, avatar BLOB, gone TEXT);
                 INSERT INTO users VALUES (1, 'Ada', 9.5, x'0102', NULL);",
            )
            .unwrap();
        }

        let source = SqliteSource::new(&path, "SELECT * FROM users");
        let rows = source.fetch_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["name"], json!("Ada"));
        assert_eq!(rows[0]["score"], json!(9.5));
        assert_eq!(rows[0]["avatar"], json!("AQI="));
        assert_eq!(rows[0]["gone"], Value::Null);
    }

    #[tokio::test]
    async fn empty_query_is_config_error() {
        let source = SqliteSource::new("/nonexistent.db", "  ");
        assert!(matches!(source.fetch_rows().await, Err(SyncError::Config(_))));
    }
}
