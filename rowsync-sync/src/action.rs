//! Local actions that receive the entries of a pull.

use crate::config::PullOperation;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use rowsync_types::RemoteEntry;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Consumes the entries fetched by a pull operation.
#[async_trait]
pub trait PullAction: Send + Sync {
    async fn apply(&self, operation: &PullOperation, entries: Vec<RemoteEntry>) -> SyncResult<()>;
}

/// Writes pulled entries to a JSON file, replacing its previous content.
#[derive(Debug, Clone)]
pub struct JsonFileAction {
    path: PathBuf,
}

impl JsonFileAction {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PullAction for JsonFileAction {
    async fn apply(&self, _operation: &PullOperation, entries: Vec<RemoteEntry>) -> SyncResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&entries)?;

        // Write to a sibling file first so readers never see a partial file.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Wrote {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

/// Upserts pulled entries into a SQLite table of `(id, data)` rows, where
/// `data` is the entry's JSON.
#[derive(Debug, Clone)]
pub struct SqliteTableAction {
    path: PathBuf,
    table: String,
}

impl SqliteTableAction {
    /// Creates the action. The table name may only contain ASCII letters,
    /// digits and underscores.
    pub fn new(path: impl Into<PathBuf>, table: impl Into<String>) -> SyncResult<Self> {
        let table = table.into();
        let valid = !table.is_empty()
            && !table.starts_with(|c: char| c.is_ascii_digit())
            && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(SyncError::Config(format!("invalid table name \"{table}\"")));
        }
        Ok(Self {
            path: path.into(),
            table,
        })
    }
}

fn upsert_entries(path: &Path, table: &str, entries: &[RemoteEntry]) -> SyncResult<usize> {
    let mut conn = rusqlite::Connection::open(path)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (id TEXT PRIMARY KEY, data TEXT NOT NULL)"
    ))?;

    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {table} (id, data) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data"
        ))?;
        for entry in entries {
            let data = serde_json::to_string(&entry.data)?;
            stmt.execute(rusqlite::params![entry.id.to_string(), data])?;
        }
    }
    tx.commit()?;
    Ok(entries.len())
}

#[async_trait]
impl PullAction for SqliteTableAction {
    async fn apply(&self, _operation: &PullOperation, entries: Vec<RemoteEntry>) -> SyncResult<()> {
        let path = self.path.clone();
        let table = self.table.clone();
        let written = tokio::task::spawn_blocking(move || upsert_entries(&path, &table, &entries))
            .await
            .map_err(|e| SyncError::Source(format!("database task failed: {e}")))??;
        debug!("Upserted {} entries into {}", written, self.table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: i64, value: serde_json::Value) -> RemoteEntry {
        RemoteEntry::new(id, value.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn json_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/entries.json");
        let action = JsonFileAction::new(&path);

        action
            .apply(&PullOperation::default(), vec![entry(1, json!({"name": "Ada"}))])
            .await
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, json!([{"id": 1, "data": {"name": "Ada"}}]));
    }

    #[test]
    fn table_name_validated() {
        assert!(SqliteTableAction::new("x.db", "entries_1").is_ok());
        assert!(SqliteTableAction::new("x.db", "1entries").is_err());
        assert!(SqliteTableAction::new("x.db", "a; DROP TABLE b").is_err());
        assert!(SqliteTableAction::new("x.db", "").is_err());
    }

    #[tokio::test]
    async fn sqlite_upsert_replaces_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pull.db");
        let action = SqliteTableAction::new(&path, "entries").unwrap();
        let op = PullOperation::default();

        action.apply(&op, vec![entry(1, json!({"v": 1})), entry(2, json!({"v": 2}))]).await.unwrap();
        action.apply(&op, vec![entry(1, json!({"v": 3}))]).await.unwrap();

        let conn = rusqlite::Connection::open(&path).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0)).unwrap();
        let data: String = conn
            .query_row("SELECT data FROM entries WHERE id = '1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(data, r#"{"v":3}"#);
    }
}
