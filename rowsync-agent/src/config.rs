//! Agent configuration file.
//!
//! The agent reads a TOML file describing the API token, run flags and the
//! list of operations:
//!
//! ```toml
//! auth_token = "eu--..."
//! dry_run = false
//!
//! [database]
//! path = "/var/lib/app/app.db"
//!
//! [[operations]]
//! type = "push"
//! target_data_source_id = 42
//! primary_column = "id"
//! frequency_secs = 300
//!
//! [operations.source]
//! kind = "query"
//! sql = "SELECT * FROM customers"
//!
//! [[operations]]
//! type = "pull"
//! target_data_source_id = 43
//!
//! [operations.output]
//! kind = "json"
//! path = "orders.json"
//! ```

use anyhow::{bail, Context, Result};
use rowsync_sync::{
    HttpSource, JsonFileAction, PullAction, PullOperation, PushOperation, RowSource,
    SqliteSource, SqliteTableAction, StaticSource, SyncConfig, SyncOrchestrator,
};
use rowsync_types::Row;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Environment variable holding the config path when none is given.
pub const CONFIG_ENV: &str = "ROWSYNC_CONFIG";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub auth_token: String,
    /// Log the payloads instead of committing them, then exit.
    #[serde(default)]
    pub dry_run: bool,
    /// Run every operation once at startup.
    #[serde(default = "default_true")]
    pub sync_on_init: bool,
    /// Overrides the region derived from the token.
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub operations: Vec<OperationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OperationConfig {
    Push(PushConfig),
    Pull(PullConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    pub source: SourceConfig,
    #[serde(flatten)]
    pub operation: PushOperation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullConfig {
    pub output: OutputConfig,
    #[serde(flatten)]
    pub operation: PullOperation,
}

/// Where a push reads its rows from.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// SQL run against `database`, or the top-level `[database]`.
    Query {
        sql: String,
        #[serde(default)]
        database: Option<PathBuf>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Rows written inline in the config file.
    Rows { rows: Vec<Row> },
}

/// Where a pull writes the entries it receives.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputConfig {
    Json { path: PathBuf },
    Sqlite { path: PathBuf, table: String },
}

impl AgentConfig {
    /// Reads and parses a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(contents)?;
        if config.auth_token.trim().is_empty() {
            bail!("auth_token cannot be empty");
        }
        Ok(config)
    }

    /// Library settings derived from this file.
    pub fn sync_config(&self) -> SyncConfig {
        let config = SyncConfig::new(self.auth_token.clone()).with_dry_run(self.dry_run);
        match &self.api_base_url {
            Some(url) => config.with_base_url(url.clone()),
            None => config,
        }
    }

    /// Builds an orchestrator with every operation registered, in file
    /// order. Fails on the first invalid operation.
    pub fn build_orchestrator(&self) -> Result<SyncOrchestrator> {
        let mut orchestrator = SyncOrchestrator::new(self.sync_config())?;
        self.register(&mut orchestrator)?;
        Ok(orchestrator)
    }

    /// Registers the operations on an existing orchestrator.
    pub fn register(&self, orchestrator: &mut SyncOrchestrator) -> Result<()> {
        if self.operations.is_empty() {
            bail!("no operations configured");
        }
        for (index, operation) in self.operations.iter().enumerate() {
            let registered = match operation {
                OperationConfig::Push(push) => {
                    let source = self.row_source(&push.source)?;
                    orchestrator.push(push.operation.clone(), source)
                }
                OperationConfig::Pull(pull) => {
                    let action = pull_action(&pull.output)?;
                    orchestrator.pull(pull.operation.clone(), action)
                }
            };
            registered.with_context(|| format!("Invalid operation at position {}", index + 1))?;
        }
        Ok(())
    }

    fn row_source(&self, source: &SourceConfig) -> Result<Arc<dyn RowSource>> {
        Ok(match source {
            SourceConfig::Query { sql, database } => {
                let path = database
                    .clone()
                    .or_else(|| self.database.as_ref().map(|db| db.path.clone()))
                    .context("query source needs a database path")?;
                Arc::new(SqliteSource::new(path, sql.clone()))
            }
            SourceConfig::Http { url, headers } => {
                Arc::new(HttpSource::new(url.clone(), headers.clone())?)
            }
            SourceConfig::Rows { rows } => Arc::new(StaticSource::new(rows.clone())),
        })
    }
}

fn pull_action(output: &OutputConfig) -> Result<Arc<dyn PullAction>> {
    Ok(match output {
        OutputConfig::Json { path } => Arc::new(JsonFileAction::new(path.clone())),
        OutputConfig::Sqlite { path, table } => {
            Arc::new(SqliteTableAction::new(path.clone(), table.clone())?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_sync::SyncMode;

    const SAMPLE: &str = r#"
auth_token = "us--token"
dry_run = true

[database]
path = "app.db"

[[operations]]
type = "push"
description = "Customers"
target_data_source_id = 42
primary_column = "id"
mode = "replace"
batch_size = 250
frequency_secs = 60

[operations.source]
kind = "query"
sql = "SELECT * FROM customers"

[[operations]]
type = "pull"
target_data_source_id = 43
attributes = ["id", "total"]

[operations.where]
status = "open"

[operations.output]
kind = "json"
path = "orders.json"
"#;

    #[test]
    fn parses_sample() {
        let config = AgentConfig::from_toml(SAMPLE).unwrap();
        assert!(config.dry_run);
        assert!(config.sync_on_init);
        assert_eq!(config.operations.len(), 2);

        let OperationConfig::Push(push) = &config.operations[0] else {
            panic!("expected a push");
        };
        assert_eq!(push.operation.target_data_source_id, 42);
        assert_eq!(push.operation.mode, SyncMode::Replace);
        assert_eq!(push.operation.batch_size, 250);
        assert_eq!(push.operation.frequency_secs, Some(60));
        assert!(matches!(push.source, SourceConfig::Query { database: None, .. }));

        let OperationConfig::Pull(pull) = &config.operations[1] else {
            panic!("expected a pull");
        };
        assert_eq!(pull.operation.filter, Some(serde_json::json!({"status": "open"})));
        assert_eq!(
            pull.operation.attributes,
            Some(vec!["id".to_string(), "total".to_string()])
        );
    }

    #[test]
    fn empty_token_rejected() {
        assert!(AgentConfig::from_toml("auth_token = \"  \"").is_err());
    }

    #[test]
    fn query_without_database_rejected() {
        let config = AgentConfig::from_toml(
            r#"
auth_token = "eu--token"

[[operations]]
type = "push"
target_data_source_id = 1

[operations.source]
kind = "query"
sql = "SELECT 1"
"#,
        )
        .unwrap();
        assert!(config.build_orchestrator().is_err());
    }

    #[test]
    fn base_url_override() {
        let mut config = AgentConfig::from_toml("auth_token = \"us--token\"").unwrap();
        assert_eq!(config.sync_config().base_url(), rowsync_sync::config::US_API_URL);
        config.api_base_url = Some("http://localhost:9000".into());
        assert_eq!(config.sync_config().base_url(), "http://localhost:9000");
    }
}
