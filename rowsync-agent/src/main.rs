//! rowsync agent
//!
//! Keeps remote data sources in step with local databases and files.
//!
//! Usage:
//!   rowsync start agent.toml [--test] [--verbose]
//!   rowsync check agent.toml

use anyhow::Result;
use clap::{Parser, Subcommand};
use rowsync_agent::{AgentConfig, AgentRunner, OperationConfig, RunOptions};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "rowsync", version)]
#[command(about = "Sync local rows with remote data sources")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the configured operations
    Start {
        /// Path to the agent config file
        #[arg(env = "ROWSYNC_CONFIG")]
        config: PathBuf,

        /// Dry run: log what would be committed, then exit
        #[arg(long)]
        test: bool,

        /// Enable verbose debug logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// Parse and validate a config file without contacting the service
    Check {
        /// Path to the agent config file
        #[arg(env = "ROWSYNC_CONFIG")]
        config: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Start {
            config,
            test,
            verbose,
        } => {
            init_logging(verbose);
            info!("rowsync agent {} starting...", env!("CARGO_PKG_VERSION"));

            let mut config = AgentConfig::load(&config)?;
            config.dry_run |= test;
            let options = RunOptions {
                dry_run: config.dry_run,
                sync_on_init: config.sync_on_init || config.dry_run,
            };
            let orchestrator = config.build_orchestrator()?;
            AgentRunner::new(orchestrator, options).run().await
        }
        Command::Check { config } => {
            init_logging(false);
            let config = AgentConfig::load(&config)?;
            let orchestrator = config.build_orchestrator()?;

            println!("Configuration OK");
            println!("  API:        {}", orchestrator.config().base_url());
            println!("  Dry run:    {}", config.dry_run);
            for (id, operation) in orchestrator.operations() {
                let kind = match config.operations.get(id.0) {
                    Some(OperationConfig::Push(_)) => "push",
                    Some(OperationConfig::Pull(_)) => "pull",
                    None => "?",
                };
                let schedule = operation
                    .frequency_secs()
                    .map_or("on start".to_string(), |s| format!("every {s}s"));
                println!(
                    "  {} {} data source {} ({}) {}",
                    id,
                    kind,
                    operation.target_data_source_id(),
                    operation.description(),
                    schedule
                );
            }
            Ok(())
        }
    }
}
