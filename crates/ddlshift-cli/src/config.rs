//! Command-line arguments and CLI configuration.

use crate::formatter::OutputFormat;
use clap::{Parser, Subcommand};
use ddlshift_core::config::{
    DEFAULT_LEASE_DURATION_MS, DEFAULT_LOCK_POLL_INTERVAL_MS, DEFAULT_LOCK_TIMEOUT_MS,
};
use ddlshift_core::{EngineConfig, RecordStatus, RiskLevel, TransactionScope};
use std::path::PathBuf;
use std::time::Duration;

/// Default data directory.
pub const DEFAULT_DATA_PATH: &str = "./ddlshift-data";

/// CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Path to the sled data directory.
    pub data_path: PathBuf,
    /// Output format.
    pub format: OutputFormat,
    /// Engine settings.
    pub engine: EngineConfig,
}

/// ddlshift - plan, apply and roll back schema migrations
#[derive(Parser, Debug)]
#[command(name = "ddlshift")]
#[command(version, about = "Schema migration planning and execution", long_about = None)]
pub struct Args {
    /// Path to the data directory holding schemas, history and locks.
    #[arg(short, long, global = true, default_value = DEFAULT_DATA_PATH)]
    pub data_path: PathBuf,

    /// Output format.
    #[arg(long, global = true, default_value = "table", value_enum)]
    pub format: OutputFormat,

    /// Milliseconds to wait for the scope lock.
    #[arg(long, global = true, default_value_t = DEFAULT_LOCK_TIMEOUT_MS)]
    pub lock_timeout_ms: u64,

    /// Lease duration in milliseconds.
    #[arg(long, global = true, default_value_t = DEFAULT_LEASE_DURATION_MS)]
    pub lease_ms: u64,

    /// Lock poll interval in milliseconds.
    #[arg(long, global = true, default_value_t = DEFAULT_LOCK_POLL_INTERVAL_MS)]
    pub poll_ms: u64,

    /// Run the whole plan in one transaction instead of one per batch.
    #[arg(long, global = true)]
    pub whole_plan: bool,

    /// Maximum operations per batch (0 = unbounded).
    #[arg(long, global = true, default_value_t = 0)]
    pub max_batch_size: usize,

    /// Lock holder identity (defaults to process id and start time).
    #[arg(long, global = true)]
    pub holder: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Store a schema snapshot as the live schema of its scope.
    Seed {
        /// JSON snapshot file.
        file: PathBuf,

        /// Row count statistics, as TABLE=ROWS.
        #[arg(long = "rows", value_parser = parse_row_count)]
        rows: Vec<(String, u64)>,
    },

    /// Show the live schema of a scope.
    Observe {
        /// Scope name.
        scope: String,
    },

    /// Preview the migration to a desired schema without executing it.
    Plan {
        /// JSON snapshot file of the desired schema.
        desired: PathBuf,

        /// Highest risk level the plan may contain.
        #[arg(long, default_value = "medium")]
        max_risk: RiskLevel,
    },

    /// Migrate a scope to a desired schema.
    Apply {
        /// JSON snapshot file of the desired schema.
        desired: PathBuf,

        /// Highest risk level the plan may contain.
        #[arg(long, default_value = "medium")]
        max_risk: RiskLevel,

        /// Execute without asking for confirmation.
        #[arg(short, long)]
        yes: bool,

        /// Accept operations that cannot be rolled back.
        #[arg(long)]
        acknowledge_irreversible: bool,
    },

    /// Roll back a completed migration.
    Rollback {
        /// Record ID from `history`.
        record_id: String,

        /// Skip steps that cannot be reversed.
        #[arg(long)]
        acknowledge_irreversible: bool,
    },

    /// List migration history for a scope.
    History {
        /// Scope name.
        scope: String,

        /// Only records with this status.
        #[arg(long)]
        status: Option<RecordStatus>,

        /// Only the most recent N records.
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn parse_row_count(s: &str) -> Result<(String, u64), String> {
    let (table, rows) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TABLE=ROWS, got '{}'", s))?;
    let rows = rows
        .parse()
        .map_err(|_| format!("invalid row count '{}'", rows))?;
    Ok((table.to_string(), rows))
}

impl Args {
    /// Convert command-line arguments to configuration.
    pub fn into_config(self) -> (CliConfig, Command) {
        let mut engine = EngineConfig::new()
            .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .with_lease_duration(Duration::from_millis(self.lease_ms))
            .with_lock_poll_interval(Duration::from_millis(self.poll_ms));

        if self.whole_plan {
            engine = engine.with_transaction_scope(TransactionScope::WholePlan);
        }
        if self.max_batch_size > 0 {
            engine = engine.with_max_batch_size(self.max_batch_size);
        }
        if let Some(holder) = self.holder {
            engine = engine.with_holder_id(holder);
        }

        let config = CliConfig {
            data_path: self.data_path,
            format: self.format,
            engine,
        };
        (config, self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_config_defaults() {
        let args = Args::parse_from(["ddlshift", "observe", "app"]);
        let (config, command) = args.into_config();

        assert_eq!(config.data_path, PathBuf::from(DEFAULT_DATA_PATH));
        assert_eq!(config.format, OutputFormat::Table);
        assert_eq!(config.engine.transaction_scope, TransactionScope::PerBatch);
        assert_eq!(config.engine.max_batch_size, None);
        assert_eq!(
            config.engine.lock_timeout,
            Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS)
        );
        assert!(matches!(command, Command::Observe { scope } if scope == "app"));
    }

    #[test]
    fn test_into_config_overrides() {
        let args = Args::parse_from([
            "ddlshift",
            "apply",
            "desired.json",
            "--max-risk",
            "high",
            "--yes",
            "--whole-plan",
            "--max-batch-size",
            "3",
            "--holder",
            "deploy-1",
            "--format",
            "json",
        ]);
        let (config, command) = args.into_config();

        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(config.engine.transaction_scope, TransactionScope::WholePlan);
        assert_eq!(config.engine.max_batch_size, Some(3));
        assert_eq!(config.engine.holder_id, "deploy-1");
        match command {
            Command::Apply { max_risk, yes, .. } => {
                assert_eq!(max_risk, RiskLevel::High);
                assert!(yes);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_row_count() {
        assert_eq!(parse_row_count("user=42"), Ok(("user".to_string(), 42)));
        assert!(parse_row_count("user").is_err());
        assert!(parse_row_count("user=many").is_err());
    }
}
