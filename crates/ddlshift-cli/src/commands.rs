//! Command handlers.

use crate::config::{CliConfig, Command};
use crate::error::CliError;
use crate::formatter::{create_formatter, Formatter};
use ddlshift_core::migration::TracingObserver;
use ddlshift_core::{
    ConfirmationToken, ExecuteOptions, ExecutionMode, HistoryFilter, MigrationEngine,
    PlanOutcome, RecordStatus, RiskLevel, SchemaSnapshot, SledSchemaTarget, StaticModelSource,
};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// An open data directory and the settings to drive it with.
pub struct Session {
    db: sled::Db,
    config: CliConfig,
    formatter: Box<dyn Formatter>,
}

impl Session {
    /// Open the data directory named by the configuration.
    pub fn open(config: CliConfig) -> Result<Self, CliError> {
        let db = sled::open(&config.data_path)?;
        debug!(path = %config.data_path.display(), "Opened data directory");
        Ok(Self {
            db,
            formatter: create_formatter(config.format),
            config,
        })
    }

    /// Run one command, prompting on `input` and writing results to `output`.
    pub fn run(
        &self,
        command: Command,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
    ) -> Result<(), CliError> {
        match command {
            Command::Seed { file, rows } => self.seed(&file, &rows, output),
            Command::Observe { scope } => self.observe(&scope, output),
            Command::Plan { desired, max_risk } => self.plan(&desired, max_risk, output),
            Command::Apply {
                desired,
                max_risk,
                yes,
                acknowledge_irreversible,
            } => self.apply(&desired, max_risk, yes, acknowledge_irreversible, input, output),
            Command::Rollback {
                record_id,
                acknowledge_irreversible,
            } => self.rollback(&record_id, acknowledge_irreversible, output),
            Command::History {
                scope,
                status,
                limit,
            } => self.history(&scope, status, limit, output),
        }
    }

    fn engine(&self, models: StaticModelSource) -> Result<MigrationEngine, CliError> {
        let engine = MigrationEngine::open_sled(&self.db, Arc::new(models), self.config.engine.clone())?
            .with_observer(Arc::new(TracingObserver));
        Ok(engine)
    }

    fn seed(
        &self,
        file: &Path,
        rows: &[(String, u64)],
        output: &mut dyn Write,
    ) -> Result<(), CliError> {
        let snapshot = read_snapshot(file)?;
        let target = SledSchemaTarget::open(&self.db)?;
        target.seed(&snapshot)?;
        for (table, count) in rows {
            target.set_row_count(snapshot.scope(), table, Some(*count))?;
        }
        self.db.flush()?;

        info!(scope = snapshot.scope(), tables = snapshot.len(), "Seeded schema");
        let message = format!(
            "Seeded scope '{}' with {} table(s)",
            snapshot.scope(),
            snapshot.len()
        );
        writeln!(output, "{}", self.formatter.format_message(&message))?;
        Ok(())
    }

    fn observe(&self, scope: &str, output: &mut dyn Write) -> Result<(), CliError> {
        let snapshot = SledSchemaTarget::open(&self.db)?.load(scope)?;
        writeln!(output, "{}", self.formatter.format_snapshot(&snapshot))?;
        Ok(())
    }

    fn plan(
        &self,
        desired: &Path,
        max_risk: RiskLevel,
        output: &mut dyn Write,
    ) -> Result<(), CliError> {
        let snapshot = read_snapshot(desired)?;
        let scope = snapshot.scope().to_string();
        let engine = self.engine(StaticModelSource::new().with_model(snapshot))?;

        let outcome = engine.plan(&scope, ExecutionMode::DryRun, max_risk);
        engine.shutdown();

        if let Some(preview) = outcome?.preview() {
            writeln!(output, "{}", self.formatter.format_preview(preview))?;
        }
        Ok(())
    }

    fn apply(
        &self,
        desired: &Path,
        max_risk: RiskLevel,
        yes: bool,
        acknowledge_irreversible: bool,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
    ) -> Result<(), CliError> {
        let snapshot = read_snapshot(desired)?;
        let scope = snapshot.scope().to_string();
        let engine = self.engine(StaticModelSource::new().with_model(snapshot))?;

        let result = self.apply_with(&engine, &scope, max_risk, yes, acknowledge_irreversible, input, output);
        engine.shutdown();
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_with(
        &self,
        engine: &MigrationEngine,
        scope: &str,
        max_risk: RiskLevel,
        yes: bool,
        acknowledge_irreversible: bool,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
    ) -> Result<(), CliError> {
        let mode = if yes {
            ExecutionMode::AutoConfirm
        } else {
            ExecutionMode::Interactive
        };

        let plan = match engine.plan(scope, mode, max_risk)? {
            PlanOutcome::Plan(plan) => plan,
            PlanOutcome::Preview(preview) => {
                writeln!(output, "{}", self.formatter.format_preview(&preview))?;
                return Ok(());
            }
        };

        let mut options = ExecuteOptions::new();
        if acknowledge_irreversible {
            options = options.acknowledge_irreversible();
        }

        if mode == ExecutionMode::Interactive {
            writeln!(output, "{}", self.formatter.format_preview(&plan.preview()))?;
            write!(output, "Apply this plan? [y/N] ")?;
            output.flush()?;

            let mut answer = String::new();
            input.read_line(&mut answer)?;
            if !matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
                return Err(CliError::Aborted);
            }
            options = options.with_confirmation(ConfirmationToken::for_plan(&plan));
        }

        let record = engine.execute(plan, &options)?;
        writeln!(output, "{}", self.formatter.format_record(&record))?;
        Ok(())
    }

    fn rollback(
        &self,
        record_id: &str,
        acknowledge_irreversible: bool,
        output: &mut dyn Write,
    ) -> Result<(), CliError> {
        let engine = self.engine(StaticModelSource::new())?;
        let result = engine.rollback(record_id, acknowledge_irreversible);
        engine.shutdown();

        writeln!(output, "{}", self.formatter.format_record(&result?))?;
        Ok(())
    }

    fn history(
        &self,
        scope: &str,
        status: Option<RecordStatus>,
        limit: Option<usize>,
        output: &mut dyn Write,
    ) -> Result<(), CliError> {
        let mut filter = HistoryFilter::new();
        if let Some(status) = status {
            filter = filter.status(status);
        }
        if let Some(limit) = limit {
            filter = filter.limit(limit);
        }

        let engine = self.engine(StaticModelSource::new())?;
        let records = engine.history(scope, filter);
        engine.shutdown();

        writeln!(output, "{}", self.formatter.format_history(&records?))?;
        Ok(())
    }
}

/// Read a schema snapshot from a JSON file.
fn read_snapshot(path: &Path) -> Result<SchemaSnapshot, CliError> {
    let file = std::fs::File::open(path)?;
    let snapshot: SchemaSnapshot = serde_json::from_reader(std::io::BufReader::new(file))?;
    snapshot.validate()?;
    Ok(snapshot)
}
