//! Migration engine facade.

use super::diff::SchemaDiff;
use super::error::{MigrationError, RiskLevel};
use super::executor::{rollback_record, ExecuteOptions, ExecutionContext, ExecutionCoordinator};
use super::history::{HistoryFilter, HistoryStore, SledHistoryStore};
use super::lock::{ConcurrencyGuard, LockStore, SledLockStore};
use super::observer::{NullObserver, ProgressObserver, QueuedObserver};
use super::plan::{ExecutionMode, MigrationPlan, MigrationPlanner, PreviewResult};
use super::state::MigrationRecord;
use crate::config::EngineConfig;
use crate::dialect::{AnsiSqlRenderer, SqlRenderer};
use crate::driver::{ConnectionSource, ModelSource, SchemaIntrospector};
use crate::target::SledSchemaTarget;
use std::sync::Arc;
use tracing::{info, instrument};

/// Result of planning.
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// An executable plan.
    Plan(MigrationPlan),
    /// A dry run: what execution would do.
    Preview(PreviewResult),
}

impl PlanOutcome {
    /// The plan, if one was produced for execution.
    pub fn into_plan(self) -> Option<MigrationPlan> {
        match self {
            PlanOutcome::Plan(plan) => Some(plan),
            PlanOutcome::Preview(_) => None,
        }
    }

    /// The preview, if this was a dry run.
    pub fn preview(&self) -> Option<&PreviewResult> {
        match self {
            PlanOutcome::Preview(preview) => Some(preview),
            PlanOutcome::Plan(_) => None,
        }
    }
}

/// Plans, executes and rolls back migrations for one database.
pub struct MigrationEngine {
    introspector: Arc<dyn SchemaIntrospector>,
    models: Arc<dyn ModelSource>,
    planner: MigrationPlanner,
    context: Arc<ExecutionContext>,
    queued: Option<Arc<QueuedObserver>>,
}

impl MigrationEngine {
    /// Create an engine with the ANSI renderer and no observer.
    pub fn new(
        introspector: Arc<dyn SchemaIntrospector>,
        models: Arc<dyn ModelSource>,
        connections: Arc<dyn ConnectionSource>,
        history: Arc<dyn HistoryStore>,
        locks: Arc<dyn LockStore>,
        config: EngineConfig,
    ) -> Self {
        let guard = Arc::new(ConcurrencyGuard::new(
            locks,
            config.lease_duration,
            config.lock_poll_interval,
        ));
        let planner = MigrationPlanner::new(Arc::new(AnsiSqlRenderer::new()))
            .with_max_batch_size(config.max_batch_size);

        Self {
            introspector,
            models,
            planner,
            context: Arc::new(ExecutionContext {
                history,
                guard,
                connections,
                observer: Arc::new(NullObserver),
                config,
            }),
            queued: None,
        }
    }

    /// Create an engine over a sled database: schemas, history and locks all
    /// live in their own trees.
    pub fn open_sled(
        db: &sled::Db,
        models: Arc<dyn ModelSource>,
        config: EngineConfig,
    ) -> Result<Self, MigrationError> {
        let target = Arc::new(SledSchemaTarget::open(db)?);
        Ok(Self::new(
            target.clone(),
            models,
            target,
            Arc::new(SledHistoryStore::open(db)?),
            Arc::new(SledLockStore::open(db)?),
            config,
        ))
    }

    /// Render operations with a different dialect.
    pub fn with_renderer(mut self, renderer: Arc<dyn SqlRenderer>) -> Self {
        self.planner = MigrationPlanner::new(renderer)
            .with_max_batch_size(self.context.config.max_batch_size);
        self
    }

    /// Deliver progress events to `sink` through a bounded background queue.
    pub fn with_observer(mut self, sink: Arc<dyn ProgressObserver>) -> Self {
        let queued = Arc::new(QueuedObserver::start(
            sink,
            self.context.config.observer_capacity,
        ));
        self.context = Arc::new(ExecutionContext {
            history: self.context.history.clone(),
            guard: self.context.guard.clone(),
            connections: self.context.connections.clone(),
            observer: queued.clone(),
            config: self.context.config.clone(),
        });
        self.queued = Some(queued);
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.context.config
    }

    /// The concurrency guard shared by every execution of this engine.
    pub fn guard(&self) -> &Arc<ConcurrencyGuard> {
        &self.context.guard
    }

    /// Progress events dropped because the observer fell behind.
    pub fn dropped_events(&self) -> u64 {
        self.queued.as_ref().map(|q| q.dropped()).unwrap_or(0)
    }

    /// Diff the desired schema of `scope` against the live one and plan the
    /// result. Dry runs return a preview instead of a plan.
    #[instrument(skip(self))]
    pub fn plan(
        &self,
        scope: &str,
        mode: ExecutionMode,
        max_risk: RiskLevel,
    ) -> Result<PlanOutcome, MigrationError> {
        let desired = self.models.desired(scope)?;
        if desired.scope() != scope {
            return Err(MigrationError::Configuration(format!(
                "model for scope '{}' declares scope '{}'",
                scope,
                desired.scope()
            )));
        }
        let observed = self.introspector.observe(scope)?;

        let diff = SchemaDiff::compute_with(&desired, &observed, &self.planner.classifier())?;
        let plan = self
            .planner
            .plan(scope, diff.into_operations(), max_risk, mode)?;

        info!(
            plan_id = %plan.id(),
            operations = plan.operation_count(),
            risk = %plan.aggregate_risk(),
            checksum = %plan.checksum(),
            "Planned migration"
        );

        if mode == ExecutionMode::DryRun {
            let mut coordinator = self.coordinator(plan);
            return Ok(PlanOutcome::Preview(coordinator.preview()?));
        }
        Ok(PlanOutcome::Plan(plan))
    }

    /// A coordinator for a plan, sharing this engine's stores and guard.
    pub fn coordinator(&self, plan: MigrationPlan) -> ExecutionCoordinator {
        ExecutionCoordinator::new(plan, self.context.clone())
    }

    /// Execute a plan.
    pub fn execute(
        &self,
        plan: MigrationPlan,
        options: &ExecuteOptions,
    ) -> Result<MigrationRecord, MigrationError> {
        self.coordinator(plan).execute(options)
    }

    /// Roll back a completed execution by record ID.
    pub fn rollback(
        &self,
        record_id: &str,
        acknowledge_irreversible: bool,
    ) -> Result<MigrationRecord, MigrationError> {
        rollback_record(&self.context, record_id, acknowledge_irreversible)
    }

    /// History of a scope, oldest first.
    pub fn history(
        &self,
        scope: &str,
        filter: HistoryFilter,
    ) -> Result<Vec<MigrationRecord>, MigrationError> {
        self.context.history.list(&filter.scope(scope))
    }

    /// Stop the observer thread after delivering queued events.
    pub fn shutdown(&self) {
        if let Some(queued) = &self.queued {
            queued.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDatabase, StaticModelSource};
    use crate::migration::history::MemoryHistoryStore;
    use crate::migration::lock::MemoryLockStore;
    use crate::migration::observer::ProgressEvent;
    use crate::migration::state::RecordStatus;
    use crate::schema::{ColumnSpec, LogicalType, SchemaSnapshot, TableSpec};
    use parking_lot::Mutex;

    fn user_table() -> TableSpec {
        TableSpec::new("user").with_column(ColumnSpec::new("id", LogicalType::Uuid))
    }

    fn engine(db: &MemoryDatabase, desired: SchemaSnapshot) -> MigrationEngine {
        let db = Arc::new(db.clone());
        MigrationEngine::new(
            db.clone(),
            Arc::new(StaticModelSource::new().with_model(desired)),
            db,
            Arc::new(MemoryHistoryStore::new()),
            Arc::new(MemoryLockStore::new()),
            EngineConfig::new(),
        )
    }

    #[test]
    fn test_plan_execute_history() {
        let db = MemoryDatabase::new();
        db.seed(SchemaSnapshot::new("app").with_table(user_table()));
        let desired = SchemaSnapshot::new("app").with_table(
            user_table().with_column(ColumnSpec::nullable("phone", LogicalType::Text)),
        );
        let engine = engine(&db, desired);

        let plan = engine
            .plan("app", ExecutionMode::AutoConfirm, RiskLevel::Safe)
            .unwrap()
            .into_plan()
            .unwrap();
        assert_eq!(plan.operation_count(), 1);

        let record = engine.execute(plan, &ExecuteOptions::new()).unwrap();
        let history = engine.history("app", HistoryFilter::new()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, record.id);
        assert!(engine.history("billing", HistoryFilter::new()).unwrap().is_empty());

        let rolled = engine.rollback(&record.id, false).unwrap();
        assert_eq!(rolled.status, RecordStatus::RolledBack);
    }

    #[test]
    fn test_dry_run_returns_preview() {
        let db = MemoryDatabase::new();
        let engine = engine(&db, SchemaSnapshot::new("app").with_table(user_table()));

        let outcome = engine
            .plan("app", ExecutionMode::DryRun, RiskLevel::High)
            .unwrap();
        let preview = outcome.preview().unwrap();
        assert!(preview.to_string().contains("CREATE TABLE"));
        assert_eq!(db.mutation_count(), 0);
    }

    #[test]
    fn test_unknown_scope_is_configuration_error() {
        let db = MemoryDatabase::new();
        let engine = engine(&db, SchemaSnapshot::new("app"));
        assert!(matches!(
            engine.plan("billing", ExecutionMode::AutoConfirm, RiskLevel::High),
            Err(MigrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_queued_observer_receives_events() {
        let db = MemoryDatabase::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let engine = engine(&db, SchemaSnapshot::new("app").with_table(user_table()))
            .with_observer(Arc::new(move |e: &ProgressEvent| sink.lock().push(e.clone())));

        let plan = engine
            .plan("app", ExecutionMode::AutoConfirm, RiskLevel::Safe)
            .unwrap()
            .into_plan()
            .unwrap();
        engine.execute(plan, &ExecuteOptions::new()).unwrap();
        engine.shutdown();

        let seen = seen.lock();
        assert!(seen
            .iter()
            .any(|e| matches!(e, ProgressEvent::BatchCommitted { .. })));
        assert_eq!(engine.dropped_events(), 0);
    }
}
