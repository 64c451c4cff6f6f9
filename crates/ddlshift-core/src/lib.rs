//! ddlshift core - schema diffing, risk grading, rollback planning and guarded
//! execution of relational schema migrations.
//!
//! The flow through this crate is:
//!
//! 1. a [`ModelSource`](driver::ModelSource) supplies the desired [`SchemaSnapshot`] and a
//!    [`SchemaIntrospector`](driver::SchemaIntrospector) the observed one;
//! 2. [`SchemaDiff`] turns the pair into ordered, risk-classified operations;
//! 3. [`MigrationPlanner`] batches them, renders action descriptors, checksums the
//!    plan and derives the rollback plan;
//! 4. [`ExecutionCoordinator`] runs the plan under a [`ConcurrencyGuard`] lease and
//!    writes a [`MigrationRecord`] to the [`HistoryStore`].
//!
//! [`MigrationEngine`] wires all of the above together.

pub mod config;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod id;
pub mod migration;
pub mod schema;
pub mod target;

pub use config::{EngineConfig, TransactionScope};
pub use dialect::{AnsiSqlRenderer, SqlRenderer};
pub use driver::{
    ConnectionSource, DdlConnection, MemoryDatabase, ModelSource, SchemaIntrospector,
    StaticModelSource,
};
pub use error::Error;
pub use migration::{
    CancelHandle, ConcurrencyGuard, ConfirmationToken, CoordinatorState, ExecuteOptions,
    ExecutionCoordinator, ExecutionMode, HistoryFilter, HistoryStore, LockToken,
    MemoryHistoryStore, MemoryLockStore, MigrationEngine, MigrationError, MigrationOperation,
    MigrationPlan, MigrationPlanner, MigrationRecord, OperationKind, PlanOutcome, PreviewResult,
    ProgressEvent, ProgressObserver, RecordStatus, RiskClassifier, RiskLevel, RollbackPlan,
    RollbackPlanner, SchemaDiff, SledHistoryStore, SledLockStore,
};
pub use schema::{
    ColumnSpec, ConstraintSpec, DefaultValue, ForeignKeySpec, IndexSpec, LogicalType,
    SchemaSnapshot, TableConstraint, TableSpec,
};
pub use target::SledSchemaTarget;
