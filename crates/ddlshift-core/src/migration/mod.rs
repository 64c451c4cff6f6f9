//! Migration engine.
//!
//! This module evolves a live schema toward a declared one with:
//! - Deterministic schema diffing
//! - Risk grading (SAFE/MEDIUM/HIGH)
//! - Rollback plans computed before anything executes
//! - Checksummed plans and duplicate-application detection
//! - One active migration per scope, guarded by a leased lock
//!
//! # Risk Levels
//!
//! | Level | Description | Examples | Behavior |
//! |-------|-------------|----------|----------|
//! | **SAFE** | No data loss, no blocking | New tables, nullable columns, indexes | Shares batches |
//! | **MEDIUM** | May fail on existing data or lock | Widening casts, tightening nullability | Shares batches |
//! | **HIGH** | May destroy data | Dropped columns or tables, lossy casts | Own batch |
//!
//! # Example
//!
//! ```ignore
//! use ddlshift_core::migration::{ExecuteOptions, ExecutionMode, MigrationEngine, RiskLevel};
//!
//! let engine = MigrationEngine::open_sled(&db, models, EngineConfig::default())?;
//!
//! // Plan, refusing anything above MEDIUM
//! let plan = engine
//!     .plan("app", ExecutionMode::AutoConfirm, RiskLevel::Medium)?
//!     .into_plan()
//!     .expect("not a dry run");
//!
//! let record = engine.execute(plan, &ExecuteOptions::new())?;
//! println!("applied {} as {}", record.checksum, record.id);
//! ```

pub mod diff;
pub mod engine;
pub mod error;
pub mod executor;
pub mod history;
pub mod lock;
pub mod observer;
pub mod operation;
pub mod plan;
pub mod risk;
pub mod rollback;
pub mod state;

// Re-export main types

// Diff and operation types
pub use diff::SchemaDiff;
pub use operation::{ActionDescriptor, Change, MigrationOperation, OperationKind, TableOccupancy};

// Error types
pub use error::{MigrationError, RiskLevel, RollbackOutcome};

// Risk and rollback types
pub use risk::{Conversion, RiskClassifier, TypeCapabilities};
pub use rollback::{Fidelity, RollbackBatch, RollbackPlan, RollbackPlanner, RollbackStep};

// Plan types
pub use plan::{
    compute_checksum, ConfirmationToken, ExecutionMode, MigrationPlan, MigrationPlanner,
    PlanBatch, PreviewBatch, PreviewResult, PreviewStatement,
};

// Execution types
pub use engine::{MigrationEngine, PlanOutcome};
pub use executor::{
    rollback_record, CancelHandle, ExecuteOptions, ExecutionContext, ExecutionCoordinator,
};
pub use state::{
    CoordinatorState, MigrationRecord, OperationOutcome, OutcomeStatus, RecordStatus,
    StateTransition,
};

// Concurrency and history types
pub use history::{HistoryFilter, HistoryStore, MemoryHistoryStore, SledHistoryStore};
pub use lock::{ConcurrencyGuard, LockStore, LockToken, MemoryLockStore, SledLockStore};

// Observer types
pub use observer::{
    EventQueue, NullObserver, ProgressEvent, ProgressObserver, QueuedObserver, TracingObserver,
};
