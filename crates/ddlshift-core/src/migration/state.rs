//! Coordinator state machine and persisted migration records.

use super::error::{MigrationError, RiskLevel};
use super::operation::MigrationOperation;
use super::plan::{compute_checksum, MigrationPlan};
use super::rollback::RollbackPlan;
use crate::id::{current_timestamp, generate_hex_id};
use rkyv::{Archive, Deserialize, Serialize};

/// State of an execution coordinator.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorState {
    /// Plan built, nothing done yet.
    Planned,
    /// Dry run reported (terminal).
    Previewed,
    /// Interactive plan waiting for a confirmation token.
    AwaitingConfirmation,
    /// Batches are running.
    Executing,
    /// All batches committed (terminal).
    Completed,
    /// A batch failed or the lease was lost.
    Failed,
    /// Committed batches are being reversed.
    RollingBack,
    /// Committed batches were reversed (terminal).
    RolledBack,
    /// Reversal failed or was impossible (terminal, needs an operator).
    RollbackFailed,
    /// Cancelled before execution started (terminal).
    Cancelled,
    /// An identical plan was already applied (terminal).
    AlreadyApplied,
}

impl CoordinatorState {
    /// Check if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: CoordinatorState) -> bool {
        use CoordinatorState::*;
        matches!(
            (self, next),
            (Planned, Previewed)
                | (Planned, AwaitingConfirmation)
                | (Planned, Executing)
                | (Planned, AlreadyApplied)
                | (AwaitingConfirmation, Executing)
                | (AwaitingConfirmation, Cancelled)
                | (AwaitingConfirmation, AlreadyApplied)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, RollingBack)
                | (Failed, RollingBack)
                | (Failed, RollbackFailed)
                | (RollingBack, RolledBack)
                | (RollingBack, RollbackFailed)
                | (Completed, RollingBack)
                | (Completed, RolledBack)
        )
    }

    /// Check if no coordinator transition leaves this state.
    ///
    /// `Completed` is terminal for the coordinator; an explicit rollback may
    /// later move its record on to `RolledBack`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoordinatorState::Previewed
                | CoordinatorState::Completed
                | CoordinatorState::RolledBack
                | CoordinatorState::RollbackFailed
                | CoordinatorState::Cancelled
                | CoordinatorState::AlreadyApplied
        )
    }
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CoordinatorState::Planned => "PLANNED",
            CoordinatorState::Previewed => "PREVIEWED",
            CoordinatorState::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            CoordinatorState::Executing => "EXECUTING",
            CoordinatorState::Completed => "COMPLETED",
            CoordinatorState::Failed => "FAILED",
            CoordinatorState::RollingBack => "ROLLING_BACK",
            CoordinatorState::RolledBack => "ROLLED_BACK",
            CoordinatorState::RollbackFailed => "ROLLBACK_FAILED",
            CoordinatorState::Cancelled => "CANCELLED",
            CoordinatorState::AlreadyApplied => "ALREADY_APPLIED",
        };
        f.write_str(name)
    }
}

/// One recorded state change.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct StateTransition {
    /// Previous state.
    pub from: CoordinatorState,
    /// New state.
    pub to: CoordinatorState,
    /// When the transition happened (microseconds since epoch).
    pub at: u64,
}

impl StateTransition {
    /// Create a transition stamped with the current time.
    pub fn now(from: CoordinatorState, to: CoordinatorState) -> Self {
        Self {
            from,
            to,
            at: current_timestamp(),
        }
    }
}

/// Status of a persisted migration record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// Plan fully applied.
    Completed,
    /// Plan reversed, either after a failure or by explicit rollback.
    RolledBack,
    /// Execution or rollback ended in a state needing an operator.
    Failed,
}

impl RecordStatus {
    /// Status recorded for a terminal coordinator state.
    pub fn from_state(state: CoordinatorState) -> Option<Self> {
        match state {
            CoordinatorState::Completed => Some(RecordStatus::Completed),
            CoordinatorState::RolledBack => Some(RecordStatus::RolledBack),
            CoordinatorState::RollbackFailed | CoordinatorState::Failed => Some(RecordStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordStatus::Completed => write!(f, "COMPLETED"),
            RecordStatus::RolledBack => write!(f, "ROLLED_BACK"),
            RecordStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "completed" => Ok(RecordStatus::Completed),
            "rolled_back" => Ok(RecordStatus::RolledBack),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(format!("unknown record status: {}", other)),
        }
    }
}

/// What happened to one operation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Applied and committed.
    Applied,
    /// Failed; its transaction was aborted.
    Failed,
    /// Applied, then reversed.
    Reverted,
    /// Applied, and the reversal failed or was impossible.
    RevertFailed,
    /// Applied inside a transaction that was aborted.
    Aborted,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeStatus::Applied => write!(f, "applied"),
            OutcomeStatus::Failed => write!(f, "failed"),
            OutcomeStatus::Reverted => write!(f, "reverted"),
            OutcomeStatus::RevertFailed => write!(f, "revert_failed"),
            OutcomeStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Per-operation outcome.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct OperationOutcome {
    /// Batch the operation belongs to.
    pub batch_index: usize,
    /// Operation description.
    pub description: String,
    /// What happened.
    pub status: OutcomeStatus,
    /// Error message, if any.
    pub message: Option<String>,
}

/// A persisted record of one plan execution or explicit rollback.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct MigrationRecord {
    /// Record ID (hex, time-ordered).
    pub id: String,
    /// ID of the executed plan.
    pub plan_id: String,
    /// Scope.
    pub scope: String,
    /// Plan checksum.
    pub checksum: String,
    /// When execution started (microseconds since epoch).
    pub applied_at: u64,
    /// Current status.
    pub status: RecordStatus,
    /// Every coordinator state change, in order.
    pub transitions: Vec<StateTransition>,
    /// Per-operation outcomes, in order.
    pub outcomes: Vec<OperationOutcome>,
    /// Wall-clock duration of the execution.
    pub duration_micros: u64,
    /// Executed operations, in order.
    pub operations: Vec<MigrationOperation>,
    /// Aggregate risk of the plan.
    pub aggregate_risk: RiskLevel,
    /// Rollback plan computed before execution.
    pub rollback_plan: RollbackPlan,
    /// Set when this record documents a failed rollback of another record.
    pub rollback_of: Option<String>,
    /// Error message for failed or rolled back executions.
    pub error: Option<String>,
}

impl MigrationRecord {
    /// Create a record for a plan execution.
    pub fn for_plan(
        plan: &MigrationPlan,
        status: RecordStatus,
        transitions: Vec<StateTransition>,
        outcomes: Vec<OperationOutcome>,
        applied_at: u64,
        duration_micros: u64,
    ) -> Self {
        Self {
            id: generate_hex_id(),
            plan_id: plan.id().to_string(),
            scope: plan.scope().to_string(),
            checksum: plan.checksum().to_string(),
            applied_at,
            status,
            transitions,
            outcomes,
            duration_micros,
            operations: plan.operations().cloned().collect(),
            aggregate_risk: plan.aggregate_risk(),
            rollback_plan: plan.rollback_plan().clone(),
            rollback_of: None,
            error: None,
        }
    }

    /// Attach an error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// The state the coordinator finished in (or the last appended one).
    pub fn final_state(&self) -> Option<CoordinatorState> {
        self.transitions.last().map(|t| t.to)
    }

    /// Append a transition, updating the status.
    ///
    /// Only `COMPLETED -> ROLLED_BACK` may be appended to a finished record.
    pub fn append_transition(&mut self, transition: StateTransition) -> Result<(), MigrationError> {
        let current = self.final_state().unwrap_or(CoordinatorState::Planned);
        let allowed = self.status == RecordStatus::Completed
            && transition.from == current
            && transition.from == CoordinatorState::Completed
            && transition.to == CoordinatorState::RolledBack;
        if !allowed {
            return Err(MigrationError::InvalidTransition {
                from: current,
                to: transition.to,
            });
        }
        self.transitions.push(transition);
        self.status = RecordStatus::RolledBack;
        Ok(())
    }

    /// Recompute the plan checksum from the stored operations.
    pub fn verify_checksum(&self) -> Result<(), MigrationError> {
        let actual = compute_checksum(&self.scope, &self.operations)?;
        if actual != self.checksum {
            return Err(MigrationError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Serialize the record to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a record from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::AnsiSqlRenderer;
    use crate::migration::operation::{Change, TableOccupancy};
    use crate::migration::plan::{ExecutionMode, MigrationPlanner};
    use crate::schema::{ColumnSpec, LogicalType};
    use std::sync::Arc;

    fn create_plan() -> MigrationPlan {
        let op = MigrationOperation::new(
            "user",
            Change::AddColumn {
                column: ColumnSpec::nullable("phone", LogicalType::varchar(32)),
            },
            TableOccupancy::Populated,
        );
        MigrationPlanner::new(Arc::new(AnsiSqlRenderer::new()))
            .plan("app", vec![op], RiskLevel::Safe, ExecutionMode::AutoConfirm)
            .unwrap()
    }

    fn completed_record() -> MigrationRecord {
        let plan = create_plan();
        MigrationRecord::for_plan(
            &plan,
            RecordStatus::Completed,
            vec![
                StateTransition::now(CoordinatorState::Planned, CoordinatorState::Executing),
                StateTransition::now(CoordinatorState::Executing, CoordinatorState::Completed),
            ],
            vec![OperationOutcome {
                batch_index: 0,
                description: "ADD_COLUMN user.phone".into(),
                status: OutcomeStatus::Applied,
                message: None,
            }],
            current_timestamp(),
            1_500,
        )
    }

    #[test]
    fn test_state_machine() {
        use CoordinatorState::*;
        assert!(Planned.can_transition_to(Executing));
        assert!(Planned.can_transition_to(AwaitingConfirmation));
        assert!(AwaitingConfirmation.can_transition_to(Cancelled));
        assert!(Executing.can_transition_to(RollingBack));
        assert!(Failed.can_transition_to(RollingBack));
        assert!(RollingBack.can_transition_to(RollbackFailed));

        assert!(!Planned.can_transition_to(Completed));
        assert!(!Previewed.can_transition_to(Executing));
        assert!(!RollbackFailed.can_transition_to(RollingBack));
        assert!(!Executing.can_transition_to(Cancelled));

        assert!(Previewed.is_terminal());
        assert!(RollbackFailed.is_terminal());
        assert!(!Failed.is_terminal());
    }

    #[test]
    fn test_record_status_mapping() {
        assert_eq!(
            RecordStatus::from_state(CoordinatorState::RollbackFailed),
            Some(RecordStatus::Failed)
        );
        assert_eq!(RecordStatus::from_state(CoordinatorState::Executing), None);
        assert_eq!("rolled-back".parse::<RecordStatus>(), Ok(RecordStatus::RolledBack));
    }

    #[test]
    fn test_append_rollback_transition() {
        let mut record = completed_record();
        record
            .append_transition(StateTransition::now(
                CoordinatorState::Completed,
                CoordinatorState::RolledBack,
            ))
            .unwrap();
        assert_eq!(record.status, RecordStatus::RolledBack);
        assert_eq!(record.final_state(), Some(CoordinatorState::RolledBack));

        // A rolled back record cannot be rolled back again.
        let err = record
            .append_transition(StateTransition::now(
                CoordinatorState::Completed,
                CoordinatorState::RolledBack,
            ))
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidTransition { .. }));
    }

    #[test]
    fn test_record_checksum_and_serialization() {
        let record = completed_record();
        record.verify_checksum().unwrap();

        let bytes = record.to_bytes().unwrap();
        let restored = MigrationRecord::from_bytes(&bytes).unwrap();
        assert_eq!(restored, record);

        let mut tampered = record.clone();
        tampered.operations.clear();
        assert!(matches!(
            tampered.verify_checksum(),
            Err(MigrationError::ChecksumMismatch { .. })
        ));
    }
}
