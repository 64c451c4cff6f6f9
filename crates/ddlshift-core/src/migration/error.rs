//! Migration-specific error types.

use super::state::CoordinatorState;
use rkyv::{Archive, Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Risk level of a migration operation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// No data loss and no blocking of normal traffic.
    /// Examples: new tables, new nullable columns, new indexes.
    #[default]
    Safe,
    /// May fail on existing data or lock the table for a while.
    /// Examples: widening type changes, tightening nullability.
    Medium,
    /// May destroy data.
    /// Examples: dropping columns or tables, narrowing type changes.
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Safe => write!(f, "SAFE"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "safe" => Ok(RiskLevel::Safe),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

/// What happened to already-committed work after an execution failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Nothing had been committed, so there was nothing to undo.
    NotNeeded,
    /// All committed batches were reversed.
    RolledBack {
        /// Number of batches reversed.
        batches: usize,
    },
    /// Rollback was attempted and failed; manual intervention required.
    Failed {
        /// Why the rollback failed.
        reason: String,
    },
    /// Rollback was not attempted; manual intervention required.
    Skipped {
        /// Why rollback was not attempted.
        reason: String,
    },
}

impl RollbackOutcome {
    /// Check if the database was left in its pre-execution state.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            RollbackOutcome::NotNeeded | RollbackOutcome::RolledBack { .. }
        )
    }
}

impl std::fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackOutcome::NotNeeded => write!(f, "nothing to roll back"),
            RollbackOutcome::RolledBack { batches } => {
                write!(f, "rolled back {} committed batch(es)", batches)
            }
            RollbackOutcome::Failed { reason } => write!(f, "rollback failed: {}", reason),
            RollbackOutcome::Skipped { reason } => write!(f, "rollback skipped: {}", reason),
        }
    }
}

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A snapshot is malformed.
    #[error("schema invariant violated in table '{table}': {message}")]
    SchemaInvariantViolation {
        /// Table the violation was found in (empty for snapshot-level problems).
        table: String,
        /// Description of the violation.
        message: String,
    },

    /// The plan's aggregate risk exceeds what the caller allows.
    #[error("risk threshold exceeded: plan is {aggregate}, maximum allowed is {max_allowed}; offending operations: {}", offending.join(", "))]
    RiskThresholdExceeded {
        /// The caller-supplied maximum.
        max_allowed: RiskLevel,
        /// The plan's aggregate risk.
        aggregate: RiskLevel,
        /// Descriptions of operations above the threshold.
        offending: Vec<String>,
    },

    /// The live schema could not be read.
    #[error("introspection of scope '{scope}' failed: {message}")]
    Introspection {
        /// The scope being observed.
        scope: String,
        /// Error message.
        message: String,
    },

    /// The scope lock could not be acquired in time.
    #[error("timed out after {waited:?} waiting for lock on scope '{scope}'")]
    LockTimeout {
        /// The contended scope.
        scope: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// A lease could not be renewed or validated.
    #[error("lease on scope '{scope}' held by '{holder}' has expired or was taken over")]
    LeaseExpired {
        /// The scope.
        scope: String,
        /// The holder whose lease was lost.
        holder: String,
    },

    /// A token was released by someone who no longer holds it.
    #[error("lock on scope '{scope}' is not held by '{holder}'")]
    LockNotHeld {
        /// The scope.
        scope: String,
        /// The supposed holder.
        holder: String,
    },

    /// A batch failed; committed batches were rolled back.
    #[error("batch {batch_index} failed: {message} ({rollback})")]
    BatchExecution {
        /// Index of the failed batch.
        batch_index: usize,
        /// Error message from the database.
        message: String,
        /// What happened to earlier batches.
        rollback: RollbackOutcome,
        /// History record written for this execution.
        record_id: Option<String>,
    },

    /// The lease was lost while executing.
    #[error("lease on scope '{scope}' lost before batch {batch_index} completed ({rollback})")]
    LeaseLost {
        /// The scope.
        scope: String,
        /// Batch that was running or about to run.
        batch_index: usize,
        /// What happened to earlier batches.
        rollback: RollbackOutcome,
        /// History record written for this execution.
        record_id: Option<String>,
    },

    /// An explicit rollback failed.
    #[error("rollback failed: {reason}")]
    RollbackFailure {
        /// The reason rollback failed.
        reason: String,
        /// History record written for the failed rollback.
        record_id: Option<String>,
    },

    /// An identical plan has already been applied.
    #[error("plan {checksum} already applied")]
    AlreadyApplied {
        /// Checksum of the plan.
        checksum: String,
    },

    /// An interactive plan is waiting for a confirmation token.
    #[error("plan {plan_id} requires confirmation before execution")]
    ConfirmationRequired {
        /// The plan awaiting confirmation.
        plan_id: String,
    },

    /// The supplied confirmation token does not match the plan.
    #[error("confirmation token does not match plan {plan_id}")]
    InvalidConfirmation {
        /// The plan awaiting confirmation.
        plan_id: String,
    },

    /// The plan contains irreversible operations that were not acknowledged.
    #[error("plan contains irreversible operations that must be acknowledged: {}", reasons.join("; "))]
    IrreversibleNotAcknowledged {
        /// Why each irreversible operation cannot be undone.
        reasons: Vec<String>,
    },

    /// A plan or record no longer matches its checksum.
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// The stored checksum.
        expected: String,
        /// The recomputed checksum.
        actual: String,
    },

    /// History record not found.
    #[error("migration record not found: {record_id}")]
    RecordNotFound {
        /// The missing record ID.
        record_id: String,
    },

    /// A state transition that the coordinator state machine forbids.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: CoordinatorState,
        /// Requested state.
        to: CoordinatorState,
    },

    /// Execution was cancelled by the caller.
    #[error("migration cancelled ({rollback})")]
    Cancelled {
        /// What happened to committed batches.
        rollback: RollbackOutcome,
        /// History record written, if execution had started.
        record_id: Option<String>,
    },

    /// A DDL statement failed.
    #[error("{operation} failed: {message}")]
    Statement {
        /// Description of the operation.
        operation: String,
        /// Error message from the database.
        message: String,
    },

    /// A database connection could not be obtained or used.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid configuration or usage.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// Check if the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrationError::Introspection { .. }
                | MigrationError::LockTimeout { .. }
                | MigrationError::Connection(_)
        )
    }

    /// Check if this error represents a failure rather than an informational outcome.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            MigrationError::AlreadyApplied { .. } | MigrationError::ConfirmationRequired { .. }
        )
    }

    /// Check if an operator has to intervene before the scope is usable again.
    pub fn requires_intervention(&self) -> bool {
        match self {
            MigrationError::RollbackFailure { .. } => true,
            MigrationError::BatchExecution { rollback, .. }
            | MigrationError::LeaseLost { rollback, .. }
            | MigrationError::Cancelled { rollback, .. } => !rollback.is_clean(),
            _ => false,
        }
    }

    /// History record written for the failed execution, if any.
    pub fn record_id(&self) -> Option<&str> {
        match self {
            MigrationError::BatchExecution { record_id, .. }
            | MigrationError::LeaseLost { record_id, .. }
            | MigrationError::RollbackFailure { record_id, .. }
            | MigrationError::Cancelled { record_id, .. } => record_id.as_deref(),
            _ => None,
        }
    }
}

impl From<sled::Error> for MigrationError {
    fn from(err: sled::Error) -> Self {
        MigrationError::Storage(crate::error::Error::Storage(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Safe < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert_eq!(
            [RiskLevel::Medium, RiskLevel::High, RiskLevel::Safe]
                .into_iter()
                .max(),
            Some(RiskLevel::High)
        );
    }

    #[test]
    fn test_risk_level_parse_and_display() {
        assert_eq!("medium".parse::<RiskLevel>(), Ok(RiskLevel::Medium));
        assert_eq!("HIGH".parse::<RiskLevel>(), Ok(RiskLevel::High));
        assert!("extreme".parse::<RiskLevel>().is_err());
        assert_eq!(RiskLevel::Safe.to_string(), "SAFE");
    }

    #[test]
    fn test_error_classification() {
        let timeout = MigrationError::LockTimeout {
            scope: "app".into(),
            waited: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(timeout.is_failure());

        let applied = MigrationError::AlreadyApplied {
            checksum: "abc".into(),
        };
        assert!(!applied.is_failure());
        assert!(!applied.is_retryable());

        let invariant = MigrationError::SchemaInvariantViolation {
            table: "user".into(),
            message: "duplicate column name 'id'".into(),
        };
        assert!(!invariant.is_retryable());
    }

    #[test]
    fn test_batch_error_carries_rollback_outcome() {
        let err = MigrationError::BatchExecution {
            batch_index: 1,
            message: "disk full".into(),
            rollback: RollbackOutcome::RolledBack { batches: 1 },
            record_id: Some("r1".into()),
        };
        let text = err.to_string();
        assert!(text.contains("batch 1 failed: disk full"));
        assert!(text.contains("rolled back 1 committed batch(es)"));
        assert!(!err.requires_intervention());
        assert_eq!(err.record_id(), Some("r1"));

        let stuck = MigrationError::BatchExecution {
            batch_index: 1,
            message: "disk full".into(),
            rollback: RollbackOutcome::Failed {
                reason: "irreversible".into(),
            },
            record_id: None,
        };
        assert!(stuck.requires_intervention());
    }

    #[test]
    fn test_threshold_error_lists_offenders() {
        let err = MigrationError::RiskThresholdExceeded {
            max_allowed: RiskLevel::Medium,
            aggregate: RiskLevel::High,
            offending: vec!["DROP_COLUMN user.legacy_code".into()],
        };
        assert!(err.to_string().contains("DROP_COLUMN user.legacy_code"));
    }
}
