//! Rollback planning.
//!
//! Every forward operation gets a [`RollbackStep`] before execution starts:
//! either a reverse operation annotated with how faithfully it restores the
//! prior state, or an irreversibility marker with a reason.

use super::operation::{Change, MigrationOperation, TableOccupancy};
use super::risk::{Conversion, RiskClassifier};
use crate::schema::TableConstraint;
use rkyv::{Archive, Deserialize, Serialize};

/// How faithfully a reverse operation restores the prior state.
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
pub enum Fidelity {
    /// Structure and data are fully restored.
    Lossless,
    /// Structure is restored; data written or converted since may be lost.
    Lossy,
    /// Structure is restored without the data it held.
    Partial,
}

impl std::fmt::Display for Fidelity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fidelity::Lossless => write!(f, "lossless"),
            Fidelity::Lossy => write!(f, "lossy"),
            Fidelity::Partial => write!(f, "partial"),
        }
    }
}

/// The reverse of one forward operation.
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
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackStep {
    /// A reverse operation exists.
    Reverse {
        /// The operation that undoes the forward one.
        operation: MigrationOperation,
        /// How faithful the reversal is.
        fidelity: Fidelity,
        /// Caveat for lossy or partial reversals.
        note: Option<String>,
    },
    /// The forward operation cannot be undone.
    Irreversible {
        /// Description of the forward operation.
        forward: String,
        /// Why it cannot be undone.
        reason: String,
    },
}

impl RollbackStep {
    /// Check if this step can be executed.
    pub fn is_reversible(&self) -> bool {
        matches!(self, RollbackStep::Reverse { .. })
    }

    /// The reverse operation, if any.
    pub fn operation(&self) -> Option<&MigrationOperation> {
        match self {
            RollbackStep::Reverse { operation, .. } => Some(operation),
            RollbackStep::Irreversible { .. } => None,
        }
    }

    /// Short description for logs and previews.
    pub fn describe(&self) -> String {
        match self {
            RollbackStep::Reverse {
                operation,
                fidelity,
                note,
            } => match note {
                Some(note) => format!("{} ({}: {})", operation.describe(), fidelity, note),
                None => format!("{} ({})", operation.describe(), fidelity),
            },
            RollbackStep::Irreversible { forward, reason } => {
                format!("IRREVERSIBLE {}: {}", forward, reason)
            }
        }
    }
}

/// Reverse steps for one forward batch, in execution order.
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
pub struct RollbackBatch {
    /// Index of the forward batch this undoes.
    pub forward_batch: usize,
    /// Steps, already reversed relative to the forward operations.
    pub steps: Vec<RollbackStep>,
}

/// The complete reverse of a plan, computed before execution.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Default,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct RollbackPlan {
    batches: Vec<RollbackBatch>,
}

impl RollbackPlan {
    /// Build a rollback plan from per-batch steps given in forward order.
    ///
    /// Batches and the steps inside them are reversed.
    pub fn from_forward_batches(forward: Vec<Vec<RollbackStep>>) -> Self {
        let batches = forward
            .into_iter()
            .enumerate()
            .rev()
            .map(|(forward_batch, mut steps)| {
                steps.reverse();
                RollbackBatch {
                    forward_batch,
                    steps,
                }
            })
            .collect();
        Self { batches }
    }

    /// All batches, last forward batch first.
    pub fn batches(&self) -> &[RollbackBatch] {
        &self.batches
    }

    /// Batches undoing the first `committed` forward batches, in execution order.
    pub fn for_committed(&self, committed: usize) -> impl Iterator<Item = &RollbackBatch> {
        self.batches
            .iter()
            .filter(move |b| b.forward_batch < committed)
    }

    /// All steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &RollbackStep> {
        self.batches.iter().flat_map(|b| b.steps.iter())
    }

    /// Number of steps.
    pub fn step_count(&self) -> usize {
        self.batches.iter().map(|b| b.steps.len()).sum()
    }

    /// Check if any step is irreversible.
    pub fn has_irreversible(&self) -> bool {
        self.steps().any(|s| !s.is_reversible())
    }

    /// Reasons for every irreversible step.
    pub fn irreversible_reasons(&self) -> Vec<String> {
        self.steps()
            .filter_map(|s| match s {
                RollbackStep::Irreversible { forward, reason } => {
                    Some(format!("{}: {}", forward, reason))
                }
                RollbackStep::Reverse { .. } => None,
            })
            .collect()
    }
}

/// Derives reverse operations.
#[derive(Debug, Clone, Default)]
pub struct RollbackPlanner {
    classifier: RiskClassifier,
}

impl RollbackPlanner {
    /// Create a planner that classifies reverse operations with `classifier`.
    pub fn new(classifier: RiskClassifier) -> Self {
        Self { classifier }
    }

    fn reverse_op(&self, forward: &MigrationOperation, change: Change) -> MigrationOperation {
        MigrationOperation::classified(
            forward.table(),
            change,
            TableOccupancy::Unknown,
            &self.classifier,
        )
    }

    /// Compute the rollback step for one operation.
    pub fn reverse(&self, op: &MigrationOperation) -> RollbackStep {
        let step = |change: Change, fidelity: Fidelity, note: Option<&str>| RollbackStep::Reverse {
            operation: self.reverse_op(op, change),
            fidelity,
            note: note.map(str::to_string),
        };

        match op.change() {
            Change::CreateTable { table } => step(
                Change::DropTable {
                    table: table.clone(),
                },
                Fidelity::Lossy,
                Some("rows written since creation are dropped"),
            ),

            Change::DropTable { table } => step(
                Change::CreateTable {
                    table: table.clone(),
                },
                Fidelity::Partial,
                Some("recreate-without-data"),
            ),

            Change::AddColumn { column } => {
                if op.occupancy().is_empty() {
                    step(
                        Change::DropColumn {
                            column: column.clone(),
                        },
                        Fidelity::Lossless,
                        None,
                    )
                } else {
                    step(
                        Change::DropColumn {
                            column: column.clone(),
                        },
                        Fidelity::Lossy,
                        Some("lossy on non-empty tables"),
                    )
                }
            }

            Change::DropColumn { column } => RollbackStep::Irreversible {
                forward: op.describe(),
                reason: format!(
                    "data in column '{}.{}' cannot be reconstructed",
                    op.table(),
                    column.name
                ),
            },

            Change::AlterColumnType { before, after } => {
                let forward = self
                    .classifier
                    .capabilities()
                    .conversion(before.logical_type, after.logical_type);
                let reverse = Change::AlterColumnType {
                    before: after.clone(),
                    after: before.clone(),
                };
                if forward == Conversion::Lossy {
                    step(reverse, Fidelity::Lossy, Some("forward conversion was lossy"))
                } else {
                    step(reverse, Fidelity::Lossless, None)
                }
            }

            Change::AlterColumnNullability { before, after } => {
                let reverse = Change::AlterColumnNullability {
                    before: after.clone(),
                    after: before.clone(),
                };
                if after.nullable && !before.nullable {
                    step(
                        reverse,
                        Fidelity::Lossy,
                        Some("NULLs written since must be removed before re-tightening"),
                    )
                } else {
                    step(reverse, Fidelity::Lossless, None)
                }
            }

            Change::AddIndex { index } => step(
                Change::DropIndex {
                    index: index.clone(),
                },
                Fidelity::Lossless,
                None,
            ),

            Change::DropIndex { index } => step(
                Change::AddIndex {
                    index: index.clone(),
                },
                Fidelity::Lossless,
                None,
            ),

            Change::AddConstraint { constraint } => step(
                Change::DropConstraint {
                    constraint: constraint.clone(),
                    dependents: Vec::new(),
                },
                Fidelity::Lossless,
                None,
            ),

            Change::DropConstraint { constraint, .. } => {
                let note = match constraint {
                    TableConstraint::ForeignKey(_) => "rows written since may violate the foreign key",
                    TableConstraint::Constraint(_) => "rows written since may violate the constraint",
                };
                step(
                    Change::AddConstraint {
                        constraint: constraint.clone(),
                    },
                    Fidelity::Lossy,
                    Some(note),
                )
            }
        }
    }
}
