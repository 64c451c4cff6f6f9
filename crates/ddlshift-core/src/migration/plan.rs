//! Migration plan generation.
//!
//! The planner turns diff output into an executable, checksummed plan: it
//! enforces the caller's risk ceiling, renders every operation through the
//! dialect, groups operations into transactional batches and derives the
//! rollback plan up front.

use super::error::{MigrationError, RiskLevel};
use super::operation::MigrationOperation;
use super::risk::RiskClassifier;
use super::rollback::{RollbackPlan, RollbackPlanner, RollbackStep};
use crate::dialect::SqlRenderer;
use crate::id::{current_timestamp, generate_hex_id};
use std::sync::Arc;
use tracing::debug;

/// Domain separator for plan checksums.
const CHECKSUM_DOMAIN: &[u8] = b"ddlshift-plan-v1";

/// How a plan is to be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Compute and report; never mutate.
    DryRun,
    /// Wait for an explicit confirmation token.
    Interactive,
    /// Execute directly when within the risk ceiling.
    #[default]
    AutoConfirm,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::DryRun => write!(f, "dry-run"),
            ExecutionMode::Interactive => write!(f, "interactive"),
            ExecutionMode::AutoConfirm => write!(f, "auto-confirm"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "dry-run" | "dryrun" => Ok(ExecutionMode::DryRun),
            "interactive" => Ok(ExecutionMode::Interactive),
            "auto-confirm" | "auto" => Ok(ExecutionMode::AutoConfirm),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

/// Operations executed inside one transaction.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlanBatch {
    /// Position of the batch in the plan.
    pub index: usize,
    /// Operations in execution order.
    pub operations: Vec<MigrationOperation>,
}

impl PlanBatch {
    /// Highest risk in the batch.
    pub fn risk(&self) -> RiskLevel {
        self.operations
            .iter()
            .map(MigrationOperation::risk)
            .max()
            .unwrap_or_default()
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// An executable migration plan.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationPlan {
    id: String,
    scope: String,
    mode: ExecutionMode,
    batches: Vec<PlanBatch>,
    aggregate_risk: RiskLevel,
    checksum: String,
    rollback: RollbackPlan,
    created_at: u64,
}

impl MigrationPlan {
    /// Unique plan ID (hex, time-ordered).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Scope the plan applies to.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Batches in execution order.
    pub fn batches(&self) -> &[PlanBatch] {
        &self.batches
    }

    /// All operations in execution order.
    pub fn operations(&self) -> impl Iterator<Item = &MigrationOperation> {
        self.batches.iter().flat_map(|b| b.operations.iter())
    }

    /// Total number of operations.
    pub fn operation_count(&self) -> usize {
        self.batches.iter().map(PlanBatch::len).sum()
    }

    /// Check if the plan has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.operation_count() == 0
    }

    /// Maximum risk of any operation.
    pub fn aggregate_risk(&self) -> RiskLevel {
        self.aggregate_risk
    }

    /// Content checksum (blake3, hex).
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Pre-computed rollback plan.
    pub fn rollback_plan(&self) -> &RollbackPlan {
        &self.rollback
    }

    /// Creation time (microseconds since epoch).
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// The same plan with a different execution mode. The checksum is unchanged.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Recompute the checksum and compare it with the stored one.
    pub fn verify_checksum(&self) -> Result<(), MigrationError> {
        let actual = compute_checksum(&self.scope, self.operations())?;
        if actual != self.checksum {
            return Err(MigrationError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Everything a real execution would do, without doing it.
    pub fn preview(&self) -> PreviewResult {
        let batches = self
            .batches
            .iter()
            .map(|batch| PreviewBatch {
                index: batch.index,
                statements: batch
                    .operations
                    .iter()
                    .map(|op| PreviewStatement {
                        description: op.describe(),
                        risk: op.risk(),
                        action: op.forward().map(|a| a.to_string()).unwrap_or_default(),
                    })
                    .collect(),
            })
            .collect();

        let rollback = self
            .rollback
            .steps()
            .map(|step| match step.operation().and_then(|op| op.forward()) {
                Some(action) => format!("{} -- {}", action, step.describe()),
                None => step.describe(),
            })
            .collect();

        PreviewResult {
            plan_id: self.id.clone(),
            scope: self.scope.clone(),
            checksum: self.checksum.clone(),
            aggregate_risk: self.aggregate_risk,
            batches,
            rollback,
            irreversible: self.rollback.irreversible_reasons(),
        }
    }

    #[cfg(test)]
    pub(crate) fn batches_mut(&mut self) -> &mut Vec<PlanBatch> {
        &mut self.batches
    }
}

/// One rendered statement in a preview.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PreviewStatement {
    /// Operation description.
    pub description: String,
    /// Assessed risk.
    pub risk: RiskLevel,
    /// Rendered forward action.
    pub action: String,
}

/// One batch in a preview.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PreviewBatch {
    /// Batch index.
    pub index: usize,
    /// Statements in execution order.
    pub statements: Vec<PreviewStatement>,
}

/// Result of a dry run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PreviewResult {
    /// Plan ID.
    pub plan_id: String,
    /// Scope.
    pub scope: String,
    /// Plan checksum, identical to what a real run would record.
    pub checksum: String,
    /// Aggregate risk.
    pub aggregate_risk: RiskLevel,
    /// Rendered batches.
    pub batches: Vec<PreviewBatch>,
    /// Rendered rollback steps in execution order.
    pub rollback: Vec<String>,
    /// Irreversible steps, with reasons.
    pub irreversible: Vec<String>,
}

impl std::fmt::Display for PreviewResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "plan {} for scope '{}'", self.plan_id, self.scope)?;
        writeln!(f, "checksum: {}", self.checksum)?;
        writeln!(f, "risk: {}", self.aggregate_risk)?;
        if self.batches.is_empty() {
            return writeln!(f, "no changes");
        }
        for batch in &self.batches {
            writeln!(f, "batch {}:", batch.index)?;
            for stmt in &batch.statements {
                writeln!(f, "  [{}] {}", stmt.risk, stmt.description)?;
                writeln!(f, "    {};", stmt.action)?;
            }
        }
        writeln!(f, "rollback:")?;
        for line in &self.rollback {
            writeln!(f, "  {}", line)?;
        }
        Ok(())
    }
}

/// External acknowledgment that moves an interactive plan out of
/// `AwaitingConfirmation`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfirmationToken(String);

impl ConfirmationToken {
    /// Wrap a token supplied by the operator.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token that confirms this exact plan.
    pub fn for_plan(plan: &MigrationPlan) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"confirm:");
        hasher.update(plan.id().as_bytes());
        hasher.update(b":");
        hasher.update(plan.checksum().as_bytes());
        let hash = hasher.finalize();
        Self(hex::encode(&hash.as_bytes()[..8]))
    }

    /// Check if this token confirms the plan.
    pub fn matches(&self, plan: &MigrationPlan) -> bool {
        *self == Self::for_plan(plan)
    }

    /// Token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConfirmationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the checksum over a scope and an ordered operation sequence.
pub fn compute_checksum<'a>(
    scope: &str,
    operations: impl IntoIterator<Item = &'a MigrationOperation>,
) -> Result<String, MigrationError> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(CHECKSUM_DOMAIN);
    hasher.update(&(scope.len() as u64).to_le_bytes());
    hasher.update(scope.as_bytes());
    for op in operations {
        let bytes = op.canonical_bytes()?;
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

/// Builds executable plans.
pub struct MigrationPlanner {
    renderer: Arc<dyn SqlRenderer>,
    rollback: RollbackPlanner,
    max_batch_size: Option<usize>,
}

impl MigrationPlanner {
    /// Create a planner for a dialect.
    pub fn new(renderer: Arc<dyn SqlRenderer>) -> Self {
        let classifier = RiskClassifier::new(renderer.capabilities());
        Self {
            renderer,
            rollback: RollbackPlanner::new(classifier),
            max_batch_size: None,
        }
    }

    /// Cap the number of operations per batch.
    pub fn with_max_batch_size(mut self, size: Option<usize>) -> Self {
        self.max_batch_size = size.map(|s| s.max(1));
        self
    }

    /// The classifier matching the dialect's capability table.
    pub fn classifier(&self) -> RiskClassifier {
        RiskClassifier::new(self.renderer.capabilities())
    }

    /// Build a plan, failing closed if any operation exceeds `max_risk`.
    pub fn plan(
        &self,
        scope: &str,
        operations: Vec<MigrationOperation>,
        max_risk: RiskLevel,
        mode: ExecutionMode,
    ) -> Result<MigrationPlan, MigrationError> {
        let aggregate_risk = operations
            .iter()
            .map(MigrationOperation::risk)
            .max()
            .unwrap_or_default();

        if aggregate_risk > max_risk {
            let offending = operations
                .iter()
                .filter(|op| op.risk() > max_risk)
                .map(|op| op.to_string())
                .collect();
            return Err(MigrationError::RiskThresholdExceeded {
                max_allowed: max_risk,
                aggregate: aggregate_risk,
                offending,
            });
        }

        let checksum = compute_checksum(scope, &operations)?;

        let mut batches: Vec<PlanBatch> = Vec::new();
        let mut rollback_batches: Vec<Vec<RollbackStep>> = Vec::new();
        let mut current: Vec<MigrationOperation> = Vec::new();
        let mut current_steps: Vec<RollbackStep> = Vec::new();

        for op in operations {
            let (op, step) = self.render(op)?;
            let isolated = op.risk() == RiskLevel::High;

            if isolated && !current.is_empty() {
                Self::flush(&mut batches, &mut rollback_batches, &mut current, &mut current_steps);
            }
            current.push(op);
            current_steps.push(step);

            let full = self.max_batch_size.is_some_and(|max| current.len() >= max);
            if isolated || full {
                Self::flush(&mut batches, &mut rollback_batches, &mut current, &mut current_steps);
            }
        }
        if !current.is_empty() {
            Self::flush(&mut batches, &mut rollback_batches, &mut current, &mut current_steps);
        }

        let plan = MigrationPlan {
            id: generate_hex_id(),
            scope: scope.to_string(),
            mode,
            batches,
            aggregate_risk,
            checksum,
            rollback: RollbackPlan::from_forward_batches(rollback_batches),
            created_at: current_timestamp(),
        };

        debug!(
            plan_id = %plan.id,
            scope = %plan.scope,
            operations = plan.operation_count(),
            batches = plan.batches.len(),
            risk = %plan.aggregate_risk,
            "Planned migration"
        );

        Ok(plan)
    }

    /// Attach rendered actions to an operation and its reverse.
    fn render(
        &self,
        op: MigrationOperation,
    ) -> Result<(MigrationOperation, RollbackStep), MigrationError> {
        let forward = self.renderer.render(&op)?;
        let step = match self.rollback.reverse(&op) {
            RollbackStep::Reverse {
                operation,
                fidelity,
                note,
            } => {
                let backward = self.renderer.render(&operation)?;
                RollbackStep::Reverse {
                    operation: operation.with_actions(backward, None),
                    fidelity,
                    note,
                }
            }
            irreversible => irreversible,
        };
        let backward = step
            .operation()
            .and_then(|reverse| reverse.forward().cloned());
        Ok((op.with_actions(forward, backward), step))
    }

    fn flush(
        batches: &mut Vec<PlanBatch>,
        rollback_batches: &mut Vec<Vec<RollbackStep>>,
        current: &mut Vec<MigrationOperation>,
        current_steps: &mut Vec<RollbackStep>,
    ) {
        batches.push(PlanBatch {
            index: batches.len(),
            operations: std::mem::take(current),
        });
        rollback_batches.push(std::mem::take(current_steps));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::AnsiSqlRenderer;
    use crate::migration::diff::SchemaDiff;
    use crate::migration::operation::{Change, TableOccupancy};
    use crate::schema::{
        ColumnSpec, ConstraintSpec, ForeignKeySpec, IndexSpec, LogicalType, SchemaSnapshot,
        TableSpec,
    };

    fn planner() -> MigrationPlanner {
        MigrationPlanner::new(Arc::new(AnsiSqlRenderer::new()))
    }

    fn user_table() -> TableSpec {
        TableSpec::new("user")
            .with_column(ColumnSpec::new("id", LogicalType::Uuid))
            .with_column(ColumnSpec::nullable("legacy_code", LogicalType::varchar(8)))
            .with_row_count(100)
    }

    fn add_index(name: &str) -> MigrationOperation {
        MigrationOperation::new(
            "user",
            Change::AddIndex {
                index: IndexSpec::new(name, ["id"]),
            },
            TableOccupancy::Populated,
        )
    }

    fn drop_legacy() -> MigrationOperation {
        MigrationOperation::new(
            "user",
            Change::DropColumn {
                column: ColumnSpec::nullable("legacy_code", LogicalType::varchar(8)),
            },
            TableOccupancy::Populated,
        )
    }

    #[test]
    fn test_plan_fails_closed_above_threshold() {
        let err = planner()
            .plan("app", vec![add_index("a"), drop_legacy()], RiskLevel::Medium, ExecutionMode::AutoConfirm)
            .unwrap_err();
        match err {
            MigrationError::RiskThresholdExceeded {
                max_allowed,
                aggregate,
                offending,
            } => {
                assert_eq!(max_allowed, RiskLevel::Medium);
                assert_eq!(aggregate, RiskLevel::High);
                assert_eq!(offending.len(), 1);
                assert!(offending[0].contains("DROP_COLUMN user.legacy_code"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_high_risk_operations_are_isolated() {
        let ops = vec![add_index("a"), add_index("b"), drop_legacy(), add_index("c")];
        let plan = planner()
            .plan("app", ops, RiskLevel::High, ExecutionMode::AutoConfirm)
            .unwrap();

        let sizes: Vec<usize> = plan.batches().iter().map(PlanBatch::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
        assert_eq!(plan.batches()[1].risk(), RiskLevel::High);
        assert_eq!(plan.aggregate_risk(), RiskLevel::High);
        assert!(plan.rollback_plan().has_irreversible());
    }

    #[test]
    fn test_max_batch_size() {
        let ops = vec![add_index("a"), add_index("b"), add_index("c")];
        let plan = planner()
            .with_max_batch_size(Some(2))
            .plan("app", ops, RiskLevel::Safe, ExecutionMode::AutoConfirm)
            .unwrap();
        let sizes: Vec<usize> = plan.batches().iter().map(PlanBatch::len).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let observed = SchemaSnapshot::new("app").with_table(user_table());
        let desired = SchemaSnapshot::new("app").with_table(
            user_table().with_column(ColumnSpec::nullable("phone", LogicalType::varchar(32))),
        );

        let a = planner()
            .plan(
                "app",
                SchemaDiff::compute(&desired, &observed).unwrap().into_operations(),
                RiskLevel::High,
                ExecutionMode::AutoConfirm,
            )
            .unwrap();
        let b = planner()
            .plan(
                "app",
                SchemaDiff::compute(&desired.clone(), &observed.clone().with_row_count("user", Some(5)))
                    .unwrap()
                    .into_operations(),
                RiskLevel::High,
                ExecutionMode::DryRun,
            )
            .unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);

        let other_scope = planner()
            .plan(
                "billing",
                SchemaDiff::compute(&desired, &observed).unwrap().into_operations(),
                RiskLevel::High,
                ExecutionMode::AutoConfirm,
            )
            .unwrap();
        assert_ne!(a.checksum(), other_scope.checksum());
    }

    #[test]
    fn test_checksum_ignores_declaration_order() {
        let org = TableSpec::new("org").with_column(ColumnSpec::new("id", LogicalType::Uuid));
        let forward = TableSpec::new("member")
            .with_column(ColumnSpec::new("id", LogicalType::Uuid))
            .with_column(ColumnSpec::new("name", LogicalType::Text))
            .with_column(ColumnSpec::new("org_id", LogicalType::Uuid))
            .with_index(IndexSpec::new("a_idx", ["name"]))
            .with_index(IndexSpec::unique("b_idx", ["id"]))
            .with_constraint(ConstraintSpec::check("a_check", "name <> ''"))
            .with_constraint(ConstraintSpec::unique("b_uq", ["name", "org_id"]))
            .with_foreign_key(ForeignKeySpec::new("a_fk", "org_id", "org", "id"))
            .with_foreign_key(ForeignKeySpec::new("b_fk", "id", "org", "id"));
        let reversed = TableSpec::new("member")
            .with_column(ColumnSpec::new("org_id", LogicalType::Uuid))
            .with_column(ColumnSpec::new("name", LogicalType::Text))
            .with_column(ColumnSpec::new("id", LogicalType::Uuid))
            .with_index(IndexSpec::unique("b_idx", ["id"]))
            .with_index(IndexSpec::new("a_idx", ["name"]))
            .with_constraint(ConstraintSpec::unique("b_uq", ["name", "org_id"]))
            .with_constraint(ConstraintSpec::check("a_check", "name <> ''"))
            .with_foreign_key(ForeignKeySpec::new("b_fk", "id", "org", "id"))
            .with_foreign_key(ForeignKeySpec::new("a_fk", "org_id", "org", "id"));

        let a = SchemaSnapshot::new("app").with_table(org.clone()).with_table(forward);
        let b = SchemaSnapshot::new("app").with_table(org.clone()).with_table(reversed);
        assert_eq!(a, b);

        let checksum = |desired: &SchemaSnapshot, observed: &SchemaSnapshot| {
            planner()
                .plan(
                    "app",
                    SchemaDiff::compute(desired, observed).unwrap().into_operations(),
                    RiskLevel::High,
                    ExecutionMode::AutoConfirm,
                )
                .unwrap()
                .checksum()
                .to_string()
        };

        // New table: CREATE_TABLE followed by its indexes and constraints
        let empty = SchemaSnapshot::new("app").with_table(org.clone());
        assert_eq!(checksum(&a, &empty), checksum(&b, &empty));

        // Existing table: ADD_COLUMN, ADD_INDEX and ADD_CONSTRAINT
        let bare = SchemaSnapshot::new("app")
            .with_table(org)
            .with_table(TableSpec::new("member").with_column(ColumnSpec::new("id", LogicalType::Uuid)));
        assert_eq!(checksum(&a, &bare), checksum(&b, &bare));

        // Dropping either declaration of the same table
        let gone = SchemaSnapshot::new("app").with_table(
            TableSpec::new("org").with_column(ColumnSpec::new("id", LogicalType::Uuid)),
        );
        assert_eq!(checksum(&gone, &a), checksum(&gone, &b));
    }

    #[test]
    fn test_checksum_is_order_sensitive() {
        let a = planner()
            .plan("app", vec![add_index("a"), add_index("b")], RiskLevel::Safe, ExecutionMode::AutoConfirm)
            .unwrap();
        let b = planner()
            .plan("app", vec![add_index("b"), add_index("a")], RiskLevel::Safe, ExecutionMode::AutoConfirm)
            .unwrap();
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_verify_checksum_detects_tampering() {
        let mut plan = planner()
            .plan("app", vec![add_index("a")], RiskLevel::Safe, ExecutionMode::AutoConfirm)
            .unwrap();
        assert!(plan.verify_checksum().is_ok());

        plan.batches_mut()[0].operations.push(drop_legacy());
        assert!(matches!(
            plan.verify_checksum(),
            Err(MigrationError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_operations_carry_rendered_actions() {
        let plan = planner()
            .plan("app", vec![add_index("user_id_idx")], RiskLevel::Safe, ExecutionMode::AutoConfirm)
            .unwrap();
        let op = plan.operations().next().unwrap();
        assert_eq!(
            op.forward().map(|a| a.as_str()),
            Some("CREATE INDEX \"user_id_idx\" ON \"user\" (\"id\")")
        );
        assert_eq!(op.backward().map(|a| a.as_str()), Some("DROP INDEX \"user_id_idx\""));

        let preview = plan.preview();
        assert_eq!(preview.checksum, plan.checksum());
        assert_eq!(preview.batches[0].statements[0].action, op.forward().unwrap().as_str());
        assert!(preview.to_string().contains("CREATE INDEX"));
    }

    #[test]
    fn test_confirmation_token() {
        let plan = planner()
            .plan("app", vec![add_index("a")], RiskLevel::Safe, ExecutionMode::Interactive)
            .unwrap();
        let token = ConfirmationToken::for_plan(&plan);
        assert!(token.matches(&plan));
        assert_eq!(token.as_str().len(), 16);
        assert!(!ConfirmationToken::new("nope").matches(&plan));
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("dry-run".parse::<ExecutionMode>(), Ok(ExecutionMode::DryRun));
        assert_eq!("auto".parse::<ExecutionMode>(), Ok(ExecutionMode::AutoConfirm));
        assert_eq!("INTERACTIVE".parse::<ExecutionMode>(), Ok(ExecutionMode::Interactive));
        assert!("yolo".parse::<ExecutionMode>().is_err());
    }
}
