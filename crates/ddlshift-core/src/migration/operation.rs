//! Atomic schema change operations.

use super::error::{MigrationError, RiskLevel};
use super::risk::RiskClassifier;
use crate::schema::{ColumnSpec, IndexSpec, TableConstraint, TableSpec};
use rkyv::{Archive, Deserialize, Serialize};

/// The kind of a migration operation.
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
pub enum OperationKind {
    CreateTable,
    DropTable,
    AddColumn,
    DropColumn,
    AlterColumnType,
    AlterColumnNullability,
    AddIndex,
    DropIndex,
    AddConstraint,
    DropConstraint,
}

impl OperationKind {
    /// Check if this kind removes structure.
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            OperationKind::DropTable
                | OperationKind::DropColumn
                | OperationKind::DropIndex
                | OperationKind::DropConstraint
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::CreateTable => "CREATE_TABLE",
            OperationKind::DropTable => "DROP_TABLE",
            OperationKind::AddColumn => "ADD_COLUMN",
            OperationKind::DropColumn => "DROP_COLUMN",
            OperationKind::AlterColumnType => "ALTER_COLUMN_TYPE",
            OperationKind::AlterColumnNullability => "ALTER_COLUMN_NULLABILITY",
            OperationKind::AddIndex => "ADD_INDEX",
            OperationKind::DropIndex => "DROP_INDEX",
            OperationKind::AddConstraint => "ADD_CONSTRAINT",
            OperationKind::DropConstraint => "DROP_CONSTRAINT",
        };
        f.write_str(name)
    }
}

/// Per-kind payload of a migration operation.
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
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Change {
    /// Create a table with its columns. Indexes and constraints follow as
    /// separate operations.
    CreateTable { table: TableSpec },
    /// Drop a table. Carries the full prior definition.
    DropTable { table: TableSpec },
    /// Add a column.
    AddColumn { column: ColumnSpec },
    /// Drop a column. Carries the prior definition.
    DropColumn { column: ColumnSpec },
    /// Change a column's type.
    AlterColumnType { before: ColumnSpec, after: ColumnSpec },
    /// Change a column's nullability and/or default.
    AlterColumnNullability { before: ColumnSpec, after: ColumnSpec },
    /// Add an index.
    AddIndex { index: IndexSpec },
    /// Drop an index.
    DropIndex { index: IndexSpec },
    /// Add a unique, check or foreign key constraint.
    AddConstraint { constraint: TableConstraint },
    /// Drop a constraint. `dependents` names foreign keys (`table.name`) that
    /// rely on it.
    DropConstraint {
        constraint: TableConstraint,
        dependents: Vec<String>,
    },
}

impl Change {
    /// Get the operation kind.
    pub fn kind(&self) -> OperationKind {
        match self {
            Change::CreateTable { .. } => OperationKind::CreateTable,
            Change::DropTable { .. } => OperationKind::DropTable,
            Change::AddColumn { .. } => OperationKind::AddColumn,
            Change::DropColumn { .. } => OperationKind::DropColumn,
            Change::AlterColumnType { .. } => OperationKind::AlterColumnType,
            Change::AlterColumnNullability { .. } => OperationKind::AlterColumnNullability,
            Change::AddIndex { .. } => OperationKind::AddIndex,
            Change::DropIndex { .. } => OperationKind::DropIndex,
            Change::AddConstraint { .. } => OperationKind::AddConstraint,
            Change::DropConstraint { .. } => OperationKind::DropConstraint,
        }
    }

    /// Name of the column, index or constraint targeted, if any.
    pub fn target_name(&self) -> Option<&str> {
        match self {
            Change::CreateTable { .. } | Change::DropTable { .. } => None,
            Change::AddColumn { column } | Change::DropColumn { column } => Some(&column.name),
            Change::AlterColumnType { after, .. } | Change::AlterColumnNullability { after, .. } => {
                Some(&after.name)
            }
            Change::AddIndex { index } | Change::DropIndex { index } => Some(&index.name),
            Change::AddConstraint { constraint } | Change::DropConstraint { constraint, .. } => {
                Some(constraint.name())
            }
        }
    }

    /// Payload with declaration order and ordinal positions normalized away,
    /// so structurally equal changes serialize identically.
    pub fn canonical(&self) -> Change {
        match self {
            Change::CreateTable { table } => Change::CreateTable {
                table: table.canonical(),
            },
            Change::DropTable { table } => Change::DropTable {
                table: table.canonical(),
            },
            Change::AddColumn { column } => Change::AddColumn {
                column: column.canonical(),
            },
            Change::DropColumn { column } => Change::DropColumn {
                column: column.canonical(),
            },
            Change::AlterColumnType { before, after } => Change::AlterColumnType {
                before: before.canonical(),
                after: after.canonical(),
            },
            Change::AlterColumnNullability { before, after } => Change::AlterColumnNullability {
                before: before.canonical(),
                after: after.canonical(),
            },
            Change::DropConstraint {
                constraint,
                dependents,
            } => {
                let mut dependents = dependents.clone();
                dependents.sort();
                Change::DropConstraint {
                    constraint: constraint.clone(),
                    dependents,
                }
            }
            Change::AddIndex { .. } | Change::DropIndex { .. } | Change::AddConstraint { .. } => {
                self.clone()
            }
        }
    }
}

/// Whether the target table held rows when the operation was planned.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TableOccupancy {
    /// Known to have no rows.
    Empty,
    /// Known to have rows.
    Populated,
    /// Not known; treated as populated.
    #[default]
    Unknown,
}

impl TableOccupancy {
    /// Derive occupancy from an introspected row count.
    pub fn from_row_count(rows: Option<u64>) -> Self {
        match rows {
            Some(0) => TableOccupancy::Empty,
            Some(_) => TableOccupancy::Populated,
            None => TableOccupancy::Unknown,
        }
    }

    /// Check if the table is known to be empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, TableOccupancy::Empty)
    }
}

/// Opaque dialect-rendered action (e.g. DDL text). Never inspected by the engine.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct ActionDescriptor(pub String);

impl ActionDescriptor {
    /// Create a descriptor.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Get the descriptor text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single atomic schema change.
///
/// The risk level is assigned by a [`RiskClassifier`] at construction and is
/// read-only afterwards.
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
pub struct MigrationOperation {
    table: String,
    change: Change,
    occupancy: TableOccupancy,
    risk: RiskLevel,
    forward: Option<ActionDescriptor>,
    backward: Option<ActionDescriptor>,
}

/// Canonical form hashed into plan checksums.
#[derive(serde::Serialize)]
struct CanonicalOperation<'a> {
    table: &'a str,
    change: Change,
    risk: RiskLevel,
}

impl MigrationOperation {
    /// Create an operation classified with the portable capability table.
    pub fn new(table: impl Into<String>, change: Change, occupancy: TableOccupancy) -> Self {
        Self::classified(table, change, occupancy, &RiskClassifier::default())
    }

    /// Create an operation classified by the given classifier.
    pub fn classified(
        table: impl Into<String>,
        change: Change,
        occupancy: TableOccupancy,
        classifier: &RiskClassifier,
    ) -> Self {
        let risk = classifier.classify(&change, occupancy);
        Self {
            table: table.into(),
            change,
            occupancy,
            risk,
            forward: None,
            backward: None,
        }
    }

    /// Attach rendered forward and backward actions.
    pub fn with_actions(
        mut self,
        forward: ActionDescriptor,
        backward: Option<ActionDescriptor>,
    ) -> Self {
        self.forward = Some(forward);
        self.backward = backward;
        self
    }

    /// Target table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Typed payload.
    pub fn change(&self) -> &Change {
        &self.change
    }

    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.change.kind()
    }

    /// Table occupancy observed at planning time.
    pub fn occupancy(&self) -> TableOccupancy {
        self.occupancy
    }

    /// Assigned risk level.
    pub fn risk(&self) -> RiskLevel {
        self.risk
    }

    /// Rendered forward action, once planned.
    pub fn forward(&self) -> Option<&ActionDescriptor> {
        self.forward.as_ref()
    }

    /// Rendered reverse action, if the operation is reversible.
    pub fn backward(&self) -> Option<&ActionDescriptor> {
        self.backward.as_ref()
    }

    /// Column, index or constraint name targeted, if any.
    pub fn target_name(&self) -> Option<&str> {
        self.change.target_name()
    }

    /// Short human-readable description, e.g. `ADD_COLUMN user.phone`.
    pub fn describe(&self) -> String {
        match self.target_name() {
            Some(target) => format!("{} {}.{}", self.kind(), self.table, target),
            None => format!("{} {}", self.kind(), self.table),
        }
    }

    /// Canonical serialization used for checksums.
    ///
    /// Covers kind, table, canonical payload and risk. Occupancy and rendered
    /// actions are excluded so that dialect text never changes a plan's identity.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        serde_json::to_vec(&CanonicalOperation {
            table: &self.table,
            change: self.change.canonical(),
            risk: self.risk,
        })
        .map_err(|e| MigrationError::Serialization(e.to_string()))
    }
}

impl std::fmt::Display for MigrationOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.describe(), self.risk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LogicalType;

    #[test]
    fn test_kind_display() {
        assert_eq!(OperationKind::AlterColumnNullability.to_string(), "ALTER_COLUMN_NULLABILITY");
        assert_eq!(OperationKind::CreateTable.to_string(), "CREATE_TABLE");
        assert!(OperationKind::DropIndex.is_removal());
        assert!(!OperationKind::AddIndex.is_removal());
    }

    #[test]
    fn test_occupancy_from_row_count() {
        assert_eq!(TableOccupancy::from_row_count(Some(0)), TableOccupancy::Empty);
        assert_eq!(TableOccupancy::from_row_count(Some(12)), TableOccupancy::Populated);
        assert_eq!(TableOccupancy::from_row_count(None), TableOccupancy::Unknown);
    }

    #[test]
    fn test_operation_describe() {
        let op = MigrationOperation::new(
            "user",
            Change::AddColumn {
                column: ColumnSpec::nullable("phone", LogicalType::varchar(32)),
            },
            TableOccupancy::Populated,
        );
        assert_eq!(op.describe(), "ADD_COLUMN user.phone");
        assert_eq!(op.kind(), OperationKind::AddColumn);
        assert_eq!(op.risk(), RiskLevel::Safe);
        assert!(op.forward().is_none());
    }

    #[test]
    fn test_canonical_bytes_ignore_actions_and_occupancy() {
        let change = Change::AddColumn {
            column: ColumnSpec::nullable("phone", LogicalType::Text),
        };
        let a = MigrationOperation::new("user", change.clone(), TableOccupancy::Populated);
        let b = MigrationOperation::new("user", change, TableOccupancy::Empty)
            .with_actions(ActionDescriptor::new("ALTER TABLE ..."), None);

        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());

        let text = String::from_utf8(a.canonical_bytes().unwrap()).unwrap();
        assert!(text.contains("\"kind\":\"ADD_COLUMN\""));
        assert!(text.contains("\"risk\":\"SAFE\""));
    }

    #[test]
    fn test_canonical_bytes_ignore_declaration_order() {
        use crate::schema::{IndexSpec, TableSpec};

        let a = TableSpec::new("user")
            .with_column(ColumnSpec::new("id", LogicalType::Uuid))
            .with_column(ColumnSpec::new("name", LogicalType::Text))
            .with_index(IndexSpec::new("a_idx", ["id"]))
            .with_index(IndexSpec::new("b_idx", ["name"]));
        let b = TableSpec::new("user")
            .with_column(ColumnSpec::new("name", LogicalType::Text))
            .with_column(ColumnSpec::new("id", LogicalType::Uuid))
            .with_index(IndexSpec::new("b_idx", ["name"]))
            .with_index(IndexSpec::new("a_idx", ["id"]));
        assert_eq!(a, b);

        let drop_a = MigrationOperation::new("user", Change::DropTable { table: a }, TableOccupancy::Empty);
        let drop_b = MigrationOperation::new("user", Change::DropTable { table: b }, TableOccupancy::Empty);
        assert_eq!(drop_a.canonical_bytes().unwrap(), drop_b.canonical_bytes().unwrap());

        let moved = MigrationOperation::new(
            "user",
            Change::AddColumn {
                column: ColumnSpec::nullable("phone", LogicalType::Text).at_position(5),
            },
            TableOccupancy::Empty,
        );
        let added = MigrationOperation::new(
            "user",
            Change::AddColumn {
                column: ColumnSpec::nullable("phone", LogicalType::Text),
            },
            TableOccupancy::Empty,
        );
        assert_eq!(moved.canonical_bytes().unwrap(), added.canonical_bytes().unwrap());
    }
}
