//! Table definitions: columns, indexes, foreign keys and constraints.

use super::column::ColumnSpec;
use rkyv::{Archive, Deserialize, Serialize};

/// An index definition.
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
pub struct IndexSpec {
    /// Index name (unique within its table).
    pub name: String,
    /// Indexed columns, in key order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    /// Create a non-unique index.
    pub fn new(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Create a unique index.
    pub fn unique(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            unique: true,
            ..Self::new(name, columns)
        }
    }
}

/// A foreign key definition.
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
pub struct ForeignKeySpec {
    /// Constraint name (unique within its table).
    pub name: String,
    /// Referencing columns.
    pub columns: Vec<String>,
    /// Referenced table.
    pub references_table: String,
    /// Referenced columns, positionally matched with `columns`.
    pub references_columns: Vec<String>,
}

impl ForeignKeySpec {
    /// Create a single-column foreign key.
    pub fn new(
        name: impl Into<String>,
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            columns: vec![column.into()],
            references_table: references_table.into(),
            references_columns: vec![references_column.into()],
        }
    }
}

/// A unique or check constraint.
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
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ConstraintSpec {
    /// Uniqueness constraint (single or composite).
    Unique {
        /// Constraint name.
        name: String,
        /// Columns that must be unique together.
        columns: Vec<String>,
    },
    /// Check constraint (expression must evaluate to true).
    Check {
        /// Constraint name.
        name: String,
        /// Boolean expression.
        expression: String,
    },
}

impl ConstraintSpec {
    /// Create a unique constraint.
    pub fn unique(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        ConstraintSpec::Unique {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a check constraint.
    pub fn check(name: impl Into<String>, expression: impl Into<String>) -> Self {
        ConstraintSpec::Check {
            name: name.into(),
            expression: expression.into(),
        }
    }

    /// Get the constraint name.
    pub fn name(&self) -> &str {
        match self {
            ConstraintSpec::Unique { name, .. } => name,
            ConstraintSpec::Check { name, .. } => name,
        }
    }

    /// Columns covered by this constraint. Check constraints report none.
    pub fn columns(&self) -> &[String] {
        match self {
            ConstraintSpec::Unique { columns, .. } => columns,
            ConstraintSpec::Check { .. } => &[],
        }
    }
}

/// Any constraint that can be added to or dropped from a table.
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
#[serde(rename_all = "snake_case")]
pub enum TableConstraint {
    /// Unique or check constraint.
    Constraint(ConstraintSpec),
    /// Foreign key constraint.
    ForeignKey(ForeignKeySpec),
}

impl TableConstraint {
    /// Get the constraint name.
    pub fn name(&self) -> &str {
        match self {
            TableConstraint::Constraint(c) => c.name(),
            TableConstraint::ForeignKey(fk) => &fk.name,
        }
    }

    /// Check if this is a unique constraint.
    pub fn is_unique(&self) -> bool {
        matches!(self, TableConstraint::Constraint(ConstraintSpec::Unique { .. }))
    }

    /// Check if this is a foreign key.
    pub fn is_foreign_key(&self) -> bool {
        matches!(self, TableConstraint::ForeignKey(_))
    }
}

impl From<ConstraintSpec> for TableConstraint {
    fn from(constraint: ConstraintSpec) -> Self {
        TableConstraint::Constraint(constraint)
    }
}

impl From<ForeignKeySpec> for TableConstraint {
    fn from(fk: ForeignKeySpec) -> Self {
        TableConstraint::ForeignKey(fk)
    }
}

/// A table definition.
///
/// Equality is structural: columns are compared by definition regardless of
/// position, index / foreign key / constraint collections are compared as
/// sets, and `row_count` is ignored.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize)]
pub struct TableSpec {
    /// Table name (unique within the snapshot).
    pub name: String,
    /// Column definitions in declaration order.
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
    /// Index definitions.
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    /// Foreign key definitions.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySpec>,
    /// Unique and check constraints.
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
    /// Number of rows as reported by introspection, if known.
    #[serde(default)]
    pub row_count: Option<u64>,
}

impl TableSpec {
    /// Create an empty table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            constraints: Vec::new(),
            row_count: None,
        }
    }

    /// Append a column, assigning it the next ordinal position.
    pub fn with_column(mut self, mut column: ColumnSpec) -> Self {
        column.position = self.columns.len() as u32;
        self.columns.push(column);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    /// Add a foreign key.
    pub fn with_foreign_key(mut self, fk: ForeignKeySpec) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Add a unique or check constraint.
    pub fn with_constraint(mut self, constraint: ConstraintSpec) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Record the introspected row count.
    pub fn with_row_count(mut self, rows: u64) -> Self {
        self.row_count = Some(rows);
        self
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Get an index by name.
    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Check if a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// All foreign keys and constraints as [`TableConstraint`]s.
    pub fn all_constraints(&self) -> impl Iterator<Item = TableConstraint> + '_ {
        self.constraints
            .iter()
            .cloned()
            .map(TableConstraint::Constraint)
            .chain(self.foreign_keys.iter().cloned().map(TableConstraint::ForeignKey))
    }

    /// The same table with only its columns, as created by `CREATE TABLE`.
    pub fn columns_only(&self) -> TableSpec {
        TableSpec {
            name: self.name.clone(),
            columns: self.columns.clone(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            constraints: Vec::new(),
            row_count: None,
        }
    }

    /// Order-independent form: columns, indexes, foreign keys and constraints
    /// sorted by name, positions cleared and row count dropped. Tables that
    /// compare equal have identical canonical forms.
    pub fn canonical(&self) -> TableSpec {
        let mut columns: Vec<ColumnSpec> = self.columns.iter().map(ColumnSpec::canonical).collect();
        columns.sort_by(|a, b| a.name.cmp(&b.name));
        let mut indexes = self.indexes.clone();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        let mut foreign_keys = self.foreign_keys.clone();
        foreign_keys.sort_by(|a, b| a.name.cmp(&b.name));
        let mut constraints = self.constraints.clone();
        constraints.sort_by(|a, b| a.name().cmp(b.name()));

        TableSpec {
            name: self.name.clone(),
            columns,
            indexes,
            foreign_keys,
            constraints,
            row_count: None,
        }
    }
}

fn same_set<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x)) && b.iter().all(|y| a.contains(y))
}

impl PartialEq for TableSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.columns.len() == other.columns.len()
            && self.columns.iter().all(|c| {
                other
                    .column(&c.name)
                    .is_some_and(|o| c.same_definition(o))
            })
            && same_set(&self.indexes, &other.indexes)
            && same_set(&self.foreign_keys, &other.foreign_keys)
            && same_set(&self.constraints, &other.constraints)
    }
}

impl Eq for TableSpec {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LogicalType;

    fn user_table() -> TableSpec {
        TableSpec::new("user")
            .with_column(ColumnSpec::new("id", LogicalType::Uuid))
            .with_column(ColumnSpec::new("email", LogicalType::varchar(255)))
            .with_index(IndexSpec::unique("user_email_idx", ["email"]))
            .with_constraint(ConstraintSpec::check("email_not_blank", "email <> ''"))
    }

    #[test]
    fn test_table_builder_assigns_positions() {
        let table = user_table();
        assert_eq!(table.columns[0].position, 0);
        assert_eq!(table.columns[1].position, 1);
        assert!(table.has_column("email"));
        assert!(table.index("user_email_idx").is_some());
    }

    #[test]
    fn test_structural_equality_ignores_order_and_stats() {
        let a = user_table().with_row_count(10);
        let b = TableSpec::new("user")
            .with_constraint(ConstraintSpec::check("email_not_blank", "email <> ''"))
            .with_index(IndexSpec::unique("user_email_idx", ["email"]))
            .with_column(ColumnSpec::new("email", LogicalType::varchar(255)))
            .with_column(ColumnSpec::new("id", LogicalType::Uuid));

        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(
            serde_json::to_string(&a.canonical()).unwrap(),
            serde_json::to_string(&b.canonical()).unwrap()
        );
    }

    #[test]
    fn test_structural_inequality() {
        let a = user_table();
        let b = user_table().with_index(IndexSpec::new("user_id_idx", ["id"]));
        assert_ne!(a, b);

        let mut c = user_table();
        c.columns[1].nullable = true;
        assert_ne!(a, c);
    }

    #[test]
    fn test_columns_only() {
        let table = user_table().with_foreign_key(ForeignKeySpec::new(
            "user_org_fk",
            "id",
            "org",
            "id",
        ));
        let bare = table.columns_only();
        assert_eq!(bare.columns.len(), 2);
        assert!(bare.indexes.is_empty());
        assert!(bare.foreign_keys.is_empty());
        assert!(bare.constraints.is_empty());
    }

    #[test]
    fn test_table_constraint_names() {
        let unique: TableConstraint = ConstraintSpec::unique("uq", ["email"]).into();
        let fk: TableConstraint = ForeignKeySpec::new("fk", "org_id", "org", "id").into();
        assert_eq!(unique.name(), "uq");
        assert!(unique.is_unique());
        assert!(fk.is_foreign_key());
        assert_eq!(user_table().all_constraints().count(), 1);
    }
}
