//! Schema snapshots - the desired or observed structure of one scope.

use super::table::{TableConstraint, TableSpec};
use crate::error::Error;
use crate::migration::error::MigrationError;
use crate::migration::operation::{Change, MigrationOperation};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A complete description of one scope's tables at one point in time.
///
/// Snapshots are immutable once constructed: they are built with
/// [`SchemaSnapshot::with_table`] and every transformation returns a new one.
/// Equality is structural over the tables; the scope name is not compared.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize)]
pub struct SchemaSnapshot {
    scope: String,
    #[serde(default)]
    tables: Vec<TableSpec>,
}

impl SchemaSnapshot {
    /// Create an empty snapshot for a scope.
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            tables: Vec::new(),
        }
    }

    /// Build a snapshot and validate it.
    pub fn from_tables(
        scope: impl Into<String>,
        tables: impl IntoIterator<Item = TableSpec>,
    ) -> Result<Self, MigrationError> {
        let snapshot = Self {
            scope: scope.into(),
            tables: tables.into_iter().collect(),
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Add a table. Duplicates are reported by [`SchemaSnapshot::validate`].
    pub fn with_table(mut self, table: TableSpec) -> Self {
        self.tables.push(table);
        self
    }

    /// The scope this snapshot describes.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// All tables in declaration order.
    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    /// Get a table by name.
    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Check if the snapshot has no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Tables keyed by name, in name order.
    pub fn by_name(&self) -> BTreeMap<&str, &TableSpec> {
        self.tables.iter().map(|t| (t.name.as_str(), t)).collect()
    }

    /// Replace the recorded row count of a table.
    pub fn with_row_count(mut self, table: &str, rows: Option<u64>) -> Self {
        if let Some(t) = self.tables.iter_mut().find(|t| t.name == table) {
            t.row_count = rows;
        }
        self
    }

    /// Check every structural invariant of the snapshot.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let mut table_names = HashSet::new();
        for table in &self.tables {
            if table.name.is_empty() {
                return Err(violation("", "table name must not be empty"));
            }
            if !table_names.insert(table.name.as_str()) {
                return Err(violation(&table.name, "duplicate table name"));
            }
            Self::validate_table(table)?;
        }

        for table in &self.tables {
            for fk in &table.foreign_keys {
                let target = self.table(&fk.references_table).ok_or_else(|| {
                    violation(
                        &table.name,
                        format!(
                            "foreign key '{}' references unknown table '{}'",
                            fk.name, fk.references_table
                        ),
                    )
                })?;
                if fk.columns.len() != fk.references_columns.len() || fk.columns.is_empty() {
                    return Err(violation(
                        &table.name,
                        format!("foreign key '{}' has mismatched column lists", fk.name),
                    ));
                }
                if let Some(missing) = fk.references_columns.iter().find(|c| !target.has_column(c)) {
                    return Err(violation(
                        &table.name,
                        format!(
                            "foreign key '{}' references unknown column '{}.{}'",
                            fk.name, fk.references_table, missing
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_table(table: &TableSpec) -> Result<(), MigrationError> {
        let mut columns = HashSet::new();
        for column in &table.columns {
            if column.name.is_empty() {
                return Err(violation(&table.name, "column name must not be empty"));
            }
            if !columns.insert(column.name.as_str()) {
                return Err(violation(
                    &table.name,
                    format!("duplicate column name '{}'", column.name),
                ));
            }
        }

        let check_columns = |kind: &str, name: &str, cols: &[String]| {
            match cols.iter().find(|c| !columns.contains(c.as_str())) {
                Some(missing) => Err(violation(
                    &table.name,
                    format!("{} '{}' references unknown column '{}'", kind, name, missing),
                )),
                None => Ok(()),
            }
        };

        let mut indexes = HashSet::new();
        for index in &table.indexes {
            if !indexes.insert(index.name.as_str()) {
                return Err(violation(
                    &table.name,
                    format!("duplicate index name '{}'", index.name),
                ));
            }
            if index.columns.is_empty() {
                return Err(violation(
                    &table.name,
                    format!("index '{}' has no columns", index.name),
                ));
            }
            check_columns("index", &index.name, &index.columns)?;
        }

        let mut constraints = HashSet::new();
        for constraint in table.all_constraints() {
            if !constraints.insert(constraint.name().to_string()) {
                return Err(violation(
                    &table.name,
                    format!("duplicate constraint name '{}'", constraint.name()),
                ));
            }
            match &constraint {
                TableConstraint::Constraint(c) => check_columns("constraint", c.name(), c.columns())?,
                TableConstraint::ForeignKey(fk) => check_columns("foreign key", &fk.name, &fk.columns)?,
            }
        }

        Ok(())
    }

    /// Return a new snapshot with one operation applied.
    ///
    /// The result is validated, so an operation that would leave dangling
    /// references (for example dropping a table that is still referenced by a
    /// foreign key) is rejected.
    pub fn apply(&self, operation: &MigrationOperation) -> Result<SchemaSnapshot, MigrationError> {
        let mut next = self.clone();
        let table_name = operation.table();

        if let Change::CreateTable { table } = operation.change() {
            if next.table(&table.name).is_some() {
                return Err(violation(&table.name, "cannot create table: already exists"));
            }
            next.tables.push(table.clone());
            next.validate()?;
            return Ok(next);
        }

        if let Change::DropTable { .. } = operation.change() {
            let before = next.tables.len();
            next.tables.retain(|t| t.name != table_name);
            if next.tables.len() == before {
                return Err(violation(table_name, "cannot drop table: does not exist"));
            }
            next.validate()?;
            return Ok(next);
        }

        let table = next
            .tables
            .iter_mut()
            .find(|t| t.name == table_name)
            .ok_or_else(|| violation(table_name, "table does not exist"))?;

        match operation.change() {
            Change::CreateTable { .. } | Change::DropTable { .. } => {}
            Change::AddColumn { column } => {
                if table.has_column(&column.name) {
                    return Err(violation(
                        table_name,
                        format!("cannot add column '{}': already exists", column.name),
                    ));
                }
                table.columns.push(column.clone());
            }
            Change::DropColumn { column } => {
                let before = table.columns.len();
                table.columns.retain(|c| c.name != column.name);
                if table.columns.len() == before {
                    return Err(violation(
                        table_name,
                        format!("cannot drop column '{}': does not exist", column.name),
                    ));
                }
            }
            Change::AlterColumnType { after, .. } => {
                let column = column_mut(table, &after.name)?;
                column.logical_type = after.logical_type;
                column.default = after.default.clone();
            }
            Change::AlterColumnNullability { after, .. } => {
                let column = column_mut(table, &after.name)?;
                column.nullable = after.nullable;
                column.default = after.default.clone();
            }
            Change::AddIndex { index } => {
                if table.index(&index.name).is_some() {
                    return Err(violation(
                        table_name,
                        format!("cannot add index '{}': already exists", index.name),
                    ));
                }
                table.indexes.push(index.clone());
            }
            Change::DropIndex { index } => {
                let before = table.indexes.len();
                table.indexes.retain(|i| i.name != index.name);
                if table.indexes.len() == before {
                    return Err(violation(
                        table_name,
                        format!("cannot drop index '{}': does not exist", index.name),
                    ));
                }
            }
            Change::AddConstraint { constraint } => match constraint {
                TableConstraint::Constraint(c) => table.constraints.push(c.clone()),
                TableConstraint::ForeignKey(fk) => table.foreign_keys.push(fk.clone()),
            },
            Change::DropConstraint { constraint, .. } => {
                let name = constraint.name();
                let removed = match constraint {
                    TableConstraint::Constraint(_) => {
                        let before = table.constraints.len();
                        table.constraints.retain(|c| c.name() != name);
                        table.constraints.len() != before
                    }
                    TableConstraint::ForeignKey(_) => {
                        let before = table.foreign_keys.len();
                        table.foreign_keys.retain(|fk| fk.name != name);
                        table.foreign_keys.len() != before
                    }
                };
                if !removed {
                    return Err(violation(
                        table_name,
                        format!("cannot drop constraint '{}': does not exist", name),
                    ));
                }
            }
        }

        next.validate()?;
        Ok(next)
    }

    /// Apply a sequence of operations in order.
    pub fn apply_all<'a>(
        &self,
        operations: impl IntoIterator<Item = &'a MigrationOperation>,
    ) -> Result<SchemaSnapshot, MigrationError> {
        let mut current = self.clone();
        for operation in operations {
            current = current.apply(operation)?;
        }
        Ok(current)
    }

    /// Serialize the snapshot to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Encode(e.to_string()))
    }

    /// Deserialize a snapshot from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Decode(e.to_string()))
    }
}

impl PartialEq for SchemaSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.tables.len() == other.tables.len()
            && self
                .tables
                .iter()
                .all(|t| other.table(&t.name).is_some_and(|o| t == o))
    }
}

impl Eq for SchemaSnapshot {}

fn column_mut<'a>(
    table: &'a mut TableSpec,
    name: &str,
) -> Result<&'a mut super::ColumnSpec, MigrationError> {
    let table_name = table.name.clone();
    table
        .columns
        .iter_mut()
        .find(|c| c.name == name)
        .ok_or_else(|| violation(&table_name, format!("column '{}' does not exist", name)))
}

fn violation(table: &str, message: impl Into<String>) -> MigrationError {
    MigrationError::SchemaInvariantViolation {
        table: table.to_string(),
        message: message.into(),
    }
}
