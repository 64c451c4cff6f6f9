//! Schema diffing algorithm.
//!
//! Compares a desired snapshot with an observed one and produces an ordered
//! list of atomic operations that transform the observed schema into the
//! desired one. Emission order:
//!
//! 1. dropped or changed foreign keys, then unique / check constraints
//! 2. dropped or changed indexes
//! 3. new tables (columns only)
//! 4. new columns
//! 5. type changes, then nullability / default changes
//! 6. new indexes
//! 7. new unique / check constraints, then new foreign keys
//! 8. dropped tables, referencing tables first
//! 9. dropped columns

use super::error::{MigrationError, RiskLevel};
use super::operation::{Change, MigrationOperation, TableOccupancy};
use super::risk::RiskClassifier;
use crate::schema::{
    ColumnSpec, ConstraintSpec, ForeignKeySpec, IndexSpec, SchemaSnapshot, TableConstraint,
    TableSpec,
};
use std::collections::{BTreeMap, BTreeSet};

/// Ordered operations that turn an observed schema into a desired one.
#[derive(Debug, Clone)]
pub struct SchemaDiff {
    /// Scope of the desired snapshot.
    pub scope: String,
    /// Operations in execution order.
    pub operations: Vec<MigrationOperation>,
}

impl SchemaDiff {
    /// Compute the diff with the portable risk classifier.
    pub fn compute(
        desired: &SchemaSnapshot,
        observed: &SchemaSnapshot,
    ) -> Result<Self, MigrationError> {
        Self::compute_with(desired, observed, &RiskClassifier::default())
    }

    /// Compute the diff, classifying operations with the given classifier.
    ///
    /// Both snapshots are validated first; a malformed snapshot fails the
    /// whole diff.
    pub fn compute_with(
        desired: &SchemaSnapshot,
        observed: &SchemaSnapshot,
        classifier: &RiskClassifier,
    ) -> Result<Self, MigrationError> {
        desired.validate()?;
        observed.validate()?;

        let builder = DiffBuilder {
            desired: desired.by_name(),
            observed: observed.by_name(),
            classifier,
            operations: Vec::new(),
        };

        Ok(SchemaDiff {
            scope: desired.scope().to_string(),
            operations: builder.build(),
        })
    }

    /// Check if there are any changes.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Get the number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Maximum risk of any operation (`Safe` when empty).
    pub fn aggregate_risk(&self) -> RiskLevel {
        self.operations
            .iter()
            .map(MigrationOperation::risk)
            .max()
            .unwrap_or_default()
    }

    /// Consume the diff, returning its operations.
    pub fn into_operations(self) -> Vec<MigrationOperation> {
        self.operations
    }
}

struct DiffBuilder<'a> {
    desired: BTreeMap<&'a str, &'a TableSpec>,
    observed: BTreeMap<&'a str, &'a TableSpec>,
    classifier: &'a RiskClassifier,
    operations: Vec<MigrationOperation>,
}

impl<'a> DiffBuilder<'a> {
    fn build(mut self) -> Vec<MigrationOperation> {
        self.drop_constraints();
        self.drop_indexes();
        self.create_tables();
        self.add_columns();
        self.alter_columns();
        self.add_indexes();
        self.add_constraints();
        self.drop_tables();
        self.drop_columns();
        self.operations
    }

    fn push(&mut self, table: &str, change: Change, occupancy: TableOccupancy) {
        self.operations.push(MigrationOperation::classified(
            table,
            change,
            occupancy,
            self.classifier,
        ));
    }

    fn occupancy(&self, table: &str) -> TableOccupancy {
        match self.observed.get(table) {
            Some(t) => TableOccupancy::from_row_count(t.row_count),
            None => TableOccupancy::Empty,
        }
    }

    /// Tables present in both snapshots, as (desired, observed) pairs.
    fn surviving(&self) -> Vec<(&'a TableSpec, &'a TableSpec)> {
        self.desired
            .iter()
            .filter_map(|(name, desired)| self.observed.get(name).map(|observed| (*desired, *observed)))
            .collect()
    }

    fn drop_constraints(&mut self) {
        let surviving = self.surviving();

        for (desired, observed) in &surviving {
            for fk in foreign_keys_by_name(observed) {
                if !desired.foreign_keys.contains(fk) {
                    self.push(
                        &observed.name,
                        Change::DropConstraint {
                            constraint: TableConstraint::ForeignKey(fk.clone()),
                            dependents: Vec::new(),
                        },
                        self.occupancy(&observed.name),
                    );
                }
            }
        }

        for (desired, observed) in &surviving {
            for constraint in constraints_by_name(observed) {
                if !desired.constraints.contains(constraint) {
                    let dependents = self.unique_dependents(&observed.name, constraint.columns());
                    self.push(
                        &observed.name,
                        Change::DropConstraint {
                            constraint: TableConstraint::Constraint(constraint.clone()),
                            dependents,
                        },
                        self.occupancy(&observed.name),
                    );
                }
            }
        }
    }

    /// Foreign keys kept by the desired schema that reference exactly these columns.
    fn unique_dependents(&self, table: &str, columns: &[String]) -> Vec<String> {
        if columns.is_empty() {
            return Vec::new();
        }
        let key: BTreeSet<&str> = columns.iter().map(String::as_str).collect();
        let mut dependents = Vec::new();
        for (name, observed) in &self.observed {
            let Some(desired) = self.desired.get(name) else {
                continue;
            };
            for fk in &observed.foreign_keys {
                let referenced: BTreeSet<&str> =
                    fk.references_columns.iter().map(String::as_str).collect();
                if fk.references_table == table && referenced == key && desired.foreign_keys.contains(fk) {
                    dependents.push(format!("{}.{}", name, fk.name));
                }
            }
        }
        dependents.sort();
        dependents
    }

    fn drop_indexes(&mut self) {
        for (desired, observed) in self.surviving() {
            for index in indexes_by_name(observed) {
                if !desired.indexes.contains(index) {
                    self.push(
                        &observed.name,
                        Change::DropIndex { index: index.clone() },
                        self.occupancy(&observed.name),
                    );
                }
            }
        }
    }

    fn create_tables(&mut self) {
        let new_tables: Vec<&TableSpec> = self
            .desired
            .values()
            .filter(|t| !self.observed.contains_key(t.name.as_str()))
            .copied()
            .collect();

        for table in new_tables {
            self.push(
                &table.name,
                Change::CreateTable {
                    table: table.columns_only(),
                },
                TableOccupancy::Empty,
            );
        }
    }

    fn add_columns(&mut self) {
        for (desired, observed) in self.surviving() {
            for column in columns_by_name(desired) {
                if !observed.has_column(&column.name) {
                    self.push(
                        &desired.name,
                        Change::AddColumn {
                            column: column.clone(),
                        },
                        self.occupancy(&desired.name),
                    );
                }
            }
        }
    }

    fn alter_columns(&mut self) {
        for (desired, observed) in self.surviving() {
            let occupancy = self.occupancy(&desired.name);
            for target in columns_by_name(desired) {
                let Some(current) = observed.column(&target.name) else {
                    continue;
                };

                let mut current = current.clone();
                if current.logical_type != target.logical_type {
                    let after = ColumnSpec {
                        logical_type: target.logical_type,
                        ..current.clone()
                    };
                    self.push(
                        &desired.name,
                        Change::AlterColumnType {
                            before: current,
                            after: after.clone(),
                        },
                        occupancy,
                    );
                    current = after;
                }

                if current.nullable != target.nullable || current.default != target.default {
                    let after = ColumnSpec {
                        nullable: target.nullable,
                        default: target.default.clone(),
                        ..current.clone()
                    };
                    self.push(
                        &desired.name,
                        Change::AlterColumnNullability {
                            before: current,
                            after,
                        },
                        occupancy,
                    );
                }
            }
        }
    }

    fn add_indexes(&mut self) {
        let desired: Vec<&TableSpec> = self.desired.values().copied().collect();
        for table in desired {
            let existing = self.observed.get(table.name.as_str()).copied().map(|t| &t.indexes);
            for index in indexes_by_name(table) {
                if existing.is_some_and(|e| e.contains(index)) {
                    continue;
                }
                self.push(
                    &table.name,
                    Change::AddIndex { index: index.clone() },
                    self.occupancy(&table.name),
                );
            }
        }
    }

    fn add_constraints(&mut self) {
        let desired: Vec<&TableSpec> = self.desired.values().copied().collect();

        for table in &desired {
            let existing = self.observed.get(table.name.as_str()).copied().map(|t| &t.constraints);
            for constraint in constraints_by_name(table) {
                if existing.is_some_and(|e| e.contains(constraint)) {
                    continue;
                }
                self.push(
                    &table.name,
                    Change::AddConstraint {
                        constraint: TableConstraint::Constraint(constraint.clone()),
                    },
                    self.occupancy(&table.name),
                );
            }
        }

        for table in &desired {
            let existing = self.observed.get(table.name.as_str()).copied().map(|t| &t.foreign_keys);
            for fk in foreign_keys_by_name(table) {
                if existing.is_some_and(|e| e.contains(fk)) {
                    continue;
                }
                self.push(
                    &table.name,
                    Change::AddConstraint {
                        constraint: TableConstraint::ForeignKey(fk.clone()),
                    },
                    self.occupancy(&table.name),
                );
            }
        }
    }

    /// Drop removed tables so that no table is dropped while another remaining
    /// table still references it. Reference cycles are broken by dropping one
    /// table's outgoing foreign keys first.
    fn drop_tables(&mut self) {
        let mut remaining: BTreeMap<String, TableSpec> = self
            .observed
            .iter()
            .filter(|(name, _)| !self.desired.contains_key(*name))
            .map(|(name, table)| {
                let mut table = (*table).clone();
                table.row_count = None;
                (name.to_string(), table)
            })
            .collect();

        while !remaining.is_empty() {
            let referenced_by_other = |name: &str| {
                remaining.values().any(|t| {
                    t.name != name && t.foreign_keys.iter().any(|fk| fk.references_table == name)
                })
            };

            let next = remaining
                .keys()
                .find(|name| !referenced_by_other(name.as_str()))
                .cloned();

            if let Some(name) = next {
                if let Some(table) = remaining.remove(&name) {
                    let occupancy = self.occupancy(&name);
                    self.push(&name, Change::DropTable { table }, occupancy);
                }
                continue;
            }

            let names: BTreeSet<String> = remaining.keys().cloned().collect();
            let breaker = remaining.values_mut().find(|t| {
                t.foreign_keys
                    .iter()
                    .any(|fk| fk.references_table != t.name && names.contains(&fk.references_table))
            });
            let Some(table) = breaker else {
                break;
            };

            let table_name = table.name.clone();
            let (mut cut, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut table.foreign_keys)
                .into_iter()
                .partition(|fk| fk.references_table != table_name && names.contains(&fk.references_table));
            cut.sort_by(|a, b| a.name.cmp(&b.name));
            table.foreign_keys = kept;

            let occupancy = self.occupancy(&table_name);
            for fk in cut {
                self.push(
                    &table_name,
                    Change::DropConstraint {
                        constraint: TableConstraint::ForeignKey(fk),
                        dependents: Vec::new(),
                    },
                    occupancy,
                );
            }
        }
    }

    fn drop_columns(&mut self) {
        for (desired, observed) in self.surviving() {
            for column in columns_by_name(observed) {
                if !desired.has_column(&column.name) {
                    self.push(
                        &observed.name,
                        Change::DropColumn {
                            column: column.clone(),
                        },
                        self.occupancy(&observed.name),
                    );
                }
            }
        }
    }
}

// Emission order depends on names only, never on declaration order or position.

fn columns_by_name(table: &TableSpec) -> Vec<&ColumnSpec> {
    let mut columns: Vec<&ColumnSpec> = table.columns.iter().collect();
    columns.sort_by(|a, b| a.name.cmp(&b.name));
    columns
}

fn indexes_by_name(table: &TableSpec) -> Vec<&IndexSpec> {
    let mut indexes: Vec<&IndexSpec> = table.indexes.iter().collect();
    indexes.sort_by(|a, b| a.name.cmp(&b.name));
    indexes
}

fn foreign_keys_by_name(table: &TableSpec) -> Vec<&ForeignKeySpec> {
    let mut foreign_keys: Vec<&ForeignKeySpec> = table.foreign_keys.iter().collect();
    foreign_keys.sort_by(|a, b| a.name.cmp(&b.name));
    foreign_keys
}

fn constraints_by_name(table: &TableSpec) -> Vec<&ConstraintSpec> {
    let mut constraints: Vec<&ConstraintSpec> = table.constraints.iter().collect();
    constraints.sort_by(|a, b| a.name().cmp(b.name()));
    constraints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::operation::OperationKind;
    use crate::schema::{DefaultValue, LogicalType};

    fn create_user_table() -> TableSpec {
        TableSpec::new("user")
            .with_column(ColumnSpec::new("id", LogicalType::Uuid))
            .with_column(ColumnSpec::new("name", LogicalType::varchar(100)))
            .with_column(ColumnSpec::nullable("legacy_code", LogicalType::varchar(8)))
            .with_row_count(42)
    }

    fn create_post_table() -> TableSpec {
        TableSpec::new("post")
            .with_column(ColumnSpec::new("id", LogicalType::Uuid))
            .with_column(ColumnSpec::new("author_id", LogicalType::Uuid))
            .with_column(ColumnSpec::new("title", LogicalType::Text))
            .with_index(IndexSpec::new("post_author_idx", ["author_id"]))
            .with_foreign_key(ForeignKeySpec::new("post_author_fk", "author_id", "user", "id"))
    }

    fn snapshot(tables: impl IntoIterator<Item = TableSpec>) -> SchemaSnapshot {
        tables
            .into_iter()
            .fold(SchemaSnapshot::new("app"), SchemaSnapshot::with_table)
    }

    fn kinds(diff: &SchemaDiff) -> Vec<OperationKind> {
        diff.operations.iter().map(MigrationOperation::kind).collect()
    }

    fn assert_reaches(desired: &SchemaSnapshot, observed: &SchemaSnapshot) {
        let diff = SchemaDiff::compute(desired, observed).unwrap();
        let applied = observed.apply_all(&diff.operations).unwrap();
        assert_eq!(&applied, desired);
    }

    #[test]
    fn test_diff_no_changes() {
        let s = snapshot([create_user_table(), create_post_table()]);
        let diff = SchemaDiff::compute(&s, &s).unwrap();
        assert!(diff.is_empty());
        assert_eq!(diff.aggregate_risk(), RiskLevel::Safe);
    }

    #[test]
    fn test_diff_add_nullable_column() {
        let observed = snapshot([create_user_table()]);
        let desired = snapshot([create_user_table()
            .with_column(ColumnSpec::nullable("phone", LogicalType::varchar(32)))]);

        let diff = SchemaDiff::compute(&desired, &observed).unwrap();
        assert_eq!(kinds(&diff), vec![OperationKind::AddColumn]);
        assert_eq!(diff.operations[0].risk(), RiskLevel::Safe);
        assert_eq!(diff.operations[0].describe(), "ADD_COLUMN user.phone");
        assert_reaches(&desired, &observed);
    }

    #[test]
    fn test_diff_drop_column_is_high() {
        let observed = snapshot([create_user_table()]);
        let mut user = create_user_table();
        user.columns.retain(|c| c.name != "legacy_code");
        let desired = snapshot([user]);

        let diff = SchemaDiff::compute(&desired, &observed).unwrap();
        assert_eq!(kinds(&diff), vec![OperationKind::DropColumn]);
        assert_eq!(diff.aggregate_risk(), RiskLevel::High);
        assert_reaches(&desired, &observed);
    }

    #[test]
    fn test_diff_create_table_before_dependents() {
        let observed = snapshot([create_user_table()]);
        let desired = snapshot([create_user_table(), create_post_table()]);

        let diff = SchemaDiff::compute(&desired, &observed).unwrap();
        assert_eq!(
            kinds(&diff),
            vec![
                OperationKind::CreateTable,
                OperationKind::AddIndex,
                OperationKind::AddConstraint
            ]
        );
        assert!(diff.operations.iter().all(|op| op.risk() == RiskLevel::Safe));
        assert_reaches(&desired, &observed);
    }

    #[test]
    fn test_diff_drop_tables_referrers_first() {
        let observed = snapshot([create_user_table(), create_post_table()]);
        let desired = snapshot(Vec::new());

        let diff = SchemaDiff::compute(&desired, &observed).unwrap();
        let tables: Vec<&str> = diff.operations.iter().map(|op| op.table()).collect();
        assert_eq!(tables, vec!["post", "user"]);
        assert_eq!(kinds(&diff), vec![OperationKind::DropTable, OperationKind::DropTable]);
        assert_reaches(&desired, &observed);
    }

    #[test]
    fn test_diff_drop_table_cycle() {
        let a = TableSpec::new("a")
            .with_column(ColumnSpec::new("id", LogicalType::Int))
            .with_column(ColumnSpec::new("b_id", LogicalType::Int))
            .with_foreign_key(ForeignKeySpec::new("a_b_fk", "b_id", "b", "id"));
        let b = TableSpec::new("b")
            .with_column(ColumnSpec::new("id", LogicalType::Int))
            .with_column(ColumnSpec::new("a_id", LogicalType::Int))
            .with_foreign_key(ForeignKeySpec::new("b_a_fk", "a_id", "a", "id"));
        let observed = snapshot([a, b]);
        let desired = snapshot(Vec::new());

        let diff = SchemaDiff::compute(&desired, &observed).unwrap();
        assert_eq!(diff.operations[0].kind(), OperationKind::DropConstraint);
        assert_reaches(&desired, &observed);
    }

    #[test]
    fn test_diff_type_and_nullability_are_separate() {
        let observed = snapshot([create_user_table()]);
        let mut user = create_user_table();
        user.columns[2] = ColumnSpec::new("legacy_code", LogicalType::varchar(16))
            .with_default(DefaultValue::String("none".into()))
            .at_position(2);
        let desired = snapshot([user]);

        let diff = SchemaDiff::compute(&desired, &observed).unwrap();
        assert_eq!(
            kinds(&diff),
            vec![OperationKind::AlterColumnType, OperationKind::AlterColumnNullability]
        );
        assert_eq!(diff.operations[0].risk(), RiskLevel::Medium);
        assert_eq!(diff.operations[1].risk(), RiskLevel::Safe);
        assert_reaches(&desired, &observed);
    }

    #[test]
    fn test_diff_default_only_change() {
        let observed = snapshot([create_user_table()]);
        let mut user = create_user_table();
        user.columns[1].default = Some(DefaultValue::String("anonymous".into()));
        let desired = snapshot([user]);

        let diff = SchemaDiff::compute(&desired, &observed).unwrap();
        assert_eq!(kinds(&diff), vec![OperationKind::AlterColumnNullability]);
        assert_eq!(diff.aggregate_risk(), RiskLevel::Safe);
        assert_reaches(&desired, &observed);
    }

    #[test]
    fn test_diff_index_order_independent() {
        let observed = snapshot([create_user_table()
            .with_index(IndexSpec::new("a_idx", ["name"]))
            .with_index(IndexSpec::unique("b_idx", ["id"]))]);
        let desired = snapshot([create_user_table()
            .with_index(IndexSpec::unique("b_idx", ["id"]))
            .with_index(IndexSpec::new("a_idx", ["name"]))]);

        assert!(SchemaDiff::compute(&desired, &observed).unwrap().is_empty());
    }

    #[test]
    fn test_diff_changed_index_is_dropped_then_added() {
        let observed = snapshot([create_user_table().with_index(IndexSpec::new("name_idx", ["name"]))]);
        let desired = snapshot([create_user_table().with_index(IndexSpec::unique("name_idx", ["name"]))]);

        let diff = SchemaDiff::compute(&desired, &observed).unwrap();
        assert_eq!(kinds(&diff), vec![OperationKind::DropIndex, OperationKind::AddIndex]);
        assert_reaches(&desired, &observed);
    }

    #[test]
    fn test_diff_unique_with_dependents() {
        let org = || {
            TableSpec::new("org")
                .with_column(ColumnSpec::new("id", LogicalType::Int))
                .with_column(ColumnSpec::new("code", LogicalType::varchar(8)))
        };
        let member = TableSpec::new("member")
            .with_column(ColumnSpec::new("id", LogicalType::Int))
            .with_column(ColumnSpec::new("org_code", LogicalType::varchar(8)))
            .with_foreign_key(ForeignKeySpec::new("member_org_fk", "org_code", "org", "code"));

        let observed = snapshot([
            org().with_constraint(ConstraintSpec::unique("org_code_uq", ["code"])),
            member.clone(),
        ]);
        let desired = snapshot([org(), member]);

        let diff = SchemaDiff::compute(&desired, &observed).unwrap();
        assert_eq!(diff.len(), 1);
        match diff.operations[0].change() {
            Change::DropConstraint { dependents, .. } => {
                assert_eq!(dependents, &vec!["member.member_org_fk".to_string()]);
            }
            other => panic!("unexpected change: {:?}", other),
        }
        assert_eq!(diff.operations[0].risk(), RiskLevel::High);
    }

    #[test]
    fn test_diff_rejects_malformed_snapshot() {
        let broken = snapshot([create_user_table().with_column(ColumnSpec::new("id", LogicalType::Int))]);
        let ok = snapshot([create_user_table()]);

        let err = SchemaDiff::compute(&broken, &ok).unwrap_err();
        assert!(matches!(err, MigrationError::SchemaInvariantViolation { .. }));
        assert!(SchemaDiff::compute(&ok, &broken).is_err());
    }

    #[test]
    fn test_diff_complex_migration() {
        let observed = snapshot([create_user_table(), create_post_table()]);

        let mut user = create_user_table()
            .with_column(ColumnSpec::new("email", LogicalType::varchar(255)).with_default(DefaultValue::String(String::new())))
            .with_constraint(ConstraintSpec::unique("user_email_uq", ["email"]));
        user.columns.retain(|c| c.name != "legacy_code");
        let comment = TableSpec::new("comment")
            .with_column(ColumnSpec::new("id", LogicalType::Uuid))
            .with_column(ColumnSpec::new("user_id", LogicalType::Uuid))
            .with_foreign_key(ForeignKeySpec::new("comment_user_fk", "user_id", "user", "id"));
        let desired = snapshot([user, comment]);

        let diff = SchemaDiff::compute(&desired, &observed).unwrap();
        let first_drop_table = diff
            .operations
            .iter()
            .position(|op| op.kind() == OperationKind::DropTable)
            .unwrap();
        let create = diff
            .operations
            .iter()
            .position(|op| op.kind() == OperationKind::CreateTable)
            .unwrap();
        assert!(create < first_drop_table);
        assert_eq!(diff.aggregate_risk(), RiskLevel::High);
        assert_reaches(&desired, &observed);
    }
}
