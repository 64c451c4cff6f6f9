//! SQL dialect rendering.
//!
//! A [`SqlRenderer`] turns a [`MigrationOperation`] into an opaque
//! [`ActionDescriptor`] executed by the database driver, and supplies the
//! dialect's type conversion table.

use crate::migration::error::MigrationError;
use crate::migration::operation::{ActionDescriptor, Change, MigrationOperation};
use crate::migration::risk::TypeCapabilities;
use crate::schema::{ColumnSpec, ConstraintSpec, LogicalType, TableConstraint, TableSpec};

/// Renders operations into dialect-specific actions.
pub trait SqlRenderer: Send + Sync {
    /// Dialect name, for logs.
    fn name(&self) -> &str;

    /// Render one operation.
    fn render(&self, operation: &MigrationOperation) -> Result<ActionDescriptor, MigrationError>;

    /// Type conversion table used by the risk classifier.
    fn capabilities(&self) -> TypeCapabilities {
        TypeCapabilities::portable()
    }
}

/// Reference renderer producing ANSI-style DDL.
#[derive(Debug, Clone, Default)]
pub struct AnsiSqlRenderer {
    capabilities: TypeCapabilities,
}

impl AnsiSqlRenderer {
    /// Create a renderer with the portable capability table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom capability table.
    pub fn with_capabilities(mut self, capabilities: TypeCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn ident(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn ident_list(names: &[String]) -> String {
        names
            .iter()
            .map(|n| Self::ident(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn sql_type(ty: LogicalType) -> String {
        match ty {
            LogicalType::Bool => "BOOLEAN".to_string(),
            LogicalType::SmallInt => "SMALLINT".to_string(),
            LogicalType::Int => "INTEGER".to_string(),
            LogicalType::BigInt => "BIGINT".to_string(),
            LogicalType::Real => "REAL".to_string(),
            LogicalType::Double => "DOUBLE PRECISION".to_string(),
            LogicalType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            LogicalType::Varchar { length } => format!("VARCHAR({})", length),
            LogicalType::Text => "TEXT".to_string(),
            LogicalType::Bytes => "BLOB".to_string(),
            LogicalType::Date => "DATE".to_string(),
            LogicalType::Timestamp => "TIMESTAMP".to_string(),
            LogicalType::Uuid => "UUID".to_string(),
            LogicalType::Json => "JSON".to_string(),
        }
    }

    fn column_def(column: &ColumnSpec) -> String {
        let mut def = format!("{} {}", Self::ident(&column.name), Self::sql_type(column.logical_type));
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            def.push_str(&format!(" DEFAULT {}", default));
        }
        def
    }

    fn create_table(table: &TableSpec) -> String {
        let mut columns: Vec<&ColumnSpec> = table.columns.iter().collect();
        columns.sort_by_key(|c| c.position);
        let body = columns
            .into_iter()
            .map(Self::column_def)
            .collect::<Vec<_>>()
            .join(", ");
        let mut statements = vec![format!("CREATE TABLE {} ({})", Self::ident(&table.name), body)];

        // Only present when recreating a dropped table.
        for index in &table.indexes {
            statements.push(Self::create_index(&table.name, index));
        }
        for constraint in table.all_constraints() {
            statements.push(Self::add_constraint(&table.name, &constraint));
        }
        statements.join(";\n")
    }

    fn create_index(table: &str, index: &crate::schema::IndexSpec) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            Self::ident(&index.name),
            Self::ident(table),
            Self::ident_list(&index.columns)
        )
    }

    fn add_constraint(table: &str, constraint: &TableConstraint) -> String {
        let body = match constraint {
            TableConstraint::Constraint(ConstraintSpec::Unique { columns, .. }) => {
                format!("UNIQUE ({})", Self::ident_list(columns))
            }
            TableConstraint::Constraint(ConstraintSpec::Check { expression, .. }) => {
                format!("CHECK ({})", expression)
            }
            TableConstraint::ForeignKey(fk) => format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                Self::ident_list(&fk.columns),
                Self::ident(&fk.references_table),
                Self::ident_list(&fk.references_columns)
            ),
        };
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            Self::ident(table),
            Self::ident(constraint.name()),
            body
        )
    }
}

impl SqlRenderer for AnsiSqlRenderer {
    fn name(&self) -> &str {
        "ansi"
    }

    fn render(&self, operation: &MigrationOperation) -> Result<ActionDescriptor, MigrationError> {
        let table = Self::ident(operation.table());
        let sql = match operation.change() {
            Change::CreateTable { table: spec } => Self::create_table(spec),
            Change::DropTable { .. } => format!("DROP TABLE {}", table),
            Change::AddColumn { column } => {
                format!("ALTER TABLE {} ADD COLUMN {}", table, Self::column_def(column))
            }
            Change::DropColumn { column } => {
                format!("ALTER TABLE {} DROP COLUMN {}", table, Self::ident(&column.name))
            }
            Change::AlterColumnType { after, .. } => format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                table,
                Self::ident(&after.name),
                Self::sql_type(after.logical_type)
            ),
            Change::AlterColumnNullability { before, after } => {
                let column = Self::ident(&after.name);
                let mut parts = Vec::new();
                if before.default != after.default {
                    parts.push(match &after.default {
                        Some(default) => format!("ALTER COLUMN {} SET DEFAULT {}", column, default),
                        None => format!("ALTER COLUMN {} DROP DEFAULT", column),
                    });
                }
                if before.nullable != after.nullable {
                    parts.push(if after.nullable {
                        format!("ALTER COLUMN {} DROP NOT NULL", column)
                    } else {
                        format!("ALTER COLUMN {} SET NOT NULL", column)
                    });
                }
                if parts.is_empty() {
                    return Err(MigrationError::Configuration(format!(
                        "{} changes neither nullability nor default",
                        operation.describe()
                    )));
                }
                format!("ALTER TABLE {} {}", table, parts.join(", "))
            }
            Change::AddIndex { index } => Self::create_index(operation.table(), index),
            Change::DropIndex { index } => format!("DROP INDEX {}", Self::ident(&index.name)),
            Change::AddConstraint { constraint } => Self::add_constraint(operation.table(), constraint),
            Change::DropConstraint { constraint, .. } => format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                table,
                Self::ident(constraint.name())
            ),
        };
        Ok(ActionDescriptor::new(sql))
    }

    fn capabilities(&self) -> TypeCapabilities {
        self.capabilities.clone()
    }
}
