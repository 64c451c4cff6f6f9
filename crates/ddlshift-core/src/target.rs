//! Schema target persisted in sled.
//!
//! Stores one [`SchemaSnapshot`] per scope. It stands in for a live database
//! when driving the engine from the command line: introspection reads the
//! stored snapshot, and a connection stages changes and writes them back on
//! commit.

use crate::driver::{ConnectionSource, DdlConnection, SchemaIntrospector};
use crate::migration::error::MigrationError;
use crate::migration::operation::{Change, MigrationOperation};
use crate::schema::SchemaSnapshot;
use tracing::debug;

/// Sled-backed schema store.
#[derive(Clone)]
pub struct SledSchemaTarget {
    tree: sled::Tree,
}

impl SledSchemaTarget {
    /// Tree name for schema snapshots.
    pub const TREE_NAME: &'static str = "ddlshift:schemas";

    /// Open or create the schema tree.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        Ok(Self {
            tree: db.open_tree(Self::TREE_NAME)?,
        })
    }

    /// Stored snapshot of a scope, or an empty one.
    pub fn load(&self, scope: &str) -> Result<SchemaSnapshot, MigrationError> {
        match self.tree.get(scope.as_bytes())? {
            Some(bytes) => Ok(SchemaSnapshot::from_bytes(&bytes)?),
            None => Ok(SchemaSnapshot::new(scope)),
        }
    }

    /// Replace the stored snapshot of the snapshot's scope.
    pub fn seed(&self, snapshot: &SchemaSnapshot) -> Result<(), MigrationError> {
        snapshot.validate()?;
        self.store(snapshot)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Set the row count statistic of a table.
    pub fn set_row_count(&self, scope: &str, table: &str, rows: Option<u64>) -> Result<(), MigrationError> {
        let snapshot = self.load(scope)?.with_row_count(table, rows);
        self.store(&snapshot)
    }

    /// Scopes with a stored snapshot.
    pub fn scopes(&self) -> Result<Vec<String>, MigrationError> {
        self.tree
            .iter()
            .keys()
            .map(|key| -> Result<String, MigrationError> {
                Ok(String::from_utf8_lossy(&key?).into_owned())
            })
            .collect()
    }

    fn store(&self, snapshot: &SchemaSnapshot) -> Result<(), MigrationError> {
        self.tree
            .insert(snapshot.scope().as_bytes(), snapshot.to_bytes()?)?;
        Ok(())
    }
}

impl SchemaIntrospector for SledSchemaTarget {
    fn observe(&self, scope: &str) -> Result<SchemaSnapshot, MigrationError> {
        self.load(scope).map_err(|e| MigrationError::Introspection {
            scope: scope.to_string(),
            message: e.to_string(),
        })
    }
}

impl ConnectionSource for SledSchemaTarget {
    fn connect(&self, scope: &str) -> Result<Box<dyn DdlConnection>, MigrationError> {
        Ok(Box::new(SledConnection {
            target: self.clone(),
            scope: scope.to_string(),
            staged: None,
        }))
    }
}

struct SledConnection {
    target: SledSchemaTarget,
    scope: String,
    staged: Option<SchemaSnapshot>,
}

impl DdlConnection for SledConnection {
    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn begin(&mut self) -> Result<(), MigrationError> {
        if self.staged.is_some() {
            return Err(MigrationError::Connection("transaction already open".to_string()));
        }
        self.staged = Some(self.target.load(&self.scope)?);
        Ok(())
    }

    fn apply(&mut self, operation: &MigrationOperation) -> Result<(), MigrationError> {
        let staged = self
            .staged
            .as_ref()
            .ok_or_else(|| MigrationError::Connection("no open transaction".to_string()))?;
        let mut next = staged.apply(operation)?;
        if let Change::CreateTable { table } = operation.change() {
            next = next.with_row_count(&table.name, Some(0));
        }
        debug!(scope = %self.scope, operation = %operation.describe(), "Staged operation");
        self.staged = Some(next);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), MigrationError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| MigrationError::Connection("no open transaction".to_string()))?;
        self.target.store(&staged)?;
        self.target.tree.flush()?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), MigrationError> {
        self.staged = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::operation::TableOccupancy;
    use crate::schema::{ColumnSpec, LogicalType, TableSpec};

    fn user_snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new("app")
            .with_table(TableSpec::new("user").with_column(ColumnSpec::new("id", LogicalType::Uuid)))
    }

    #[test]
    fn test_seed_and_observe() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let target = SledSchemaTarget::open(&db).unwrap();

        assert!(target.observe("app").unwrap().is_empty());
        target.seed(&user_snapshot()).unwrap();
        target.set_row_count("app", "user", Some(42)).unwrap();

        let observed = target.observe("app").unwrap();
        assert_eq!(observed, user_snapshot());
        assert_eq!(observed.table("user").unwrap().row_count, Some(42));
        assert_eq!(target.scopes().unwrap(), vec!["app".to_string()]);
    }

    #[test]
    fn test_connection_commits_staged_changes() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let target = SledSchemaTarget::open(&db).unwrap();
        target.seed(&user_snapshot()).unwrap();

        let op = MigrationOperation::new(
            "user",
            Change::AddColumn {
                column: ColumnSpec::nullable("phone", LogicalType::Text),
            },
            TableOccupancy::Unknown,
        );

        let mut conn = target.connect("app").unwrap();
        assert!(conn.apply(&op).is_err());

        conn.begin().unwrap();
        conn.apply(&op).unwrap();
        assert!(!target.load("app").unwrap().table("user").unwrap().has_column("phone"));
        conn.commit().unwrap();
        assert!(target.load("app").unwrap().table("user").unwrap().has_column("phone"));
    }
}
