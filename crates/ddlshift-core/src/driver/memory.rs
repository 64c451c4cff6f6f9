//! In-memory reference database.

use super::{ConnectionSource, DdlConnection, SchemaIntrospector};
use crate::migration::error::MigrationError;
use crate::migration::operation::{Change, MigrationOperation};
use crate::schema::SchemaSnapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type FailurePredicate = Arc<dyn Fn(&MigrationOperation) -> bool + Send + Sync>;

#[derive(Default)]
struct DatabaseState {
    scopes: HashMap<String, SchemaSnapshot>,
    failures: Vec<FailurePredicate>,
    unreachable: bool,
    non_transactional: bool,
    executed: Vec<String>,
    mutations: u64,
    connections: HashMap<String, usize>,
    interleaved: bool,
}

/// Schema-only database kept in memory.
///
/// Each scope is a [`SchemaSnapshot`]; transactions stage a copy and swap it
/// in on commit. Failures can be injected per operation, and the database
/// notices when two connections work on the same scope at once.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report DDL as non-transactional.
    pub fn without_transactional_ddl(self) -> Self {
        self.state.lock().non_transactional = true;
        self
    }

    /// Replace the schema of the snapshot's scope.
    pub fn seed(&self, snapshot: SchemaSnapshot) {
        self.state
            .lock()
            .scopes
            .insert(snapshot.scope().to_string(), snapshot);
    }

    /// Current schema of a scope.
    pub fn snapshot(&self, scope: &str) -> SchemaSnapshot {
        self.state
            .lock()
            .scopes
            .get(scope)
            .cloned()
            .unwrap_or_else(|| SchemaSnapshot::new(scope))
    }

    /// Set the row count statistic of a table.
    pub fn set_row_count(&self, scope: &str, table: &str, rows: Option<u64>) {
        let mut state = self.state.lock();
        if let Some(snapshot) = state.scopes.remove(scope) {
            state
                .scopes
                .insert(scope.to_string(), snapshot.with_row_count(table, rows));
        }
    }

    /// Fail every operation matching the predicate.
    pub fn fail_when(&self, predicate: impl Fn(&MigrationOperation) -> bool + Send + Sync + 'static) {
        self.state.lock().failures.push(Arc::new(predicate));
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Make introspection and connections fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Descriptions of committed operations, in commit order.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// Number of committed operations.
    pub fn mutation_count(&self) -> u64 {
        self.state.lock().mutations
    }

    /// Check if two connections ever worked on one scope at the same time.
    pub fn interleaving_detected(&self) -> bool {
        self.state.lock().interleaved
    }
}

impl SchemaIntrospector for MemoryDatabase {
    fn observe(&self, scope: &str) -> Result<SchemaSnapshot, MigrationError> {
        if self.state.lock().unreachable {
            return Err(MigrationError::Introspection {
                scope: scope.to_string(),
                message: "database unreachable".to_string(),
            });
        }
        Ok(self.snapshot(scope))
    }
}

impl ConnectionSource for MemoryDatabase {
    fn connect(&self, scope: &str) -> Result<Box<dyn DdlConnection>, MigrationError> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(MigrationError::Connection("database unreachable".to_string()));
        }
        let open = state.connections.entry(scope.to_string()).or_insert(0);
        *open += 1;
        if *open > 1 {
            state.interleaved = true;
        }
        let transactional = !state.non_transactional;
        drop(state);

        Ok(Box::new(MemoryConnection {
            db: self.clone(),
            scope: scope.to_string(),
            transactional,
            staged: None,
            pending: Vec::new(),
        }))
    }
}

struct MemoryConnection {
    db: MemoryDatabase,
    scope: String,
    transactional: bool,
    staged: Option<SchemaSnapshot>,
    pending: Vec<String>,
}

impl DdlConnection for MemoryConnection {
    fn supports_transactional_ddl(&self) -> bool {
        self.transactional
    }

    fn begin(&mut self) -> Result<(), MigrationError> {
        if self.staged.is_some() {
            return Err(MigrationError::Connection("transaction already open".to_string()));
        }
        self.staged = Some(self.db.snapshot(&self.scope));
        Ok(())
    }

    fn apply(&mut self, operation: &MigrationOperation) -> Result<(), MigrationError> {
        let staged = self
            .staged
            .as_ref()
            .ok_or_else(|| MigrationError::Connection("no open transaction".to_string()))?;

        let failures = self.db.state.lock().failures.clone();
        if failures.iter().any(|fail| fail(operation)) {
            return Err(MigrationError::Statement {
                operation: operation.describe(),
                message: "injected failure".to_string(),
            });
        }

        let mut next = staged.apply(operation)?;
        if let Change::CreateTable { table } = operation.change() {
            // Fresh tables hold no rows.
            next = next.with_row_count(&table.name, Some(0));
        }
        self.staged = Some(next);
        self.pending.push(operation.describe());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), MigrationError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| MigrationError::Connection("no open transaction".to_string()))?;
        let mut state = self.db.state.lock();
        state.scopes.insert(self.scope.clone(), staged);
        state.mutations += self.pending.len() as u64;
        state.executed.append(&mut self.pending);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), MigrationError> {
        self.staged = None;
        self.pending.clear();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.db.state.lock();
        if let Some(open) = state.connections.get_mut(&self.scope) {
            *open = open.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::operation::{OperationKind, TableOccupancy};
    use crate::schema::{ColumnSpec, LogicalType, TableSpec};

    fn seeded() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.seed(
            SchemaSnapshot::new("app")
                .with_table(TableSpec::new("user").with_column(ColumnSpec::new("id", LogicalType::Uuid))),
        );
        db
    }

    fn add_phone() -> MigrationOperation {
        MigrationOperation::new(
            "user",
            Change::AddColumn {
                column: ColumnSpec::nullable("phone", LogicalType::Text),
            },
            TableOccupancy::Empty,
        )
    }

    #[test]
    fn test_commit_and_rollback() {
        let db = seeded();
        let mut conn = db.connect("app").unwrap();

        conn.begin().unwrap();
        conn.apply(&add_phone()).unwrap();
        conn.rollback().unwrap();
        assert!(!db.snapshot("app").table("user").unwrap().has_column("phone"));
        assert_eq!(db.mutation_count(), 0);

        conn.begin().unwrap();
        conn.apply(&add_phone()).unwrap();
        conn.commit().unwrap();
        assert!(db.snapshot("app").table("user").unwrap().has_column("phone"));
        assert_eq!(db.executed(), vec!["ADD_COLUMN user.phone".to_string()]);
    }

    #[test]
    fn test_injected_failure() {
        let db = seeded();
        db.fail_when(|op| op.kind() == OperationKind::AddColumn);
        let mut conn = db.connect("app").unwrap();
        conn.begin().unwrap();
        assert!(matches!(
            conn.apply(&add_phone()),
            Err(MigrationError::Statement { .. })
        ));

        db.clear_failures();
        conn.apply(&add_phone()).unwrap();
    }

    #[test]
    fn test_unreachable() {
        let db = seeded();
        db.set_unreachable(true);
        assert!(db.observe("app").unwrap_err().is_retryable());
        assert!(db.connect("app").is_err());
    }

    #[test]
    fn test_interleaving_detection() {
        let db = seeded();
        {
            let _a = db.connect("app").unwrap();
        }
        let _b = db.connect("app").unwrap();
        assert!(!db.interleaving_detected());

        let _c = db.connect("app").unwrap();
        assert!(db.interleaving_detected());
    }
}
