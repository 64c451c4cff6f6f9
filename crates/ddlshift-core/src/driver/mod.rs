//! Collaborator interfaces between the engine and a database.
//!
//! The engine never talks to a database directly. It reads the live schema
//! through a [`SchemaIntrospector`], the target schema through a
//! [`ModelSource`], and executes operations on a [`DdlConnection`] handed
//! out by a [`ConnectionSource`].

mod memory;

pub use memory::MemoryDatabase;

use crate::migration::error::MigrationError;
use crate::migration::operation::MigrationOperation;
use crate::schema::SchemaSnapshot;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Reads the live schema of a scope.
pub trait SchemaIntrospector: Send + Sync {
    /// Observe the current schema. Failures are `Introspection` errors.
    fn observe(&self, scope: &str) -> Result<SchemaSnapshot, MigrationError>;
}

/// Supplies the desired schema of a scope.
pub trait ModelSource: Send + Sync {
    /// The schema the scope should have.
    fn desired(&self, scope: &str) -> Result<SchemaSnapshot, MigrationError>;
}

/// A connection owned by one plan execution.
pub trait DdlConnection: Send {
    /// Check if DDL statements can be rolled back inside a transaction.
    fn supports_transactional_ddl(&self) -> bool;

    /// Open a transaction.
    fn begin(&mut self) -> Result<(), MigrationError>;

    /// Execute one operation inside the open transaction.
    fn apply(&mut self, operation: &MigrationOperation) -> Result<(), MigrationError>;

    /// Commit the open transaction.
    fn commit(&mut self) -> Result<(), MigrationError>;

    /// Abort the open transaction.
    fn rollback(&mut self) -> Result<(), MigrationError>;
}

/// Hands out exclusive DDL connections.
pub trait ConnectionSource: Send + Sync {
    /// Open a connection for executing migrations on a scope.
    fn connect(&self, scope: &str) -> Result<Box<dyn DdlConnection>, MigrationError>;
}

/// Model source backed by fixed snapshots, one per scope.
#[derive(Default)]
pub struct StaticModelSource {
    models: RwLock<HashMap<String, SchemaSnapshot>>,
}

impl StaticModelSource {
    /// Create an empty model source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a snapshot, keyed by its scope.
    pub fn with_model(self, snapshot: SchemaSnapshot) -> Self {
        self.set(snapshot);
        self
    }

    /// Replace the desired snapshot of its scope.
    pub fn set(&self, snapshot: SchemaSnapshot) {
        self.models
            .write()
            .insert(snapshot.scope().to_string(), snapshot);
    }
}

impl ModelSource for StaticModelSource {
    fn desired(&self, scope: &str) -> Result<SchemaSnapshot, MigrationError> {
        self.models.read().get(scope).cloned().ok_or_else(|| {
            MigrationError::Configuration(format!("no model declared for scope '{}'", scope))
        })
    }
}
