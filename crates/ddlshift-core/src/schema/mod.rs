//! Schema model: the desired and observed structure of a scope.

pub mod column;
pub mod snapshot;
pub mod table;
pub mod types;

pub use column::ColumnSpec;
pub use snapshot::SchemaSnapshot;
pub use table::{ConstraintSpec, ForeignKeySpec, IndexSpec, TableConstraint, TableSpec};
pub use types::{DefaultValue, LogicalType};
