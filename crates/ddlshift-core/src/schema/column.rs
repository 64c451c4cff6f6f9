//! Column definitions.

use super::types::{DefaultValue, LogicalType};
use rkyv::{Archive, Deserialize, Serialize};

/// A column definition within a table.
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
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Column data type.
    pub logical_type: LogicalType,
    /// Whether the column accepts NULL.
    #[serde(default)]
    pub nullable: bool,
    /// Default value if not provided on insert.
    #[serde(default)]
    pub default: Option<DefaultValue>,
    /// Ordinal position within the table. Not part of the structural definition.
    #[serde(default)]
    pub position: u32,
}

impl ColumnSpec {
    /// Create a new NOT NULL column.
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable: false,
            default: None,
            position: 0,
        }
    }

    /// Create a nullable column.
    pub fn nullable(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            nullable: true,
            ..Self::new(name, logical_type)
        }
    }

    /// Set the default value.
    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Set the ordinal position.
    pub fn at_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    /// Check if this column has a default value.
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// The definition without its ordinal position.
    pub fn canonical(&self) -> ColumnSpec {
        ColumnSpec {
            position: 0,
            ..self.clone()
        }
    }

    /// Compare everything except the ordinal position.
    pub fn same_definition(&self, other: &ColumnSpec) -> bool {
        self.name == other.name
            && self.logical_type == other.logical_type
            && self.nullable == other.nullable
            && self.default == other.default
    }
}
