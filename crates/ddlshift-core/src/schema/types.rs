//! Logical column types and default values.

use rkyv::{Archive, Deserialize, Serialize};

/// Engine-independent column type.
///
/// Dialect renderers map these onto concrete DDL types; the risk classifier
/// reasons about conversions between them through a capability table.
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
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    /// Boolean value.
    Bool,
    /// 16-bit signed integer.
    SmallInt,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    BigInt,
    /// 32-bit floating point.
    Real,
    /// 64-bit floating point.
    Double,
    /// Fixed-precision decimal.
    Decimal {
        /// Total number of digits.
        precision: u8,
        /// Number of digits after the decimal point.
        scale: u8,
    },
    /// Length-bounded string.
    Varchar {
        /// Maximum length in characters.
        length: u32,
    },
    /// Unbounded string.
    Text,
    /// Binary data.
    Bytes,
    /// Calendar date.
    Date,
    /// Timestamp with microsecond precision.
    Timestamp,
    /// UUID (128-bit identifier).
    Uuid,
    /// JSON document.
    Json,
}

impl LogicalType {
    /// Create a bounded string type.
    pub fn varchar(length: u32) -> Self {
        LogicalType::Varchar { length }
    }

    /// Create a decimal type.
    pub fn decimal(precision: u8, scale: u8) -> Self {
        LogicalType::Decimal { precision, scale }
    }

    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            LogicalType::SmallInt
                | LogicalType::Int
                | LogicalType::BigInt
                | LogicalType::Real
                | LogicalType::Double
                | LogicalType::Decimal { .. }
        )
    }

    /// Check if this type is a string type.
    pub fn is_string(&self) -> bool {
        matches!(self, LogicalType::Varchar { .. } | LogicalType::Text)
    }
}

impl std::fmt::Display for LogicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogicalType::Bool => write!(f, "bool"),
            LogicalType::SmallInt => write!(f, "smallint"),
            LogicalType::Int => write!(f, "int"),
            LogicalType::BigInt => write!(f, "bigint"),
            LogicalType::Real => write!(f, "real"),
            LogicalType::Double => write!(f, "double"),
            LogicalType::Decimal { precision, scale } => {
                write!(f, "decimal({}, {})", precision, scale)
            }
            LogicalType::Varchar { length } => write!(f, "varchar({})", length),
            LogicalType::Text => write!(f, "text"),
            LogicalType::Bytes => write!(f, "bytes"),
            LogicalType::Date => write!(f, "date"),
            LogicalType::Timestamp => write!(f, "timestamp"),
            LogicalType::Uuid => write!(f, "uuid"),
            LogicalType::Json => write!(f, "json"),
        }
    }
}

/// Default value for a column.
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
pub enum DefaultValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// String value.
    String(String),
    /// Current timestamp (evaluated at insert time).
    CurrentTimestamp,
    /// Custom expression, passed through to the dialect verbatim.
    Expression(String),
}

impl std::fmt::Display for DefaultValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefaultValue::Null => write!(f, "NULL"),
            DefaultValue::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            DefaultValue::Int(i) => write!(f, "{}", i),
            DefaultValue::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            DefaultValue::CurrentTimestamp => write!(f, "CURRENT_TIMESTAMP"),
            DefaultValue::Expression(e) => write!(f, "{}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_checks() {
        assert!(LogicalType::Int.is_numeric());
        assert!(LogicalType::decimal(10, 2).is_numeric());
        assert!(!LogicalType::Text.is_numeric());

        assert!(LogicalType::varchar(50).is_string());
        assert!(LogicalType::Text.is_string());
        assert!(!LogicalType::Bytes.is_string());
    }

    #[test]
    fn test_display() {
        assert_eq!(LogicalType::varchar(50).to_string(), "varchar(50)");
        assert_eq!(LogicalType::decimal(12, 4).to_string(), "decimal(12, 4)");
        assert_eq!(DefaultValue::String("o'neil".into()).to_string(), "'o''neil'");
        assert_eq!(DefaultValue::Bool(true).to_string(), "TRUE");
    }
}
