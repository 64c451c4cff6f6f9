//! Risk classification for migration operations.
//!
//! Classification is a pure function of the operation payload and the
//! occupancy of the target table. Type conversions are judged through a
//! [`TypeCapabilities`] table, which a SQL dialect may override.

use super::error::RiskLevel;
use super::operation::{Change, TableOccupancy};
use crate::schema::LogicalType;
use std::collections::HashMap;

/// How a value survives a type conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Conversion {
    /// The types are the same for the dialect.
    Identical,
    /// Every source value is representable in the target.
    Widening,
    /// Some source values may be truncated, rounded or rejected.
    Lossy,
}

/// Table of type conversions for a dialect.
///
/// The portable defaults only declare a conversion widening when it is
/// widening on every mainstream engine. Dialects register overrides for
/// specific `(from, to)` pairs.
#[derive(Debug, Clone, Default)]
pub struct TypeCapabilities {
    overrides: HashMap<(LogicalType, LogicalType), Conversion>,
}

impl TypeCapabilities {
    /// The portable capability table.
    pub fn portable() -> Self {
        Self::default()
    }

    /// Override the conversion for one type pair.
    pub fn with_override(mut self, from: LogicalType, to: LogicalType, conversion: Conversion) -> Self {
        self.overrides.insert((from, to), conversion);
        self
    }

    /// Classify the conversion from one type to another.
    pub fn conversion(&self, from: LogicalType, to: LogicalType) -> Conversion {
        if let Some(conversion) = self.overrides.get(&(from, to)) {
            return *conversion;
        }
        if from == to {
            return Conversion::Identical;
        }
        if portable_widening(from, to) {
            Conversion::Widening
        } else {
            Conversion::Lossy
        }
    }
}

/// Digits left of the decimal point that each integer type needs.
fn integer_digits(ty: LogicalType) -> Option<u8> {
    match ty {
        LogicalType::SmallInt => Some(5),
        LogicalType::Int => Some(10),
        LogicalType::BigInt => Some(19),
        _ => None,
    }
}

fn integer_rank(ty: LogicalType) -> Option<u8> {
    match ty {
        LogicalType::SmallInt => Some(0),
        LogicalType::Int => Some(1),
        LogicalType::BigInt => Some(2),
        _ => None,
    }
}

fn portable_widening(from: LogicalType, to: LogicalType) -> bool {
    use LogicalType::*;

    if let (Some(a), Some(b)) = (integer_rank(from), integer_rank(to)) {
        return a < b;
    }

    match (from, to) {
        (SmallInt | Int, Double) => true,
        (Real, Double) => true,
        (Date, Timestamp) => true,
        (Varchar { length: a }, Varchar { length: b }) => b >= a,
        (Varchar { .. }, Text) => true,
        (
            Decimal {
                precision: p1,
                scale: s1,
            },
            Decimal {
                precision: p2,
                scale: s2,
            },
        ) => s2 >= s1 && p2.saturating_sub(s2) >= p1.saturating_sub(s1),
        (SmallInt | Int | BigInt, Decimal { precision, scale }) => integer_digits(from)
            .is_some_and(|digits| precision.saturating_sub(scale) >= digits),
        _ => false,
    }
}

/// Assigns a [`RiskLevel`] to each change.
#[derive(Debug, Clone, Default)]
pub struct RiskClassifier {
    capabilities: TypeCapabilities,
}

impl RiskClassifier {
    /// Create a classifier over a dialect's capability table.
    pub fn new(capabilities: TypeCapabilities) -> Self {
        Self { capabilities }
    }

    /// The capability table in use.
    pub fn capabilities(&self) -> &TypeCapabilities {
        &self.capabilities
    }

    /// Classify a change. Unknown occupancy is treated as populated.
    pub fn classify(&self, change: &Change, occupancy: TableOccupancy) -> RiskLevel {
        match change {
            Change::CreateTable { .. } | Change::AddIndex { .. } => RiskLevel::Safe,

            Change::AddConstraint { constraint } => {
                if constraint.is_unique() && !occupancy.is_empty() {
                    RiskLevel::Medium
                } else {
                    RiskLevel::Safe
                }
            }

            Change::AddColumn { column } => {
                if column.nullable || column.has_default() || occupancy.is_empty() {
                    RiskLevel::Safe
                } else {
                    RiskLevel::Medium
                }
            }

            Change::AlterColumnType { before, after } => {
                match self.capabilities.conversion(before.logical_type, after.logical_type) {
                    Conversion::Identical => RiskLevel::Safe,
                    Conversion::Widening => RiskLevel::Medium,
                    Conversion::Lossy => RiskLevel::High,
                }
            }

            Change::AlterColumnNullability { before, after } => {
                let tightening = before.nullable && !after.nullable;
                if tightening && !after.has_default() {
                    RiskLevel::Medium
                } else {
                    RiskLevel::Safe
                }
            }

            Change::DropColumn { .. } | Change::DropTable { .. } => RiskLevel::High,

            Change::DropConstraint { dependents, .. } => {
                if dependents.is_empty() {
                    RiskLevel::Medium
                } else {
                    RiskLevel::High
                }
            }

            Change::DropIndex { .. } => RiskLevel::Medium,
        }
    }
}
