//! Entity identifiers and processing units.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Phase;

const DATE_AGGREGATE: &str = "__date__";

/// Identifies the entity a processing unit is about.
///
/// Serializes as a plain string; the whole-date aggregate uses a reserved
/// sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityId {
    /// A concrete key such as a player or team id.
    Key(String),
    /// The whole-date aggregate unit.
    DateAggregate,
}

impl EntityId {
    /// Creates a concrete entity id.
    #[must_use]
    pub fn key(id: impl Into<String>) -> Self {
        Self::from(id.into())
    }

    /// Returns true for the whole-date sentinel.
    #[must_use]
    pub fn is_date_aggregate(&self) -> bool {
        matches!(self, Self::DateAggregate)
    }

    /// The string form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Key(k) => k,
            Self::DateAggregate => DATE_AGGREGATE,
        }
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        if value == DATE_AGGREGATE {
            Self::DateAggregate
        } else {
            Self::Key(value)
        }
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        match value {
            EntityId::Key(k) => k,
            EntityId::DateAggregate => DATE_AGGREGATE.to_string(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The smallest schedulable unit: one entity of one phase on one date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessingUnit {
    /// Phase producing the output.
    pub phase: Phase,
    /// Entity the output is about.
    pub entity_id: EntityId,
    /// Partition date.
    pub date: NaiveDate,
}

impl ProcessingUnit {
    /// Creates a new processing unit.
    #[must_use]
    pub fn new(phase: Phase, entity_id: impl Into<EntityId>, date: NaiveDate) -> Self {
        Self {
            phase,
            entity_id: entity_id.into(),
            date,
        }
    }
}

impl fmt::Display for ProcessingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.phase, self.date, self.entity_id)
    }
}
