//! The phase processor seam.
//!
//! The statistical work inside a phase is external; the coordinator only
//! sees what a processor produced (or why it could not) per entity.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::core::{EntityId, Phase};
use crate::errors::{PhaseflowError, Result};
use crate::hashing::FieldValue;
use crate::ledger::FailureCategory;

/// What a processor determined for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutput {
    /// An output was computed.
    Produced {
        /// The computed payload.
        payload: FieldValue,
        /// The input it was computed from, if the processor reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<FieldValue>,
        /// Version of the computation or source data.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_version: Option<String>,
    },
    /// No output, with an explanation.
    Absent {
        /// Why.
        category: FailureCategory,
        /// Human readable reason.
        reason: String,
        /// Whether a rerun could fix it.
        #[serde(default)]
        correctable: bool,
    },
}

impl UnitOutput {
    /// A produced payload without input or version.
    #[must_use]
    pub fn produced(payload: impl Into<FieldValue>) -> Self {
        Self::Produced {
            payload: payload.into(),
            input: None,
            source_version: None,
        }
    }

    /// A legitimate, non-correctable absence.
    #[must_use]
    pub fn expected_absence(reason: impl Into<String>) -> Self {
        Self::Absent {
            category: FailureCategory::ExpectedAbsence,
            reason: reason.into(),
            correctable: false,
        }
    }

    /// Too little data to compute.
    #[must_use]
    pub fn insufficient_data(reason: impl Into<String>) -> Self {
        Self::Absent {
            category: FailureCategory::InsufficientData,
            reason: reason.into(),
            correctable: true,
        }
    }
}

/// Result of processing one entity.
#[derive(Debug)]
pub struct EntityResult {
    /// The entity.
    pub entity_id: EntityId,
    /// Output, absence, or the error that prevented either.
    pub outcome: Result<UnitOutput>,
}

impl EntityResult {
    /// A successful outcome.
    #[must_use]
    pub fn ok(entity_id: impl Into<EntityId>, output: UnitOutput) -> Self {
        Self {
            entity_id: entity_id.into(),
            outcome: Ok(output),
        }
    }

    /// A failed outcome.
    #[must_use]
    pub fn err(entity_id: impl Into<EntityId>, error: PhaseflowError) -> Self {
        Self {
            entity_id: entity_id.into(),
            outcome: Err(error),
        }
    }
}

/// Computes one phase for one date.
#[async_trait]
pub trait PhaseProcessor: Send + Sync {
    /// Processor name recorded on failure records.
    fn name(&self) -> &str;

    /// Version recorded on outputs that do not carry their own.
    fn source_version(&self) -> &str {
        "unversioned"
    }

    /// Date-level dependency check before any entity is processed.
    ///
    /// A `DependencyMissing` error here fans out into one failure record
    /// per expected entity.
    async fn prepare(&self, _phase: Phase, _date: NaiveDate) -> Result<()> {
        Ok(())
    }

    /// Processes `entities` for `date`, returning one result per entity.
    ///
    /// A date-level `Err` applies to every entity of the call.
    async fn process(&self, phase: Phase, date: NaiveDate, entities: &[EntityId]) -> Result<Vec<EntityResult>>;
}
