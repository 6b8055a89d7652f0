//! Per-entity failure records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::core::{EntityId, Phase, ProcessingUnit};
use crate::errors::PhaseflowError;

/// Why an expected output was not produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    /// Upstream exists but holds too little data to compute.
    InsufficientData,
    /// An upstream artifact the computation needs is missing.
    MissingUpstreamDependency,
    /// The computation itself failed.
    ProcessingError,
    /// No output is expected for this entity on this date.
    ExpectedAbsence,
}

impl FailureCategory {
    /// Returns true for categories that explain an absence as expected
    /// rather than erroneous.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::ExpectedAbsence | Self::InsufficientData)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "INSUFFICIENT_DATA"),
            Self::MissingUpstreamDependency => write!(f, "MISSING_UPSTREAM_DEPENDENCY"),
            Self::ProcessingError => write!(f, "PROCESSING_ERROR"),
            Self::ExpectedAbsence => write!(f, "EXPECTED_ABSENCE"),
        }
    }
}

/// Durable record of why one expected unit has no output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Phase the unit belongs to.
    pub phase: Phase,
    /// Name of the processor that recorded the failure.
    pub processor: String,
    /// Entity without output.
    pub entity_id: EntityId,
    /// Partition date.
    pub date: NaiveDate,
    /// Failure category.
    pub category: FailureCategory,
    /// Human readable reason.
    pub reason: String,
    /// Whether a later rerun is expected to fix it.
    pub is_correctable: bool,
    /// Upstream artifacts whose absence caused the failure.
    #[serde(default)]
    pub missing_dependency_refs: Vec<String>,
    /// When the failure was recorded.
    pub recorded_at: DateTime<Utc>,
    /// Attempt that recorded it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<Uuid>,
}

impl FailureRecord {
    /// Creates a failure record.
    #[must_use]
    pub fn new(
        unit: ProcessingUnit,
        processor: impl Into<String>,
        category: FailureCategory,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            phase: unit.phase,
            processor: processor.into(),
            entity_id: unit.entity_id,
            date: unit.date,
            category,
            reason: reason.into(),
            is_correctable: false,
            missing_dependency_refs: Vec::new(),
            recorded_at: Utc::now(),
            attempt_id: None,
        }
    }

    /// Builds the record an entity-level error maps to.
    ///
    /// `DependencyMissing` becomes a correctable missing-dependency failure,
    /// an exhausted transient error a correctable processing error, anything
    /// else a non-correctable processing error.
    #[must_use]
    pub fn from_error(unit: ProcessingUnit, processor: impl Into<String>, error: &PhaseflowError) -> Self {
        match error {
            PhaseflowError::DependencyMissing {
                refs,
                message,
                correctable,
            } => Self::new(unit, processor, FailureCategory::MissingUpstreamDependency, message.clone())
                .with_refs(refs.clone())
                .correctable(*correctable),
            err if err.is_transient() => {
                Self::new(unit, processor, FailureCategory::ProcessingError, err.to_string())
                    .correctable(true)
            }
            err => Self::new(unit, processor, FailureCategory::ProcessingError, err.to_string()),
        }
    }

    /// Sets whether the failure is correctable.
    #[must_use]
    pub fn correctable(mut self, correctable: bool) -> Self {
        self.is_correctable = correctable;
        self
    }

    /// Sets the missing dependency references.
    #[must_use]
    pub fn with_refs(mut self, refs: Vec<String>) -> Self {
        self.missing_dependency_refs = refs;
        self
    }

    /// Sets the recording attempt.
    #[must_use]
    pub fn with_attempt(mut self, attempt_id: Uuid) -> Self {
        self.attempt_id = Some(attempt_id);
        self
    }

    /// The unit this record explains.
    #[must_use]
    pub fn unit(&self) -> ProcessingUnit {
        ProcessingUnit::new(self.phase, self.entity_id.clone(), self.date)
    }

    /// Returns true when `other` describes the same failure of the same
    /// unit, ignoring timestamps and attempt ids.
    #[must_use]
    pub fn same_cause(&self, other: &Self) -> bool {
        self.phase == other.phase
            && self.processor == other.processor
            && self.entity_id == other.entity_id
            && self.date == other.date
            && self.category == other.category
            && self.reason == other.reason
            && self.is_correctable == other.is_correctable
            && self.missing_dependency_refs == other.missing_dependency_refs
    }
}

/// A single cause that applies to many entities of one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureCause {
    /// Phase of the affected units.
    pub phase: Phase,
    /// Processor recording the failures.
    pub processor: String,
    /// Partition date.
    pub date: NaiveDate,
    /// Category for every fanned-out record.
    pub category: FailureCategory,
    /// Shared reason.
    pub reason: String,
    /// Shared correctability.
    pub is_correctable: bool,
    /// Shared dependency references.
    pub missing_dependency_refs: Vec<String>,
}

impl FailureCause {
    /// A correctable upstream gap.
    #[must_use]
    pub fn missing_dependency(
        phase: Phase,
        processor: impl Into<String>,
        date: NaiveDate,
        refs: Vec<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            processor: processor.into(),
            date,
            category: FailureCategory::MissingUpstreamDependency,
            reason: reason.into(),
            is_correctable: true,
            missing_dependency_refs: refs,
        }
    }
}

/// Expands one cause into one record per affected entity.
///
/// Failures are never recorded as a single whole-date placeholder; every
/// expected entity gets its own record so reconciliation can account for it.
#[must_use]
pub fn fan_out(cause: &FailureCause, entities: &[EntityId]) -> Vec<FailureRecord> {
    let recorded_at = Utc::now();
    entities
        .iter()
        .map(|entity| FailureRecord {
            phase: cause.phase,
            processor: cause.processor.clone(),
            entity_id: entity.clone(),
            date: cause.date,
            category: cause.category,
            reason: cause.reason.clone(),
            is_correctable: cause.is_correctable,
            missing_dependency_refs: cause.missing_dependency_refs.clone(),
            recorded_at,
            attempt_id: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransientKind;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    #[test]
    fn test_fan_out_one_record_per_entity() {
        let cause = FailureCause::missing_dependency(
            Phase::Features,
            "features",
            date(),
            vec!["analytics".to_string()],
            "analytics output missing",
        );
        let entities: Vec<EntityId> = ["a", "b", "c"].into_iter().map(EntityId::from).collect();
        let records = fan_out(&cause, &entities);

        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.is_correctable));
        assert!(records
            .iter()
            .all(|r| r.missing_dependency_refs == vec!["analytics".to_string()]));
        assert_eq!(records[1].entity_id, EntityId::from("b"));
    }

    #[test]
    fn test_from_error_mapping() {
        let unit = || ProcessingUnit::new(Phase::Features, "p1", date());

        let dep = PhaseflowError::dependency_missing(vec!["odds".into()], "no odds");
        let record = FailureRecord::from_error(unit(), "features", &dep);
        assert_eq!(record.category, FailureCategory::MissingUpstreamDependency);
        assert!(record.is_correctable);
        assert_eq!(record.missing_dependency_refs, vec!["odds".to_string()]);

        let dq = PhaseflowError::DataQuality("minutes negative".into());
        let record = FailureRecord::from_error(unit(), "features", &dq);
        assert_eq!(record.category, FailureCategory::ProcessingError);
        assert!(!record.is_correctable);

        let transient = PhaseflowError::transient(TransientKind::Timeout, "slow");
        let record = FailureRecord::from_error(unit(), "features", &transient);
        assert_eq!(record.category, FailureCategory::ProcessingError);
        assert!(record.is_correctable);
    }

    #[test]
    fn test_same_cause_ignores_timestamps() {
        let unit = ProcessingUnit::new(Phase::Grading, "p1", date());
        let a = FailureRecord::new(unit.clone(), "grading", FailureCategory::ExpectedAbsence, "dnp");
        let mut b = a.clone().with_attempt(Uuid::new_v4());
        b.recorded_at = Utc::now();
        assert!(a.same_cause(&b));

        let c = FailureRecord::new(unit, "grading", FailureCategory::ExpectedAbsence, "postponed");
        assert!(!a.same_cause(&c));
    }

    #[test]
    fn test_category_serialization() {
        assert_eq!(
            serde_json::to_string(&FailureCategory::MissingUpstreamDependency).unwrap(),
            "\"MISSING_UPSTREAM_DEPENDENCY\""
        );
        assert!(FailureCategory::ExpectedAbsence.is_expected());
        assert!(!FailureCategory::ProcessingError.is_expected());
    }
}
