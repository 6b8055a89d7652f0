//! Output records produced by successful processing units.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EntityId, Phase, ProcessingUnit};
use crate::hashing::{ContentHash, FieldValue};

/// The result of a successful processing unit.
///
/// Records are immutable; a rerun that computes a different hash replaces
/// the record with a new one whose `supersedes` points at the old hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Phase that produced the record.
    pub phase: Phase,
    /// Entity the record describes.
    pub entity_id: EntityId,
    /// Partition date.
    pub date: NaiveDate,
    /// Digest of the canonicalized input and payload.
    pub content_hash: ContentHash,
    /// When the payload was computed.
    pub computed_at: DateTime<Utc>,
    /// Version of the processor or source data that produced it.
    pub source_version: String,
    /// The canonical payload.
    pub payload: FieldValue,
    /// Hash of the record this one replaced, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<ContentHash>,
    /// Attempt that wrote the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<Uuid>,
}

impl OutputRecord {
    /// Creates a new output record computed now.
    #[must_use]
    pub fn new(
        unit: ProcessingUnit,
        content_hash: ContentHash,
        source_version: impl Into<String>,
        payload: FieldValue,
    ) -> Self {
        Self {
            phase: unit.phase,
            entity_id: unit.entity_id,
            date: unit.date,
            content_hash,
            computed_at: Utc::now(),
            source_version: source_version.into(),
            payload,
            supersedes: None,
            attempt_id: None,
        }
    }

    /// Sets the writing attempt.
    #[must_use]
    pub fn with_attempt(mut self, attempt_id: Uuid) -> Self {
        self.attempt_id = Some(attempt_id);
        self
    }

    /// The processing unit this record fulfils.
    #[must_use]
    pub fn unit(&self) -> ProcessingUnit {
        ProcessingUnit::new(self.phase, self.entity_id.clone(), self.date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::ContentHasher;

    #[test]
    fn test_output_record_serialize() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let payload = FieldValue::from(12.5);
        let hash = ContentHasher::default().compute(&payload).unwrap();
        let record = OutputRecord::new(
            ProcessingUnit::new(Phase::Features, "p1", date),
            hash.clone(),
            "v3",
            payload,
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["entity_id"], "p1");
        assert_eq!(json["phase"], "features");
        assert!(json.get("supersedes").is_none());

        let back: OutputRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.content_hash, hash);
        assert_eq!(back.unit(), record.unit());
    }
}
