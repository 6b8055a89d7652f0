//! Merge rules for the outputs and failures of one (phase, date).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::MergeOutcome;
use crate::core::{EntityId, OutputRecord};
use crate::ledger::FailureRecord;

/// Outputs and outstanding failures of one partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct PartitionLedger {
    #[serde(default)]
    pub(crate) outputs: BTreeMap<EntityId, OutputRecord>,
    #[serde(default)]
    pub(crate) failures: Vec<FailureRecord>,
}

impl PartitionLedger {
    /// Merge-by-hash. Drops outstanding failures of the same entity.
    pub(crate) fn merge(&mut self, mut record: OutputRecord) -> MergeOutcome {
        self.failures.retain(|f| f.entity_id != record.entity_id);

        match self.outputs.get(&record.entity_id) {
            Some(existing) if existing.content_hash == record.content_hash => MergeOutcome::Unchanged,
            Some(existing) => {
                let previous = existing.content_hash.clone();
                record.supersedes = Some(previous.clone());
                self.outputs.insert(record.entity_id.clone(), record);
                MergeOutcome::Superseded { previous }
            }
            None => {
                self.outputs.insert(record.entity_id.clone(), record);
                MergeOutcome::Inserted
            }
        }
    }

    /// Records a failure keyed by (processor, entity). Returns false when
    /// nothing was written.
    pub(crate) fn record_failure(&mut self, record: FailureRecord) -> bool {
        if self.outputs.contains_key(&record.entity_id) {
            return false;
        }
        let existing = self
            .failures
            .iter_mut()
            .find(|f| f.processor == record.processor && f.entity_id == record.entity_id);
        match existing {
            Some(existing) if existing.same_cause(&record) => false,
            Some(existing) => {
                *existing = record;
                true
            }
            None => {
                self.failures.push(record);
                true
            }
        }
    }
}
