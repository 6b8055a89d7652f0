//! Reconciliation of expected entities against outputs and failures.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::{FailureCategory, FailureRecord};
use crate::core::{EntityId, OutputRecord, Phase};
use crate::errors::Result;
use crate::store::{OutputStore, UpstreamSource};

/// Full accounting of one (phase, date).
///
/// `expected = produced + failed + unaccounted` always holds; a non-zero
/// `unaccounted` is a defect regardless of how the run exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Phase checked.
    pub phase: Phase,
    /// Date checked.
    pub date: NaiveDate,
    /// Size of the expected set.
    pub expected: usize,
    /// Expected entities with an output.
    pub produced: usize,
    /// Expected entities explained by a failure record and no output.
    pub failed: usize,
    /// Expected entities with neither.
    pub unaccounted: usize,
    /// The unaccounted entity ids, sorted.
    pub unaccounted_entities: Vec<EntityId>,
    /// Entities with records that are not in the expected set.
    pub extraneous: Vec<EntityId>,
    /// Counted failures per category.
    pub failures_by_category: BTreeMap<FailureCategory, usize>,
    /// Counted failures that explain an expected absence.
    pub expected_absences: usize,
    /// Counted failures a rerun is expected to fix.
    pub correctable_failures: usize,
}

impl ReconciliationReport {
    /// True when every expected entity is accounted for.
    #[must_use]
    pub fn is_reconciled(&self) -> bool {
        self.unaccounted == 0
    }

    /// Converts to dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("phase".to_string(), serde_json::json!(self.phase));
        map.insert("date".to_string(), serde_json::json!(self.date));
        map.insert("expected".to_string(), serde_json::json!(self.expected));
        map.insert("produced".to_string(), serde_json::json!(self.produced));
        map.insert("failed".to_string(), serde_json::json!(self.failed));
        map.insert("unaccounted".to_string(), serde_json::json!(self.unaccounted));
        map.insert("reconciled".to_string(), serde_json::json!(self.is_reconciled()));
        map
    }
}

/// Pure reconciliation over already-loaded sets.
#[must_use]
pub fn reconcile_sets(
    phase: Phase,
    date: NaiveDate,
    expected: &[EntityId],
    outputs: &[OutputRecord],
    failures: &[FailureRecord],
) -> ReconciliationReport {
    let expected: BTreeSet<&EntityId> = expected.iter().collect();
    let produced: BTreeSet<&EntityId> = outputs
        .iter()
        .filter(|o| o.phase == phase && o.date == date)
        .map(|o| &o.entity_id)
        .collect();

    // An entity with both an output and a failure counts only as produced.
    let mut counted_failures: BTreeMap<&EntityId, &FailureRecord> = BTreeMap::new();
    for failure in failures.iter().filter(|f| f.phase == phase && f.date == date) {
        if !produced.contains(&failure.entity_id) {
            counted_failures.entry(&failure.entity_id).or_insert(failure);
        }
    }

    let mut report = ReconciliationReport {
        phase,
        date,
        expected: expected.len(),
        produced: 0,
        failed: 0,
        unaccounted: 0,
        unaccounted_entities: Vec::new(),
        extraneous: Vec::new(),
        failures_by_category: BTreeMap::new(),
        expected_absences: 0,
        correctable_failures: 0,
    };

    for entity in &expected {
        if produced.contains(entity) {
            report.produced += 1;
        } else if let Some(failure) = counted_failures.get(entity) {
            report.failed += 1;
            *report.failures_by_category.entry(failure.category).or_insert(0) += 1;
            if failure.category.is_expected() {
                report.expected_absences += 1;
            }
            if failure.is_correctable {
                report.correctable_failures += 1;
            }
        } else {
            report.unaccounted_entities.push((*entity).clone());
        }
    }
    report.unaccounted = report.unaccounted_entities.len();

    report.extraneous = produced
        .iter()
        .copied()
        .chain(counted_failures.keys().copied())
        .filter(|e| !expected.contains(e))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .cloned()
        .collect();

    report
}

/// Reads upstream truth and the output store to reconcile a date.
///
/// Reconciliation never writes.
#[derive(Clone)]
pub struct Reconciler {
    upstream: Arc<dyn UpstreamSource>,
    outputs: Arc<dyn OutputStore>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamSource>, outputs: Arc<dyn OutputStore>) -> Self {
        Self { upstream, outputs }
    }

    /// Reconciles the full expected set of `phase` on `date`.
    pub async fn reconcile(&self, phase: Phase, date: NaiveDate) -> Result<ReconciliationReport> {
        self.reconcile_scoped(phase, date, None).await
    }

    /// Reconciles only the entities in `scope` (all when `None`).
    pub async fn reconcile_scoped(
        &self,
        phase: Phase,
        date: NaiveDate,
        scope: Option<&[EntityId]>,
    ) -> Result<ReconciliationReport> {
        let mut expected = self.upstream.list_expected_entities(phase, date).await?;
        let mut outputs = self.outputs.list_outputs(phase, date).await?;
        let mut failures = self.outputs.list_failures(phase, date).await?;

        if let Some(scope) = scope {
            let scope: BTreeSet<&EntityId> = scope.iter().collect();
            expected.retain(|e| scope.contains(e));
            outputs.retain(|o| scope.contains(&o.entity_id));
            failures.retain(|f| scope.contains(&f.entity_id));
        }

        Ok(reconcile_sets(phase, date, &expected, &outputs, &failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProcessingUnit;
    use crate::hashing::{compute_hash, FieldValue};
    use pretty_assertions::assert_eq;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn ids(keys: &[&str]) -> Vec<EntityId> {
        keys.iter().map(|k| EntityId::from(*k)).collect()
    }

    fn output(entity: &str) -> OutputRecord {
        let payload = FieldValue::from(entity);
        OutputRecord::new(
            ProcessingUnit::new(Phase::Predictions, entity, date()),
            compute_hash(&payload).unwrap(),
            "v1",
            payload,
        )
    }

    fn failure(entity: &str, category: FailureCategory) -> FailureRecord {
        FailureRecord::new(
            ProcessingUnit::new(Phase::Predictions, entity, date()),
            "predictions",
            category,
            "no line",
        )
    }

    #[test]
    fn test_full_accounting() {
        let expected = ids(&["a", "b", "c", "d"]);
        let outputs = vec![output("a"), output("b")];
        let failures = vec![failure("c", FailureCategory::ExpectedAbsence)];

        let report = reconcile_sets(Phase::Predictions, date(), &expected, &outputs, &failures);
        assert_eq!(report.expected, 4);
        assert_eq!(report.produced, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.unaccounted, 1);
        assert_eq!(report.unaccounted_entities, ids(&["d"]));
        assert_eq!(report.expected_absences, 1);
        assert!(!report.is_reconciled());
    }

    #[test]
    fn test_output_supersedes_failure() {
        let expected = ids(&["a"]);
        let outputs = vec![output("a")];
        let failures = vec![failure("a", FailureCategory::ProcessingError)];

        let report = reconcile_sets(Phase::Predictions, date(), &expected, &outputs, &failures);
        assert_eq!(report.produced, 1);
        assert_eq!(report.failed, 0);
        assert!(report.failures_by_category.is_empty());
        assert!(report.is_reconciled());
    }

    #[test]
    fn test_extraneous_do_not_offset_unaccounted() {
        let expected = ids(&["a", "b"]);
        let outputs = vec![output("a"), output("stale")];
        let failures = vec![failure("gone", FailureCategory::ProcessingError)];

        let report = reconcile_sets(Phase::Predictions, date(), &expected, &outputs, &failures);
        assert_eq!(report.unaccounted, 1);
        assert_eq!(report.extraneous, ids(&["gone", "stale"]));
    }

    #[test]
    fn test_empty_expected_set_is_reconciled() {
        let report = reconcile_sets(Phase::Predictions, date(), &[], &[], &[]);
        assert!(report.is_reconciled());
        assert_eq!(report.to_dict().get("reconciled").unwrap(), true);
    }
}
