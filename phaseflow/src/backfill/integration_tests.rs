//! End-to-end backfill behavior against in-memory collaborators.

use chrono::{NaiveDate, Utc};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::*;
use crate::cancellation::CancellationToken;
use crate::core::{DateStatus, EntityId, Phase, RunStatus};
use crate::errors::PhaseflowError;
use crate::events::names;
use crate::gate::{DependencySpec, GateDecision};
use crate::hashing::ContentHash;
use crate::ledger::FailureCategory;
use crate::store::{OutputStore, RunHistoryStore};
use crate::testing::{
    assert_backfill_succeeded, assert_date_status, assert_fully_accounted, assert_interrupted, EntityScript,
    FixtureUpstream, Harness, ScriptedProcessor,
};
use crate::utils::DateRange;

const TABLE: &str = "raw.box_scores";
const PHASE: Phase = Phase::Analytics;

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

fn players(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("p{i:02}")).collect()
}

fn deps() -> Vec<DependencySpec> {
    vec![DependencySpec::new(TABLE).with_expected_min(100).hard_required()]
}

fn harness(range: DateRange, entities: &[String], processor: ScriptedProcessor) -> Harness {
    let upstream = FixtureUpstream::new().with_range(PHASE, range, TABLE, 250, entities);
    Harness::new(PHASE, upstream, processor, deps())
}

async fn run(h: &Harness, start: NaiveDate, end: NaiveDate, options: &BackfillOptions) -> BackfillReport {
    h.coordinator
        .run_backfill(PHASE, start, end, options, &CancellationToken::new())
        .await
        .unwrap()
}

async fn hashes(h: &Harness, date: NaiveDate) -> BTreeMap<EntityId, ContentHash> {
    h.store
        .list_outputs(PHASE, date)
        .await
        .unwrap()
        .into_iter()
        .map(|o| (o.entity_id, o.content_hash))
        .collect()
}

#[tokio::test]
async fn test_transient_entities_recover_on_first_retry() {
    let entities = players(10);
    let processor = ScriptedProcessor::new("analytics")
        .with_script("p08", EntityScript::TransientThenProduce(1))
        .with_script("p09", EntityScript::TransientThenProduce(1));
    let h = harness(DateRange::single(d(15)), &entities, processor);

    let report = run(&h, d(15), d(15), &BackfillOptions::new()).await;

    assert_backfill_succeeded(&report);
    let outcome = report.outcome(d(15)).unwrap();
    let rec = outcome.reconciliation.as_ref().unwrap();
    assert_eq!((rec.expected, rec.produced, rec.failed, rec.unaccounted), (10, 10, 0, 0));
    assert_eq!(outcome.retries, 1);
    assert_eq!(h.processor.attempts("p00", d(15)), 1);
    assert_eq!(h.processor.attempts("p08", d(15)), 2);

    // The retry only re-requested the two failing entities.
    let calls = h.processor.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1, vec![EntityId::from("p08"), EntityId::from("p09")]);
    assert!(h.store.list_failures(PHASE, d(15)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expected_absence_is_accounted() {
    let entities = players(5);
    let processor =
        ScriptedProcessor::new("analytics").with_script("p03", EntityScript::ExpectedAbsence("inactive".into()));
    let h = harness(DateRange::single(d(15)), &entities, processor);

    let report = run(&h, d(15), d(15), &BackfillOptions::new()).await;

    assert_backfill_succeeded(&report);
    let rec = report.outcome(d(15)).unwrap().reconciliation.clone().unwrap();
    assert_eq!((rec.produced, rec.failed, rec.unaccounted), (4, 1, 0));
    assert_eq!(rec.expected_absences, 1);

    let failures = h.store.list_failures(PHASE, d(15)).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].entity_id, EntityId::from("p03"));
    assert_eq!(failures[0].category, FailureCategory::ExpectedAbsence);
    assert!(!failures[0].is_correctable);
    assert_eq!(failures[0].processor, "analytics");
}

#[tokio::test]
async fn test_absent_upstream_blocks_without_writes() {
    let upstream = FixtureUpstream::new().with_expected(PHASE, d(15), players(3));
    let h = Harness::new(PHASE, upstream, ScriptedProcessor::new("analytics"), deps());

    let report = run(&h, d(15), d(15), &BackfillOptions::new()).await;

    assert_date_status(&report, d(15), DateStatus::Blocked);
    assert_eq!(report.result, BackfillResult::Partial { dates: vec![d(15)] });
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.attempt.status, RunStatus::Blocked);
    let verdict = report.outcome(d(15)).unwrap().verdict.clone().unwrap();
    assert_eq!(verdict.decision, GateDecision::Block);

    assert_eq!(h.store.write_count(), 0);
    assert!(h.processor.calls().is_empty());
    assert_eq!(h.events.count(names::GATE_BLOCK), 1);
    assert_eq!(h.events.count(names::PHASE_COMPLETED), 0);
    let entry = h.store.entry(PHASE, d(15)).await.unwrap().unwrap();
    assert_eq!(entry.status, RunStatus::Blocked);
}

#[tokio::test]
async fn test_interrupted_backfill_resumes_after_cursor() {
    let range = DateRange::new(d(1), d(10)).unwrap();
    let h = harness(range, &players(4), ScriptedProcessor::new("analytics"));
    let cancel = CancellationToken::new();
    h.processor.cancel_after(d(4), cancel.clone());

    let first = h
        .coordinator
        .run_backfill(PHASE, d(1), d(10), &BackfillOptions::new(), &cancel)
        .await
        .unwrap();

    assert_interrupted(&first);
    assert_eq!(first.outcomes.len(), 4);
    assert_eq!(first.attempt.checkpoint_cursor, Some(d(4)));
    assert_eq!(first.attempt.status, RunStatus::Pending);
    assert!(h.store.list_outputs(PHASE, d(5)).await.unwrap().is_empty());

    let mut committed = Vec::new();
    for day in 1..=4 {
        committed.push(hashes(&h, d(day)).await);
    }
    let writes_before = h.store.write_count();
    h.processor.reset();

    let second = run(&h, d(1), d(10), &BackfillOptions::new()).await;

    assert_backfill_succeeded(&second);
    assert_eq!(second.attempt.attempt_id, first.attempt.attempt_id);
    assert_eq!(second.attempt.checkpoint_cursor, Some(d(10)));
    assert_eq!(h.processor.dates_processed(), (5..=10).map(d).collect::<Vec<_>>());
    for day in 1..=4 {
        assert_date_status(&second, d(day), DateStatus::Skipped);
        assert_eq!(hashes(&h, d(day)).await, committed[day as usize - 1]);
    }
    for day in 5..=10 {
        assert_eq!(hashes(&h, d(day)).await.len(), 4);
    }
    assert_eq!(h.store.write_count(), writes_before + 6 * 4);
    assert_fully_accounted(&second);
}

#[tokio::test]
async fn test_rerun_over_unchanged_data_writes_nothing() {
    let range = DateRange::new(d(1), d(3)).unwrap();
    let h = harness(range, &players(5), ScriptedProcessor::new("analytics"));

    let first = run(&h, d(1), d(3), &BackfillOptions::new()).await;
    assert_backfill_succeeded(&first);
    let writes = h.store.write_count();
    assert_eq!(writes, 15);
    assert_eq!(first.total_writes(), 15);

    // Completed attempt: nothing to do.
    h.processor.reset();
    let noop = run(&h, d(1), d(3), &BackfillOptions::new()).await;
    assert_backfill_succeeded(&noop);
    assert!(h.processor.calls().is_empty());

    // Forced rerun recomputes everything but every merge is a no-op.
    let forced = run(&h, d(1), d(3), &BackfillOptions::new().with_force(true)).await;
    assert_backfill_succeeded(&forced);
    assert_eq!(h.processor.dates_processed().len(), 3);
    assert_eq!(h.store.write_count(), writes);
    assert_eq!(forced.total_writes(), 0);
    assert!(forced.outcomes.iter().all(|o| o.writes.unchanged == 5));
}

#[tokio::test]
async fn test_changed_payload_supersedes() {
    let h = harness(DateRange::single(d(2)), &players(3), ScriptedProcessor::new("analytics"));
    run(&h, d(2), d(2), &BackfillOptions::new()).await;
    let before = hashes(&h, d(2)).await;

    h.processor.set_version(2);
    let report = run(&h, d(2), d(2), &BackfillOptions::new().with_force(true)).await;

    assert_eq!(report.outcome(d(2)).unwrap().writes.superseded, 3);
    let outputs = h.store.list_outputs(PHASE, d(2)).await.unwrap();
    for output in outputs {
        assert_eq!(output.supersedes.as_ref(), before.get(&output.entity_id));
    }
}

#[tokio::test]
async fn test_retry_bound_and_classification() {
    let processor = ScriptedProcessor::new("analytics")
        .with_script("p00", EntityScript::AlwaysTransient)
        .with_script("p01", EntityScript::DataQuality("negative minutes".into()))
        .with_script("p02", EntityScript::MissingDependency(vec!["raw.injuries".into()]));
    let h = harness(DateRange::single(d(5)), &players(4), processor);

    let report = run(&h, d(5), d(5), &BackfillOptions::new()).await;

    assert_eq!(h.processor.attempts("p00", d(5)), 4);
    assert_eq!(h.processor.attempts("p01", d(5)), 1);
    assert_eq!(h.processor.attempts("p02", d(5)), 1);
    assert_eq!(report.outcome(d(5)).unwrap().retries, 3);

    let failures: BTreeMap<EntityId, _> = h
        .store
        .list_failures(PHASE, d(5))
        .await
        .unwrap()
        .into_iter()
        .map(|f| (f.entity_id.clone(), f))
        .collect();
    let transient = &failures[&EntityId::from("p00")];
    assert_eq!(transient.category, FailureCategory::ProcessingError);
    assert!(transient.is_correctable);
    let quality = &failures[&EntityId::from("p01")];
    assert_eq!(quality.category, FailureCategory::ProcessingError);
    assert!(!quality.is_correctable);
    let missing = &failures[&EntityId::from("p02")];
    assert_eq!(missing.category, FailureCategory::MissingUpstreamDependency);
    assert_eq!(missing.missing_dependency_refs, vec!["raw.injuries".to_string()]);

    // Every entity is accounted for even though three failed.
    assert_backfill_succeeded(&report);
    assert_fully_accounted(&report);
}

#[tokio::test]
async fn test_date_level_dependency_fans_out() {
    let processor = ScriptedProcessor::new("features").with_missing_dependency(d(7), &["analytics"]);
    let h = harness(DateRange::single(d(7)), &players(6), processor);

    let report = run(&h, d(7), d(7), &BackfillOptions::new()).await;

    let failures = h.store.list_failures(PHASE, d(7)).await.unwrap();
    assert_eq!(failures.len(), 6);
    assert!(failures
        .iter()
        .all(|f| f.category == FailureCategory::MissingUpstreamDependency
            && f.is_correctable
            && f.missing_dependency_refs == vec!["analytics".to_string()]));
    assert!(h.processor.calls().is_empty());
    let rec = report.outcome(d(7)).unwrap().reconciliation.clone().unwrap();
    assert_eq!((rec.failed, rec.unaccounted, rec.correctable_failures), (6, 0, 6));
}

#[tokio::test]
async fn test_exhausted_batch_records_correctable_failures() {
    let range = DateRange::new(d(1), d(2)).unwrap();
    let h = harness(range, &players(2), ScriptedProcessor::new("analytics"));
    h.processor.fail_batches(4);

    let report = run(&h, d(1), d(2), &BackfillOptions::new()).await;

    assert_backfill_succeeded(&report);
    assert_fully_accounted(&report);
    let first = report.outcome(d(1)).unwrap();
    assert_eq!(first.retries, 3);
    assert_eq!(first.error, None);
    assert_eq!(first.coverage.as_ref().unwrap().decision, GateDecision::Warn);
    let rec = first.reconciliation.as_ref().unwrap();
    assert_eq!((rec.produced, rec.failed, rec.correctable_failures), (0, 2, 2));

    let failures = h.store.list_failures(PHASE, d(1)).await.unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.category == FailureCategory::ProcessingError
        && f.is_correctable
        && f.reason.contains("connection reset")));
    assert_eq!(hashes(&h, d(2)).await.len(), 2);
}

#[tokio::test]
async fn test_rejected_batch_is_recorded_per_entity() {
    let h = harness(DateRange::single(d(6)), &players(2), ScriptedProcessor::new("analytics"));
    h.processor.reject_batches("duplicate box score rows");

    let report = run(&h, d(6), d(6), &BackfillOptions::new()).await;

    assert_date_status(&report, d(6), DateStatus::Success);
    let outcome = report.outcome(d(6)).unwrap();
    assert_eq!(outcome.retries, 0);
    assert_eq!(outcome.unaccounted(), Some(0));
    assert_eq!(h.processor.calls().len(), 1);

    let failures = h.store.list_failures(PHASE, d(6)).await.unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.category == FailureCategory::ProcessingError
        && !f.is_correctable
        && f.reason.contains("duplicate box score rows")));
}

#[tokio::test]
async fn test_exhausted_upstream_fails_only_that_date() {
    let range = DateRange::new(d(1), d(2)).unwrap();
    let h = harness(range, &players(2), ScriptedProcessor::new("analytics"));
    h.upstream.fail_next(4);

    let report = run(&h, d(1), d(2), &BackfillOptions::new()).await;

    assert_date_status(&report, d(1), DateStatus::Failed);
    assert_date_status(&report, d(2), DateStatus::Success);
    let failed = report.outcome(d(1)).unwrap();
    assert_eq!(failed.retries, 3);
    assert!(failed.error.as_deref().unwrap().contains("unavailable"));
    assert_eq!(failed.unaccounted(), Some(2));
    assert_eq!(h.processor.dates_processed(), vec![d(2)]);
    assert_eq!(report.result, BackfillResult::Partial { dates: vec![d(1)] });
    assert_eq!(report.attempt.status, RunStatus::Partial);
    assert_eq!(report.attempt.checkpoint_cursor, Some(d(2)));
}

#[tokio::test]
async fn test_each_transient_error_gets_its_own_retries() {
    let processor = ScriptedProcessor::new("analytics").with_script("p01", EntityScript::TransientThenProduce(3));
    let h = harness(DateRange::single(d(8)), &players(3), processor);
    h.upstream.fail_next(1);

    let report = run(&h, d(8), d(8), &BackfillOptions::new()).await;

    assert_backfill_succeeded(&report);
    assert_eq!(h.processor.attempts("p01", d(8)), 4);
    assert!(h.store.list_failures(PHASE, d(8)).await.unwrap().is_empty());
    assert_eq!(hashes(&h, d(8)).await.len(), 3);
    let outcome = report.outcome(d(8)).unwrap();
    assert_eq!(outcome.retries, 4);
    assert_eq!(report.attempt.retry_count, 4);
}

#[tokio::test]
async fn test_changed_date_selection_keeps_committed_dates() {
    let range = DateRange::new(d(1), d(3)).unwrap();
    let h = harness(range, &players(3), ScriptedProcessor::new("analytics"));

    let first = run(&h, d(1), d(3), &BackfillOptions::new().with_dates([d(1), d(2)])).await;
    assert_backfill_succeeded(&first);
    assert_eq!(first.attempt.checkpoint_cursor, Some(d(2)));
    let writes = h.store.write_count();

    let second = run(&h, d(1), d(3), &BackfillOptions::new().with_dates([d(2), d(3)])).await;

    assert_backfill_succeeded(&second);
    assert_date_status(&second, d(2), DateStatus::Skipped);
    assert_date_status(&second, d(3), DateStatus::Success);
    let d2_calls = h.processor.calls().iter().filter(|(date, _)| *date == d(2)).count();
    assert_eq!(d2_calls, 1);
    assert_eq!(second.attempt.attempt_id, first.attempt.attempt_id);
    assert_eq!(second.attempt.checkpoint_cursor, Some(d(3)));
    assert_eq!(h.store.write_count(), writes + 3);
}

#[tokio::test]
async fn test_changed_entity_selection_processes_only_missing_units() {
    let h = harness(DateRange::single(d(4)), &players(3), ScriptedProcessor::new("analytics"));

    let first = run(&h, d(4), d(4), &BackfillOptions::new().with_entities(["p00"])).await;
    assert_backfill_succeeded(&first);
    let before = hashes(&h, d(4)).await;
    h.processor.reset();

    let second = run(&h, d(4), d(4), &BackfillOptions::new().with_entities(["p00", "p01"])).await;

    assert_backfill_succeeded(&second);
    assert_eq!(h.processor.calls(), vec![(d(4), vec![EntityId::from("p01")])]);
    let rec = second.outcome(d(4)).unwrap().reconciliation.clone().unwrap();
    assert_eq!((rec.expected, rec.produced, rec.unaccounted), (2, 2, 0));
    let after = hashes(&h, d(4)).await;
    assert_eq!(after.len(), 2);
    assert_eq!(after.get(&EntityId::from("p00")), before.get(&EntityId::from("p00")));

    // Same selection again: nothing left to do.
    h.processor.reset();
    let third = run(&h, d(4), d(4), &BackfillOptions::new().with_entities(["p00", "p01"])).await;
    assert_backfill_succeeded(&third);
    assert!(h.processor.calls().is_empty());
}

#[tokio::test]
async fn test_configuration_error_aborts_attempt() {
    let range = DateRange::new(d(1), d(3)).unwrap();
    let processor = ScriptedProcessor::new("analytics").with_script("p01", EntityScript::Misconfigured("no model".into()));
    let h = harness(range, &players(2), processor);

    let report = run(&h, d(1), d(3), &BackfillOptions::new()).await;

    assert!(matches!(report.result, BackfillResult::Fatal { .. }));
    assert_eq!(report.exit_code(), 1);
    assert!(report.outcomes.is_empty());
    assert_eq!(report.attempt.status, RunStatus::Failed);
    assert!(report.attempt.last_error.as_deref().unwrap().contains("no model"));
    assert_eq!(h.processor.dates_processed(), vec![d(1)]);

    // The date lock was released, not left running.
    let entry = h.store.entry(PHASE, d(1)).await.unwrap().unwrap();
    assert_eq!(entry.status, RunStatus::Pending);
}

#[tokio::test]
async fn test_running_attempt_fails_fast() {
    let h = harness(DateRange::single(d(3)), &players(3), ScriptedProcessor::new("analytics"));
    let key = AttemptKey::new(PHASE, DateRange::single(d(3)));
    let holder = h
        .store
        .claim_attempt(RunAttempt::new(key, ""), Utc::now())
        .await
        .unwrap();

    let err = h
        .coordinator
        .run_backfill(PHASE, d(3), d(3), &BackfillOptions::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        PhaseflowError::LockHeld { holder: id, .. } => assert_eq!(id, holder.attempt_id),
        other => panic!("expected LockHeld, got {other}"),
    }
    assert!(h.processor.calls().is_empty());
    let stored = h.store.load_attempt(&key).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Running);
}

#[tokio::test]
async fn test_date_locked_by_other_attempt_is_fatal() {
    let range = DateRange::new(d(1), d(2)).unwrap();
    let h = harness(range, &players(2), ScriptedProcessor::new("analytics"));
    let other = Uuid::new_v4();
    h.store.acquire_date(PHASE, d(2), other, Utc::now()).await.unwrap();

    let report = run(&h, d(1), d(2), &BackfillOptions::new()).await;

    assert_date_status(&report, d(1), DateStatus::Success);
    assert!(matches!(report.result, BackfillResult::Fatal { .. }));
    assert_eq!(report.attempt.checkpoint_cursor, Some(d(1)));
    let entry = h.store.entry(PHASE, d(2)).await.unwrap().unwrap();
    assert_eq!(entry.attempt_id, Some(other));
    assert_eq!(entry.status, RunStatus::Running);
}

#[tokio::test]
async fn test_unfinished_dates_rerun_after_upstream_recovers() {
    let upstream = FixtureUpstream::new()
        .with_rows(TABLE, d(1), 250)
        .with_expected(PHASE, d(1), players(2))
        .with_expected(PHASE, d(2), players(2));
    let h = Harness::new(PHASE, upstream, ScriptedProcessor::new("analytics"), deps());

    let first = run(&h, d(1), d(2), &BackfillOptions::new()).await;
    assert_date_status(&first, d(2), DateStatus::Blocked);
    assert_eq!(first.attempt.status, RunStatus::Partial);

    h.upstream.set_rows(TABLE, d(2), 250);
    h.processor.reset();
    let second = run(&h, d(1), d(2), &BackfillOptions::new()).await;

    assert_backfill_succeeded(&second);
    assert_date_status(&second, d(1), DateStatus::Skipped);
    assert_date_status(&second, d(2), DateStatus::Success);
    assert_eq!(h.processor.dates_processed(), vec![d(2)]);
}

#[tokio::test]
async fn test_bypass_and_skip_preflight() {
    let upstream = FixtureUpstream::new().with_expected(PHASE, d(9), players(2));
    let h = Harness::new(PHASE, upstream, ScriptedProcessor::new("analytics"), deps());

    let bypassed = run(&h, d(9), d(9), &BackfillOptions::remediation()).await;
    assert_backfill_succeeded(&bypassed);
    let verdict = bypassed.outcome(d(9)).unwrap().verdict.clone().unwrap();
    assert!(verdict.bypassed);
    assert_eq!(verdict.observed_count, 0);
    assert_eq!(h.upstream.call_count(), 3);

    let skipped = run(&h, d(9), d(9), &BackfillOptions::new().with_skip_preflight(true).with_force(true)).await;
    assert_backfill_succeeded(&skipped);
    assert!(skipped.outcome(d(9)).unwrap().verdict.is_none());
    assert_eq!(h.upstream.call_count(), 3 + 2);
}

#[tokio::test]
async fn test_transient_upstream_is_retried() {
    let h = harness(DateRange::single(d(4)), &players(2), ScriptedProcessor::new("analytics"));
    h.upstream.fail_next(2);

    let report = run(&h, d(4), d(4), &BackfillOptions::new()).await;

    assert_backfill_succeeded(&report);
    assert_eq!(report.outcome(d(4)).unwrap().retries, 2);
    assert_eq!(report.attempt.retry_count, 2);
}

#[tokio::test]
async fn test_selection_and_coverage() {
    let range = DateRange::new(d(1), d(3)).unwrap();
    let processor =
        ScriptedProcessor::new("analytics").with_script("p01", EntityScript::InsufficientData("2 games".into()));
    let h = harness(range, &players(4), processor);
    let options = BackfillOptions::new()
        .with_dates([d(2)])
        .with_entities(["p00", "p01"])
        .with_min_coverage(0.75);

    let report = run(&h, d(1), d(3), &options).await;

    assert_eq!(report.outcomes.len(), 1);
    let outcome = report.outcome(d(2)).unwrap();
    assert_eq!(h.processor.calls(), vec![(d(2), vec![EntityId::from("p00"), EntityId::from("p01")])]);
    let rec = outcome.reconciliation.as_ref().unwrap();
    assert_eq!((rec.expected, rec.produced, rec.failed), (2, 1, 1));
    assert_eq!(outcome.coverage.as_ref().unwrap().decision, GateDecision::Warn);
    assert_eq!(outcome.status, DateStatus::Success);
    assert_eq!(h.events.count(names::GATE_WARN), 1);
}

#[tokio::test]
async fn test_events_and_invalid_invocations() {
    let range = DateRange::new(d(1), d(2)).unwrap();
    let h = harness(range, &players(1), ScriptedProcessor::new("analytics"));

    run(&h, d(1), d(2), &BackfillOptions::new()).await;
    assert_eq!(h.events.count(names::BACKFILL_STARTED), 1);
    assert_eq!(h.events.count(names::BACKFILL_DATE_COMPLETED), 2);
    assert_eq!(h.events.count(names::PHASE_COMPLETED), 2);
    assert_eq!(h.events.count(names::BACKFILL_COMPLETED), 1);
    let completed = h.events.events_of_type(names::PHASE_COMPLETED);
    assert_eq!(completed[0].1.as_ref().unwrap()["next_phase"], "features");

    let cancel = CancellationToken::new();
    let reversed = h
        .coordinator
        .run_backfill(PHASE, d(2), d(1), &BackfillOptions::new(), &cancel)
        .await;
    assert!(matches!(reversed, Err(PhaseflowError::Configuration(_))));
    let unknown = h
        .coordinator
        .run_backfill(Phase::Grading, d(1), d(1), &BackfillOptions::new(), &cancel)
        .await;
    assert!(matches!(unknown, Err(PhaseflowError::Configuration(_))));
    let coverage = h
        .coordinator
        .run_backfill(PHASE, d(1), d(1), &BackfillOptions::new().with_min_coverage(1.5), &cancel)
        .await;
    assert!(matches!(coverage, Err(PhaseflowError::Configuration(_))));
}

#[tokio::test]
async fn test_cancel_before_start_leaves_attempt_pending() {
    let h = harness(DateRange::single(d(1)), &players(1), ScriptedProcessor::new("analytics"));
    let cancel = CancellationToken::new();
    cancel.cancel("shutdown");

    let report = h
        .coordinator
        .run_backfill(PHASE, d(1), d(1), &BackfillOptions::new(), &cancel)
        .await
        .unwrap();

    assert_interrupted(&report);
    assert_eq!(report.exit_code(), 2);
    let stored = h.store.load_attempt(&report.attempt.key).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Pending);
    assert_eq!(stored.checkpoint_cursor, None);
}
