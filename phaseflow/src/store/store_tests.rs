//! Behavior shared by every store implementation.

use chrono::{Duration, NaiveDate, Utc};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use uuid::Uuid;

use super::*;
use crate::backfill::{AttemptKey, RunAttempt};
use crate::core::RunStatus;
use crate::errors::PhaseflowError;
use crate::hashing::{compute_hash, FieldValue};
use crate::ledger::FailureCategory;
use crate::selfheal::{HealRecord, HealState};

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

fn output(entity: &str, value: i64) -> OutputRecord {
    let payload = FieldValue::from(value);
    OutputRecord::new(
        ProcessingUnit::new(Phase::Features, entity, date(1)),
        compute_hash(&payload).unwrap(),
        "v1",
        payload,
    )
}

fn failure(entity: &str) -> FailureRecord {
    FailureRecord::new(
        ProcessingUnit::new(Phase::Features, entity, date(1)),
        "features",
        FailureCategory::MissingUpstreamDependency,
        "analytics missing",
    )
    .correctable(true)
}

fn key() -> AttemptKey {
    AttemptKey::new(Phase::Features, DateRange::new(date(1), date(3)).unwrap())
}

async fn check_output_merge<S: OutputStore>(store: &S) {
    assert_eq!(store.merge_output(output("a", 1)).await.unwrap(), MergeOutcome::Inserted);
    assert_eq!(store.merge_output(output("a", 1)).await.unwrap(), MergeOutcome::Unchanged);
    assert!(matches!(
        store.merge_output(output("a", 2)).await.unwrap(),
        MergeOutcome::Superseded { .. }
    ));

    let stored = store
        .get_output(&ProcessingUnit::new(Phase::Features, "a", date(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.payload, FieldValue::from(2));
    assert!(stored.supersedes.is_some());
    assert_eq!(store.count_outputs(Phase::Features, date(1)).await.unwrap(), 1);
    assert_eq!(store.count_outputs(Phase::Features, date(2)).await.unwrap(), 0);
}

async fn check_failure_supersession<S: OutputStore>(store: &S) {
    assert!(store.record_failure(failure("b")).await.unwrap());
    assert!(!store.record_failure(failure("b")).await.unwrap());
    assert_eq!(store.list_failures(Phase::Features, date(1)).await.unwrap().len(), 1);

    store.merge_output(output("b", 5)).await.unwrap();
    assert!(store.list_failures(Phase::Features, date(1)).await.unwrap().is_empty());
    assert!(!store.record_failure(failure("b")).await.unwrap());
}

async fn check_date_lock<S: RunHistoryStore>(store: &S) {
    let holder = Uuid::new_v4();
    let other = Uuid::new_v4();
    let now = Utc::now();

    store.acquire_date(Phase::Features, date(1), holder, now).await.unwrap();
    // Re-entrant for the holder.
    store.acquire_date(Phase::Features, date(1), holder, now).await.unwrap();

    let err = store
        .acquire_date(Phase::Features, date(1), other, now)
        .await
        .unwrap_err();
    assert!(matches!(err, PhaseflowError::LockHeld { holder: h, .. } if h == holder));

    let mut entry = store.entry(Phase::Features, date(1)).await.unwrap().unwrap();
    entry.status = RunStatus::Success;
    store.complete_date(entry).await.unwrap();

    let entry = store.acquire_date(Phase::Features, date(1), other, now).await.unwrap();
    assert_eq!(entry.attempt_id, Some(other));
    store.release_date(Phase::Features, date(1), other).await.unwrap();
    assert_eq!(
        store.entry(Phase::Features, date(1)).await.unwrap().unwrap().status,
        RunStatus::Pending
    );
}

async fn check_attempt_claim<S: RunHistoryStore>(store: &S) {
    let first = store.claim_attempt(RunAttempt::new(key(), "a"), Utc::now()).await.unwrap();
    assert_eq!(first.status, RunStatus::Running);

    let err = store
        .claim_attempt(RunAttempt::new(key(), "b"), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, PhaseflowError::LockHeld { .. }));
    assert_eq!(store.list_running().await.unwrap().len(), 1);

    let mut paused = first.clone();
    paused.transition(RunStatus::Pending);
    paused.advance_cursor(date(1));
    store.save_attempt(&paused).await.unwrap();

    let resumed = store.claim_attempt(RunAttempt::new(key(), "c"), Utc::now()).await.unwrap();
    assert_eq!(resumed.attempt_id, first.attempt_id);
    assert_eq!(resumed.checkpoint_cursor, Some(date(1)));
}

async fn check_reclaim<S: RunHistoryStore>(store: &S) {
    let stuck = Uuid::new_v4();
    let long_ago = Utc::now() - Duration::hours(8);
    store.acquire_date(Phase::Features, date(2), stuck, long_ago).await.unwrap();

    let mut attempt = RunAttempt::new(key(), "");
    attempt.attempt_id = stuck;
    attempt.status = RunStatus::Running;
    attempt.updated_at = long_ago;
    store.save_attempt(&attempt).await.unwrap();

    let none = store
        .reclaim_stale(Phase::Features, date(2), Utc::now(), Duration::hours(10))
        .await
        .unwrap();
    assert!(none.is_empty());

    let reclaimed = store
        .reclaim_stale(Phase::Features, date(2), Utc::now(), Duration::hours(6))
        .await
        .unwrap();
    assert_eq!(reclaimed, vec![stuck]);
    assert!(store.list_running().await.unwrap().is_empty());
    assert_eq!(
        store.entry(Phase::Features, date(2)).await.unwrap().unwrap().status,
        RunStatus::Failed
    );
}

async fn check_heal_records<S: RunHistoryStore>(store: &S) {
    assert!(store.load_heal(Phase::Publishing, date(1)).await.unwrap().is_none());
    let mut record = HealRecord::new(Phase::Publishing, date(1));
    record.transition(HealState::Checking, Utc::now(), "tick");
    store.save_heal(&record).await.unwrap();
    assert_eq!(store.load_heal(Phase::Publishing, date(1)).await.unwrap(), Some(record));
}

async fn check_history_range<S: RunHistoryStore>(store: &S) {
    for day in [3, 1, 2] {
        let id = Uuid::new_v4();
        let mut entry = store.acquire_date(Phase::Grading, date(day), id, Utc::now()).await.unwrap();
        entry.status = RunStatus::Success;
        store.complete_date(entry).await.unwrap();
    }
    let history = store
        .history(Phase::Grading, DateRange::new(date(1), date(2)).unwrap())
        .await
        .unwrap();
    let dates: Vec<_> = history.iter().map(|e| e.date).collect();
    assert_eq!(dates, vec![date(1), date(2)]);
}

#[tokio::test]
async fn test_memory_store_outputs() {
    let store = MemoryStore::new();
    check_output_merge(&store).await;
    check_failure_supersession(&store).await;
    // Inserted, superseded, failure, output.
    assert_eq!(store.write_count(), 4);
}

#[tokio::test]
async fn test_memory_store_runs() {
    let store = MemoryStore::new();
    check_date_lock(&store).await;
    check_attempt_claim(&store).await;
    check_heal_records(&store).await;
    check_history_range(&store).await;
}

#[tokio::test]
async fn test_memory_store_reclaim() {
    check_reclaim(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_file_store_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();
    check_output_merge(&store).await;
    check_failure_supersession(&store).await;
}

#[tokio::test]
async fn test_file_store_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();
    check_date_lock(&store).await;
    check_attempt_claim(&store).await;
    check_heal_records(&store).await;
    check_history_range(&store).await;
}

#[tokio::test]
async fn test_file_store_reclaim() {
    let dir = tempfile::tempdir().unwrap();
    check_reclaim(&FileStore::open(dir.path()).await.unwrap()).await;
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileStore::open(dir.path()).await.unwrap();
        store.merge_output(output("a", 1)).await.unwrap();
        store.claim_attempt(RunAttempt::new(key(), ""), Utc::now()).await.unwrap();
    }
    let store = FileStore::open(dir.path()).await.unwrap();
    assert_eq!(store.list_outputs(Phase::Features, date(1)).await.unwrap().len(), 1);
    assert_eq!(store.list_running().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_file_store_lock_timeout_is_transient() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path())
        .await
        .unwrap()
        .with_lock_timeout(std::time::Duration::from_millis(30));
    std::fs::write(dir.path().join(".lock"), b"other").unwrap();

    let err = store.merge_output(output("a", 1)).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_concurrent_date_lock_single_winner() {
    let store = Arc::new(MemoryStore::new());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .acquire_date(Phase::Analytics, date(5), Uuid::new_v4(), Utc::now())
                .await
                .is_ok()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_concurrent_file_lock_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .acquire_date(Phase::Analytics, date(5), Uuid::new_v4(), Utc::now())
                .await
                .is_ok()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

fn abandon(path: &std::path::Path) {
    std::fs::write(path, b"4242").unwrap();
    let old = std::time::SystemTime::now() - std::time::Duration::from_secs(300);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(old)
        .unwrap();
}

#[tokio::test]
async fn test_file_store_reclaims_abandoned_lock() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();
    abandon(&dir.path().join(".lock"));

    assert_eq!(store.merge_output(output("a", 1)).await.unwrap(), MergeOutcome::Inserted);
    assert!(!dir.path().join(".lock").exists());
    assert!(!dir.path().join(".lock.reclaim").exists());
}

#[tokio::test]
async fn test_file_store_abandoned_lock_needs_reclaim_guard() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path())
        .await
        .unwrap()
        .with_lock_timeout(std::time::Duration::from_millis(30));
    abandon(&dir.path().join(".lock"));
    std::fs::write(dir.path().join(".lock.reclaim"), b"").unwrap();

    // Someone else is reclaiming: the abandoned lock is left to them.
    let err = store.merge_output(output("a", 1)).await.unwrap_err();
    assert!(err.is_transient());
    assert!(dir.path().join(".lock").exists());

    abandon(&dir.path().join(".lock.reclaim"));
    assert_eq!(store.merge_output(output("a", 1)).await.unwrap(), MergeOutcome::Inserted);
}

#[tokio::test]
async fn test_concurrent_reclaim_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    abandon(&dir.path().join(".lock"));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let root = dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            let store = FileStore::open(root).await.unwrap();
            store
                .acquire_date(Phase::Analytics, date(6), Uuid::new_v4(), Utc::now())
                .await
                .is_ok()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
