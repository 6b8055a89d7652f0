//! In-process store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

use super::partition::PartitionLedger;
use super::{check_holder, claim, lock_date, MergeOutcome, OutputStore, RunHistoryStore};
use crate::backfill::{AttemptKey, RunAttempt, RunHistoryEntry};
use crate::core::{OutputRecord, Phase, ProcessingUnit, RunStatus};
use crate::errors::Result;
use crate::ledger::FailureRecord;
use crate::selfheal::HealRecord;
use crate::utils::DateRange;

type Partition = (Phase, NaiveDate);

#[derive(Debug, Default)]
struct Runs {
    attempts: HashMap<AttemptKey, RunAttempt>,
    history: BTreeMap<Partition, RunHistoryEntry>,
}

/// Store that keeps everything in memory.
///
/// Lock acquisition is an atomic compare-and-set within the process. State
/// is lost on exit; use [`super::FileStore`] to survive restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: RwLock<HashMap<Partition, PartitionLedger>>,
    runs: Mutex<Runs>,
    heal: DashMap<Partition, HealRecord>,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of output and failure writes performed so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl OutputStore for MemoryStore {
    async fn merge_output(&self, record: OutputRecord) -> Result<MergeOutcome> {
        let outcome = self
            .ledger
            .write()
            .entry((record.phase, record.date))
            .or_default()
            .merge(record);
        if outcome.wrote() {
            self.bump();
        }
        Ok(outcome)
    }

    async fn get_output(&self, unit: &ProcessingUnit) -> Result<Option<OutputRecord>> {
        Ok(self
            .ledger
            .read()
            .get(&(unit.phase, unit.date))
            .and_then(|partition| partition.outputs.get(&unit.entity_id))
            .cloned())
    }

    async fn list_outputs(&self, phase: Phase, date: NaiveDate) -> Result<Vec<OutputRecord>> {
        Ok(self
            .ledger
            .read()
            .get(&(phase, date))
            .map(|partition| partition.outputs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count_outputs(&self, phase: Phase, date: NaiveDate) -> Result<u64> {
        Ok(self
            .ledger
            .read()
            .get(&(phase, date))
            .map_or(0, |partition| partition.outputs.len() as u64))
    }

    async fn record_failure(&self, record: FailureRecord) -> Result<bool> {
        let written = self
            .ledger
            .write()
            .entry((record.phase, record.date))
            .or_default()
            .record_failure(record);
        if written {
            self.bump();
        }
        Ok(written)
    }

    async fn list_failures(&self, phase: Phase, date: NaiveDate) -> Result<Vec<FailureRecord>> {
        Ok(self
            .ledger
            .read()
            .get(&(phase, date))
            .map(|partition| partition.failures.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl RunHistoryStore for MemoryStore {
    async fn load_attempt(&self, key: &AttemptKey) -> Result<Option<RunAttempt>> {
        Ok(self.runs.lock().attempts.get(key).cloned())
    }

    async fn save_attempt(&self, attempt: &RunAttempt) -> Result<()> {
        self.runs.lock().attempts.insert(attempt.key, attempt.clone());
        Ok(())
    }

    async fn claim_attempt(&self, fresh: RunAttempt, now: DateTime<Utc>) -> Result<RunAttempt> {
        let mut runs = self.runs.lock();
        let key = fresh.key;
        let attempt = claim(runs.attempts.get(&key).cloned(), fresh, now)?;
        runs.attempts.insert(key, attempt.clone());
        Ok(attempt)
    }

    async fn list_running(&self) -> Result<Vec<RunAttempt>> {
        Ok(self
            .runs
            .lock()
            .attempts
            .values()
            .filter(|a| a.status == RunStatus::Running)
            .cloned()
            .collect())
    }

    async fn acquire_date(
        &self,
        phase: Phase,
        date: NaiveDate,
        attempt_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RunHistoryEntry> {
        let mut runs = self.runs.lock();
        let entry = lock_date(runs.history.get(&(phase, date)).cloned(), phase, date, attempt_id, now)?;
        runs.history.insert((phase, date), entry.clone());
        Ok(entry)
    }

    async fn complete_date(&self, entry: RunHistoryEntry) -> Result<()> {
        let mut runs = self.runs.lock();
        let partition = (entry.phase, entry.date);
        check_holder(runs.history.get(&partition), entry.attempt_id)?;
        runs.history.insert(partition, entry);
        Ok(())
    }

    async fn release_date(&self, phase: Phase, date: NaiveDate, attempt_id: Uuid) -> Result<()> {
        let mut runs = self.runs.lock();
        check_holder(runs.history.get(&(phase, date)), Some(attempt_id))?;
        if let Some(entry) = runs.history.get_mut(&(phase, date)) {
            if entry.status == RunStatus::Running {
                entry.status = RunStatus::Pending;
                entry.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn entry(&self, phase: Phase, date: NaiveDate) -> Result<Option<RunHistoryEntry>> {
        Ok(self.runs.lock().history.get(&(phase, date)).cloned())
    }

    async fn history(&self, phase: Phase, range: DateRange) -> Result<Vec<RunHistoryEntry>> {
        Ok(self
            .runs
            .lock()
            .history
            .range((phase, range.start)..=(phase, range.end))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn reclaim_stale(
        &self,
        phase: Phase,
        date: NaiveDate,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Vec<Uuid>> {
        let mut runs = self.runs.lock();
        let mut reclaimed = Vec::new();

        if let Some(entry) = runs.history.get_mut(&(phase, date)) {
            if entry.is_stale(now, stale_after) {
                if let Some(holder) = entry.attempt_id {
                    reclaimed.push(holder);
                }
                entry.status = RunStatus::Failed;
                entry.updated_at = now;
            }
        }

        for attempt in runs.attempts.values_mut() {
            if attempt.key.phase == phase
                && attempt.key.range.contains(date)
                && attempt.is_stale(now, stale_after)
            {
                attempt.status = RunStatus::Failed;
                attempt.last_error = Some("reclaimed stale lock".to_string());
                attempt.updated_at = now;
                if !reclaimed.contains(&attempt.attempt_id) {
                    reclaimed.push(attempt.attempt_id);
                }
            }
        }

        if !reclaimed.is_empty() {
            debug!(phase = %phase, date = %date, count = reclaimed.len(), "Reclaimed stale locks");
        }
        Ok(reclaimed)
    }

    async fn load_heal(&self, phase: Phase, date: NaiveDate) -> Result<Option<HealRecord>> {
        Ok(self.heal.get(&(phase, date)).map(|r| r.clone()))
    }

    async fn save_heal(&self, record: &HealRecord) -> Result<()> {
        self.heal.insert((record.phase, record.date), record.clone());
        Ok(())
    }
}
