//! Collaborator interfaces and their in-process and file-backed stores.
//!
//! All coordination state lives behind these traits; nothing the
//! coordinator or self-heal monitor relies on is held only in memory.

mod file;
mod memory;
mod partition;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backfill::{AttemptKey, RunAttempt, RunHistoryEntry};
use crate::core::{EntityId, OutputRecord, Phase, ProcessingUnit, RunStatus};
use crate::errors::Result;
use crate::hashing::ContentHash;
use crate::ledger::FailureRecord;
use crate::selfheal::HealRecord;
use crate::utils::DateRange;

/// Read-only upstream truth.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Rows of `table` within `range`.
    async fn count_rows(&self, table: &str, range: DateRange) -> Result<u64>;

    /// The authoritative expected set of `phase` on `date`.
    async fn list_expected_entities(&self, phase: Phase, date: NaiveDate) -> Result<Vec<EntityId>>;
}

/// What a merge did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// No prior record; written.
    Inserted,
    /// Same hash already stored; nothing written.
    Unchanged,
    /// A record with a different hash was replaced.
    Superseded {
        /// Hash of the replaced record.
        previous: ContentHash,
    },
}

impl MergeOutcome {
    /// True when the store was written to.
    #[must_use]
    pub fn wrote(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Append/merge sink for outputs and failures keyed by
/// (phase, entity, date).
#[async_trait]
pub trait OutputStore: Send + Sync {
    /// Merges by content hash. An equal hash is a no-op; a different hash
    /// supersedes the stored record. Any outstanding failure for the same
    /// unit is removed.
    async fn merge_output(&self, record: OutputRecord) -> Result<MergeOutcome>;

    /// The output for one unit.
    async fn get_output(&self, unit: &ProcessingUnit) -> Result<Option<OutputRecord>>;

    /// All outputs of a (phase, date).
    async fn list_outputs(&self, phase: Phase, date: NaiveDate) -> Result<Vec<OutputRecord>>;

    /// Number of outputs of a (phase, date).
    async fn count_outputs(&self, phase: Phase, date: NaiveDate) -> Result<u64>;

    /// Records a failure keyed by (processor, entity, date).
    ///
    /// Returns `false` without writing when the unit already has an output
    /// or the same cause is already recorded.
    async fn record_failure(&self, record: FailureRecord) -> Result<bool>;

    /// Outstanding failures of a (phase, date).
    async fn list_failures(&self, phase: Phase, date: NaiveDate) -> Result<Vec<FailureRecord>>;
}

/// Durable run history, attempts and self-heal records.
#[async_trait]
pub trait RunHistoryStore: Send + Sync {
    /// Loads an attempt by key.
    async fn load_attempt(&self, key: &AttemptKey) -> Result<Option<RunAttempt>>;

    /// Persists an attempt.
    async fn save_attempt(&self, attempt: &RunAttempt) -> Result<()>;

    /// Atomically moves the attempt for `fresh.key` to `running`.
    ///
    /// Fails with `LockHeld` when a `running` attempt already exists, even a
    /// stale one. An existing non-running attempt is resumed (its id,
    /// cursor and retry count are kept); otherwise `fresh` is stored.
    async fn claim_attempt(&self, fresh: RunAttempt, now: DateTime<Utc>) -> Result<RunAttempt>;

    /// Attempts currently marked `running`.
    async fn list_running(&self) -> Result<Vec<RunAttempt>>;

    /// Atomically takes the (phase, date) advisory lock for `attempt_id`.
    ///
    /// Fails with `LockHeld` when another attempt holds it.
    async fn acquire_date(
        &self,
        phase: Phase,
        date: NaiveDate,
        attempt_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RunHistoryEntry>;

    /// Records the final status of a date and releases its lock.
    async fn complete_date(&self, entry: RunHistoryEntry) -> Result<()>;

    /// Releases the lock without a final status (the date returns to
    /// `pending`).
    async fn release_date(&self, phase: Phase, date: NaiveDate, attempt_id: Uuid) -> Result<()>;

    /// History entry of one (phase, date).
    async fn entry(&self, phase: Phase, date: NaiveDate) -> Result<Option<RunHistoryEntry>>;

    /// History entries of `phase` within `range`, ascending.
    async fn history(&self, phase: Phase, range: DateRange) -> Result<Vec<RunHistoryEntry>>;

    /// Marks `running` entries and attempts touching (phase, date) that are
    /// older than `stale_after` as failed. Returns the reclaimed attempt ids.
    async fn reclaim_stale(
        &self,
        phase: Phase,
        date: NaiveDate,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Vec<Uuid>>;

    /// Loads the self-heal record of (phase, date).
    async fn load_heal(&self, phase: Phase, date: NaiveDate) -> Result<Option<HealRecord>>;

    /// Persists a self-heal record.
    async fn save_heal(&self, record: &HealRecord) -> Result<()>;
}

/// Shared CAS rule for `acquire_date`, used by every store.
pub(crate) fn lock_date(
    existing: Option<RunHistoryEntry>,
    phase: Phase,
    date: NaiveDate,
    attempt_id: Uuid,
    now: DateTime<Utc>,
) -> Result<RunHistoryEntry> {
    match existing {
        Some(entry) if entry.status == RunStatus::Running && entry.attempt_id != Some(attempt_id) => {
            Err(crate::errors::PhaseflowError::LockHeld {
                phase,
                date,
                holder: entry.attempt_id.unwrap_or_else(Uuid::nil),
            })
        }
        Some(mut entry) => {
            entry.status = RunStatus::Running;
            entry.attempt_id = Some(attempt_id);
            entry.started_at = now;
            entry.updated_at = now;
            Ok(entry)
        }
        None => Ok(RunHistoryEntry::running(phase, date, attempt_id, now)),
    }
}

/// Shared CAS rule for `claim_attempt`.
pub(crate) fn claim(existing: Option<RunAttempt>, fresh: RunAttempt, now: DateTime<Utc>) -> Result<RunAttempt> {
    let mut attempt = match existing {
        Some(existing) if existing.status == RunStatus::Running => {
            return Err(crate::errors::PhaseflowError::LockHeld {
                phase: existing.key.phase,
                date: existing
                    .checkpoint_cursor
                    .and_then(|c| c.succ_opt())
                    .unwrap_or(existing.key.range.start),
                holder: existing.attempt_id,
            });
        }
        Some(existing) => existing,
        None => fresh,
    };
    attempt.status = RunStatus::Running;
    attempt.updated_at = now;
    attempt.last_error = None;
    Ok(attempt)
}

/// Shared rule for `complete_date` and `release_date`: only the holder (or
/// anyone, once the lock is gone) may write the final status.
pub(crate) fn check_holder(existing: Option<&RunHistoryEntry>, attempt_id: Option<Uuid>) -> Result<()> {
    match existing {
        Some(entry)
            if entry.status == RunStatus::Running && entry.attempt_id.is_some() && entry.attempt_id != attempt_id =>
        {
            Err(crate::errors::PhaseflowError::LockHeld {
                phase: entry.phase,
                date: entry.date,
                holder: entry.attempt_id.unwrap_or_else(Uuid::nil),
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod store_tests;
