//! Durable run attempts and per-date run history.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::core::{Phase, RunStatus};
use crate::utils::DateRange;

/// Identity of a run attempt: one phase over one date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptKey {
    /// Phase being processed.
    pub phase: Phase,
    /// Dates covered.
    pub range: DateRange,
}

impl AttemptKey {
    /// Creates a key.
    #[must_use]
    pub fn new(phase: Phase, range: DateRange) -> Self {
        Self { phase, range }
    }

    /// A filesystem- and log-friendly identifier.
    #[must_use]
    pub fn slug(&self) -> String {
        format!("{}_{}_{}", self.phase, self.range.start, self.range.end)
    }
}

impl fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.phase, self.range)
    }
}

/// A resumable backfill over a date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAttempt {
    /// Unique attempt id.
    pub attempt_id: Uuid,
    /// Phase and range.
    pub key: AttemptKey,
    /// Current status; `Running` doubles as the attempt-level lock.
    pub status: RunStatus,
    /// Last fully committed date. Only ever moves forward.
    pub checkpoint_cursor: Option<NaiveDate>,
    /// Transient retries spent so far across all dates.
    pub retry_count: u32,
    /// When the attempt was first created.
    pub started_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Fingerprint of the options the attempt was started with.
    #[serde(default)]
    pub options_fingerprint: String,
    /// Error that ended the attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RunAttempt {
    /// Creates a pending attempt.
    #[must_use]
    pub fn new(key: AttemptKey, options_fingerprint: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            attempt_id: Uuid::new_v4(),
            key,
            status: RunStatus::Pending,
            checkpoint_cursor: None,
            retry_count: 0,
            started_at: now,
            updated_at: now,
            options_fingerprint: options_fingerprint.into(),
            last_error: None,
        }
    }

    /// Advances the cursor; earlier dates are ignored.
    pub fn advance_cursor(&mut self, date: NaiveDate) {
        if self.checkpoint_cursor.map_or(true, |c| date > c) {
            self.checkpoint_cursor = Some(date);
        }
        self.updated_at = Utc::now();
    }

    /// Returns true if `date` was committed by this attempt.
    #[must_use]
    pub fn is_committed(&self, date: NaiveDate) -> bool {
        self.checkpoint_cursor.is_some_and(|c| date <= c)
    }

    /// Sets the status and bumps `updated_at`.
    pub fn transition(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// True when the attempt is `running` and has not been updated within
    /// `stale_after`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == RunStatus::Running && now - self.updated_at > stale_after
    }
}

/// Run history of one (phase, date), shared by every attempt that touches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// Phase.
    pub phase: Phase,
    /// Date.
    pub date: NaiveDate,
    /// Last known status; `Running` is the per-date advisory lock.
    pub status: RunStatus,
    /// Attempt holding the lock, or the last one that finished the date.
    pub attempt_id: Option<Uuid>,
    /// Cursor of the owning attempt when this date was committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_cursor: Option<NaiveDate>,
    /// Transient retries spent on this date.
    pub retry_count: u32,
    /// When the current or last run of the date started.
    pub started_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl RunHistoryEntry {
    /// A fresh `running` entry held by `attempt_id`.
    #[must_use]
    pub fn running(phase: Phase, date: NaiveDate, attempt_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            phase,
            date,
            status: RunStatus::Running,
            attempt_id: Some(attempt_id),
            checkpoint_cursor: None,
            retry_count: 0,
            started_at: now,
            updated_at: now,
        }
    }

    /// True when the entry is locked and older than `stale_after`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == RunStatus::Running && now - self.started_at > stale_after
    }
}
