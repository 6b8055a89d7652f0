//! Run and per-date status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The status of a run attempt or of one (phase, date) history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not started, or interrupted and awaiting resume.
    #[default]
    Pending,
    /// Currently executing; doubles as the advisory lock.
    Running,
    /// Every date reconciled.
    Success,
    /// At least one date finished with unaccounted entities or errors.
    Partial,
    /// Aborted by a fatal error.
    Failed,
    /// The completeness gate refused to let the work start.
    Blocked,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

impl RunStatus {
    /// Returns true if the status represents a finished attempt.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Partial | Self::Failed | Self::Blocked)
    }

    /// Returns true if the status indicates full success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Outcome of a single date inside a backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateStatus {
    /// Processed and reconciled with zero unaccounted entities.
    Success,
    /// Processed but reconciliation found unaccounted entities.
    Partial,
    /// The completeness gate blocked the date; nothing was written.
    Blocked,
    /// A non-transient error (or exhausted retries) stopped the date.
    Failed,
    /// Already committed by an earlier invocation of the same attempt.
    Skipped,
}

impl DateStatus {
    /// The run-history status recorded for this outcome, if any.
    #[must_use]
    pub fn to_run_status(self) -> Option<RunStatus> {
        match self {
            Self::Success => Some(RunStatus::Success),
            Self::Partial => Some(RunStatus::Partial),
            Self::Blocked => Some(RunStatus::Blocked),
            Self::Failed => Some(RunStatus::Failed),
            Self::Skipped => None,
        }
    }

    /// Returns true if the date needs operator or self-heal attention.
    #[must_use]
    pub fn needs_attention(self) -> bool {
        matches!(self, Self::Partial | Self::Blocked | Self::Failed)
    }
}

impl fmt::Display for DateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Blocked => write!(f, "blocked"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}
