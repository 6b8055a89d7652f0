//! Per-date outcome table returned by every backfill.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use super::RunAttempt;
use crate::core::DateStatus;
use crate::gate::{CompletenessVerdict, GateDecision};
use crate::ledger::ReconciliationReport;
use crate::store::MergeOutcome;

/// Writes performed while processing one date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStats {
    /// New outputs.
    pub inserted: u64,
    /// Outputs replaced by a different hash.
    pub superseded: u64,
    /// Outputs skipped because the hash matched.
    pub unchanged: u64,
    /// Failure records written.
    pub failures_recorded: u64,
}

impl WriteStats {
    /// Counts one merge.
    pub fn record_merge(&mut self, outcome: &MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Superseded { .. } => self.superseded += 1,
            MergeOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// Store writes (unchanged merges excluded).
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.inserted + self.superseded + self.failures_recorded
    }
}

/// What happened to one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateOutcome {
    /// The date.
    pub date: NaiveDate,
    /// Final status.
    pub status: DateStatus,
    /// Input-side gate verdict, when the gate ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<CompletenessVerdict>,
    /// Output coverage verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CompletenessVerdict>,
    /// Reconciliation after processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconciliationReport>,
    /// Writes performed.
    pub writes: WriteStats,
    /// Transient retries spent on the date.
    pub retries: u32,
    /// Error that stopped the date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DateOutcome {
    /// An outcome with no work recorded yet.
    #[must_use]
    pub fn new(date: NaiveDate, status: DateStatus) -> Self {
        Self {
            date,
            status,
            verdict: None,
            coverage: None,
            reconciliation: None,
            writes: WriteStats::default(),
            retries: 0,
            error: None,
        }
    }

    /// Unaccounted entities, if reconciliation ran.
    #[must_use]
    pub fn unaccounted(&self) -> Option<usize> {
        self.reconciliation.as_ref().map(|r| r.unaccounted)
    }

    fn gate_label(&self) -> String {
        let mut label = match &self.verdict {
            Some(v) if v.bypassed => "BYPASS".to_string(),
            Some(v) => v.decision.to_string(),
            None => "-".to_string(),
        };
        if self
            .coverage
            .as_ref()
            .is_some_and(|c| c.decision == GateDecision::Warn)
        {
            label.push_str("+LOWCOV");
        }
        label
    }
}

/// Overall result of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BackfillResult {
    /// Every date reconciled.
    Success,
    /// Some dates need attention.
    Partial {
        /// Dates that did not reconcile.
        dates: Vec<NaiveDate>,
    },
    /// The attempt was aborted.
    Fatal {
        /// The aborting error.
        error: String,
    },
    /// Cancelled; the attempt can be resumed.
    Interrupted {
        /// Cancellation reason.
        reason: String,
    },
}

impl BackfillResult {
    /// Derives the result from per-date outcomes.
    #[must_use]
    pub fn from_outcomes(outcomes: &[DateOutcome]) -> Self {
        let dates: Vec<NaiveDate> = outcomes
            .iter()
            .filter(|o| o.status.needs_attention())
            .map(|o| o.date)
            .collect();
        if dates.is_empty() {
            Self::Success
        } else {
            Self::Partial { dates }
        }
    }
}

/// Returned by every backfill invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillReport {
    /// The attempt as persisted at the end of the invocation.
    pub attempt: RunAttempt,
    /// One entry per date considered.
    pub outcomes: Vec<DateOutcome>,
    /// Overall result.
    #[serde(flatten)]
    pub result: BackfillResult,
}

impl BackfillReport {
    /// Process exit code: 0 success, 2 partial or interrupted, 1 fatal.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.result {
            BackfillResult::Success => 0,
            BackfillResult::Partial { .. } | BackfillResult::Interrupted { .. } => 2,
            BackfillResult::Fatal { .. } => 1,
        }
    }

    /// True when every date reconciled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result == BackfillResult::Success
    }

    /// Outcome of one date.
    #[must_use]
    pub fn outcome(&self, date: NaiveDate) -> Option<&DateOutcome> {
        self.outcomes.iter().find(|o| o.date == date)
    }

    /// Total store writes across all dates.
    #[must_use]
    pub fn total_writes(&self) -> u64 {
        self.outcomes.iter().map(|o| o.writes.writes()).sum()
    }

    /// Renders the outcome table as plain text.
    #[must_use]
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<12} {:<8} {:<14} {:>8} {:>8} {:>6} {:>11} {:>7} {:>7}",
            "date", "status", "gate", "expected", "produced", "failed", "unaccounted", "writes", "retries"
        );
        for o in &self.outcomes {
            let (expected, produced, failed, unaccounted) = o.reconciliation.as_ref().map_or_else(
                || ("-".to_string(), "-".to_string(), "-".to_string(), "-".to_string()),
                |r| {
                    (
                        r.expected.to_string(),
                        r.produced.to_string(),
                        r.failed.to_string(),
                        r.unaccounted.to_string(),
                    )
                },
            );
            let _ = writeln!(
                out,
                "{:<12} {:<8} {:<14} {:>8} {:>8} {:>6} {:>11} {:>7} {:>7}",
                o.date.to_string(),
                o.status.to_string(),
                o.gate_label(),
                expected,
                produced,
                failed,
                unaccounted,
                o.writes.writes(),
                o.retries
            );
            if let Some(error) = &o.error {
                let _ = writeln!(out, "  error: {error}");
            }
        }
        let summary = match &self.result {
            BackfillResult::Success => "success".to_string(),
            BackfillResult::Partial { dates } => {
                let list: Vec<String> = dates.iter().map(ToString::to_string).collect();
                format!("partial: {}", list.join(", "))
            }
            BackfillResult::Fatal { error } => format!("fatal: {error}"),
            BackfillResult::Interrupted { reason } => format!("interrupted: {reason}"),
        };
        let _ = writeln!(
            out,
            "attempt {} {} status={} cursor={} -> {}",
            self.attempt.attempt_id,
            self.attempt.key,
            self.attempt.status,
            self.attempt
                .checkpoint_cursor
                .map_or_else(|| "-".to_string(), |c| c.to_string()),
            summary
        );
        out
    }
}
