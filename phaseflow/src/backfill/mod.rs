//! Resumable, checkpointed backfills.
//!
//! A backfill runs one phase over a date range. Progress lives in the
//! run-history store: the attempt record holds the checkpoint cursor and
//! doubles as the attempt-level lock, and each (phase, date) history entry
//! is the per-date advisory lock.

mod attempt;
mod coordinator;
mod options;
mod processor;
mod report;
mod retry;

pub use attempt::{AttemptKey, RunAttempt, RunHistoryEntry};
pub use coordinator::{BackfillCoordinator, ResumeMode, DEFAULT_MIN_COVERAGE};
pub use options::BackfillOptions;
pub use processor::{EntityResult, PhaseProcessor, UnitOutput};
pub use report::{BackfillReport, BackfillResult, DateOutcome, WriteStats};
pub use retry::{
    backoff, should_retry, with_retry, BackoffStrategy, JitterStrategy, RetryDecision, RetryPolicy, RetryState,
};

#[cfg(test)]
mod integration_tests;
