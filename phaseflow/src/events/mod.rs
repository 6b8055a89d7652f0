//! Outbound event notifications.
//!
//! Components receive an `Arc<dyn EventSink>` at construction; there is no
//! process-global sink, so concurrent coordinators never share one by
//! accident.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// Event type names emitted by the orchestration layer.
pub mod names {
    /// A backfill attempt started or resumed.
    pub const BACKFILL_STARTED: &str = "backfill.started";
    /// One date of a backfill finished (any status).
    pub const BACKFILL_DATE_COMPLETED: &str = "backfill.date.completed";
    /// A backfill attempt finished.
    pub const BACKFILL_COMPLETED: &str = "backfill.completed";
    /// The completeness gate let a thin slice through.
    pub const GATE_WARN: &str = "gate.warn";
    /// The completeness gate refused a date.
    pub const GATE_BLOCK: &str = "gate.block";
    /// A phase reconciled a date; downstream may run.
    pub const PHASE_COMPLETED: &str = "phase.completed";
    /// The self-heal monitor changed state.
    pub const SELFHEAL_TRANSITION: &str = "selfheal.transition";
    /// Self-heal gave up; operator attention required.
    pub const SELFHEAL_FAILED: &str = "selfheal.failed";
}

/// Returns the default sink used when none is configured.
#[must_use]
pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(LoggingEventSink::default())
}
