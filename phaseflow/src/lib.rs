//! # Phaseflow
//!
//! Orchestration core for date-partitioned, multi-phase batch pipelines.
//!
//! Phaseflow sits between a scheduler and the phase processors of a linear
//! pipeline and provides:
//!
//! - **Content hashing**: canonical SHA-256 digests make reruns over
//!   unchanged data true no-ops
//! - **Completeness gating**: lenient input-side checks, strict audits and
//!   an output coverage check
//! - **Failure ledger**: every expected entity ends with an output or a
//!   categorized failure, verified by reconciliation
//! - **Resumable backfills**: per-date checkpoints, bounded transient retry
//!   and advisory locks in durable state
//! - **Self-heal**: a bounded state machine that remediates missing
//!   terminal deliverables
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use phaseflow::prelude::*;
//!
//! let config = PhaseflowConfig::load(Path::new("phaseflow.yaml"))?;
//! let store = Arc::new(FileStore::open("state").await?);
//! let coordinator = config
//!     .coordinator(upstream, store.clone(), store)
//!     .with_processor(Phase::Analytics, processor);
//!
//! let report = coordinator
//!     .run_backfill(Phase::Analytics, start, end, &BackfillOptions::new(), &CancellationToken::new())
//!     .await?;
//! println!("{}", report.render_table());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod audit;
pub mod backfill;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod gate;
pub mod hashing;
pub mod ledger;
pub mod selfheal;
pub mod store;
pub mod testing;
pub mod trigger;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audit::{validate, ValidationEntry, ValidationReport};
    pub use crate::backfill::{
        BackfillCoordinator, BackfillOptions, BackfillReport, BackfillResult, DateOutcome,
        EntityResult, PhaseProcessor, RetryPolicy, RunAttempt, UnitOutput,
    };
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{PhaseConfig, PhaseflowConfig};
    pub use crate::core::{DateStatus, EntityId, OutputRecord, Phase, ProcessingUnit, RunStatus};
    pub use crate::errors::{PhaseflowError, Result, TransientKind};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::gate::{CompletenessVerdict, DependencySpec, GateDecision, GateOptions};
    pub use crate::hashing::{ContentHash, ContentHasher, FieldValue};
    pub use crate::ledger::{FailureCategory, FailureRecord, ReconciliationReport, Reconciler};
    pub use crate::selfheal::{HealPolicy, HealRecord, HealState, SelfHealMonitor};
    pub use crate::store::{FileStore, MemoryStore, OutputStore, RunHistoryStore, UpstreamSource};
    pub use crate::trigger::{ChannelTriggerSink, Trigger, TriggerRouter, TriggerSink, TriggerSource};
    pub use crate::utils::{iso_timestamp, parse_date, DateRange, Timestamp};
}
