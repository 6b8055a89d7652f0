//! Completeness gate.
//!
//! Decides whether an upstream slice of unknown completeness is sufficient
//! for the next phase to run. Evaluation is a synchronous pure function;
//! only [`preflight`] touches the upstream source.

mod completeness;
mod preflight;

pub use completeness::{evaluate, CompletenessVerdict, GateDecision, GateOptions};
pub use preflight::{output_coverage, preflight, report_verdict, DependencySpec};
