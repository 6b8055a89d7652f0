//! Failure ledger and reconciliation checker.
//!
//! Every processor emits exactly one of {output, failure} per expected
//! entity; the reconciler is the oracle that proves it did.

mod failure;
mod reconcile;

pub use failure::{fan_out, FailureCategory, FailureCause, FailureRecord};
pub use reconcile::{reconcile_sets, ReconciliationReport, Reconciler};
