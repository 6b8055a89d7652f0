//! Testing utilities for phaseflow orchestration.
//!
//! This module provides:
//! - An in-memory upstream fixture
//! - Scripted phase processors
//! - A coordinator harness and report assertions

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_backfill_succeeded, assert_date_status, assert_fully_accounted, assert_interrupted};
pub use fixtures::{FixtureUpstream, Harness};
pub use mocks::{EntityScript, ScriptedProcessor};
