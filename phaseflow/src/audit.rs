//! Read-only validation of a phase over a date range.
//!
//! Runs the completeness gate in strict mode (enforcing `expected_min`)
//! and, optionally, the reconciliation checker for every date. Nothing is
//! written and no events are emitted.

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{debug, info, warn};

use crate::backfill::BackfillCoordinator;
use crate::core::{Phase, RunStatus};
use crate::gate::{preflight, CompletenessVerdict, GateDecision, GateOptions};
use crate::ledger::ReconciliationReport;
use crate::utils::DateRange;

/// Dates checked concurrently.
const CONCURRENT_DATES: usize = 8;

/// Findings for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationEntry {
    /// Date checked.
    pub date: NaiveDate,
    /// Strict gate verdict; absent when the upstream query failed.
    pub verdict: Option<CompletenessVerdict>,
    /// Reconciliation, when requested.
    pub reconciliation: Option<ReconciliationReport>,
    /// Last recorded run status of the date.
    pub history: Option<RunStatus>,
    /// Error raised while checking.
    pub error: Option<String>,
}

impl ValidationEntry {
    /// True when the gate proceeds and every expected entity is accounted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
            && self
                .verdict
                .as_ref()
                .is_some_and(|v| v.decision == GateDecision::Proceed)
            && self
                .reconciliation
                .as_ref()
                .map_or(true, ReconciliationReport::is_reconciled)
    }
}

/// Result of a validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Phase validated.
    pub phase: Phase,
    /// Range validated.
    pub range: DateRange,
    /// One entry per date, ascending.
    pub entries: Vec<ValidationEntry>,
}

impl ValidationReport {
    /// True when every date is clean.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(ValidationEntry::is_clean)
    }

    /// Dates with findings.
    #[must_use]
    pub fn flagged_dates(&self) -> Vec<NaiveDate> {
        self.entries.iter().filter(|e| !e.is_clean()).map(|e| e.date).collect()
    }

    /// 0 when clean, 1 when any check errored, 2 for findings.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.entries.iter().any(|e| e.error.is_some()) {
            1
        } else if self.is_clean() {
            0
        } else {
            2
        }
    }

    /// Renders one line per date.
    #[must_use]
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<12} {:<8} {:>9} {:>9} {:>8} {:>11} {:<8}",
            "date", "gate", "observed", "expected", "produced", "unaccounted", "history"
        );
        for e in &self.entries {
            let (gate, observed, expected_min) = e.verdict.as_ref().map_or_else(
                || ("-".to_string(), "-".to_string(), "-".to_string()),
                |v| (v.decision.to_string(), v.observed_count.to_string(), v.expected_min.to_string()),
            );
            let (produced, unaccounted) = e.reconciliation.as_ref().map_or_else(
                || ("-".to_string(), "-".to_string()),
                |r| (r.produced.to_string(), r.unaccounted.to_string()),
            );
            let history = e.history.map_or_else(|| "-".to_string(), |s| s.to_string());
            let _ = writeln!(
                out,
                "{:<12} {:<8} {:>9} {:>9} {:>8} {:>11} {:<8}",
                e.date.to_string(),
                gate,
                observed,
                expected_min,
                produced,
                unaccounted,
                history
            );
            if let Some(reason) = e.verdict.as_ref().map(|v| &v.reason).filter(|r| !r.is_empty()) {
                let _ = writeln!(out, "  gate: {reason}");
            }
            if let Some(r) = e.reconciliation.as_ref().filter(|r| !r.is_reconciled()) {
                let ids: Vec<String> = r.unaccounted_entities.iter().map(ToString::to_string).collect();
                let _ = writeln!(out, "  unaccounted: {}", ids.join(", "));
            }
            if let Some(error) = &e.error {
                let _ = writeln!(out, "  error: {error}");
            }
        }
        let flagged = self.flagged_dates();
        if flagged.is_empty() {
            let _ = writeln!(out, "result: clean");
        } else {
            let list: Vec<String> = flagged.iter().map(ToString::to_string).collect();
            let _ = writeln!(out, "result: flagged: {}", list.join(", "));
        }
        out
    }
}

/// Validates `phase` over `range` with the strict gate, reconciling each
/// date when `reconcile` is set.
pub async fn validate(
    coordinator: &BackfillCoordinator,
    phase: Phase,
    range: DateRange,
    reconcile: bool,
) -> ValidationReport {
    info!(phase = %phase, start = %range.start, end = %range.end, reconcile, "Validating");
    let entries: Vec<ValidationEntry> = stream::iter(range.days())
        .map(|date| check_date(coordinator, phase, date, reconcile))
        .buffered(CONCURRENT_DATES)
        .collect()
        .await;
    let report = ValidationReport { phase, range, entries };
    info!(phase = %phase, clean = report.is_clean(), flagged = report.flagged_dates().len(), "Validation finished");
    report
}

async fn check_date(
    coordinator: &BackfillCoordinator,
    phase: Phase,
    date: NaiveDate,
    reconcile: bool,
) -> ValidationEntry {
    let mut entry = ValidationEntry {
        date,
        verdict: None,
        reconciliation: None,
        history: None,
        error: None,
    };
    let mut errors = Vec::new();

    match preflight(
        coordinator.upstream().as_ref(),
        phase,
        date,
        coordinator.dependencies(phase),
        GateOptions::strict(),
    )
    .await
    {
        Ok(verdict) => {
            if verdict.decision != GateDecision::Proceed {
                warn!(phase = %phase, date = %date, decision = %verdict.decision, "Strict gate: {}", verdict.reason);
            }
            entry.verdict = Some(verdict);
        }
        Err(e) => errors.push(format!("gate: {e}")),
    }

    if reconcile {
        match coordinator.reconciler().reconcile(phase, date).await {
            Ok(report) => entry.reconciliation = Some(report),
            Err(e) => errors.push(format!("reconcile: {e}")),
        }
    }

    match coordinator.runs().entry(phase, date).await {
        Ok(history) => entry.history = history.map(|h| h.status),
        Err(e) => errors.push(format!("history: {e}")),
    }

    if !errors.is_empty() {
        entry.error = Some(errors.join("; "));
    }
    debug!(phase = %phase, date = %date, clean = entry.is_clean(), "Date validated");
    entry
}
