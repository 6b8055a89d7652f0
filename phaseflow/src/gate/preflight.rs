//! Input-side and output-side gate checks.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{evaluate, CompletenessVerdict, GateDecision, GateOptions};
use crate::core::Phase;
use crate::errors::Result;
use crate::events::{names, EventSink};
use crate::store::UpstreamSource;
use crate::utils::DateRange;

/// One upstream table a phase reads before it may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Upstream table name, passed to `count_rows`.
    pub table: String,
    /// Rows a complete slice is expected to hold.
    #[serde(default)]
    pub expected_min: u64,
    /// An empty slice blocks instead of warning.
    #[serde(default)]
    pub hard_required: bool,
    /// Extra days before the date to include in the count.
    #[serde(default)]
    pub lookback_days: u32,
}

impl DependencySpec {
    /// Creates a dependency with no minimum.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            expected_min: 0,
            hard_required: false,
            lookback_days: 0,
        }
    }

    /// Sets the expected minimum row count.
    #[must_use]
    pub fn with_expected_min(mut self, expected_min: u64) -> Self {
        self.expected_min = expected_min;
        self
    }

    /// Marks the dependency hard-required.
    #[must_use]
    pub fn hard_required(mut self) -> Self {
        self.hard_required = true;
        self
    }

    /// Counts `lookback_days` extra days before the date.
    #[must_use]
    pub fn with_lookback(mut self, days: u32) -> Self {
        self.lookback_days = days;
        self
    }
}

/// Runs the completeness gate for every dependency of `phase` on `date`
/// and folds the results; the worst decision wins.
///
/// With `options.bypass` set the verdict always proceeds. Row counts are
/// still recorded; a count that fails under bypass is logged and read as 0.
pub async fn preflight(
    upstream: &dyn UpstreamSource,
    phase: Phase,
    date: NaiveDate,
    dependencies: &[DependencySpec],
    options: GateOptions,
) -> Result<CompletenessVerdict> {
    if dependencies.is_empty() {
        let mut verdict = evaluate(phase, date, 0, 0, options);
        if !options.bypass {
            verdict.reason = "no upstream dependencies configured".to_string();
        }
        return Ok(verdict);
    }

    let mut folded: Option<CompletenessVerdict> = None;
    for dep in dependencies {
        let range = DateRange::trailing(date, dep.lookback_days);
        let observed = match upstream.count_rows(&dep.table, range).await {
            Ok(observed) => observed,
            Err(e) if options.bypass => {
                warn!(table = %dep.table, error = %e, "Row count unavailable, gate bypassed");
                0
            }
            Err(e) => return Err(e),
        };
        let mut verdict = evaluate(
            phase,
            date,
            observed,
            dep.expected_min,
            options.with_hard_required(options.hard_required || dep.hard_required),
        );
        if !verdict.reason.is_empty() {
            verdict.reason = format!("{}: {}", dep.table, verdict.reason);
        }
        debug!(
            phase = %phase,
            date = %date,
            table = %dep.table,
            observed,
            expected_min = dep.expected_min,
            decision = %verdict.decision,
            "Dependency checked"
        );
        folded = Some(match folded {
            Some(acc) => acc.merge(verdict),
            None => verdict,
        });
    }

    Ok(folded.unwrap_or_else(|| evaluate(phase, date, 0, 0, options)))
}

/// Post-processing coverage check.
///
/// Returns WARN when `produced / expected` falls below `min_coverage`,
/// PROCEED otherwise. Never blocks: the outputs are already written.
#[must_use]
pub fn output_coverage(
    phase: Phase,
    date: NaiveDate,
    produced: u64,
    expected: u64,
    min_coverage: f64,
) -> CompletenessVerdict {
    #[allow(clippy::cast_precision_loss)]
    let ratio = if expected == 0 {
        1.0
    } else {
        produced as f64 / expected as f64
    };
    let (decision, reason) = if min_coverage > 0.0 && ratio < min_coverage {
        (
            GateDecision::Warn,
            format!(
                "output coverage {:.1}% below minimum {:.1}%",
                ratio * 100.0,
                min_coverage * 100.0
            ),
        )
    } else {
        (GateDecision::Proceed, String::new())
    };
    CompletenessVerdict {
        phase,
        date,
        observed_count: produced,
        expected_min: expected,
        decision,
        reason,
        bypassed: false,
    }
}

/// Logs and emits the verdict when it is WARN or BLOCK.
pub async fn report_verdict(sink: &dyn EventSink, verdict: &CompletenessVerdict) {
    let event = match verdict.decision {
        GateDecision::Proceed => return,
        GateDecision::Warn => names::GATE_WARN,
        GateDecision::Block => names::GATE_BLOCK,
    };
    warn!(
        phase = %verdict.phase,
        date = %verdict.date,
        observed = verdict.observed_count,
        expected_min = verdict.expected_min,
        decision = %verdict.decision,
        "Completeness gate: {}",
        verdict.reason
    );
    sink.emit(event, serde_json::to_value(verdict).ok()).await;
}
