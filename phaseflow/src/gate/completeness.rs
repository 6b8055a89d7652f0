//! Completeness verdicts for a single upstream slice.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::Phase;

/// The gate's decision for one (phase, date).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateDecision {
    /// Upstream looks complete enough.
    Proceed,
    /// Upstream is thin but processing continues.
    Warn,
    /// Processing must not start.
    Block,
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proceed => write!(f, "PROCEED"),
            Self::Warn => write!(f, "WARN"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

/// Flags that change how strictly the gate judges a slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOptions {
    /// Always proceed (self-heal and emergency reruns).
    pub bypass: bool,
    /// Enforce `expected_min`; used by validation tooling.
    pub strict: bool,
    /// An empty slice blocks instead of warning.
    pub hard_required: bool,
}

impl GateOptions {
    /// Lenient defaults.
    #[must_use]
    pub fn lenient() -> Self {
        Self::default()
    }

    /// Strict audit mode.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    /// Sets the bypass flag.
    #[must_use]
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Sets the hard-required flag.
    #[must_use]
    pub fn with_hard_required(mut self, hard_required: bool) -> Self {
        self.hard_required = hard_required;
        self
    }
}

/// The outcome of evaluating one upstream slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletenessVerdict {
    /// Phase asking to run.
    pub phase: Phase,
    /// Partition date.
    pub date: NaiveDate,
    /// Rows found upstream.
    pub observed_count: u64,
    /// Rows a complete slice is expected to hold.
    pub expected_min: u64,
    /// The decision.
    pub decision: GateDecision,
    /// Human readable explanation.
    pub reason: String,
    /// Set when the decision came from the bypass flag.
    #[serde(default)]
    pub bypassed: bool,
}

impl CompletenessVerdict {
    /// True for PROCEED and WARN.
    #[must_use]
    pub fn allows_processing(&self) -> bool {
        self.decision != GateDecision::Block
    }

    /// Folds another verdict into this one; the worse decision wins and
    /// reasons are joined.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        if other.decision > self.decision {
            self.decision = other.decision;
        }
        self.observed_count = self.observed_count.saturating_add(other.observed_count);
        self.expected_min = self.expected_min.saturating_add(other.expected_min);
        self.bypassed |= other.bypassed;
        if self.reason.is_empty() {
            self.reason = other.reason;
        } else if !other.reason.is_empty() {
            self.reason = format!("{}; {}", self.reason, other.reason);
        }
        self
    }
}

/// Evaluates one slice.
///
/// Lenient policy: any rows at all proceed, with a WARN below
/// `expected_min`; an empty slice warns unless the dependency is
/// hard-required. Strict policy blocks whenever `observed < expected_min`.
#[must_use]
pub fn evaluate(
    phase: Phase,
    date: NaiveDate,
    observed_count: u64,
    expected_min: u64,
    options: GateOptions,
) -> CompletenessVerdict {
    let (decision, reason, bypassed) = if options.bypass {
        (
            GateDecision::Proceed,
            format!("gate bypassed (observed {observed_count}, expected {expected_min})"),
            true,
        )
    } else if options.strict && observed_count < expected_min {
        (
            GateDecision::Block,
            format!("strict: observed {observed_count} below expected minimum {expected_min}"),
            false,
        )
    } else if observed_count == 0 && options.hard_required {
        (
            GateDecision::Block,
            "no upstream rows for hard-required dependency".to_string(),
            false,
        )
    } else if observed_count == 0 {
        (
            GateDecision::Warn,
            "no upstream rows; proceeding leniently".to_string(),
            false,
        )
    } else if observed_count < expected_min {
        (
            GateDecision::Warn,
            format!("observed {observed_count} below expected minimum {expected_min}"),
            false,
        )
    } else {
        (GateDecision::Proceed, String::new(), false)
    };

    CompletenessVerdict {
        phase,
        date,
        observed_count,
        expected_min,
        decision,
        reason,
        bypassed,
    }
}
