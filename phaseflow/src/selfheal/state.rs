//! Self-heal state machine types.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::Phase;

/// State of the monitor for one target date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealState {
    /// Waiting for the next tick.
    #[default]
    Idle,
    /// Looking for terminal output.
    Checking,
    /// Running remediation.
    Remediating,
    /// Terminal output is present.
    Verified,
    /// Remediation exhausted; an operator must intervene.
    Failed,
}

impl HealState {
    /// Verified and Failed are never left automatically.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }
}

impl fmt::Display for HealState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Checking => write!(f, "checking"),
            Self::Remediating => write!(f, "remediating"),
            Self::Verified => write!(f, "verified"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealTransition {
    /// State left.
    pub from: HealState,
    /// State entered.
    pub to: HealState,
    /// When.
    pub at: DateTime<Utc>,
    /// Why.
    pub note: String,
}

/// Persisted supervision state for (terminal phase, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealRecord {
    /// Phase whose output is the deliverable.
    pub phase: Phase,
    /// Target date.
    pub date: NaiveDate,
    /// Current state.
    pub state: HealState,
    /// Remediation cycles started so far.
    pub cycles: u32,
    /// Last time the deliverable was checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    /// Transition log, oldest first.
    #[serde(default)]
    pub history: Vec<HealTransition>,
}

impl HealRecord {
    /// A fresh idle record.
    #[must_use]
    pub fn new(phase: Phase, date: NaiveDate) -> Self {
        Self {
            phase,
            date,
            state: HealState::Idle,
            cycles: 0,
            last_checked: None,
            history: Vec::new(),
        }
    }

    /// Moves to `to`, logging the transition. Returns the previous state.
    pub fn transition(&mut self, to: HealState, at: DateTime<Utc>, note: impl Into<String>) -> HealState {
        let from = self.state;
        self.history.push(HealTransition {
            from,
            to,
            at,
            note: note.into(),
        });
        self.state = to;
        from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_log() {
        let mut record = HealRecord::new(Phase::Publishing, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let now = Utc::now();
        assert_eq!(record.transition(HealState::Checking, now, "tick"), HealState::Idle);
        record.transition(HealState::Verified, now, "output present");

        assert_eq!(record.state, HealState::Verified);
        assert!(record.state.is_terminal());
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.history[1].from, HealState::Checking);
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_string(&HealState::Remediating).unwrap(), "\"remediating\"");
    }
}
