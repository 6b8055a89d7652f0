//! The fixed, linear phase ordering of the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::PhaseflowError;

/// A pipeline phase.
///
/// Phases run in declaration order; each one consumes the output of the
/// phase before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Raw source ingestion.
    RawIngestion,
    /// Derived analytics over raw data.
    Analytics,
    /// Precomputed features.
    Features,
    /// Model predictions.
    Predictions,
    /// Grading of predictions against outcomes.
    Grading,
    /// Publishing of the terminal deliverable.
    Publishing,
}

impl Phase {
    /// All phases in dependency order.
    pub const ALL: [Self; 6] = [
        Self::RawIngestion,
        Self::Analytics,
        Self::Features,
        Self::Predictions,
        Self::Grading,
        Self::Publishing,
    ];

    /// Position of the phase in the pipeline (0-based).
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The phase whose output this phase consumes.
    #[must_use]
    pub fn upstream(self) -> Option<Self> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// The phase that consumes this phase's output.
    #[must_use]
    pub fn downstream(self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Every phase from the start of the pipeline through `self`, in order.
    #[must_use]
    pub fn pipeline_to(self) -> Vec<Self> {
        Self::ALL[..=self.index()].to_vec()
    }

    /// The snake_case name of the phase.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RawIngestion => "raw_ingestion",
            Self::Analytics => "analytics",
            Self::Features => "features",
            Self::Predictions => "predictions",
            Self::Grading => "grading",
            Self::Publishing => "publishing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PhaseflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| PhaseflowError::configuration(format!("unknown phase '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert_eq!(Phase::RawIngestion.upstream(), None);
        assert_eq!(Phase::Features.upstream(), Some(Phase::Analytics));
        assert_eq!(Phase::Grading.downstream(), Some(Phase::Publishing));
        assert_eq!(Phase::Publishing.downstream(), None);
        assert!(Phase::Analytics < Phase::Predictions);
    }

    #[test]
    fn test_pipeline_to() {
        assert_eq!(Phase::RawIngestion.pipeline_to(), vec![Phase::RawIngestion]);
        assert_eq!(Phase::Publishing.pipeline_to().len(), 6);
        assert_eq!(
            Phase::Features.pipeline_to(),
            vec![Phase::RawIngestion, Phase::Analytics, Phase::Features]
        );
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("grading".parse::<Phase>().unwrap(), Phase::Grading);
        assert_eq!("Raw-Ingestion".parse::<Phase>().unwrap(), Phase::RawIngestion);
        assert!("scraping".parse::<Phase>().is_err());
        assert_eq!(Phase::Predictions.to_string(), "predictions");
    }

    #[test]
    fn test_phase_serialize() {
        let json = serde_json::to_string(&Phase::Features).unwrap();
        assert_eq!(json, r#""features""#);
    }
}
