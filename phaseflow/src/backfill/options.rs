//! Backfill invocation options.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::core::EntityId;

/// Options recognized by a backfill invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillOptions {
    /// Skip the input-side completeness gate.
    pub skip_preflight: bool,
    /// Run the gate with its bypass flag set (self-heal and emergencies).
    pub bypass_gate: bool,
    /// Reprocess dates an earlier invocation already committed.
    pub force: bool,
    /// Override of the configured minimum output coverage ratio.
    pub min_coverage: Option<f64>,
    /// Restrict processing to these dates of the range.
    pub dates: Option<BTreeSet<NaiveDate>>,
    /// Restrict processing to these entities of each expected set.
    pub entities: Option<BTreeSet<EntityId>>,
}

impl BackfillOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options used by the self-heal monitor: gate bypassed, committed
    /// dates reprocessed. Unchanged outputs still merge as no-ops.
    #[must_use]
    pub fn remediation() -> Self {
        Self {
            bypass_gate: true,
            force: true,
            ..Self::default()
        }
    }

    /// Sets `skip_preflight`.
    #[must_use]
    pub fn with_skip_preflight(mut self, skip: bool) -> Self {
        self.skip_preflight = skip;
        self
    }

    /// Sets `bypass_gate`.
    #[must_use]
    pub fn with_bypass_gate(mut self, bypass: bool) -> Self {
        self.bypass_gate = bypass;
        self
    }

    /// Sets `force`.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Sets the minimum coverage override.
    #[must_use]
    pub fn with_min_coverage(mut self, ratio: f64) -> Self {
        self.min_coverage = Some(ratio);
        self
    }

    /// Restricts processing to the given dates.
    #[must_use]
    pub fn with_dates(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.dates = Some(dates.into_iter().collect());
        self
    }

    /// Restricts processing to the given entities.
    #[must_use]
    pub fn with_entities<I, E>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EntityId>,
    {
        self.entities = Some(entities.into_iter().map(Into::into).collect());
        self
    }

    /// Returns true if `date` is selected.
    #[must_use]
    pub fn selects_date(&self, date: NaiveDate) -> bool {
        self.dates.as_ref().map_or(true, |dates| dates.contains(&date))
    }

    /// Narrows an expected set to the selected entities, keeping order.
    #[must_use]
    pub fn select_entities(&self, expected: Vec<EntityId>) -> Vec<EntityId> {
        match &self.entities {
            Some(selected) => expected.into_iter().filter(|e| selected.contains(e)).collect(),
            None => expected,
        }
    }

    /// Digest of the options that change which units an attempt covers.
    ///
    /// A resumed attempt whose scope fingerprint changed starts over from
    /// the beginning of its range.
    #[must_use]
    pub fn scope_fingerprint(&self) -> String {
        if self.dates.is_none() && self.entities.is_none() {
            return String::new();
        }
        let mut hasher = Sha256::new();
        for date in self.dates.iter().flatten() {
            hasher.update(date.to_string().as_bytes());
            hasher.update(b";");
        }
        hasher.update(b"|");
        for entity in self.entities.iter().flatten() {
            hasher.update(entity.as_str().as_bytes());
            hasher.update(b";");
        }
        hex::encode(&hasher.finalize()[..8])
    }
}
