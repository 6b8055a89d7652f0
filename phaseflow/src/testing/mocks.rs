//! Scripted phase processors for testing.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::backfill::{EntityResult, PhaseProcessor, UnitOutput};
use crate::cancellation::CancellationToken;
use crate::core::{EntityId, Phase};
use crate::errors::{PhaseflowError, Result, TransientKind};
use crate::hashing::FieldValue;

/// What a [`ScriptedProcessor`] does for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityScript {
    /// Produce a deterministic payload.
    Produce,
    /// Fail transiently this many times per date, then produce.
    TransientThenProduce(u32),
    /// Always fail transiently.
    AlwaysTransient,
    /// Report a legitimate absence.
    ExpectedAbsence(String),
    /// Report insufficient data.
    InsufficientData(String),
    /// Fail with a data quality error.
    DataQuality(String),
    /// Fail with a missing dependency.
    MissingDependency(Vec<String>),
    /// Fail with a configuration error.
    Misconfigured(String),
}

/// A processor whose per-entity behavior is scripted.
///
/// Entities without a script produce. Payloads depend on the entity, the
/// date and a settable version, so tests can change outputs on demand.
#[derive(Debug, Default)]
pub struct ScriptedProcessor {
    name: String,
    scripts: Mutex<HashMap<EntityId, EntityScript>>,
    attempts: Mutex<HashMap<(EntityId, NaiveDate), u32>>,
    missing_on: Mutex<HashMap<NaiveDate, Vec<String>>>,
    batch_failures: Mutex<u32>,
    batch_rejection: Mutex<Option<String>>,
    version: Mutex<i64>,
    cancel_after: Mutex<Option<(NaiveDate, CancellationToken)>>,
    calls: Mutex<Vec<(NaiveDate, Vec<EntityId>)>>,
}

impl ScriptedProcessor {
    /// Creates a processor that produces for every entity.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Scripts one entity.
    #[must_use]
    pub fn with_script(self, entity: impl Into<EntityId>, script: EntityScript) -> Self {
        self.set_script(entity, script);
        self
    }

    /// Scripts one entity.
    pub fn set_script(&self, entity: impl Into<EntityId>, script: EntityScript) {
        self.scripts.lock().insert(entity.into(), script);
    }

    /// Makes `prepare` report missing `refs` on `date`.
    #[must_use]
    pub fn with_missing_dependency(self, date: NaiveDate, refs: &[&str]) -> Self {
        self.missing_on
            .lock()
            .insert(date, refs.iter().map(ToString::to_string).collect());
        self
    }

    /// Makes the next `n` `process` calls fail transiently as a whole.
    pub fn fail_batches(&self, n: u32) {
        *self.batch_failures.lock() = n;
    }

    /// Makes every `process` call fail as a whole with a data quality error.
    pub fn reject_batches(&self, reason: impl Into<String>) {
        *self.batch_rejection.lock() = Some(reason.into());
    }

    /// Changes every payload produced from now on.
    pub fn set_version(&self, version: i64) {
        *self.version.lock() = version;
    }

    /// Cancels `token` once `date` has been processed.
    pub fn cancel_after(&self, date: NaiveDate, token: CancellationToken) {
        *self.cancel_after.lock() = Some((date, token));
    }

    /// Every `process` call as (date, requested entities).
    #[must_use]
    pub fn calls(&self) -> Vec<(NaiveDate, Vec<EntityId>)> {
        self.calls.lock().clone()
    }

    /// Distinct dates passed to `process`, in call order.
    #[must_use]
    pub fn dates_processed(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = Vec::new();
        for (date, _) in self.calls.lock().iter() {
            if !dates.contains(date) {
                dates.push(*date);
            }
        }
        dates
    }

    /// How many times `entity` was processed on `date`.
    #[must_use]
    pub fn attempts(&self, entity: impl Into<EntityId>, date: NaiveDate) -> u32 {
        self.attempts
            .lock()
            .get(&(entity.into(), date))
            .copied()
            .unwrap_or(0)
    }

    /// Forgets recorded calls and attempts.
    pub fn reset(&self) {
        self.calls.lock().clear();
        self.attempts.lock().clear();
    }

    /// The payload produced for `entity` on `date` at the current version.
    #[must_use]
    pub fn payload(&self, entity: &EntityId, date: NaiveDate) -> FieldValue {
        FieldValue::map([
            ("entity", FieldValue::from(entity.as_str())),
            ("date", FieldValue::from(date)),
            ("version", FieldValue::from(*self.version.lock())),
        ])
    }

    fn run_entity(&self, entity: &EntityId, date: NaiveDate) -> Result<UnitOutput> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry((entity.clone(), date)).or_insert(0);
            *count += 1;
            *count
        };
        let script = self
            .scripts
            .lock()
            .get(entity)
            .cloned()
            .unwrap_or(EntityScript::Produce);
        let transient = || PhaseflowError::transient(TransientKind::Timeout, format!("{entity} timed out"));
        match script {
            EntityScript::Produce => Ok(UnitOutput::produced(self.payload(entity, date))),
            EntityScript::TransientThenProduce(failures) if attempt <= failures => Err(transient()),
            EntityScript::TransientThenProduce(_) => Ok(UnitOutput::produced(self.payload(entity, date))),
            EntityScript::AlwaysTransient => Err(transient()),
            EntityScript::ExpectedAbsence(reason) => Ok(UnitOutput::expected_absence(reason)),
            EntityScript::InsufficientData(reason) => Ok(UnitOutput::insufficient_data(reason)),
            EntityScript::DataQuality(reason) => Err(PhaseflowError::DataQuality(reason)),
            EntityScript::MissingDependency(refs) => Err(PhaseflowError::dependency_missing(
                refs,
                format!("{entity} has no upstream rows"),
            )),
            EntityScript::Misconfigured(reason) => Err(PhaseflowError::configuration(reason)),
        }
    }
}

#[async_trait]
impl PhaseProcessor for ScriptedProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_version(&self) -> &str {
        "scripted-1"
    }

    async fn prepare(&self, _phase: Phase, date: NaiveDate) -> Result<()> {
        match self.missing_on.lock().get(&date) {
            Some(refs) => Err(PhaseflowError::dependency_missing(
                refs.clone(),
                format!("upstream missing for {date}"),
            )),
            None => Ok(()),
        }
    }

    async fn process(&self, _phase: Phase, date: NaiveDate, entities: &[EntityId]) -> Result<Vec<EntityResult>> {
        self.calls.lock().push((date, entities.to_vec()));
        {
            let mut failures = self.batch_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(PhaseflowError::transient(
                    TransientKind::ConnectionReset,
                    "connection reset by peer",
                ));
            }
        }
        if let Some(reason) = self.batch_rejection.lock().clone() {
            return Err(PhaseflowError::DataQuality(reason));
        }

        let results = entities
            .iter()
            .map(|entity| EntityResult {
                entity_id: entity.clone(),
                outcome: self.run_entity(entity, date),
            })
            .collect();

        if let Some((cancel_date, token)) = self.cancel_after.lock().as_ref() {
            if *cancel_date == date {
                token.cancel(format!("stop requested after {date}"));
            }
        }
        Ok(results)
    }
}
