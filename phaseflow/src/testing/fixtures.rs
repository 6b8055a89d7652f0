//! Fixtures for orchestration tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::mocks::ScriptedProcessor;
use crate::backfill::{BackfillCoordinator, RetryPolicy};
use crate::core::{EntityId, Phase};
use crate::errors::{PhaseflowError, Result, TransientKind};
use crate::events::CollectingEventSink;
use crate::gate::DependencySpec;
use crate::store::{MemoryStore, UpstreamSource};
use crate::utils::DateRange;

/// An in-memory upstream truth source.
///
/// Row counts are kept per (table, date); `count_rows` sums them over the
/// requested range. Transient failures can be injected for the next calls.
#[derive(Debug, Default)]
pub struct FixtureUpstream {
    rows: RwLock<HashMap<(String, NaiveDate), u64>>,
    expected: RwLock<HashMap<(Phase, NaiveDate), Vec<EntityId>>>,
    failures: Mutex<u32>,
    calls: AtomicUsize,
}

impl FixtureUpstream {
    /// Creates an empty upstream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rows of `table` on `date`.
    #[must_use]
    pub fn with_rows(self, table: &str, date: NaiveDate, rows: u64) -> Self {
        self.set_rows(table, date, rows);
        self
    }

    /// Sets the expected set of `phase` on `date`.
    #[must_use]
    pub fn with_expected<I, E>(self, phase: Phase, date: NaiveDate, entities: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EntityId>,
    {
        self.set_expected(phase, date, entities);
        self
    }

    /// Sets the same expected set and `rows` of `table` for every date in
    /// `range`.
    #[must_use]
    pub fn with_range<E>(self, phase: Phase, range: DateRange, table: &str, rows: u64, entities: &[E]) -> Self
    where
        E: Clone + Into<EntityId>,
    {
        for date in range.days() {
            self.set_rows(table, date, rows);
            self.set_expected(phase, date, entities.iter().cloned());
        }
        self
    }

    /// Sets the rows of `table` on `date`.
    pub fn set_rows(&self, table: &str, date: NaiveDate, rows: u64) {
        self.rows.write().insert((table.to_string(), date), rows);
    }

    /// Sets the expected set of `phase` on `date`.
    pub fn set_expected<I, E>(&self, phase: Phase, date: NaiveDate, entities: I)
    where
        I: IntoIterator<Item = E>,
        E: Into<EntityId>,
    {
        self.expected
            .write()
            .insert((phase, date), entities.into_iter().map(Into::into).collect());
    }

    /// Makes the next `n` calls fail with a transient `unavailable` error.
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock() = n;
    }

    /// Calls served so far, failed ones included.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(PhaseflowError::transient(
                TransientKind::Unavailable,
                "upstream unavailable (injected)",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamSource for FixtureUpstream {
    async fn count_rows(&self, table: &str, range: DateRange) -> Result<u64> {
        self.enter()?;
        let rows = self.rows.read();
        Ok(range
            .days()
            .filter_map(|date| rows.get(&(table.to_string(), date)))
            .sum())
    }

    async fn list_expected_entities(&self, phase: Phase, date: NaiveDate) -> Result<Vec<EntityId>> {
        self.enter()?;
        Ok(self
            .expected
            .read()
            .get(&(phase, date))
            .cloned()
            .unwrap_or_default())
    }
}

/// A coordinator wired to in-memory collaborators, with handles kept for
/// assertions.
#[derive(Debug, Clone)]
pub struct Harness {
    /// Upstream fixture.
    pub upstream: Arc<FixtureUpstream>,
    /// Output and run-history store.
    pub store: Arc<MemoryStore>,
    /// Scripted processor registered for `phase`.
    pub processor: Arc<ScriptedProcessor>,
    /// Events emitted by the coordinator.
    pub events: Arc<CollectingEventSink>,
    /// The coordinator under test.
    pub coordinator: BackfillCoordinator,
}

impl Harness {
    /// Builds a harness for `phase` gated on `dependencies`, retrying
    /// without delay.
    #[must_use]
    pub fn new(
        phase: Phase,
        upstream: FixtureUpstream,
        processor: ScriptedProcessor,
        dependencies: Vec<DependencySpec>,
    ) -> Self {
        let upstream = Arc::new(upstream);
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(processor);
        let events = Arc::new(CollectingEventSink::new());
        let coordinator = BackfillCoordinator::new(
            Arc::clone(&upstream) as Arc<dyn UpstreamSource>,
            Arc::clone(&store) as _,
            Arc::clone(&store) as _,
        )
        .with_processor(phase, Arc::clone(&processor) as _)
        .with_dependencies(phase, dependencies)
        .with_retry_policy(RetryPolicy::immediate())
        .with_event_sink(Arc::clone(&events) as _);
        Self {
            upstream,
            store,
            processor,
            events,
            coordinator,
        }
    }
}
