//! The self-heal monitor.
//!
//! Supervises the terminal deliverable of each date. Once the grace
//! deadline has passed without terminal output, the monitor reclaims stale
//! locks and backfills every phase up to the terminal one with the gate
//! bypassed. Remediation cycles are bounded; exhausting them parks the
//! date in `Failed` until an operator forces it.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::json;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{HealRecord, HealState};
use crate::backfill::{BackfillCoordinator, BackfillOptions, BackfillResult};
use crate::cancellation::CancellationToken;
use crate::core::Phase;
use crate::errors::Result;
use crate::events::names;
use crate::utils::end_of_day;

/// Self-heal settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealPolicy {
    /// Phase whose output is the deliverable.
    pub terminal_phase: Phase,
    /// Wait after the end of the target date before remediating.
    pub grace: Duration,
    /// Remediation cycles before giving up.
    pub max_cycles: u32,
    /// Age after which a `running` lock is reclaimed.
    pub max_attempt_duration: Duration,
}

impl Default for HealPolicy {
    fn default() -> Self {
        Self {
            terminal_phase: Phase::Publishing,
            grace: Duration::hours(10),
            max_cycles: 3,
            max_attempt_duration: Duration::hours(6),
        }
    }
}

/// Drives [`HealRecord`]s through the self-heal state machine.
#[derive(Debug, Clone)]
pub struct SelfHealMonitor {
    coordinator: BackfillCoordinator,
    policy: HealPolicy,
}

impl SelfHealMonitor {
    /// Creates a monitor remediating through `coordinator`.
    #[must_use]
    pub fn new(coordinator: BackfillCoordinator, policy: HealPolicy) -> Self {
        Self { coordinator, policy }
    }

    /// The active policy.
    #[must_use]
    pub fn policy(&self) -> &HealPolicy {
        &self.policy
    }

    /// When remediation of `date` may start.
    #[must_use]
    pub fn deadline_for(&self, date: NaiveDate) -> DateTime<Utc> {
        end_of_day(date) + self.policy.grace
    }

    /// Current record of `date`, if it was ever supervised.
    pub async fn status(&self, date: NaiveDate) -> Result<Option<HealRecord>> {
        self.coordinator
            .runs()
            .load_heal(self.policy.terminal_phase, date)
            .await
    }

    /// Runs one supervision step for `date` now.
    pub async fn tick(&self, date: NaiveDate, cancel: &CancellationToken) -> Result<HealRecord> {
        self.tick_at(date, Utc::now(), cancel).await
    }

    /// Runs one supervision step for `date` as of `now`.
    ///
    /// Terminal records are returned unchanged. At most one remediation
    /// cycle runs per tick.
    pub async fn tick_at(&self, date: NaiveDate, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<HealRecord> {
        let span = info_span!("selfheal", phase = %self.policy.terminal_phase, date = %date);
        async {
            let mut record = self.load(date).await?;
            if record.state.is_terminal() {
                debug!(state = %record.state, "Already terminal");
                return Ok(record);
            }

            self.enter(&mut record, HealState::Checking, now, "tick").await;
            if self.deliverable_present(date).await? {
                self.enter(&mut record, HealState::Verified, now, "terminal output present")
                    .await;
                return self.save(record).await;
            }
            if now < self.deadline_for(date) {
                self.enter(&mut record, HealState::Idle, now, "terminal output absent, deadline not reached")
                    .await;
                return self.save(record).await;
            }
            if record.cycles >= self.policy.max_cycles {
                self.fail(&mut record, now).await;
                return self.save(record).await;
            }

            self.cycle(record, now, cancel).await
        }
        .instrument(span)
        .await
    }

    /// Remediates `date` immediately, ignoring the deadline.
    ///
    /// This is the only way out of `Failed`: the record is re-armed with a
    /// fresh cycle budget before remediating.
    pub async fn force(&self, date: NaiveDate, cancel: &CancellationToken) -> Result<HealRecord> {
        let now = Utc::now();
        let span = info_span!("selfheal", phase = %self.policy.terminal_phase, date = %date, forced = true);
        async {
            let mut record = self.load(date).await?;
            if record.state.is_terminal() {
                record.cycles = 0;
                self.enter(&mut record, HealState::Idle, now, "re-armed by force").await;
            }
            self.enter(&mut record, HealState::Checking, now, "forced").await;
            self.cycle(record, now, cancel).await
        }
        .instrument(span)
        .await
    }

    /// One remediation cycle followed by a check.
    async fn cycle(&self, mut record: HealRecord, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<HealRecord> {
        let date = record.date;
        record.cycles += 1;
        let note = format!("remediation cycle {}/{}", record.cycles, self.policy.max_cycles);
        self.enter(&mut record, HealState::Remediating, now, note).await;
        let mut record = self.save(record).await?;

        self.remediate(date, now, cancel).await?;

        self.enter(&mut record, HealState::Checking, Utc::now(), "remediation finished")
            .await;
        if self.deliverable_present(date).await? {
            self.enter(&mut record, HealState::Verified, Utc::now(), "terminal output present")
                .await;
        } else if record.cycles >= self.policy.max_cycles {
            self.fail(&mut record, Utc::now()).await;
        } else {
            self.enter(&mut record, HealState::Idle, Utc::now(), "terminal output still absent")
                .await;
        }
        self.save(record).await
    }

    /// Reclaims stale locks and backfills each phase up to the terminal one.
    async fn remediate(&self, date: NaiveDate, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<()> {
        let options = BackfillOptions::remediation();
        for phase in self.policy.terminal_phase.pipeline_to() {
            let reclaimed = self
                .coordinator
                .runs()
                .reclaim_stale(phase, date, now, self.policy.max_attempt_duration)
                .await?;
            if !reclaimed.is_empty() {
                warn!(phase = %phase, attempts = ?reclaimed, "Reclaimed stale locks");
            }
            if !self.coordinator.has_processor(phase) {
                debug!(phase = %phase, "No processor registered, skipping");
                continue;
            }

            cancel.ensure_active()?;
            match self.coordinator.run_backfill(phase, date, date, &options, cancel).await {
                Ok(report) => match &report.result {
                    BackfillResult::Fatal { error } => {
                        warn!(phase = %phase, error = %error, "Remediation backfill aborted");
                        return Ok(());
                    }
                    BackfillResult::Interrupted { reason } => {
                        warn!(phase = %phase, reason = %reason, "Remediation interrupted");
                        return cancel.ensure_active();
                    }
                    result => info!(phase = %phase, result = ?result, "Remediation backfill finished"),
                },
                Err(e) => {
                    warn!(phase = %phase, error = %e, "Remediation backfill could not start");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn deliverable_present(&self, date: NaiveDate) -> Result<bool> {
        let count = self
            .coordinator
            .outputs()
            .count_outputs(self.policy.terminal_phase, date)
            .await?;
        Ok(count > 0)
    }

    async fn load(&self, date: NaiveDate) -> Result<HealRecord> {
        Ok(self
            .status(date)
            .await?
            .unwrap_or_else(|| HealRecord::new(self.policy.terminal_phase, date)))
    }

    async fn save(&self, record: HealRecord) -> Result<HealRecord> {
        self.coordinator.runs().save_heal(&record).await?;
        Ok(record)
    }

    async fn enter(&self, record: &mut HealRecord, to: HealState, at: DateTime<Utc>, note: impl Into<String>) {
        let note = note.into();
        if to == HealState::Checking {
            record.last_checked = Some(at);
        }
        let from = record.transition(to, at, note.clone());
        info!(from = %from, to = %to, cycles = record.cycles, note = %note, "Self-heal transition");
        self.coordinator
            .events()
            .emit(
                names::SELFHEAL_TRANSITION,
                Some(json!({
                    "phase": record.phase,
                    "date": record.date,
                    "from": from,
                    "to": to,
                    "cycles": record.cycles,
                    "note": note,
                })),
            )
            .await;
    }

    async fn fail(&self, record: &mut HealRecord, at: DateTime<Utc>) {
        let note = format!("terminal output absent after {} remediation cycles", record.cycles);
        self.enter(record, HealState::Failed, at, note.clone()).await;
        error!(phase = %record.phase, date = %record.date, cycles = record.cycles, "Self-heal failed, operator attention required");
        self.coordinator
            .events()
            .emit(
                names::SELFHEAL_FAILED,
                Some(json!({
                    "phase": record.phase,
                    "date": record.date,
                    "cycles": record.cycles,
                    "reason": note,
                })),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::{AttemptKey, RunAttempt};
    use crate::core::RunStatus;
    use crate::gate::DependencySpec;
    use crate::store::RunHistoryStore;
    use crate::testing::{EntityScript, FixtureUpstream, Harness, ScriptedProcessor};
    use crate::utils::{start_of_day, DateRange};
    use uuid::Uuid;

    const TABLE: &str = "raw.schedule";

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn harness(upstream: FixtureUpstream, processor: ScriptedProcessor) -> Harness {
        Harness::new(
            Phase::Publishing,
            upstream,
            processor,
            vec![DependencySpec::new(TABLE).with_expected_min(10).hard_required()],
        )
    }

    fn monitor(h: &Harness) -> SelfHealMonitor {
        SelfHealMonitor::new(h.coordinator.clone(), HealPolicy::default())
    }

    fn past_deadline(date: NaiveDate) -> DateTime<Utc> {
        end_of_day(date) + Duration::hours(11)
    }

    #[tokio::test]
    async fn test_present_output_verifies() {
        let upstream = FixtureUpstream::new()
            .with_rows(TABLE, d(1), 20)
            .with_expected(Phase::Publishing, d(1), ["g1", "g2"]);
        let h = harness(upstream, ScriptedProcessor::new("publishing"));
        h.coordinator
            .run_backfill(Phase::Publishing, d(1), d(1), &BackfillOptions::new(), &CancellationToken::new())
            .await
            .unwrap();

        let record = monitor(&h).tick_at(d(1), past_deadline(d(1)), &CancellationToken::new()).await.unwrap();

        assert_eq!(record.state, HealState::Verified);
        assert_eq!(record.cycles, 0);
        assert!(record.last_checked.is_some());
    }

    #[tokio::test]
    async fn test_waits_for_deadline() {
        let upstream = FixtureUpstream::new().with_expected(Phase::Publishing, d(2), ["g1"]);
        let h = harness(upstream, ScriptedProcessor::new("publishing"));
        let monitor = monitor(&h);

        let record = monitor.tick_at(d(2), start_of_day(d(2)), &CancellationToken::new()).await.unwrap();

        assert_eq!(record.state, HealState::Idle);
        assert_eq!(record.cycles, 0);
        assert!(h.processor.calls().is_empty());
        assert_eq!(monitor.deadline_for(d(2)), end_of_day(d(2)) + Duration::hours(10));
    }

    #[tokio::test]
    async fn test_blocked_date_is_remediated_with_bypass() {
        // No upstream rows: the ordinary backfill blocks.
        let upstream = FixtureUpstream::new().with_expected(Phase::Publishing, d(3), ["g1", "g2", "g3"]);
        let h = harness(upstream, ScriptedProcessor::new("publishing"));
        let blocked = h
            .coordinator
            .run_backfill(Phase::Publishing, d(3), d(3), &BackfillOptions::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(blocked.attempt.status, RunStatus::Blocked);

        let record = monitor(&h).tick_at(d(3), past_deadline(d(3)), &CancellationToken::new()).await.unwrap();

        assert_eq!(record.state, HealState::Verified);
        assert_eq!(record.cycles, 1);
        let states: Vec<HealState> = record.history.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                HealState::Checking,
                HealState::Remediating,
                HealState::Checking,
                HealState::Verified
            ]
        );
        assert_eq!(h.processor.dates_processed(), vec![d(3)]);
        assert_eq!(h.events.count(names::SELFHEAL_TRANSITION), 4);
    }

    #[tokio::test]
    async fn test_bounded_cycles_then_failed() {
        let processor =
            ScriptedProcessor::new("publishing").with_script("g1", EntityScript::InsufficientData("no lines".into()));
        let upstream = FixtureUpstream::new().with_expected(Phase::Publishing, d(4), ["g1"]);
        let h = harness(upstream, processor);
        let monitor = monitor(&h);
        let cancel = CancellationToken::new();
        let now = past_deadline(d(4));

        let mut record = monitor.tick_at(d(4), now, &cancel).await.unwrap();
        let mut ticks = 1;
        while !record.state.is_terminal() {
            assert!(ticks < 10, "self-heal did not converge");
            record = monitor.tick_at(d(4), now, &cancel).await.unwrap();
            ticks += 1;
        }

        assert_eq!(record.state, HealState::Failed);
        assert_eq!(record.cycles, 3);
        assert_eq!(ticks, 3);
        assert_eq!(h.events.count(names::SELFHEAL_FAILED), 1);

        // Failed is not retried automatically.
        let again = monitor.tick_at(d(4), now, &cancel).await.unwrap();
        assert_eq!(again, record);
        assert_eq!(h.processor.dates_processed().len(), 1);
        assert_eq!(h.processor.attempts("g1", d(4)), 3);

        // Force re-arms and remediates once more.
        h.processor.set_script("g1", EntityScript::Produce);
        let forced = monitor.force(d(4), &cancel).await.unwrap();
        assert_eq!(forced.state, HealState::Verified);
        assert_eq!(forced.cycles, 1);
        let persisted = monitor.status(d(4)).await.unwrap().unwrap();
        assert_eq!(persisted.state, HealState::Verified);
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let upstream = FixtureUpstream::new()
            .with_rows(TABLE, d(5), 20)
            .with_expected(Phase::Publishing, d(5), ["g1"]);
        let h = harness(upstream, ScriptedProcessor::new("publishing"));
        let now = Utc::now();
        let crashed_at = now - Duration::hours(7);

        let key = AttemptKey::new(Phase::Publishing, DateRange::new(d(5), d(6)).unwrap());
        let crashed = h.store.claim_attempt(RunAttempt::new(key, ""), crashed_at).await.unwrap();
        h.store
            .acquire_date(Phase::Publishing, d(5), crashed.attempt_id, crashed_at)
            .await
            .unwrap();

        // An ordinary backfill cannot take the date.
        let report = h
            .coordinator
            .run_backfill(Phase::Publishing, d(5), d(5), &BackfillOptions::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(report.result, BackfillResult::Fatal { .. }));

        let record = monitor(&h).tick_at(d(5), now, &CancellationToken::new()).await.unwrap();

        assert_eq!(record.state, HealState::Verified);
        let stale = h.store.load_attempt(&key).await.unwrap().unwrap();
        assert_eq!(stale.status, RunStatus::Failed);
        let entry = h.store.entry(Phase::Publishing, d(5)).await.unwrap().unwrap();
        assert_eq!(entry.status, RunStatus::Success);
        assert_ne!(entry.attempt_id, Some(crashed.attempt_id));
        assert_ne!(entry.attempt_id, Some(Uuid::nil()));
    }

    #[tokio::test]
    async fn test_cancelled_remediation_propagates() {
        let upstream = FixtureUpstream::new().with_expected(Phase::Publishing, d(6), ["g1"]);
        let h = harness(upstream, ScriptedProcessor::new("publishing"));
        let cancel = CancellationToken::new();
        cancel.cancel("shutdown");

        let err = monitor(&h).tick_at(d(6), past_deadline(d(6)), &cancel).await.unwrap_err();

        assert!(matches!(err, crate::errors::PhaseflowError::Cancelled(_)));
        let record = monitor(&h).status(d(6)).await.unwrap().unwrap();
        assert_eq!(record.state, HealState::Remediating);
    }
}
