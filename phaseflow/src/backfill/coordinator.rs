//! The backfill coordinator.
//!
//! Runs one phase over a date range, one date at a time in ascending
//! order. Each date is locked in the run-history store, gated, processed,
//! reconciled and committed before the next one starts, so a restarted
//! coordinator resumes at the first uncommitted date.

use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::retry::{backoff, should_retry, with_retry, RetryDecision, RetryPolicy, RetryState};
use super::{
    AttemptKey, BackfillOptions, BackfillReport, BackfillResult, DateOutcome, PhaseProcessor, RunAttempt,
    UnitOutput, WriteStats,
};
use crate::cancellation::CancellationToken;
use crate::core::{DateStatus, EntityId, OutputRecord, Phase, ProcessingUnit, RunStatus};
use crate::errors::{PhaseflowError, Result};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::gate::{output_coverage, preflight, report_verdict, DependencySpec, GateDecision, GateOptions};
use crate::hashing::ContentHasher;
use crate::ledger::{fan_out, FailureCause, FailureRecord, Reconciler};
use crate::store::{OutputStore, RunHistoryStore, UpstreamSource};
use crate::utils::DateRange;

/// Default minimum ratio of produced outputs to expected entities.
pub const DEFAULT_MIN_COVERAGE: f64 = 0.9;

/// How a claimed attempt relates to what an earlier invocation left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Every selected date is processed.
    Fresh,
    /// Interrupted earlier; dates up to the checkpoint cursor are skipped.
    AfterCursor,
    /// Finished unsuccessfully; only dates not recorded as successful run.
    RetryUnfinished,
    /// The date or entity selection changed; committed dates stay skipped
    /// and only units without an output are processed again.
    Rescoped,
    /// Finished successfully; nothing to do without `force`.
    AlreadyDone,
}

impl ResumeMode {
    /// Picks the mode from the attempt stored before this invocation.
    #[must_use]
    pub fn for_previous(previous: Option<&RunAttempt>, fingerprint: &str, force: bool) -> Self {
        match previous {
            None => Self::Fresh,
            Some(_) if force => Self::Fresh,
            Some(p) if p.options_fingerprint != fingerprint => Self::Rescoped,
            Some(p) => match p.status {
                RunStatus::Success => Self::AlreadyDone,
                RunStatus::Pending | RunStatus::Running => Self::AfterCursor,
                RunStatus::Partial | RunStatus::Failed | RunStatus::Blocked => Self::RetryUnfinished,
            },
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::AfterCursor => "after_cursor",
            Self::RetryUnfinished => "retry_unfinished",
            Self::Rescoped => "rescoped",
            Self::AlreadyDone => "already_done",
        }
    }
}

/// Everything one date needs, borrowed from the invocation.
struct DateRun<'a> {
    phase: Phase,
    date: NaiveDate,
    attempt_id: Uuid,
    processor: &'a dyn PhaseProcessor,
    options: &'a BackfillOptions,
    cancel: &'a CancellationToken,
    min_coverage: f64,
    only_missing: bool,
}

impl DateRun<'_> {
    fn unit(&self, entity_id: EntityId) -> ProcessingUnit {
        ProcessingUnit::new(self.phase, entity_id, self.date)
    }

    fn scope(&self) -> Option<Vec<EntityId>> {
        entity_scope(self.options)
    }
}

fn entity_scope(options: &BackfillOptions) -> Option<Vec<EntityId>> {
    options
        .entities
        .as_ref()
        .map(|selected| selected.iter().cloned().collect())
}

/// Runs backfills against the configured collaborators.
#[derive(Clone)]
pub struct BackfillCoordinator {
    upstream: Arc<dyn UpstreamSource>,
    outputs: Arc<dyn OutputStore>,
    runs: Arc<dyn RunHistoryStore>,
    processors: HashMap<Phase, Arc<dyn PhaseProcessor>>,
    dependencies: HashMap<Phase, Vec<DependencySpec>>,
    retry: RetryPolicy,
    hasher: ContentHasher,
    min_coverage: f64,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for BackfillCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut phases: Vec<&Phase> = self.processors.keys().collect();
        phases.sort();
        f.debug_struct("BackfillCoordinator")
            .field("processors", &phases)
            .field("retry", &self.retry)
            .field("min_coverage", &self.min_coverage)
            .finish_non_exhaustive()
    }
}

impl BackfillCoordinator {
    /// Creates a coordinator with no processors registered.
    #[must_use]
    pub fn new(
        upstream: Arc<dyn UpstreamSource>,
        outputs: Arc<dyn OutputStore>,
        runs: Arc<dyn RunHistoryStore>,
    ) -> Self {
        Self {
            upstream,
            outputs,
            runs,
            processors: HashMap::new(),
            dependencies: HashMap::new(),
            retry: RetryPolicy::default(),
            hasher: ContentHasher::default(),
            min_coverage: DEFAULT_MIN_COVERAGE,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Registers the processor of `phase`.
    #[must_use]
    pub fn with_processor(mut self, phase: Phase, processor: Arc<dyn PhaseProcessor>) -> Self {
        self.processors.insert(phase, processor);
        self
    }

    /// Sets the upstream dependencies gated before `phase` runs.
    #[must_use]
    pub fn with_dependencies(mut self, phase: Phase, dependencies: Vec<DependencySpec>) -> Self {
        self.dependencies.insert(phase, dependencies);
        self
    }

    /// Sets the transient retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Sets the content hasher.
    #[must_use]
    pub fn with_hasher(mut self, hasher: ContentHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Sets the default minimum output coverage.
    #[must_use]
    pub fn with_min_coverage(mut self, ratio: f64) -> Self {
        self.min_coverage = ratio;
        self
    }

    /// Sets the outbound event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The upstream truth source.
    #[must_use]
    pub fn upstream(&self) -> &Arc<dyn UpstreamSource> {
        &self.upstream
    }

    /// The output store.
    #[must_use]
    pub fn outputs(&self) -> &Arc<dyn OutputStore> {
        &self.outputs
    }

    /// The run-history store.
    #[must_use]
    pub fn runs(&self) -> &Arc<dyn RunHistoryStore> {
        &self.runs
    }

    /// The event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// The retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// A reconciler over the same collaborators.
    #[must_use]
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(Arc::clone(&self.upstream), Arc::clone(&self.outputs))
    }

    /// Dependencies configured for `phase`.
    #[must_use]
    pub fn dependencies(&self, phase: Phase) -> &[DependencySpec] {
        self.dependencies.get(&phase).map_or(&[], Vec::as_slice)
    }

    /// Returns true if a processor is registered for `phase`.
    #[must_use]
    pub fn has_processor(&self, phase: Phase) -> bool {
        self.processors.contains_key(&phase)
    }

    fn processor(&self, phase: Phase) -> Result<Arc<dyn PhaseProcessor>> {
        self.processors
            .get(&phase)
            .cloned()
            .ok_or_else(|| PhaseflowError::configuration(format!("no processor registered for phase '{phase}'")))
    }

    fn min_coverage_for(&self, options: &BackfillOptions) -> Result<f64> {
        let ratio = options.min_coverage.unwrap_or(self.min_coverage);
        if !(0.0..=1.0).contains(&ratio) {
            return Err(PhaseflowError::configuration(format!(
                "min coverage must be within [0, 1], got {ratio}"
            )));
        }
        Ok(ratio)
    }

    /// Backfills `phase` over `start..=end`.
    ///
    /// Returns `Err` only when no attempt could be started: an invalid
    /// range or option, no registered processor, or another attempt holding
    /// the same key. Everything after that is reported per date in the
    /// returned [`BackfillReport`].
    pub async fn run_backfill(
        &self,
        phase: Phase,
        start: NaiveDate,
        end: NaiveDate,
        options: &BackfillOptions,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport> {
        let range = DateRange::new(start, end)?;
        let processor = self.processor(phase)?;
        let min_coverage = self.min_coverage_for(options)?;

        let key = AttemptKey::new(phase, range);
        let fingerprint = options.scope_fingerprint();
        let previous = self.runs.load_attempt(&key).await?;
        let mut attempt = self
            .runs
            .claim_attempt(RunAttempt::new(key, fingerprint.clone()), Utc::now())
            .await?;

        let mode = ResumeMode::for_previous(previous.as_ref(), &fingerprint, options.force);
        match mode {
            ResumeMode::Fresh if previous.is_some() => {
                attempt.checkpoint_cursor = None;
                attempt.options_fingerprint = fingerprint;
                self.runs.save_attempt(&attempt).await?;
            }
            ResumeMode::Rescoped => {
                attempt.options_fingerprint = fingerprint;
                self.runs.save_attempt(&attempt).await?;
            }
            _ => {}
        }

        let span = info_span!(
            "backfill",
            phase = %phase,
            range = %range,
            attempt_id = %attempt.attempt_id,
        );
        Ok(self
            .execute(attempt, processor.as_ref(), mode, options, min_coverage, cancel)
            .instrument(span)
            .await)
    }

    async fn execute(
        &self,
        mut attempt: RunAttempt,
        processor: &dyn PhaseProcessor,
        mode: ResumeMode,
        options: &BackfillOptions,
        min_coverage: f64,
        cancel: &CancellationToken,
    ) -> BackfillReport {
        let phase = attempt.key.phase;
        info!(mode = mode.as_str(), cursor = ?attempt.checkpoint_cursor, "Backfill started");
        self.events
            .emit(
                names::BACKFILL_STARTED,
                Some(json!({
                    "attempt_id": attempt.attempt_id,
                    "phase": phase,
                    "start": attempt.key.range.start,
                    "end": attempt.key.range.end,
                    "resume": mode.as_str(),
                })),
            )
            .await;

        let mut outcomes = Vec::new();
        for date in attempt.key.range.days() {
            if !options.selects_date(date) {
                continue;
            }
            if let Err(PhaseflowError::Cancelled(reason)) = cancel.ensure_active() {
                return self.interrupt(attempt, outcomes, reason).await;
            }
            match self.skips(mode, &attempt, date, options).await {
                Ok(true) => {
                    debug!(date = %date, "Date already committed, skipping");
                    outcomes.push(DateOutcome::new(date, DateStatus::Skipped));
                    continue;
                }
                Ok(false) => {}
                Err(e) => return self.abort(attempt, outcomes, e).await,
            }

            let run = DateRun {
                phase,
                date,
                attempt_id: attempt.attempt_id,
                processor,
                options,
                cancel,
                min_coverage,
                only_missing: mode == ResumeMode::Rescoped,
            };
            let outcome = match self.run_date(&run).instrument(info_span!("date", date = %date)).await {
                Ok(outcome) => outcome,
                Err(PhaseflowError::Cancelled(reason)) => return self.interrupt(attempt, outcomes, reason).await,
                Err(e) => return self.abort(attempt, outcomes, e).await,
            };

            attempt.retry_count += outcome.retries;
            attempt.advance_cursor(date);
            if let Err(e) = self.runs.save_attempt(&attempt).await {
                outcomes.push(outcome);
                return self.abort(attempt, outcomes, e).await;
            }
            self.announce(&attempt, &outcome).await;
            outcomes.push(outcome);
        }

        attempt.transition(attempt_status(&outcomes));
        if let Err(e) = self.runs.save_attempt(&attempt).await {
            return self.abort(attempt, outcomes, e).await;
        }
        let result = BackfillResult::from_outcomes(&outcomes);
        info!(status = %attempt.status, dates = outcomes.len(), "Backfill finished");
        self.events
            .emit(
                names::BACKFILL_COMPLETED,
                Some(json!({
                    "attempt_id": attempt.attempt_id,
                    "phase": phase,
                    "status": attempt.status,
                    "result": &result,
                })),
            )
            .await;
        BackfillReport {
            attempt,
            outcomes,
            result,
        }
    }

    async fn skips(
        &self,
        mode: ResumeMode,
        attempt: &RunAttempt,
        date: NaiveDate,
        options: &BackfillOptions,
    ) -> Result<bool> {
        let phase = attempt.key.phase;
        Ok(match mode {
            ResumeMode::Fresh => false,
            ResumeMode::AlreadyDone => true,
            ResumeMode::AfterCursor => attempt.is_committed(date),
            ResumeMode::RetryUnfinished => self.date_succeeded(phase, date).await?,
            // A successful date may still lack units the new selection adds.
            ResumeMode::Rescoped => {
                self.date_succeeded(phase, date).await?
                    && self
                        .reconciler()
                        .reconcile_scoped(phase, date, entity_scope(options).as_deref())
                        .await?
                        .is_reconciled()
            }
        })
    }

    async fn date_succeeded(&self, phase: Phase, date: NaiveDate) -> Result<bool> {
        Ok(self
            .runs
            .entry(phase, date)
            .await?
            .is_some_and(|e| e.status == RunStatus::Success))
    }

    async fn announce(&self, attempt: &RunAttempt, outcome: &DateOutcome) {
        let phase = attempt.key.phase;
        self.events
            .emit(
                names::BACKFILL_DATE_COMPLETED,
                Some(json!({
                    "attempt_id": attempt.attempt_id,
                    "phase": phase,
                    "date": outcome.date,
                    "status": outcome.status,
                    "unaccounted": outcome.unaccounted(),
                    "retries": outcome.retries,
                })),
            )
            .await;
        if outcome.status == DateStatus::Success {
            self.events
                .emit(
                    names::PHASE_COMPLETED,
                    Some(json!({
                        "phase": phase,
                        "date": outcome.date,
                        "next_phase": phase.downstream(),
                    })),
                )
                .await;
        }
    }

    async fn interrupt(&self, mut attempt: RunAttempt, outcomes: Vec<DateOutcome>, reason: String) -> BackfillReport {
        warn!(reason = %reason, cursor = ?attempt.checkpoint_cursor, "Backfill interrupted");
        attempt.transition(RunStatus::Pending);
        if let Err(e) = self.runs.save_attempt(&attempt).await {
            error!(error = %e, "Failed to persist interrupted attempt");
        }
        BackfillReport {
            attempt,
            outcomes,
            result: BackfillResult::Interrupted { reason },
        }
    }

    async fn abort(&self, mut attempt: RunAttempt, outcomes: Vec<DateOutcome>, err: PhaseflowError) -> BackfillReport {
        error!(error = %err, kind = err.kind_name(), "Backfill aborted");
        attempt.last_error = Some(err.to_string());
        attempt.transition(RunStatus::Failed);
        if let Err(e) = self.runs.save_attempt(&attempt).await {
            error!(error = %e, "Failed to persist aborted attempt");
        }
        BackfillReport {
            attempt,
            outcomes,
            result: BackfillResult::Fatal { error: err.to_string() },
        }
    }

    /// Locks, processes and commits one date.
    ///
    /// `Err` aborts the attempt (or interrupts it on cancellation); every
    /// other failure is folded into the returned outcome.
    async fn run_date(&self, run: &DateRun<'_>) -> Result<DateOutcome> {
        let mut retries = 0;
        let runs = self.runs.as_ref();
        let (phase, date, attempt_id) = (run.phase, run.date, run.attempt_id);
        let mut entry = self
            .retried("acquire_date", run.cancel, &mut retries, move || {
                runs.acquire_date(phase, date, attempt_id, Utc::now())
            })
            .await?;

        let mut outcome = DateOutcome::new(date, DateStatus::Success);
        match self.process_date(run, &mut outcome, &mut retries).await {
            Ok(status) => outcome.status = status,
            Err(e) if e.is_fatal() || matches!(e, PhaseflowError::Cancelled(_)) => {
                if let Err(release) = self.runs.release_date(phase, date, attempt_id).await {
                    warn!(error = %release, "Failed to release date lock");
                }
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind_name(), "Date failed");
                outcome.status = DateStatus::Failed;
                outcome.error = Some(e.to_string());
                if outcome.reconciliation.is_none() {
                    let scope = run.scope();
                    outcome.reconciliation = self
                        .reconciler()
                        .reconcile_scoped(phase, date, scope.as_deref())
                        .await
                        .ok();
                }
            }
        }
        outcome.retries = retries;

        if let Some(status) = outcome.status.to_run_status() {
            entry.status = status;
        }
        entry.attempt_id = Some(attempt_id);
        entry.checkpoint_cursor = Some(date);
        entry.retry_count = retries;
        entry.updated_at = Utc::now();
        self.runs.complete_date(entry).await?;

        info!(
            status = %outcome.status,
            unaccounted = ?outcome.unaccounted(),
            writes = outcome.writes.writes(),
            retries = outcome.retries,
            "Date committed"
        );
        Ok(outcome)
    }

    /// Runs `operation` with a retry budget of its own, adding the retries
    /// it spent to `retries`.
    async fn retried<T, F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        retries: &mut u32,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryState::new();
        let result = with_retry(&self.retry, key, cancel, &mut state, operation).await;
        *retries += state.retries;
        result
    }

    async fn process_date(&self, run: &DateRun<'_>, outcome: &mut DateOutcome, retries: &mut u32) -> Result<DateStatus> {
        let (phase, date) = (run.phase, run.date);
        let upstream = self.upstream.as_ref();

        if !run.options.skip_preflight {
            let deps = self.dependencies(phase);
            let gate = GateOptions::lenient().with_bypass(run.options.bypass_gate);
            let verdict = self
                .retried("preflight", run.cancel, retries, move || {
                    preflight(upstream, phase, date, deps, gate)
                })
                .await?;
            report_verdict(self.events.as_ref(), &verdict).await;
            let allowed = verdict.allows_processing();
            outcome.verdict = Some(verdict);
            if !allowed {
                return Ok(DateStatus::Blocked);
            }
        }

        let expected = self
            .retried("list_expected_entities", run.cancel, retries, move || {
                upstream.list_expected_entities(phase, date)
            })
            .await?;
        let mut expected = run.options.select_entities(expected);
        if run.only_missing {
            let outputs = self.outputs.as_ref();
            let produced: BTreeSet<EntityId> = self
                .retried("list_outputs", run.cancel, retries, move || outputs.list_outputs(phase, date))
                .await?
                .into_iter()
                .map(|o| o.entity_id)
                .collect();
            expected.retain(|entity| !produced.contains(entity));
        }
        debug!(expected = expected.len(), "Expected set loaded");

        let processor = run.processor;
        match self
            .retried("prepare", run.cancel, retries, move || processor.prepare(phase, date))
            .await
        {
            Ok(()) => {
                self.process_entities(run, expected, &mut outcome.writes, retries)
                    .await?;
            }
            Err(PhaseflowError::DependencyMissing {
                refs,
                message,
                correctable,
            }) => {
                warn!(refs = ?refs, reason = %message, "Date-level dependency missing, fanning out");
                let mut cause = FailureCause::missing_dependency(phase, processor.name(), date, refs, message);
                cause.is_correctable = correctable;
                for record in fan_out(&cause, &expected) {
                    self.write_failure(record, run, retries, &mut outcome.writes).await?;
                }
            }
            Err(e) => return Err(e),
        }

        let reconciler = self.reconciler();
        let reconciler = &reconciler;
        let scope = run.scope();
        let scope = scope.as_deref();
        let report = self
            .retried("reconcile", run.cancel, retries, move || {
                reconciler.reconcile_scoped(phase, date, scope)
            })
            .await?;

        let coverage = output_coverage(
            phase,
            date,
            u64::try_from(report.produced).unwrap_or(u64::MAX),
            u64::try_from(report.expected).unwrap_or(u64::MAX),
            run.min_coverage,
        );
        if coverage.decision != GateDecision::Proceed {
            report_verdict(self.events.as_ref(), &coverage).await;
        }
        outcome.coverage = Some(coverage);

        let status = if report.is_reconciled() {
            DateStatus::Success
        } else {
            warn!(
                unaccounted = report.unaccounted,
                entities = ?report.unaccounted_entities,
                "Date did not reconcile"
            );
            DateStatus::Partial
        };
        outcome.reconciliation = Some(report);
        Ok(status)
    }

    /// Processes the expected set, retrying transient per-entity errors for
    /// just the entities that hit them. Each entity has its own retry budget.
    ///
    /// A batch the processor rejects as a whole is recorded as one failure
    /// per requested entity; only fatal errors and cancellation escape.
    async fn process_entities(
        &self,
        run: &DateRun<'_>,
        expected: Vec<EntityId>,
        writes: &mut WriteStats,
        retries: &mut u32,
    ) -> Result<()> {
        let (phase, date) = (run.phase, run.date);
        let mut pending = expected;
        let mut batch_retry = RetryState::new();
        let mut entity_retry: HashMap<EntityId, RetryState> = HashMap::new();

        while !pending.is_empty() {
            run.cancel.ensure_active()?;
            let results = match run.processor.process(phase, date, &pending).await {
                Ok(results) => {
                    batch_retry = RetryState::new();
                    results
                }
                Err(e) if e.is_fatal() || matches!(e, PhaseflowError::Cancelled(_)) => return Err(e),
                Err(e) => match should_retry(&mut batch_retry, &self.retry, &e) {
                    RetryDecision::Retry(delay) => {
                        *retries += 1;
                        debug!(retry = batch_retry.retries, error = %e, "Retrying batch after transient error");
                        backoff(delay, run.cancel).await?;
                        continue;
                    }
                    RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                        warn!(
                            error = %e,
                            kind = e.kind_name(),
                            entities = pending.len(),
                            "Batch failed, recording a failure per entity"
                        );
                        for entity in pending {
                            let record = FailureRecord::from_error(run.unit(entity), run.processor.name(), &e);
                            self.write_failure(record, run, retries, writes).await?;
                        }
                        return Ok(());
                    }
                },
            };

            let requested: BTreeSet<EntityId> = pending.iter().cloned().collect();
            let mut transient: Vec<(EntityId, PhaseflowError)> = Vec::new();
            for result in results {
                if !requested.contains(&result.entity_id) {
                    warn!(entity = %result.entity_id, "Processor returned an entity that was not requested");
                    continue;
                }
                match result.outcome {
                    Ok(output) => self.write_output(run, result.entity_id, output, retries, writes).await?,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) if e.is_transient() => transient.push((result.entity_id, e)),
                    Err(e) => {
                        debug!(entity = %result.entity_id, error = %e, "Entity failed");
                        let record = FailureRecord::from_error(run.unit(result.entity_id), run.processor.name(), &e);
                        self.write_failure(record, run, retries, writes).await?;
                    }
                }
            }

            let mut retrying = Vec::new();
            let mut delay = Duration::ZERO;
            for (entity, e) in transient {
                let state = entity_retry.entry(entity.clone()).or_default();
                match should_retry(state, &self.retry, &e) {
                    RetryDecision::Retry(wait) => {
                        delay = delay.max(wait);
                        retrying.push(entity);
                    }
                    RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                        warn!(entity = %entity, retries = state.retries, error = %e, "Retries exhausted for entity");
                        let record = FailureRecord::from_error(run.unit(entity), run.processor.name(), &e);
                        self.write_failure(record, run, retries, writes).await?;
                    }
                }
            }
            if retrying.is_empty() {
                break;
            }
            *retries += 1;
            debug!(entities = retrying.len(), "Retrying entities after transient error");
            backoff(delay, run.cancel).await?;
            pending = retrying;
        }
        Ok(())
    }

    async fn write_output(
        &self,
        run: &DateRun<'_>,
        entity_id: EntityId,
        output: UnitOutput,
        retries: &mut u32,
        writes: &mut WriteStats,
    ) -> Result<()> {
        let unit = run.unit(entity_id);
        match output {
            UnitOutput::Produced {
                payload,
                input,
                source_version,
            } => {
                let hash = match self.hasher.compute_with_input(input.as_ref(), &payload) {
                    Ok(hash) => hash,
                    Err(e) => {
                        let record = FailureRecord::from_error(unit, run.processor.name(), &e);
                        return self.write_failure(record, run, retries, writes).await;
                    }
                };
                let version = source_version.unwrap_or_else(|| run.processor.source_version().to_string());
                let record = OutputRecord::new(unit, hash, version, payload).with_attempt(run.attempt_id);
                let outputs = self.outputs.as_ref();
                let merged = self
                    .retried("merge_output", run.cancel, retries, move || {
                        outputs.merge_output(record.clone())
                    })
                    .await?;
                writes.record_merge(&merged);
                Ok(())
            }
            UnitOutput::Absent {
                category,
                reason,
                correctable,
            } => {
                let record = FailureRecord::new(unit, run.processor.name(), category, reason).correctable(correctable);
                self.write_failure(record, run, retries, writes).await
            }
        }
    }

    async fn write_failure(
        &self,
        record: FailureRecord,
        run: &DateRun<'_>,
        retries: &mut u32,
        writes: &mut WriteStats,
    ) -> Result<()> {
        let record = record.with_attempt(run.attempt_id);
        let outputs = self.outputs.as_ref();
        let written = self
            .retried("record_failure", run.cancel, retries, move || {
                outputs.record_failure(record.clone())
            })
            .await?;
        if written {
            writes.failures_recorded += 1;
        }
        Ok(())
    }
}

/// Final attempt status from the dates it processed.
fn attempt_status(outcomes: &[DateOutcome]) -> RunStatus {
    let processed: Vec<DateStatus> = outcomes
        .iter()
        .map(|o| o.status)
        .filter(|s| *s != DateStatus::Skipped)
        .collect();
    if !processed.iter().any(|s| s.needs_attention()) {
        RunStatus::Success
    } else if processed.iter().all(|s| *s == DateStatus::Blocked) {
        RunStatus::Blocked
    } else if processed.iter().all(|s| *s == DateStatus::Failed) {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    }
}
