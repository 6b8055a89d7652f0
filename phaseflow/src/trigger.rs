//! Trigger boundary between phases.
//!
//! An inbound [`Trigger`] names one (phase, date) to run. The router runs a
//! single-date backfill for it and, when the date reconciles, activates the
//! downstream phase through a [`TriggerSink`].

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backfill::{BackfillCoordinator, BackfillOptions, BackfillReport};
use crate::cancellation::CancellationToken;
use crate::core::Phase;
use crate::errors::{PhaseflowError, Result};

/// Who raised a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSource {
    /// A scheduler or external event.
    Schedule,
    /// An operator.
    Manual,
    /// Completion of the upstream phase.
    Upstream {
        /// The phase that completed.
        phase: Phase,
    },
}

/// Activation of one (phase, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Phase to run.
    pub phase: Phase,
    /// Date to run.
    pub date: NaiveDate,
    /// Options of the single-date backfill.
    #[serde(default)]
    pub options: BackfillOptions,
    /// Who raised the trigger.
    pub source: TriggerSource,
}

impl Trigger {
    /// Creates a scheduled trigger with default options.
    #[must_use]
    pub fn new(phase: Phase, date: NaiveDate) -> Self {
        Self {
            phase,
            date,
            options: BackfillOptions::default(),
            source: TriggerSource::Schedule,
        }
    }

    /// Sets the options.
    #[must_use]
    pub fn with_options(mut self, options: BackfillOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the source.
    #[must_use]
    pub fn with_source(mut self, source: TriggerSource) -> Self {
        self.source = source;
        self
    }

    /// The activation of the next phase after this one completed, if any.
    ///
    /// Only `force` carries over; selections and gate overrides apply to
    /// the phase they were given for.
    #[must_use]
    pub fn downstream(&self) -> Option<Self> {
        self.phase.downstream().map(|next| Self {
            phase: next,
            date: self.date,
            options: BackfillOptions {
                force: self.options.force,
                ..BackfillOptions::default()
            },
            source: TriggerSource::Upstream { phase: self.phase },
        })
    }
}

/// Outbound activation boundary.
#[async_trait]
pub trait TriggerSink: Send + Sync {
    /// Delivers a trigger to the next phase's boundary.
    async fn notify(&self, trigger: Trigger) -> Result<()>;
}

/// Sink delivering triggers into a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelTriggerSink {
    tx: mpsc::Sender<Trigger>,
}

impl ChannelTriggerSink {
    /// Creates a sink and the receiver it feeds.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Trigger>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TriggerSink for ChannelTriggerSink {
    async fn notify(&self, trigger: Trigger) -> Result<()> {
        self.tx
            .send(trigger)
            .await
            .map_err(|e| PhaseflowError::Store(format!("trigger channel closed, dropped {} {}", e.0.phase, e.0.date)))
    }
}

/// Runs inbound triggers and activates downstream phases.
#[derive(Clone)]
pub struct TriggerRouter {
    coordinator: BackfillCoordinator,
    sink: Option<Arc<dyn TriggerSink>>,
}

impl std::fmt::Debug for TriggerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRouter")
            .field("coordinator", &self.coordinator)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl TriggerRouter {
    /// Creates a router without an outbound sink.
    #[must_use]
    pub fn new(coordinator: BackfillCoordinator) -> Self {
        Self {
            coordinator,
            sink: None,
        }
    }

    /// Sets the outbound sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn TriggerSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Runs the single-date backfill of `trigger`.
    ///
    /// On success the downstream phase is notified when it has a registered
    /// processor. A failed notification is logged; the report is returned
    /// either way.
    pub async fn dispatch(&self, trigger: Trigger, cancel: &CancellationToken) -> Result<BackfillReport> {
        debug!(phase = %trigger.phase, date = %trigger.date, source = ?trigger.source, "Dispatching trigger");
        let report = self
            .coordinator
            .run_backfill(trigger.phase, trigger.date, trigger.date, &trigger.options, cancel)
            .await?;

        if !report.is_success() {
            info!(
                phase = %trigger.phase,
                date = %trigger.date,
                result = ?report.result,
                "Date did not reconcile; downstream not activated"
            );
            return Ok(report);
        }

        let (Some(sink), Some(next)) = (&self.sink, trigger.downstream()) else {
            return Ok(report);
        };
        if !self.coordinator.has_processor(next.phase) {
            debug!(phase = %next.phase, "No processor registered downstream");
            return Ok(report);
        }
        let (phase, date) = (next.phase, next.date);
        match sink.notify(next).await {
            Ok(()) => info!(phase = %phase, date = %date, "Activated downstream phase"),
            Err(e) => warn!(phase = %phase, date = %date, error = %e, "Failed to activate downstream phase"),
        }
        Ok(report)
    }

    /// Dispatches triggers from `rx` until the channel closes or `cancel`
    /// fires. Returns every report produced.
    ///
    /// A trigger that fails before its attempt starts is logged and skipped.
    pub async fn serve(
        &self,
        mut rx: mpsc::Receiver<Trigger>,
        cancel: &CancellationToken,
    ) -> Vec<BackfillReport> {
        let mut reports = Vec::new();
        loop {
            let trigger = tokio::select! {
                () = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(trigger) => trigger,
                    None => break,
                },
            };
            let (phase, date) = (trigger.phase, trigger.date);
            match self.dispatch(trigger, cancel).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(phase = %phase, date = %date, error = %e, "Trigger rejected"),
            }
        }
        reports
    }
}
