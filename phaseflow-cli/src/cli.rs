//! Command-line interface for phaseflow.
//!
//! Wires the library to file-backed state, a JSON upstream snapshot and
//! external processor commands, and maps results onto exit codes:
//! 0 success, 2 partial or interrupted, 1 fatal.

use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use phaseflow::audit::{validate, ValidationReport};
use phaseflow::backfill::{BackfillCoordinator, BackfillOptions, BackfillReport};
use phaseflow::cancellation::CancellationToken;
use phaseflow::config::PhaseflowConfig;
use phaseflow::core::{EntityId, Phase};
use phaseflow::selfheal::{HealRecord, HealState, SelfHealMonitor};
use phaseflow::store::FileStore;
use phaseflow::trigger::{ChannelTriggerSink, Trigger, TriggerRouter, TriggerSource};
use phaseflow::utils::DateRange;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::command_processor::CommandProcessor;
use crate::snapshot::SnapshotUpstream;

/// Orchestration of date-partitioned, multi-phase batch pipelines.
#[derive(Parser, Debug)]
#[command(name = "phaseflow")]
#[command(about = "Backfill, validate and self-heal date-partitioned pipeline phases")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true, env = "PHASEFLOW_LOG_LEVEL")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Print results as JSON instead of a table.
    #[arg(long, global = true)]
    pub json: bool,

    /// Configuration file.
    #[arg(short, long, default_value = "phaseflow.yaml", global = true, env = "PHASEFLOW_CONFIG")]
    pub config: PathBuf,

    /// Directory holding run history, ledgers and self-heal records.
    #[arg(long, default_value = ".phaseflow", global = true, env = "PHASEFLOW_STATE_DIR")]
    pub state_dir: PathBuf,

    /// Upstream snapshot document.
    #[arg(long, default_value = "upstream.json", global = true, env = "PHASEFLOW_UPSTREAM")]
    pub upstream: PathBuf,
}

/// Available subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Process a phase over a date range, resuming after the last checkpoint.
    Backfill(BackfillArgs),

    /// Audit a phase over a date range with the strict gate; never writes.
    Validate(ValidateArgs),

    /// Run one (phase, date) activation, optionally cascading downstream.
    Trigger(TriggerArgs),

    /// Remediate a date immediately, bypassing the grace deadline.
    Force(DateArgs),

    /// Run one self-heal tick for a date.
    Heal(DateArgs),
}

/// Arguments for `phaseflow backfill`.
#[derive(clap::Args, Debug)]
pub struct BackfillArgs {
    /// Phase to process.
    #[arg(short, long)]
    pub phase: Phase,

    /// First date (inclusive).
    #[arg(long)]
    pub start: NaiveDate,

    /// Last date (inclusive); defaults to `start`.
    #[arg(long)]
    pub end: Option<NaiveDate>,

    /// Skip the input-side completeness gate.
    #[arg(long)]
    pub skip_preflight: bool,

    /// Output coverage ratio below which a date warns.
    #[arg(long)]
    pub min_coverage: Option<f64>,

    /// Reprocess dates an earlier invocation already committed.
    #[arg(long)]
    pub force: bool,

    /// Only these dates of the range (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub dates: Vec<NaiveDate>,

    /// Only these entities of each expected set (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub entities: Vec<String>,
}

impl BackfillArgs {
    fn options(&self) -> BackfillOptions {
        BackfillOptions {
            skip_preflight: self.skip_preflight,
            force: self.force,
            min_coverage: self.min_coverage,
            dates: (!self.dates.is_empty()).then(|| self.dates.iter().copied().collect()),
            entities: (!self.entities.is_empty())
                .then(|| self.entities.iter().map(|e| EntityId::key(e.as_str())).collect()),
            ..BackfillOptions::default()
        }
    }
}

/// Arguments for `phaseflow validate`.
#[derive(clap::Args, Debug)]
pub struct ValidateArgs {
    /// Phase to audit.
    #[arg(short, long)]
    pub phase: Phase,

    /// First date (inclusive).
    #[arg(long)]
    pub start: NaiveDate,

    /// Last date (inclusive); defaults to `start`.
    #[arg(long)]
    pub end: Option<NaiveDate>,

    /// Also run the reconciliation checker for each date.
    #[arg(long)]
    pub reconcile: bool,
}

/// Arguments for `phaseflow trigger`.
#[derive(clap::Args, Debug)]
pub struct TriggerArgs {
    /// Phase to run.
    #[arg(short, long)]
    pub phase: Phase,

    /// Date to run.
    #[arg(long)]
    pub date: NaiveDate,

    /// Keep running downstream phases while dates reconcile.
    #[arg(long)]
    pub chain: bool,

    /// Reprocess even if already committed.
    #[arg(long)]
    pub force: bool,
}

/// Arguments naming a single target date.
#[derive(clap::Args, Debug)]
pub struct DateArgs {
    /// Target date.
    #[arg(long)]
    pub date: NaiveDate,
}

/// Parses the command line.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command and returns the process exit code.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    let coordinator = build_coordinator(&cli, &config).await?;
    let cancel = cancel_on_ctrl_c();

    match &cli.command {
        Commands::Backfill(args) => {
            let end = args.end.unwrap_or(args.start);
            let report = coordinator
                .run_backfill(args.phase, args.start, end, &args.options(), &cancel)
                .await
                .with_context(|| format!("backfill of {} {}..{} could not start", args.phase, args.start, end))?;
            emit(&cli, &report, BackfillReport::render_table)?;
            Ok(report.exit_code())
        }
        Commands::Validate(args) => {
            let range = DateRange::new(args.start, args.end.unwrap_or(args.start))?;
            let report = validate(&coordinator, args.phase, range, args.reconcile).await;
            emit(&cli, &report, ValidationReport::render_table)?;
            Ok(report.exit_code())
        }
        Commands::Trigger(args) => run_trigger(&cli, coordinator, args, &cancel).await,
        Commands::Force(args) => {
            let monitor = SelfHealMonitor::new(coordinator, config.heal_policy());
            let record = monitor.force(args.date, &cancel).await.context("forced remediation failed")?;
            emit(&cli, &record, render_heal)?;
            Ok(heal_exit_code(&record))
        }
        Commands::Heal(args) => {
            let monitor = SelfHealMonitor::new(coordinator, config.heal_policy());
            let record = monitor.tick(args.date, &cancel).await.context("self-heal tick failed")?;
            emit(&cli, &record, render_heal)?;
            Ok(heal_exit_code(&record))
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<PhaseflowConfig> {
    if cli.config.exists() {
        PhaseflowConfig::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))
    } else {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
        Ok(PhaseflowConfig::default())
    }
}

async fn build_coordinator(cli: &Cli, config: &PhaseflowConfig) -> anyhow::Result<BackfillCoordinator> {
    let store = FileStore::open(&cli.state_dir)
        .await
        .with_context(|| format!("opening state directory {}", cli.state_dir.display()))?
        .with_lock_timeout(config.locks.file_lock_timeout())
        .with_stale_lock_after(config.locks.stale_lock_file_after());
    let store = Arc::new(store);
    let upstream = Arc::new(SnapshotUpstream::new(&cli.upstream));

    let mut coordinator = config
        .coordinator(upstream, store.clone(), store)
        .with_event_sink(phaseflow::events::default_sink());
    for (phase, phase_config) in &config.phases {
        if !phase_config.has_command() {
            continue;
        }
        let mut processor = CommandProcessor::new(*phase, phase_config.command.clone())?;
        if let Some(version) = &phase_config.source_version {
            processor = processor.with_source_version(version.clone());
        }
        coordinator = coordinator.with_processor(*phase, Arc::new(processor));
    }
    Ok(coordinator)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current date");
            signalled.cancel("interrupted by signal");
        }
    });
    token
}

async fn run_trigger(
    cli: &Cli,
    coordinator: BackfillCoordinator,
    args: &TriggerArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<i32> {
    let (sink, mut rx) = ChannelTriggerSink::channel(1);
    let router = TriggerRouter::new(coordinator).with_sink(Arc::new(sink));

    let options = BackfillOptions {
        force: args.force,
        ..BackfillOptions::default()
    };
    let mut next = Some(
        Trigger::new(args.phase, args.date)
            .with_options(options)
            .with_source(TriggerSource::Manual),
    );
    let mut reports = Vec::new();
    while let Some(trigger) = next.take() {
        let phase = trigger.phase;
        let report = router
            .dispatch(trigger, cancel)
            .await
            .with_context(|| format!("{phase} {} could not start", args.date))?;
        reports.push(report);
        if args.chain {
            next = rx.try_recv().ok();
        }
    }
    info!(phases = reports.len(), "Trigger chain finished");

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("== {}", report.attempt.key.phase);
            print!("{}", report.render_table());
        }
    }
    Ok(reports.iter().map(BackfillReport::exit_code).fold(0, worst_exit_code))
}

fn worst_exit_code(a: i32, b: i32) -> i32 {
    if a == 1 || b == 1 {
        1
    } else {
        a.max(b)
    }
}

fn emit<T: Serialize>(cli: &Cli, value: &T, table: fn(&T) -> String) -> anyhow::Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{}", table(value));
    }
    Ok(())
}

fn heal_exit_code(record: &HealRecord) -> i32 {
    match record.state {
        HealState::Verified => 0,
        HealState::Failed => 1,
        HealState::Idle | HealState::Checking | HealState::Remediating => 2,
    }
}

fn render_heal(record: &HealRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {}: {} after {} cycle(s)",
        record.phase, record.date, record.state, record.cycles
    );
    for t in &record.history {
        let _ = writeln!(
            out,
            "  {} {} -> {}  {}",
            t.at.format("%Y-%m-%dT%H:%M:%SZ"),
            t.from,
            t.to,
            t.note
        );
    }
    out
}
