//! Phase processor that runs an external command per date.
//!
//! The command receives the requested entity ids on stdin, one per line,
//! and `PHASEFLOW_PHASE` / `PHASEFLOW_DATE` in its environment. `{phase}`
//! and `{date}` in its arguments are substituted. It answers with one JSON
//! object per line on stdout:
//!
//! ```text
//! {"entity_id": "p1", "outcome": "produced", "payload": {...}, "input": {...}}
//! {"entity_id": "p2", "outcome": "absent", "category": "EXPECTED_ABSENCE", "reason": "did not play"}
//! {"entity_id": "p3", "outcome": "error", "kind": "data_quality", "message": "negative minutes"}
//! ```
//!
//! Entities missing from the answer stay unaccounted and surface in
//! reconciliation. A non-zero exit fails the whole call; stderr is
//! classified against the transient whitelist.

use async_trait::async_trait;
use chrono::NaiveDate;
use phaseflow::backfill::{EntityResult, PhaseProcessor, UnitOutput};
use phaseflow::core::{EntityId, Phase};
use phaseflow::errors::{PhaseflowError, Result, TransientKind};
use phaseflow::hashing::FieldValue;
use phaseflow::ledger::FailureCategory;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Default wall-clock limit of one invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Deserialize)]
struct OutcomeLine {
    entity_id: EntityId,
    #[serde(flatten)]
    outcome: LineOutcome,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum LineOutcome {
    Produced {
        payload: serde_json::Value,
        #[serde(default)]
        input: Option<serde_json::Value>,
        #[serde(default)]
        source_version: Option<String>,
    },
    Absent {
        category: FailureCategory,
        reason: String,
        #[serde(default)]
        correctable: Option<bool>,
    },
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(default)]
        refs: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ErrorKind {
    DataQuality,
    DependencyMissing,
    Transient,
}

impl LineOutcome {
    fn into_result(self) -> Result<UnitOutput> {
        match self {
            Self::Produced {
                payload,
                input,
                source_version,
            } => Ok(UnitOutput::Produced {
                payload: FieldValue::from_json(&payload),
                input: input.as_ref().map(FieldValue::from_json),
                source_version,
            }),
            Self::Absent {
                category,
                reason,
                correctable,
            } => Ok(UnitOutput::Absent {
                category,
                reason,
                correctable: correctable.unwrap_or(category != FailureCategory::ExpectedAbsence),
            }),
            Self::Error { kind, message, refs } => Err(match kind {
                ErrorKind::DataQuality => PhaseflowError::DataQuality(message),
                ErrorKind::DependencyMissing => PhaseflowError::dependency_missing(refs, message),
                ErrorKind::Transient => match PhaseflowError::from_infra_message(message) {
                    PhaseflowError::Store(message) => PhaseflowError::transient(TransientKind::Unavailable, message),
                    classified => classified,
                },
            }),
        }
    }
}

/// Runs `program args...` once per (phase, date) call.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    name: String,
    argv: Vec<String>,
    source_version: String,
    timeout: Duration,
}

impl CommandProcessor {
    /// Creates a processor for `argv` (program first).
    pub fn new(phase: Phase, argv: Vec<String>) -> Result<Self> {
        if argv.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(PhaseflowError::configuration(format!("{phase}: no processor command configured")));
        }
        Ok(Self {
            name: format!("{phase}-command"),
            argv,
            source_version: "unversioned".to_string(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Sets the version stamped on outputs that do not report one.
    #[must_use]
    pub fn with_source_version(mut self, version: impl Into<String>) -> Self {
        self.source_version = version.into();
        self
    }

    /// Sets the wall-clock limit of one invocation.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, phase: Phase, date: NaiveDate) -> Command {
        let substitute = |arg: &String| arg.replace("{phase}", phase.as_str()).replace("{date}", &date.to_string());
        let mut cmd = Command::new(substitute(&self.argv[0]));
        cmd.args(self.argv[1..].iter().map(substitute))
            .env("PHASEFLOW_PHASE", phase.as_str())
            .env("PHASEFLOW_DATE", date.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn parse_outcomes(stdout: &str) -> Vec<EntityResult> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<OutcomeLine>(line) {
            Ok(parsed) => Some(EntityResult {
                entity_id: parsed.entity_id,
                outcome: parsed.outcome.into_result(),
            }),
            Err(e) => {
                warn!(error = %e, line, "Ignoring malformed processor output line");
                None
            }
        })
        .collect()
}

#[async_trait]
impl PhaseProcessor for CommandProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_version(&self) -> &str {
        &self.source_version
    }

    async fn process(&self, phase: Phase, date: NaiveDate, entities: &[EntityId]) -> Result<Vec<EntityResult>> {
        info!(program = %self.argv[0], phase = %phase, date = %date, entities = entities.len(), "Running processor command");
        let mut child = self.command(phase, date).spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                PhaseflowError::configuration(format!("cannot run {}: {e}", self.argv[0]))
            }
            _ => PhaseflowError::Io(e),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut input = String::new();
            for entity in entities {
                input.push_str(entity.as_str());
                input.push('\n');
            }
            // A command that exits without reading its input closes the pipe.
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!(error = %e, "Processor did not consume stdin");
            }
            stdin.shutdown().await.ok();
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                PhaseflowError::transient(
                    TransientKind::Timeout,
                    format!("{} timed out after {:?}", self.argv[0], self.timeout),
                )
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(program = %self.argv[0], code, stderr = %stderr.trim(), "Processor command failed");
            return Err(PhaseflowError::from_infra_message(format!(
                "{} exited with {code}: {}",
                self.argv[0],
                stderr.trim()
            )));
        }

        let results = parse_outcomes(&stdout);
        debug!(phase = %phase, date = %date, results = results.len(), "Processor command finished");
        Ok(results)
    }
}
