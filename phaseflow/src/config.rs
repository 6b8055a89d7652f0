//! Orchestration configuration.
//!
//! A single YAML document describes every phase's upstream dependencies and
//! processor command, the retry schedule, lock staleness, self-heal bounds
//! and hashing precision. Missing sections fall back to their defaults.
//!
//! ```yaml
//! min_coverage: 0.9
//! phases:
//!   analytics:
//!     command: ["bin/analytics", "--date", "{date}"]
//!     dependencies:
//!       - table: raw.box_scores
//!         expected_min: 200
//!         hard_required: true
//! self_heal:
//!   grace_hours: 10
//!   max_cycles: 3
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::backfill::{BackfillCoordinator, RetryPolicy, DEFAULT_MIN_COVERAGE};
use crate::core::Phase;
use crate::errors::{PhaseflowError, Result};
use crate::gate::DependencySpec;
use crate::hashing::{ContentHasher, DEFAULT_FLOAT_DIGITS};
use crate::selfheal::HealPolicy;
use crate::store::{OutputStore, RunHistoryStore, UpstreamSource};

const MAX_FLOAT_DIGITS: u32 = 15;
const MAX_LOOKBACK_DAYS: u32 = 366;

fn table_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").ok())
        .as_ref()
}

/// Settings of one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Upstream tables checked by the completeness gate.
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    /// Processor command (program and arguments). `{date}` and `{phase}`
    /// are substituted per invocation.
    #[serde(default)]
    pub command: Vec<String>,
    /// Version stamped on outputs when the processor does not report one.
    #[serde(default)]
    pub source_version: Option<String>,
}

impl PhaseConfig {
    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Sets the processor command.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// True when a processor command is configured.
    #[must_use]
    pub fn has_command(&self) -> bool {
        !self.command.is_empty()
    }
}

/// Advisory lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Age after which a `running` attempt is considered stale.
    #[serde(default = "default_max_attempt_duration_secs")]
    pub max_attempt_duration_secs: u64,
    /// How long the file store waits for its lock file.
    #[serde(default = "default_file_lock_timeout_ms")]
    pub file_lock_timeout_ms: u64,
    /// Age after which a leftover lock file is removed.
    #[serde(default = "default_stale_lock_file_secs")]
    pub stale_lock_file_secs: u64,
}

fn default_max_attempt_duration_secs() -> u64 {
    6 * 60 * 60
}

fn default_file_lock_timeout_ms() -> u64 {
    5_000
}

fn default_stale_lock_file_secs() -> u64 {
    60
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempt_duration_secs: default_max_attempt_duration_secs(),
            file_lock_timeout_ms: default_file_lock_timeout_ms(),
            stale_lock_file_secs: default_stale_lock_file_secs(),
        }
    }
}

impl LockConfig {
    /// File-store lock wait.
    #[must_use]
    pub fn file_lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.file_lock_timeout_ms)
    }

    /// File-store lock-file staleness.
    #[must_use]
    pub fn stale_lock_file_after(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stale_lock_file_secs)
    }
}

/// Self-heal settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfHealConfig {
    /// Phase whose output is the deliverable.
    #[serde(default = "default_terminal_phase")]
    pub terminal_phase: Phase,
    /// Hours after the end of the target date before remediation starts.
    #[serde(default = "default_grace_hours")]
    pub grace_hours: u32,
    /// Remediation cycles before a date is parked as failed.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
}

fn default_terminal_phase() -> Phase {
    Phase::Publishing
}

fn default_grace_hours() -> u32 {
    10
}

fn default_max_cycles() -> u32 {
    3
}

impl Default for SelfHealConfig {
    fn default() -> Self {
        Self {
            terminal_phase: default_terminal_phase(),
            grace_hours: default_grace_hours(),
            max_cycles: default_max_cycles(),
        }
    }
}

/// Hashing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashConfig {
    /// Fractional digits kept when canonicalizing numbers.
    #[serde(default = "default_float_digits")]
    pub float_digits: u32,
}

fn default_float_digits() -> u32 {
    DEFAULT_FLOAT_DIGITS
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            float_digits: default_float_digits(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseflowConfig {
    /// Per-phase settings.
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseConfig>,
    /// Transient retry schedule.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Advisory lock settings.
    #[serde(default)]
    pub locks: LockConfig,
    /// Self-heal settings.
    #[serde(default)]
    pub self_heal: SelfHealConfig,
    /// Hashing settings.
    #[serde(default)]
    pub hashing: HashConfig,
    /// Default output-coverage ratio below which a date warns.
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
}

fn default_min_coverage() -> f64 {
    DEFAULT_MIN_COVERAGE
}

impl Default for PhaseflowConfig {
    fn default() -> Self {
        Self {
            phases: BTreeMap::new(),
            retry: RetryPolicy::default(),
            locks: LockConfig::default(),
            self_heal: SelfHealConfig::default(),
            hashing: HashConfig::default(),
            min_coverage: default_min_coverage(),
        }
    }
}

impl PhaseflowConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| PhaseflowError::configuration(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PhaseflowError::configuration(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_yaml_str(&content)?;
        debug!(path = %path.display(), phases = config.phases.len(), "Loaded configuration");
        Ok(config)
    }

    /// Serializes to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| PhaseflowError::Serialization(e.to_string()))
    }

    /// Sets the settings of `phase`.
    #[must_use]
    pub fn with_phase(mut self, phase: Phase, config: PhaseConfig) -> Self {
        self.phases.insert(phase, config);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the default coverage ratio.
    #[must_use]
    pub fn with_min_coverage(mut self, ratio: f64) -> Self {
        self.min_coverage = ratio;
        self
    }

    /// Settings of `phase`, if configured.
    #[must_use]
    pub fn phase(&self, phase: Phase) -> Option<&PhaseConfig> {
        self.phases.get(&phase)
    }

    /// Checks the configuration for inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_coverage) {
            return Err(PhaseflowError::configuration(format!(
                "min_coverage must be within [0, 1], got {}",
                self.min_coverage
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(PhaseflowError::configuration(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.locks.max_attempt_duration_secs == 0 {
            return Err(PhaseflowError::configuration(
                "locks.max_attempt_duration_secs must be positive",
            ));
        }
        if self.self_heal.max_cycles == 0 {
            return Err(PhaseflowError::configuration("self_heal.max_cycles must be positive"));
        }
        if self.hashing.float_digits > MAX_FLOAT_DIGITS {
            return Err(PhaseflowError::configuration(format!(
                "hashing.float_digits must be at most {MAX_FLOAT_DIGITS}"
            )));
        }

        let pattern = table_name_pattern()
            .ok_or_else(|| PhaseflowError::configuration("table name pattern failed to compile"))?;
        for (phase, config) in &self.phases {
            let mut seen = HashSet::new();
            for dep in &config.dependencies {
                if !pattern.is_match(&dep.table) {
                    return Err(PhaseflowError::configuration(format!(
                        "{phase}: invalid dependency table '{}'",
                        dep.table
                    )));
                }
                if !seen.insert(dep.table.as_str()) {
                    return Err(PhaseflowError::configuration(format!(
                        "{phase}: dependency table '{}' listed twice",
                        dep.table
                    )));
                }
                if dep.lookback_days > MAX_LOOKBACK_DAYS {
                    return Err(PhaseflowError::configuration(format!(
                        "{phase}: lookback_days of '{}' exceeds {MAX_LOOKBACK_DAYS}",
                        dep.table
                    )));
                }
            }
            if config.command.first().is_some_and(|program| program.trim().is_empty()) {
                return Err(PhaseflowError::configuration(format!("{phase}: empty command program")));
            }
        }
        Ok(())
    }

    /// The self-heal policy.
    #[must_use]
    pub fn heal_policy(&self) -> HealPolicy {
        HealPolicy {
            terminal_phase: self.self_heal.terminal_phase,
            grace: chrono::Duration::hours(i64::from(self.self_heal.grace_hours)),
            max_cycles: self.self_heal.max_cycles,
            max_attempt_duration: self.max_attempt_duration(),
        }
    }

    /// Age after which a `running` attempt is stale.
    #[must_use]
    pub fn max_attempt_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.locks.max_attempt_duration_secs).unwrap_or(i64::MAX))
    }

    /// The content hasher.
    #[must_use]
    pub fn hasher(&self) -> ContentHasher {
        ContentHasher::with_float_digits(self.hashing.float_digits)
    }

    /// Builds a coordinator with every configured dependency list, the retry
    /// policy, hasher and coverage default applied. Processors are
    /// registered by the caller.
    #[must_use]
    pub fn coordinator(
        &self,
        upstream: Arc<dyn UpstreamSource>,
        outputs: Arc<dyn OutputStore>,
        runs: Arc<dyn RunHistoryStore>,
    ) -> BackfillCoordinator {
        let mut coordinator = BackfillCoordinator::new(upstream, outputs, runs)
            .with_retry_policy(self.retry.clone())
            .with_hasher(self.hasher())
            .with_min_coverage(self.min_coverage);
        for (phase, config) in &self.phases {
            coordinator = coordinator.with_dependencies(*phase, config.dependencies.clone());
        }
        coordinator
    }
}
