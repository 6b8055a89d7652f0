//! Error types for the phaseflow orchestration layer.
//!
//! The taxonomy separates faults that are expected to clear on retry
//! (`TransientInfra`) from faults that describe the data (`DependencyMissing`,
//! `DataQuality`), coordination conflicts (`LockHeld`) and operator mistakes
//! (`Configuration`). Only the first kind is ever retried automatically.

use chrono::NaiveDate;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;
use uuid::Uuid;

use crate::core::Phase;

/// The main error type for phaseflow operations.
#[derive(Debug, Error)]
pub enum PhaseflowError {
    /// An infrastructure fault expected to resolve on retry.
    #[error("Transient infrastructure error ({kind}): {message}")]
    TransientInfra {
        /// Which whitelisted transient condition occurred.
        kind: TransientKind,
        /// Human readable detail.
        message: String,
    },

    /// Upstream expected set or outputs are absent.
    #[error("Missing upstream dependency: {message}")]
    DependencyMissing {
        /// References to the missing upstream artifacts (tables, phases).
        refs: Vec<String>,
        /// Human readable detail.
        message: String,
        /// Whether a later rerun is expected to fix the gap.
        correctable: bool,
    },

    /// The entity is present upstream but its data is invalid.
    #[error("Data quality error: {0}")]
    DataQuality(String),

    /// Another non-stale attempt holds the lock for this key.
    #[error("Lock held for {phase}/{date} by attempt {holder}")]
    LockHeld {
        /// Phase of the contended key.
        phase: Phase,
        /// Date of the contended key.
        date: NaiveDate,
        /// Attempt currently holding the lock.
        holder: Uuid,
    },

    /// Invalid configuration; always aborts the whole attempt.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A value could not be canonicalized or (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A durable store rejected an operation for a non-transient reason.
    #[error("Store error: {0}")]
    Store(String),

    /// The operation observed an external stop signal.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The whitelist of transient infrastructure conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    /// An operation timed out.
    Timeout,
    /// The peer reset the connection.
    ConnectionReset,
    /// The service reported itself unavailable.
    Unavailable,
    /// A server-side deadline elapsed.
    DeadlineExceeded,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::ConnectionReset => write!(f, "connection_reset"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::DeadlineExceeded => write!(f, "deadline_exceeded"),
        }
    }
}

// Order matters: the first matching pattern decides the kind, and
// "deadline exceeded" must win over the generic timeout wording.
const TRANSIENT_PATTERNS: [(&str, TransientKind); 4] = [
    (r"(?i)deadline[ _-]?exceeded", TransientKind::DeadlineExceeded),
    (r"(?i)timed?[ _-]?out|timeout", TransientKind::Timeout),
    (r"(?i)connection[ _-]?(reset|refused|aborted)|broken pipe|econnreset", TransientKind::ConnectionReset),
    (r"(?i)\bunavailable\b|\b503\b|service[ _-]?busy|try again later", TransientKind::Unavailable),
];

fn transient_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new(TRANSIENT_PATTERNS.iter().map(|(p, _)| *p))
            .unwrap_or_else(|_| RegexSet::empty())
    })
}

impl TransientKind {
    /// Classifies a free-form error message against the transient whitelist.
    ///
    /// Returns `None` when the message does not describe a whitelisted
    /// condition, in which case the error must not be retried.
    #[must_use]
    pub fn classify(message: &str) -> Option<Self> {
        transient_patterns()
            .matches(message)
            .iter()
            .next()
            .map(|idx| TRANSIENT_PATTERNS[idx].1)
    }

    /// Maps an IO error kind onto the whitelist.
    #[must_use]
    pub fn from_io(kind: std::io::ErrorKind) -> Option<Self> {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Some(Self::Timeout),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe => Some(Self::ConnectionReset),
            ErrorKind::Interrupted => Some(Self::Unavailable),
            _ => None,
        }
    }
}

impl PhaseflowError {
    /// Creates a transient error of the given kind.
    #[must_use]
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::TransientInfra {
            kind,
            message: message.into(),
        }
    }

    /// Creates a correctable dependency-missing error.
    #[must_use]
    pub fn dependency_missing(refs: Vec<String>, message: impl Into<String>) -> Self {
        Self::DependencyMissing {
            refs,
            message: message.into(),
            correctable: true,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Builds an error from an opaque infrastructure message, classifying it
    /// as transient when it matches the whitelist and as a store error
    /// otherwise.
    #[must_use]
    pub fn from_infra_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match TransientKind::classify(&message) {
            Some(kind) => Self::TransientInfra { kind, message },
            None => Self::Store(message),
        }
    }

    /// Returns true if the error is on the transient whitelist.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientInfra { .. } => true,
            Self::Io(e) => TransientKind::from_io(e.kind()).is_some(),
            _ => false,
        }
    }

    /// Returns true if the error must abort the whole run attempt.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::LockHeld { .. })
    }

    /// Short stable name of the error class, used in outcome tables.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::TransientInfra { .. } => "TransientInfraError",
            Self::DependencyMissing { .. } => "DependencyMissingError",
            Self::DataQuality(_) => "DataQualityError",
            Self::LockHeld { .. } => "LockHeldError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Serialization(_) | Self::Json(_) => "SerializationError",
            Self::Store(_) => "StoreError",
            Self::Cancelled(_) => "Cancelled",
            Self::Io(_) => "IoError",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind_name()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("transient".to_string(), serde_json::json!(self.is_transient()));

        match self {
            Self::TransientInfra { kind, .. } => {
                map.insert("kind".to_string(), serde_json::json!(kind));
            }
            Self::DependencyMissing {
                refs, correctable, ..
            } => {
                map.insert("refs".to_string(), serde_json::json!(refs));
                map.insert("correctable".to_string(), serde_json::json!(correctable));
            }
            Self::LockHeld {
                phase,
                date,
                holder,
            } => {
                map.insert("phase".to_string(), serde_json::json!(phase));
                map.insert("date".to_string(), serde_json::json!(date));
                map.insert("holder".to_string(), serde_json::json!(holder));
            }
            _ => {}
        }

        map
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = PhaseflowError> = std::result::Result<T, E>;
