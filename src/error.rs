//! Error taxonomy for a run.
//!
//! [`Error`] aborts the run before anything is written. [`Warning`]s are
//! recoverable: the affected event or record is skipped, truncated or clamped
//! and the run carries on.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;

/// Fatal errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to parse calendar: {0}")]
    Parse(#[from] ParseError),

    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write dataset: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode dataset: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to move dataset into place: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// The calendar text could not be understood.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    Grammar { line: usize, message: String },

    #[error("{0}")]
    Invalid(String),
}

impl From<anyhow::Error> for ParseError {
    fn from(err: anyhow::Error) -> Self {
        // Keep the whole context chain, e.g. "parsing VEVENT: Missing UID".
        ParseError::Invalid(format!("{:#}", err))
    }
}

/// A recurrence rule whose grammar could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid recurrence rule {rule:?}: {reason}")]
pub struct RecurrenceError {
    pub rule: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("{name} delimiter cannot be empty")]
    EmptyDelimiter { name: &'static str },

    #[error("expansion window is empty: {start} is not before {end}")]
    EmptyWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("maximum occurrence count must be at least 1")]
    ZeroOccurrenceCap,

    #[error("unknown weekday: {0:?}")]
    UnknownWeekday(String),

    #[error("unknown period {0:?}, expected one of 1w, 2w, 1m, 3m, 6m, 1y, 2y, 5y")]
    UnknownPeriod(String),

    #[error("focus session minimum cannot be negative: {0} minutes")]
    NegativeFocusMinimum(i64),
}

/// Recoverable data problems.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataAnomaly {
    #[error("event {uid} at {start} ends {minutes} minutes before it starts; duration clamped to zero")]
    NegativeDuration {
        uid: String,
        start: DateTime<FixedOffset>,
        minutes: i64,
    },

    #[error("event {uid} has more occurrences than the cap of {cap} allows; expansion truncated")]
    ExpansionTruncated { uid: String, cap: usize },

    #[error("event {uid} has more than one override for {slot}; keeping the first")]
    ConflictingOverride { uid: String, slot: DateTime<Utc> },

    #[error("event {uid} has an override for {slot} that cannot be applied; ignored")]
    UnmatchedOverride { uid: String, slot: DateTime<Utc> },

    #[error("event {uid} appears more than once; keeping the first")]
    DuplicateEvent { uid: String },

    #[error("event {uid} has INTERVAL=0; treating it as 1")]
    DegenerateInterval { uid: String },

    #[error("time zone {tzid:?} is not defined; treating times as UTC")]
    UnknownTimeZone { tzid: String },
}

/// Anything recoverable that happened during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    Recurrence { uid: String, error: RecurrenceError },
    Anomaly(DataAnomaly),
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::Recurrence { uid, error } => write!(f, "skipped event {}: {}", uid, error),
            Warning::Anomaly(anomaly) => anomaly.fmt(f),
        }
    }
}

impl From<DataAnomaly> for Warning {
    fn from(anomaly: DataAnomaly) -> Self {
        Warning::Anomaly(anomaly)
    }
}

/// Collects warnings for the caller to report.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn push(&mut self, warning: impl Into<Warning>) {
        self.warnings.push(warning.into());
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }
}
