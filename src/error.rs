//! Error types for the NuvlaEdge agent.

use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("COE error: {0}")]
    Coe(#[from] CoeError),

    #[error("Nuvla error: {0}")]
    Nuvla(#[from] NuvlaError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by the periodic action scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("No actions registered")]
    Empty,
}

/// Errors a unit action may return to its worker.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    /// The unit cannot keep running (e.g. the host configuration changed) and
    /// asks its worker to terminate immediately.
    #[error("Exit requested: {0}")]
    ExitRequested(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl UnitError {
    pub fn exit(reason: impl Into<String>) -> Self {
        Self::ExitRequested(reason.into())
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Self::ExitRequested(_))
    }

    /// Short type name used by status summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExitRequested(_) => "ExitRequested",
            Self::Failed(_) => "Failed",
        }
    }
}

/// Why a worker entered its terminal failed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    ExitRequested,
    TooManyErrors,
}

impl std::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExitRequested => write!(f, "exit requested"),
            Self::TooManyErrors => write!(f, "too many errors"),
        }
    }
}

/// Worker supervision errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Aggregate of every error collected by the worker before it gave up.
    #[error("Worker {worker} failed ({reason}) after {} errors", causes.len())]
    Fatal {
        worker: String,
        reason: FatalReason,
        causes: Vec<String>,
    },

    #[error("Worker {worker} could not build its unit: {source}")]
    Build {
        worker: String,
        #[source]
        source: UnitError,
    },

    #[error("Worker {worker} period {period:?} is too short to schedule")]
    InvalidPeriod { worker: String, period: Duration },

    #[error("Worker {worker} stop not confirmed within {timeout:?}")]
    StopTimeout { worker: String, timeout: Duration },
}

/// Container orchestration engine errors.
#[derive(Debug, thiserror::Error)]
pub enum CoeError {
    #[error("COE request failed: {0}")]
    RequestFailed(String),

    #[error("Operation {0} not supported by this orchestrator")]
    Unsupported(String),
}

/// Nuvla API errors.
#[derive(Debug, thiserror::Error)]
pub enum NuvlaError {
    #[error("Nuvla request {operation} failed: {reason}")]
    RequestFailed { operation: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
