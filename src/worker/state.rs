//! Worker state machine.

use serde::Serialize;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "causes")]
pub enum WorkerState {
    /// Unit built, task not started.
    Constructed,
    /// Task spawned and looping.
    Running,
    /// Exit requested and the loop returned.
    Stopped,
    /// Terminal: too many errors or an exit request from the unit.
    Failed(Vec<String>),
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: &WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            // From Constructed
            (Constructed, Running) |
            // From Running
            (Running, Stopped) | (Running, Failed(_)) |
            // Rebuild after a stop or a failure
            (Stopped, Constructed) | (Failed(_), Constructed) |
            (Stopped, Running)
        )
    }

    /// Check if the worker must be rebuilt before it can run again.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Constructed => "constructed",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed(_) => "failed",
        };
        write!(f, "{s}")
    }
}
