use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Malformed or placeholder identity. Rejected at context creation,
    /// never enters the system.
    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("agent type '{name}' is already registered with a different descriptor")]
    DuplicateConflict { name: String },

    #[error("registry frozen at {frozen_at}: cannot register '{name}'")]
    FrozenViolation {
        name: String,
        frozen_at: DateTime<Utc>,
    },

    /// Per-run fatal: the context names an agent type the frozen registry
    /// does not know.
    #[error("agent type not found: {0}")]
    AgentNotFound(String),

    /// Caught at the engine boundary and surfaced as a terminal `error`
    /// event; never propagates to sibling engines.
    #[error("engine execution failed: {0}")]
    EngineExecutionFailure(String),

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// The core isolation invariant has been violated. Fatal-and-alerted.
    #[error(
        "cross-user leakage detected: event for run {run_id} carries user '{event_user}' \
         but the run is owned by '{owner}'"
    )]
    CrossUserLeakageDetected {
        run_id: String,
        event_user: String,
        owner: String,
    },
}

impl WardenError {
    pub fn is_invalid_context(&self) -> bool {
        matches!(self, Self::InvalidContext(_))
    }

    pub fn is_leakage(&self) -> bool {
        matches!(self, Self::CrossUserLeakageDetected { .. })
    }
}
