use thiserror::Error;

use crate::coord::types::WorkflowPhase;

/// Errors returned by the coordinator's public operations.
///
/// Phase failures and timeouts are not errors at this level: they are
/// recorded in the entity's `ExecutionState` and broadcast as events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error("Entity already executing: {entity_id}")]
    AlreadyExecuting { entity_id: String },

    #[error("Maximum concurrent executions reached (limit: {limit})")]
    MaxConcurrentReached { limit: usize },

    #[error("Entity not executing: {entity_id}")]
    NotExecuting { entity_id: String },

    #[error("Maximum retries exceeded for {entity_id} (max: {max_retries})")]
    MaxRetriesExceeded { entity_id: String, max_retries: u32 },

    #[error("No permitted phase to run for {entity_id} after {after:?}")]
    NoPhaseToRun {
        entity_id: String,
        after: Option<WorkflowPhase>,
    },

    #[error("Phase is not auto-executable: {phase}")]
    PhaseNotExecutable { phase: WorkflowPhase },

    #[error("Stale agent completion for {entity_id}: {agent_handle}")]
    StaleAgent {
        entity_id: String,
        agent_handle: String,
    },

    #[error("Stale dispatch for {entity_id}: {dispatch_id}")]
    StaleDispatch { entity_id: String, dispatch_id: u64 },

    #[error("Configuration invalid: {0}")]
    InvalidConfiguration(String),

    #[error("Coordinator must be created inside a tokio runtime")]
    NoRuntime,

    #[error("Coordinator has been disposed")]
    Disposed,
}

impl CoordinatorError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Stable code for transports that forward errors to a UI.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExecuting { .. } => "ALREADY_EXECUTING",
            Self::MaxConcurrentReached { .. } => "MAX_CONCURRENT_REACHED",
            Self::NotExecuting { .. } => "NOT_EXECUTING",
            Self::MaxRetriesExceeded { .. } => "MAX_RETRIES_EXCEEDED",
            Self::NoPhaseToRun { .. } => "NO_PHASE_TO_RUN",
            Self::PhaseNotExecutable { .. } => "PHASE_NOT_EXECUTABLE",
            Self::StaleAgent { .. } => "STALE_AGENT",
            Self::StaleDispatch { .. } => "STALE_DISPATCH",
            Self::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            Self::NoRuntime => "NO_RUNTIME",
            Self::Disposed => "DISPOSED",
        }
    }

    /// Whether the same call may succeed later without caller changes.
    ///
    /// Capacity frees up as other entities are stopped; everything else
    /// needs a different call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::MaxConcurrentReached { .. })
    }
}

/// Result type alias for CoordinatorError
pub type Result<T> = std::result::Result<T, CoordinatorError>;
