//! Error types for the analyst orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Run-level errors. A run either yields a complete decision or exactly one of these.
#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Fatal configuration error: {0}")]
    FatalConfiguration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Aggregation error: {0}")]
    AggregationError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Only configuration failures are allowed to abort a run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestrationError::FatalConfiguration(_))
    }
}

/// Failure of a single structured inference call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Schema parse error: {0}")]
    SchemaParse(String),

    #[error("Fatal configuration error: {0}")]
    FatalConfiguration(String),
}

impl InvocationError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, InvocationError::FatalConfiguration(_))
    }
}

impl From<InvocationError> for OrchestrationError {
    fn from(err: InvocationError) -> Self {
        match err {
            InvocationError::FatalConfiguration(msg) => OrchestrationError::FatalConfiguration(msg),
            other => OrchestrationError::ExecutionError(other.to_string()),
        }
    }
}
