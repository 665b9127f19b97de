use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Build-time errors
    #[error("Workflow definition error: {0}")]
    WorkflowDefinition(String),

    // Run-time errors
    #[error("Executor failed: {executor}: {message}")]
    ExecutorFailed { executor: String, message: String },

    #[error("Max retries exceeded for message {message_id} ({max_retries} retries)")]
    MaxRetriesExceeded { message_id: String, max_retries: u32 },

    #[error("Sub-workflow {executor} failed: {message}")]
    Subworkflow { executor: String, message: String },

    #[error("Payload type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Executor timed out after {timeout_ms}ms: {executor}")]
    Timeout { executor: String, timeout_ms: u64 },

    #[error("Run cancelled")]
    Cancelled,

    // Checkpoint errors
    #[error("Checkpoint does not match workflow: {0}")]
    CheckpointMismatch(String),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Shorthand for an executor failure raised from inside a handler.
    pub fn executor(executor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecutorFailed {
            executor: executor.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a build-time graph validation failure.
    pub fn definition(message: impl Into<String>) -> Self {
        Self::WorkflowDefinition(message.into())
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
