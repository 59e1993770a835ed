//! Error types for a3s-pipeline

use thiserror::Error;

/// Errors that can occur in the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or oversized input; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Router or transport could not accept an event; safe to retry
    #[error("Failed to publish event '{event_id}': {reason}")]
    Publish {
        event_id: String,
        reason: String,
    },

    /// A single remediation attempt failed
    #[error("Remediation action failed for target '{target_id}' (attempt {attempt}): {reason}")]
    ActionExecution {
        target_id: String,
        attempt: u32,
        reason: String,
    },

    /// A remediation sequence used up every attempt
    #[error("Remediation exhausted for target '{target_id}' after {attempts} attempts")]
    ExhaustedRetry {
        target_id: String,
        attempts: u32,
    },

    /// A message exceeded its receive ceiling and was moved aside
    #[error("Message '{event_id}' dead-lettered from stage '{stage}' after {receive_count} receives")]
    DeadLetter {
        stage: String,
        event_id: String,
        receive_count: u32,
    },

    /// Optimistic concurrency check failed on the key-value store
    #[error("Version conflict on key '{key}': expected {expected:?}, found {found:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// Receipt handle is unknown or no longer owns the message
    #[error("Unknown or expired message handle: {0}")]
    UnknownHandle(String),

    /// Named stage, sink, or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sink write failure
    #[error("Sink '{sink}' failed: {reason}")]
    Sink {
        sink: String,
        reason: String,
    },

    /// Queue backend failure (broker unreachable, ack rejected)
    #[error("Queue '{queue}' failed: {reason}")]
    Queue {
        queue: String,
        reason: String,
    },

    /// A subscriber fell behind and missed notifications
    #[error("Subscriber on topic '{topic}' lagged and missed {skipped} notifications")]
    Lagged {
        topic: String,
        skipped: u64,
    },

    /// Notification transport failure
    #[error("Failed to notify topic '{topic}': {reason}")]
    Notify {
        topic: String,
        reason: String,
    },

    /// The pipeline is draining and no longer accepts work
    #[error("Pipeline is shutting down")]
    ShuttingDown,

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML configuration parse failure
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    /// Whether a caller (or queue redelivery) may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Publish { .. }
                | PipelineError::ActionExecution { .. }
                | PipelineError::VersionConflict { .. }
                | PipelineError::Sink { .. }
                | PipelineError::Queue { .. }
                | PipelineError::Notify { .. }
                | PipelineError::Timeout(_)
                | PipelineError::Io(_)
        )
    }

    /// Whether this error marks a terminal failure that must reach an operator
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineError::ExhaustedRetry { .. } | PipelineError::DeadLetter { .. }
        )
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
