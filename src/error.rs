//! Error types for the spam pipeline.

use std::time::Duration;

use crate::pipeline::types::MessageId;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by the external capabilities (lookup, fetch, classify).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("No user registered for address {0}")]
    UnknownAddress(String),

    #[error("Unknown message {0}")]
    UnknownMessage(MessageId),

    #[error("Batch of {size} users exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Too many concurrent requests (limit {limit})")]
    TooManyRequests { limit: usize },

    #[error("{call} timed out after {timeout:?}")]
    Timeout {
        call: &'static str,
        timeout: Duration,
    },

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by a stage or by the runner.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Lookup failed for {address}: {source}")]
    Lookup {
        address: String,
        #[source]
        source: ServiceError,
    },

    #[error("Fetch failed for a batch of {batch_size} users: {source}")]
    Fetch {
        batch_size: usize,
        #[source]
        source: ServiceError,
    },

    #[error("Classification failed for message {message_id}: {source}")]
    Classify {
        message_id: MessageId,
        #[source]
        source: ServiceError,
    },

    #[error("Pipeline run was cancelled")]
    Cancelled,

    #[error("Downstream of stage {stage} stopped receiving")]
    DownstreamClosed { stage: &'static str },

    #[error("Returned before draining the output of stage {upstream}")]
    AbandonedInput { upstream: &'static str },

    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Worker task failed: {0}")]
    TaskFailed(String),
}

impl PipelineError {
    /// Whether this error is only a consequence of the run being cancelled.
    ///
    /// `DownstreamClosed` is not: outside a cancelled run it means the next
    /// stage returned without draining its input.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Stage { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::TaskFailed(err.to_string())
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
