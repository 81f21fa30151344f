//! Error types for browsercast

use thiserror::Error;

/// Result type alias using the browsercast Error
pub type Result<T> = std::result::Result<T, Error>;

/// Browsercast error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No free {resource} within the scan window")]
    ResourceExhausted { resource: String },

    #[error("Session already exists: {id}")]
    Conflict { id: String },

    #[error("Session not found: {id}")]
    NotFound { id: String },

    #[error("Session {id} is not ready (status: {status})")]
    NotReady { id: String, status: String },

    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Child process failure: {0}")]
    ProcessFailure(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Partial cleanup failure: {0}")]
    PartialCleanup(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error identifies a caller mistake rather than a
    /// platform fault. Used by the web layer to pick 4xx over 5xx.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. }
                | Error::NotFound { .. }
                | Error::NotReady { .. }
                | Error::InvalidRequest(_)
        )
    }
}
