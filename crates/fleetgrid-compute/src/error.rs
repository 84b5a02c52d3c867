//! Error types for compute backends.

use thiserror::Error;

/// Result type alias for compute operations.
pub type ComputeResult<T> = Result<T, ComputeError>;

/// Failures a backend reports back to the pipelines.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputeError {
    /// The backend has no offer or quota for the request. Never fatal.
    #[error("no capacity: {0}")]
    NoCapacity(String),

    /// A backend API call failed.
    #[error("backend error: {message}")]
    Backend { message: String, recoverable: bool },

    #[error("not found: {0}")]
    NotFound(String),
}

impl ComputeError {
    /// Whether the caller should leave the entity in place and try again.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ComputeError::NoCapacity(_) => true,
            ComputeError::Backend { recoverable, .. } => *recoverable,
            ComputeError::NotFound(_) => false,
        }
    }
}
