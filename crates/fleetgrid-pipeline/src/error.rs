//! Error types for the pipeline engine.

use fleetgrid_state::StateError;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("invalid pipeline config: {0}")]
    Config(String),

    #[error("pipeline task failed: {0}")]
    Join(String),
}
