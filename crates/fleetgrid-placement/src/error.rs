//! Placement error types.

use thiserror::Error;

/// Errors that can occur while placing a job.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// The instance behind an offer no longer has the blocks it advertised.
    #[error("instance {0} can no longer take the job")]
    CapacityLost(String),

    /// The offer cannot be used for this fleet.
    #[error("offer rejected: {0}")]
    InvalidOffer(String),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}

pub type PlacementResult<T> = Result<T, PlacementError>;
