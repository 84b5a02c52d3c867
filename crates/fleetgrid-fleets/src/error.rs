//! Error types for fleet consolidation.

use fleetgrid_state::StateError;
use thiserror::Error;

/// Result type alias for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    /// The fleet's lease was reclaimed before the cycle could commit.
    #[error("lease on fleet {0} was lost")]
    StaleLease(String),

    /// Some of the fleet's instances are leased by another pipeline.
    #[error("could not lock all instances of fleet {0}")]
    LockAcquisition(String),

    /// The persisted spec can never be satisfied.
    #[error("inconsistent fleet configuration: {0}")]
    ConfigurationInconsistency(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}
