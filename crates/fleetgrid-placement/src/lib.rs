//! fleetgrid-placement — where a job runs.
//!
//! Placement is read-mostly: it never takes pipeline leases and never talks
//! to a backend except to list offers. The pieces, bottom-up:
//!
//! - **`filter`** — which existing instances can host a job, as offers
//! - **`selector`** — rank candidate fleets and pick one
//! - **`plan`** — job plans for a whole run (what `fleetd plan` prints)
//! - **`assign`** — commit a chosen offer: reserve blocks or request an instance

pub mod assign;
pub mod error;
pub mod filter;
pub mod plan;
pub mod selector;

pub use assign::{JobRef, assign_job, release_job};
pub use error::{PlacementError, PlacementResult};
pub use filter::{InstanceFilter, VolumeLocation};
pub use plan::{JobPlan, JobSpec, RunSpec, get_job_plans, load_candidates, rank_offers};
pub use selector::{
    FleetCandidate, FleetPriority, FleetSelection, JobQuery, OfferLimits,
    find_optimal_fleet_with_offers,
};
