//! fleetgrid-fleets — keeps every fleet's instance count within its
//! `nodes` range.
//!
//! # Consolidation cycle
//!
//! ```text
//! skip if: fleet terminating | no nodes range | autocreated | ssh fleet
//!          | now < (last_consolidated_at or last_processed_at) + retry_delay(attempt)
//!
//! reap       = TERMINATED, not yet deleted instances
//! active     = instances not TERMINATED and not deleted
//! if active < min:
//!     create (min - active) PENDING instances
//! else if active - TERMINATING > max:
//!     mark the youngest IDLE surplus TERMINATING ("too many instances")
//!
//! attempt    = attempt + 1 if anything was created or terminated, else 0
//! retry      = 0, 30s, 1m, 2m, 5m, 10m (capped)
//! ```
//!
//! After the plan the fleet is deleted when its project is gone, or when it
//! would hold no instances and no unfinished jobs (unless it is an active
//! fleet that allows zero nodes). A spec that can never be satisfied is
//! deleted on sight with the reason in `status_message`.

pub mod consolidator;
pub mod error;
pub mod worker;

pub use consolidator::{
    Consolidation, ConsolidationPlan, CycleOutcome, DeleteReason, FleetContext, SkipReason,
    evaluate, retry_delay,
};
pub use error::{FleetError, FleetResult};
pub use worker::FleetWorker;
