//! fleetgrid-state — embedded state store for fleetgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for fleets, instances, gateways, jobs, and projects.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Rows processed by background pipelines embed a [`Lease`] (token, expiry,
//! owner). The store exposes the lease primitives the pipelines are built
//! on:
//!
//! - `claim_batch` — pick due, unleased rows oldest-first and lease them
//! - `extend_lease` — heartbeat, conditioned on the token
//! - `commit` — the single conditional update that also unlocks the row
//! - `lock_fleet_instances` / `commit_fleet_cycle` — two-phase fleet locking
//!
//! Every primitive runs inside one redb write transaction. redb serialises
//! writers, so concurrent claimers in one process never see each other's
//! half-applied state.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod lease;
pub mod leases;
pub mod offers;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use lease::{
    ClaimParams, Lease, LockToken, PipelineEntity, PipelineItem, Record, epoch_millis,
};
pub use leases::FleetCycleCommit;
pub use offers::*;
pub use store::StateStore;
pub use types::*;
