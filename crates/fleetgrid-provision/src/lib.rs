//! fleetgrid-provision — the pipeline workers that talk to backends.
//!
//! [`InstanceWorker`] launches PENDING instances (trying offers cheapest
//! first), activates them once launched, and terminates TERMINATING ones.
//! [`GatewayWorker`] runs the gateway lifecycle. Both are plugged into a
//! [`fleetgrid_pipeline::Pipeline`] with a `StoreFetcher` over their table
//! and finish every item with a single conditional commit.
//!
//! Backend failures never escape a worker: no capacity moves on to the next
//! offer, recoverable errors are recorded in `status_message` and retried,
//! unrecoverable ones end the entity.

pub mod gateways;
pub mod instances;

pub use gateways::GatewayWorker;
pub use instances::{InstanceWorker, NO_OFFERS};
