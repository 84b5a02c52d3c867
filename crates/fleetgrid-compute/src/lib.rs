//! fleetgrid-compute — the backend contract the pipelines provision through.
//!
//! A backend answers three questions: what can I buy (`get_offers`), buy
//! this one (`create_instance`), and give it back (`terminate_instance`).
//! The [`BackendRegistry`] fans offer queries out to every registered
//! backend, applies location filters, and returns one price-sorted list.
//!
//! [`StaticCompute`] serves a fixed catalog from configuration; the daemon
//! and the test suites use it where a real cloud would sit.

pub mod compute;
pub mod error;
pub mod registry;
pub mod static_backend;

pub use compute::{Compute, InstanceConfig};
pub use error::{ComputeError, ComputeResult};
pub use registry::{BackendRegistry, OfferFilter};
pub use static_backend::{CatalogEntry, StaticBackendConfig, StaticCompute};
