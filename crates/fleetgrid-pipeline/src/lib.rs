//! fleetgrid-pipeline — generic background processing over leased rows.
//!
//! # Architecture
//!
//! ```text
//! Fetcher ──claim batch──► bounded queue ──► N workers ──► conditional commit
//!                                              │
//!                                         Heartbeater (one loop per item)
//! ```
//!
//! - The fetch loop sizes each claim by the queue length: it refills to the
//!   upper limit when below the lower limit, tops up by the desired size in
//!   between, and sleeps `queue_check_delay` when full or `fetch_delay`
//!   when nothing was due.
//! - Workers share the receiving end of the queue. Each item gets its own
//!   heartbeat loop for as long as the worker holds it.
//! - At most one worker processes an entity at a time. This rests on the
//!   lease token alone, so replicas of the same pipeline can run side by
//!   side against one store.

pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod heartbeat;

pub use config::PipelineConfig;
pub use engine::Pipeline;
pub use error::{PipelineError, PipelineResult};
pub use fetcher::{Fetcher, StoreFetcher, Worker};
pub use heartbeat::{Heartbeat, Heartbeater};
