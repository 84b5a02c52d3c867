//! fleetd — the fleetgrid daemon.
//!
//! The binary in `main.rs` is a thin clap front end; the pieces it wires
//! together live here so integration tests can drive them in-process:
//!
//! - **`config`** — `fleetd.toml` parsing and pipeline/backends setup
//! - **`daemon`** — runs the fleet, instance, and gateway pipelines
//! - **`commands`** — `apply` and `plan`, which work on the store directly

pub mod commands;
pub mod config;
pub mod daemon;

pub use config::{FleetdConfig, parse_duration};
