//! redb table definitions for the fleetgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Rows are keyed by their own id; fleet membership is a field on the instance,
//! not part of the key, because instances can move in and out of the free pool.

use redb::TableDefinition;

/// Fleets keyed by `{fleet_id}`.
pub const FLEETS: TableDefinition<&str, &[u8]> = TableDefinition::new("fleets");

/// Instances keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Gateways keyed by `{gateway_id}`.
pub const GATEWAYS: TableDefinition<&str, &[u8]> = TableDefinition::new("gateways");

/// Job placement records keyed by `{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Projects keyed by `{project_name}`.
pub const PROJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");
