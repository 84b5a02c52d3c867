//! Domain types for the fleetgrid state store.
//!
//! These types represent the persisted state of fleets, instances,
//! gateways, job placements, and projects. All types are serializable
//! to/from JSON for storage in redb tables.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::lease::{Lease, Record, pipeline_entity};
use crate::offers::{Offer, Requirements, ResourceRequirements, SpotPolicy};
use crate::tables::*;

/// Unique identifier for a fleet.
pub type FleetId = String;

/// Unique identifier for an instance.
pub type InstanceId = String;

// ── Fleet ─────────────────────────────────────────────────────────

/// Lifecycle status of a fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetStatus {
    Active,
    Terminating,
    Terminated,
}

/// How instances of a fleet come to exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetMode {
    /// Provisioned from cloud backends.
    #[default]
    Cloud,
    /// Pre-existing hosts registered over SSH; never provisioned.
    Ssh,
}

/// Placement strategy of a fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    #[default]
    Any,
    /// Interconnected instances in one backend/region; required for multi-node jobs.
    Cluster,
}

/// How an instance is split into shareable blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Blocks {
    Fixed(u32),
    /// One block per GPU (one block for GPU-less instances).
    #[default]
    Auto,
}

impl Blocks {
    /// Resolve the block count once the instance's hardware is known.
    pub fn resolve(self, gpu_count: usize) -> u32 {
        match self {
            Blocks::Fixed(n) => n.max(1),
            Blocks::Auto => (gpu_count as u32).max(1),
        }
    }
}

/// Desired instance count range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetNodes {
    pub min: u32,
    #[serde(default)]
    pub max: Option<u32>,
}

/// Desired configuration of a fleet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSpec {
    #[serde(default)]
    pub nodes: Option<FleetNodes>,
    #[serde(default)]
    pub mode: FleetMode,
    #[serde(default)]
    pub placement: PlacementStrategy,
    #[serde(default)]
    pub backends: Option<Vec<String>>,
    #[serde(default)]
    pub regions: Option<Vec<String>>,
    #[serde(default)]
    pub availability_zones: Option<Vec<String>>,
    #[serde(default)]
    pub instance_types: Option<Vec<String>>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub spot_policy: SpotPolicy,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub blocks: Blocks,
    /// Created implicitly by a run rather than declared by a user.
    #[serde(default)]
    pub autocreated: bool,
}

impl FleetSpec {
    /// Reject specs no amount of retrying can satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(nodes) = self.nodes
            && let Some(max) = nodes.max
            && nodes.min > max
        {
            return Err(format!("nodes.min ({}) exceeds nodes.max ({max})", nodes.min));
        }
        if self.blocks == Blocks::Fixed(0) {
            return Err("blocks must be at least 1".to_string());
        }
        if self.max_price.is_some_and(|p| !p.is_finite() || p < 0.0) {
            return Err("max_price must be a non-negative number".to_string());
        }
        Ok(())
    }

    /// The offer query that provisions one node of this fleet.
    pub fn requirements(&self) -> Requirements {
        Requirements {
            resources: self.resources.clone(),
            max_price: self.max_price,
            spot: self.spot_policy.spot(),
        }
    }

    pub fn min_nodes(&self) -> u32 {
        self.nodes.map(|n| n.min).unwrap_or_default()
    }

    pub fn max_nodes(&self) -> Option<u32> {
        self.nodes.and_then(|n| n.max)
    }
}

/// A named group of instances with a desired size range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fleet {
    pub id: FleetId,
    pub name: String,
    pub project: String,
    pub spec: FleetSpec,
    pub status: FleetStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub consolidation_attempt: u32,
    /// Unix milliseconds of the last consolidation evaluation.
    #[serde(default)]
    pub last_consolidated_at: Option<u64>,
    #[serde(default)]
    pub last_processed_at: Option<u64>,
    pub created_at: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub lease: Lease,
}

impl Fleet {
    pub fn new(id: &str, name: &str, project: &str, spec: FleetSpec, now: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            project: project.to_string(),
            spec,
            status: FleetStatus::Active,
            status_message: None,
            consolidation_attempt: 0,
            last_consolidated_at: None,
            last_processed_at: None,
            created_at: now,
            deleted: false,
            lease: Lease::default(),
        }
    }
}

pipeline_entity!(Fleet, FLEETS, "fleets");

/// Partial update of a fleet, applied by a conditional commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetUpdate {
    pub status: Option<FleetStatus>,
    pub status_message: Option<Option<String>>,
    pub consolidation_attempt: Option<u32>,
    pub last_consolidated_at: Option<u64>,
    pub deleted: Option<bool>,
}

impl FleetUpdate {
    pub fn apply(self, fleet: &mut Fleet) {
        if let Some(status) = self.status {
            fleet.status = status;
        }
        if let Some(message) = self.status_message {
            fleet.status_message = message;
        }
        if let Some(attempt) = self.consolidation_attempt {
            fleet.consolidation_attempt = attempt;
        }
        if let Some(at) = self.last_consolidated_at {
            fleet.last_consolidated_at = Some(at);
        }
        if let Some(deleted) = self.deleted {
            fleet.deleted = deleted;
        }
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle status of a compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Provisioning,
    Idle,
    Busy,
    Terminating,
    Terminated,
}

impl InstanceStatus {
    pub fn is_active(self) -> bool {
        self != InstanceStatus::Terminated
    }

    /// Can accept jobs (possibly only on free blocks).
    pub fn is_available(self) -> bool {
        matches!(self, InstanceStatus::Idle | InstanceStatus::Busy)
    }
}

/// What a backend reports back after launching an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchedInstance {
    /// Backend-side identifier.
    pub instance_id: String,
    pub region: String,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Opaque backend payload needed for termination.
    #[serde(default)]
    pub backend_data: Option<String>,
}

/// One compute node, possibly split into blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub project: String,
    #[serde(default)]
    pub fleet_id: Option<FleetId>,
    /// Stable ordinal within the fleet.
    #[serde(default)]
    pub instance_num: u32,
    pub status: InstanceStatus,
    #[serde(default)]
    pub unreachable: bool,
    /// `None` while the block split is still unknown.
    #[serde(default)]
    pub total_blocks: Option<u32>,
    #[serde(default)]
    pub busy_blocks: u32,
    #[serde(default)]
    pub offer: Option<Offer>,
    #[serde(default)]
    pub launched: Option<LaunchedInstance>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub termination_reason: Option<String>,
    pub created_at: u64,
    #[serde(default)]
    pub last_processed_at: Option<u64>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub lease: Lease,
}

impl Instance {
    /// A fresh instance waiting for the provisioning pipeline.
    pub fn pending(id: &str, project: &str, fleet_id: Option<&str>, offer: Option<Offer>, now: u64) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            project: project.to_string(),
            fleet_id: fleet_id.map(str::to_string),
            instance_num: 0,
            status: InstanceStatus::Pending,
            unreachable: false,
            total_blocks: None,
            busy_blocks: 0,
            offer,
            launched: None,
            status_message: None,
            termination_reason: None,
            created_at: now,
            last_processed_at: None,
            deleted: false,
            lease: Lease::default(),
        }
    }

    /// Counts toward the fleet's size.
    pub fn is_active(&self) -> bool {
        self.status.is_active() && !self.deleted
    }

    pub fn free_blocks(&self) -> Option<u32> {
        self.total_blocks
            .map(|total| total.saturating_sub(self.busy_blocks))
    }
}

pipeline_entity!(Instance, INSTANCES, "instances");

/// Partial update of an instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    pub status: Option<InstanceStatus>,
    pub status_message: Option<Option<String>>,
    pub termination_reason: Option<Option<String>>,
    pub total_blocks: Option<u32>,
    pub busy_blocks: Option<u32>,
    pub offer: Option<Offer>,
    pub launched: Option<LaunchedInstance>,
    pub deleted: Option<bool>,
}

impl InstanceUpdate {
    pub fn terminating(reason: &str) -> Self {
        Self {
            status: Some(InstanceStatus::Terminating),
            termination_reason: Some(Some(reason.to_string())),
            ..Self::default()
        }
    }

    pub fn deleted() -> Self {
        Self {
            deleted: Some(true),
            ..Self::default()
        }
    }

    pub fn apply(self, instance: &mut Instance) {
        if let Some(status) = self.status {
            instance.status = status;
        }
        if let Some(message) = self.status_message {
            instance.status_message = message;
        }
        if let Some(reason) = self.termination_reason {
            instance.termination_reason = reason;
        }
        if let Some(total) = self.total_blocks {
            instance.total_blocks = Some(total);
        }
        if let Some(busy) = self.busy_blocks {
            instance.busy_blocks = busy;
        }
        if let Some(offer) = self.offer {
            instance.offer = Some(offer);
        }
        if let Some(launched) = self.launched {
            instance.launched = Some(launched);
        }
        if let Some(deleted) = self.deleted {
            instance.deleted = deleted;
        }
    }
}

/// Lowest `count` ordinals not present in `taken`.
///
/// Freed numbers are reused before the range grows.
pub fn lowest_free_instance_nums(taken: impl IntoIterator<Item = u32>, count: usize) -> Vec<u32> {
    let taken: BTreeSet<u32> = taken.into_iter().collect();
    (0u32..)
        .filter(|n| !taken.contains(n))
        .take(count)
        .collect()
}

// ── Gateway ───────────────────────────────────────────────────────

/// Lifecycle status of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Submitted,
    Provisioning,
    Running,
    Failed,
}

/// An ingress gateway backed by one compute instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: String,
    pub name: String,
    pub project: String,
    pub backend: String,
    pub region: String,
    #[serde(default)]
    pub instance_type: Option<String>,
    pub status: GatewayStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub launched: Option<LaunchedInstance>,
    #[serde(default)]
    pub to_be_deleted: bool,
    pub created_at: u64,
    #[serde(default)]
    pub last_processed_at: Option<u64>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub lease: Lease,
}

impl Gateway {
    pub fn submitted(id: &str, name: &str, project: &str, backend: &str, region: &str, now: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            project: project.to_string(),
            backend: backend.to_string(),
            region: region.to_string(),
            instance_type: None,
            status: GatewayStatus::Submitted,
            status_message: None,
            launched: None,
            to_be_deleted: false,
            created_at: now,
            last_processed_at: None,
            deleted: false,
            lease: Lease::default(),
        }
    }
}

pipeline_entity!(Gateway, GATEWAYS, "gateways");

/// Partial update of a gateway.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayUpdate {
    pub status: Option<GatewayStatus>,
    pub status_message: Option<Option<String>>,
    pub launched: Option<LaunchedInstance>,
    pub deleted: Option<bool>,
}

impl GatewayUpdate {
    pub fn apply(self, gateway: &mut Gateway) {
        if let Some(status) = self.status {
            gateway.status = status;
        }
        if let Some(message) = self.status_message {
            gateway.status_message = message;
        }
        if let Some(launched) = self.launched {
            gateway.launched = Some(launched);
        }
        if let Some(deleted) = self.deleted {
            gateway.deleted = deleted;
        }
    }
}

// ── Jobs & projects ───────────────────────────────────────────────

/// Placement status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a freshly requested instance.
    Provisioning,
    Running,
    Done,
}

/// Where a job was placed and how many blocks it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub project: String,
    pub run_name: String,
    pub job_num: u32,
    #[serde(default)]
    pub fleet_id: Option<FleetId>,
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    pub blocks: u32,
    pub status: JobStatus,
    pub submitted_at: u64,
}

impl JobRecord {
    pub fn is_active(&self) -> bool {
        self.status != JobStatus::Done
    }
}

impl Record for JobRecord {
    const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> = JOBS;
    const KIND: &'static str = "jobs";

    fn key(&self) -> &str {
        &self.id
    }
}

/// Owning scope of fleets, instances, and jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: u64,
}

impl Record for Project {
    const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> = PROJECTS;
    const KIND: &'static str = "projects";

    fn key(&self) -> &str {
        &self.name
    }
}
