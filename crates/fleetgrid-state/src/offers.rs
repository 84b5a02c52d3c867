//! Offers, resources, and the job-side requirements they are matched against.
//!
//! An [`Offer`] is ephemeral: backends produce fresh ones per query, and the
//! only persisted copy is the snapshot embedded in an [`Instance`](crate::Instance)
//! once it was chosen.

use serde::{Deserialize, Serialize};

/// Inclusive numeric range. An unset bound is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

impl Range {
    pub fn at_least(min: u64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn exactly(value: u64) -> Self {
        Self {
            min: Some(value),
            max: Some(value),
        }
    }

    pub fn contains(&self, value: u64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// A single accelerator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpu {
    pub name: String,
    pub memory_mib: u64,
}

/// Hardware descriptor of an instance type (or a block slice of one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub gpus: Vec<Gpu>,
    #[serde(default)]
    pub disk_mib: u64,
    #[serde(default)]
    pub spot: bool,
}

impl Resources {
    /// Resources of `blocks` out of `total_blocks` equal slices.
    ///
    /// CPU, memory, and GPUs are divided; disk is shared by all blocks.
    pub fn slice(&self, blocks: u32, total_blocks: u32) -> Resources {
        if total_blocks <= 1 || blocks >= total_blocks {
            return self.clone();
        }
        let gpu_count = self.gpus.len() * blocks as usize / total_blocks as usize;
        Resources {
            cpus: self.cpus * blocks / total_blocks,
            memory_mib: self.memory_mib * u64::from(blocks) / u64::from(total_blocks),
            gpus: self.gpus.iter().take(gpu_count).cloned().collect(),
            disk_mib: self.disk_mib,
            spot: self.spot,
        }
    }
}

/// A named instance type as a backend sells it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub resources: Resources,
}

/// Availability classification of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// A backend can launch it now.
    Available,
    /// Free capacity on an existing instance.
    Idle,
    /// Existing instance, but the requested blocks are occupied.
    Busy,
    NoQuota,
    NotAvailable,
}

impl Availability {
    /// Presentation order: usable first, occupied next, unobtainable last.
    pub fn rank(self) -> u8 {
        match self {
            Availability::Available | Availability::Idle => 0,
            Availability::Busy => 1,
            Availability::NoQuota | Availability::NotAvailable => 2,
        }
    }

    pub fn is_available(self) -> bool {
        matches!(self, Availability::Available | Availability::Idle)
    }
}

/// A priced compute option at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub backend: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zones: Option<Vec<String>>,
    pub instance: InstanceType,
    /// Hourly price in USD.
    pub price: f64,
    pub availability: Availability,
    /// Blocks this offer occupies (1 for a whole, non-shared instance).
    #[serde(default = "one")]
    pub blocks: u32,
    #[serde(default = "one")]
    pub total_blocks: u32,
    /// The existing instance this offer reuses; `None` for fresh backend offers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

fn one() -> u32 {
    1
}

impl Offer {
    pub fn is_existing_instance(&self) -> bool {
        self.instance_id.is_some()
    }
}

// ── Requirements ──────────────────────────────────────────────────

/// GPU part of a resource ask.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuRequirements {
    #[serde(default)]
    pub count: Range,
    /// Accepted GPU names (case-insensitive). `None` accepts any.
    #[serde(default)]
    pub names: Option<Vec<String>>,
    #[serde(default)]
    pub memory_mib: Option<Range>,
}

/// Hardware part of a job's ask.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub cpus: Range,
    #[serde(default)]
    pub memory_mib: Range,
    #[serde(default)]
    pub gpu: Option<GpuRequirements>,
    #[serde(default)]
    pub disk_mib: Option<Range>,
}

impl ResourceRequirements {
    pub fn matches(&self, resources: &Resources) -> bool {
        if !self.cpus.contains(u64::from(resources.cpus))
            || !self.memory_mib.contains(resources.memory_mib)
        {
            return false;
        }
        if let Some(disk) = &self.disk_mib
            && !disk.contains(resources.disk_mib)
        {
            return false;
        }
        let Some(gpu) = &self.gpu else {
            return true;
        };
        if !gpu.count.contains(resources.gpus.len() as u64) {
            return false;
        }
        resources.gpus.iter().all(|g| {
            allowed(gpu.names.as_deref(), &g.name)
                && gpu.memory_mib.is_none_or(|range| range.contains(g.memory_mib))
        })
    }

    /// Number of GPUs the ask needs at minimum.
    pub fn min_gpus(&self) -> u64 {
        self.gpu
            .as_ref()
            .and_then(|g| g.count.min)
            .unwrap_or_default()
    }
}

/// Spot purchasing policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotPolicy {
    Spot,
    #[default]
    OnDemand,
    Auto,
}

impl SpotPolicy {
    /// `Some(spot)` when the policy pins the purchase type, `None` for either.
    pub fn spot(self) -> Option<bool> {
        match self {
            SpotPolicy::Spot => Some(true),
            SpotPolicy::OnDemand => Some(false),
            SpotPolicy::Auto => None,
        }
    }
}

/// The full matching query: hardware, price ceiling, purchase type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub spot: Option<bool>,
}

impl Requirements {
    /// Boolean filter of one candidate against this query.
    pub fn matches(&self, resources: &Resources, price: f64) -> bool {
        if self.max_price.is_some_and(|max| price > max) {
            return false;
        }
        if self.spot.is_some_and(|spot| spot != resources.spot) {
            return false;
        }
        self.resources.matches(resources)
    }
}

/// Placement constraints a run is submitted with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub backends: Option<Vec<String>>,
    #[serde(default)]
    pub regions: Option<Vec<String>>,
    #[serde(default)]
    pub availability_zones: Option<Vec<String>>,
    #[serde(default)]
    pub instance_types: Option<Vec<String>>,
    /// Restrict placement to these fleet names.
    #[serde(default)]
    pub fleets: Option<Vec<String>>,
    #[serde(default)]
    pub spot_policy: SpotPolicy,
    #[serde(default)]
    pub max_price: Option<f64>,
}

/// Case-insensitive allow-list check; `None` allows everything.
pub fn allowed(list: Option<&[String]>, value: &str) -> bool {
    list.is_none_or(|items| items.iter().any(|item| item.eq_ignore_ascii_case(value)))
}

/// Intersect two optional allow-lists. `None` is the universe.
pub fn intersect(a: Option<&[String]>, b: Option<&[String]>) -> Option<Vec<String>> {
    match (a, b) {
        (None, None) => None,
        (Some(a), None) => Some(a.to_vec()),
        (None, Some(b)) => Some(b.to_vec()),
        (Some(a), Some(b)) => Some(
            a.iter()
                .filter(|x| b.iter().any(|y| y.eq_ignore_ascii_case(x)))
                .cloned()
                .collect(),
        ),
    }
}
