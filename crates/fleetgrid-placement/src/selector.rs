//! Fleet selector — pick the fleet a job should run in.
//!
//! Every candidate fleet is scored by
//! `(no_pool_capacity, cheapest instance offer, cheapest backend offer)`:
//! existing capacity always beats fresh provisioning, then price decides.
//! Sorting is stable, so equal keys keep the candidates' input order.

use std::cmp::Ordering;

use tracing::debug;

use fleetgrid_compute::{BackendRegistry, OfferFilter};
use fleetgrid_state::{
    Fleet, FleetMode, FleetStatus, Instance, Offer, PlacementStrategy, Profile, Requirements,
    intersect,
};

use crate::filter::{InstanceFilter, VolumeLocation};

/// A fleet with its instances, as loaded from the store.
#[derive(Debug, Clone)]
pub struct FleetCandidate {
    pub fleet: Fleet,
    pub instances: Vec<Instance>,
}

/// What a job brings to fleet selection.
#[derive(Debug, Clone, Copy)]
pub struct JobQuery<'a> {
    pub profile: &'a Profile,
    pub requirements: &'a Requirements,
    pub multinode: bool,
    /// Master node of a multi-node job; the others must join its fleet.
    pub master: Option<&'a Instance>,
    pub volumes: &'a [VolumeLocation],
}

/// Caps on backend offer queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferLimits {
    /// Per candidate fleet while ranking.
    pub max_offers_per_fleet: usize,
    /// For the chosen fleet and for job plans.
    pub max_offers: usize,
}

impl Default for OfferLimits {
    fn default() -> Self {
        Self {
            max_offers_per_fleet: 10,
            max_offers: 50,
        }
    }
}

/// Result of fleet selection. `fleet` is `None` when no fleet can take the
/// job and the caller may create a new one.
#[derive(Debug, Clone, Default)]
pub struct FleetSelection {
    pub fleet: Option<Fleet>,
    pub instance_offers: Vec<Offer>,
    pub backend_offers: Vec<Offer>,
}

/// Ranking key of one candidate. Lower is better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FleetPriority {
    pub no_pool_capacity: bool,
    pub instance_price: f64,
    pub backend_price: f64,
}

impl FleetPriority {
    fn new(instance_offers: &[Offer], backend_offers: &[Offer]) -> Self {
        let min_price = |offers: &[Offer]| {
            offers
                .iter()
                .filter(|o| o.availability.is_available())
                .map(|o| o.price)
                .fold(f64::INFINITY, f64::min)
        };
        let instance_price = min_price(instance_offers);
        Self {
            no_pool_capacity: instance_price.is_infinite(),
            instance_price,
            backend_price: min_price(backend_offers),
        }
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        self.no_pool_capacity
            .cmp(&other.no_pool_capacity)
            .then_with(|| self.instance_price.total_cmp(&other.instance_price))
            .then_with(|| self.backend_price.total_cmp(&other.backend_price))
    }
}

struct Ranked<'c> {
    candidate: &'c FleetCandidate,
    priority: FleetPriority,
    instance_offers: Vec<Offer>,
    has_offers: bool,
}

/// Choose the fleet for `job` among `candidates`.
pub async fn find_optimal_fleet_with_offers(
    candidates: &[FleetCandidate],
    job: JobQuery<'_>,
    registry: &BackendRegistry,
    limits: OfferLimits,
) -> FleetSelection {
    if let Some(fleet_id) = job.master.and_then(|m| m.fleet_id.as_deref()) {
        // Non-master nodes reuse the master's fleet and never provision.
        let Some(candidate) = candidates.iter().find(|c| c.fleet.id == fleet_id) else {
            debug!(fleet = %fleet_id, "master fleet is not a candidate");
            return FleetSelection::default();
        };
        return FleetSelection {
            fleet: Some(candidate.fleet.clone()),
            instance_offers: instance_filter(&candidate.fleet, job).offers(&candidate.instances),
            backend_offers: Vec::new(),
        };
    }

    let mut ranked = Vec::new();
    for candidate in candidates {
        let fleet = &candidate.fleet;
        if job.multinode && fleet.spec.placement != PlacementStrategy::Cluster {
            debug!(fleet = %fleet.id, "skipping non-cluster fleet for multi-node job");
            continue;
        }
        if !can_provision(candidate) && !has_free_blocks(candidate) {
            debug!(fleet = %fleet.id, "fleet is full");
            continue;
        }

        let instance_offers = instance_filter(fleet, job).offers(&candidate.instances);
        let backend_offers = if can_provision(candidate) {
            fleet_backend_offers(candidate, job, registry, limits.max_offers_per_fleet).await
        } else {
            Vec::new()
        };
        let priority = FleetPriority::new(&instance_offers, &backend_offers);
        debug!(
            fleet = %fleet.id,
            instance_offers = instance_offers.len(),
            backend_offers = backend_offers.len(),
            ?priority,
            "fleet evaluated"
        );
        ranked.push(Ranked {
            candidate,
            priority,
            has_offers: !instance_offers.is_empty() || !backend_offers.is_empty(),
            instance_offers,
        });
    }

    ranked.sort_by(|a, b| a.priority.compare(&b.priority));
    let constrained = job.profile.fleets.is_some();
    if !constrained && !ranked.iter().any(|r| r.has_offers) {
        return FleetSelection::default();
    }
    let Some(best) = ranked.into_iter().next() else {
        return FleetSelection::default();
    };

    let backend_offers = if can_provision(best.candidate) {
        fleet_backend_offers(best.candidate, job, registry, limits.max_offers).await
    } else {
        Vec::new()
    };
    FleetSelection {
        fleet: Some(best.candidate.fleet.clone()),
        instance_offers: best.instance_offers,
        backend_offers,
    }
}

fn instance_filter<'a>(fleet: &'a Fleet, job: JobQuery<'a>) -> InstanceFilter<'a> {
    InstanceFilter {
        fleet_id: Some(&fleet.id),
        master: job.master,
        volumes: job.volumes,
        shared: !job.multinode,
        ..InstanceFilter::new(job.profile, job.requirements)
    }
}

/// Whether the fleet may launch another instance.
fn can_provision(candidate: &FleetCandidate) -> bool {
    let fleet = &candidate.fleet;
    if fleet.spec.mode != FleetMode::Cloud || fleet.status != FleetStatus::Active {
        return false;
    }
    let active = candidate.instances.iter().filter(|i| i.is_active()).count();
    fleet.spec.max_nodes().is_none_or(|max| active < max as usize)
}

fn has_free_blocks(candidate: &FleetCandidate) -> bool {
    candidate.instances.iter().any(|i| {
        i.is_active()
            && !i.unreachable
            && i.status.is_available()
            && i.free_blocks().is_some_and(|free| free > 0)
    })
}

/// Backend offers for a new instance of the fleet, cheapest first.
async fn fleet_backend_offers(
    candidate: &FleetCandidate,
    job: JobQuery<'_>,
    registry: &BackendRegistry,
    limit: usize,
) -> Vec<Offer> {
    let fleet = &candidate.fleet;
    let Some(requirements) = merge_requirements(job.requirements, fleet) else {
        return Vec::new();
    };

    let mut filter = OfferFilter {
        backends: intersect(job.profile.backends.as_deref(), fleet.spec.backends.as_deref()),
        regions: intersect(job.profile.regions.as_deref(), fleet.spec.regions.as_deref()),
        availability_zones: intersect(
            job.profile.availability_zones.as_deref(),
            fleet.spec.availability_zones.as_deref(),
        ),
        instance_types: intersect(
            job.profile.instance_types.as_deref(),
            fleet.spec.instance_types.as_deref(),
        ),
    };
    // Cluster fleets grow next to their existing nodes.
    let anchor = job.master.and_then(|m| m.offer.as_ref()).or_else(|| {
        (fleet.spec.placement == PlacementStrategy::Cluster)
            .then(|| {
                candidate
                    .instances
                    .iter()
                    .filter(|i| i.is_active())
                    .find_map(|i| i.offer.as_ref())
            })
            .flatten()
    });
    if let Some(anchor) = anchor {
        pin(&mut filter.backends, &anchor.backend);
        pin(&mut filter.regions, &anchor.region);
    }
    for volume in job.volumes {
        pin(&mut filter.backends, &volume.backend);
        pin(&mut filter.regions, &volume.region);
        if let Some(zone) = &volume.availability_zone {
            pin(&mut filter.availability_zones, zone);
        }
    }

    registry
        .get_offers(&requirements, &filter, None)
        .await
        .into_iter()
        .filter(|o| fleet.spec.resources.matches(&o.instance.resources))
        .take(limit)
        .collect()
}

fn pin(list: &mut Option<Vec<String>>, value: &str) {
    let only = [value.to_string()];
    *list = intersect(list.as_deref(), Some(only.as_slice()));
}

/// The job's requirements tightened by the fleet's price ceiling and spot
/// policy. `None` when the two pin opposite purchase types.
fn merge_requirements(job: &Requirements, fleet: &Fleet) -> Option<Requirements> {
    let fleet_spot = fleet.spec.spot_policy.spot();
    let spot = match (job.spot, fleet_spot) {
        (Some(a), Some(b)) if a != b => return None,
        (a, b) => a.or(b),
    };
    let max_price = match (job.max_price, fleet.spec.max_price) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    Some(Requirements {
        resources: job.resources.clone(),
        max_price,
        spot,
    })
}
