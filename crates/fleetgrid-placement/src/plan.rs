//! Run planning — what placing each job of a run would look like.

use serde::{Deserialize, Serialize};
use tracing::info;

use fleetgrid_compute::BackendRegistry;
use fleetgrid_state::{Offer, Profile, Requirements, ResourceRequirements, StateStore, allowed};

use crate::error::PlacementResult;
use crate::filter::VolumeLocation;
use crate::selector::{FleetCandidate, JobQuery, OfferLimits, find_optimal_fleet_with_offers};

/// A submitted run: resources per node, node count, and constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub run_name: String,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default = "one")]
    pub nodes: u32,
    #[serde(default)]
    pub volumes: Vec<VolumeLocation>,
}

fn one() -> u32 {
    1
}

/// One job of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub job_num: u32,
    pub requirements: Requirements,
    pub multinode: bool,
}

impl RunSpec {
    /// The query every job of the run is matched with.
    pub fn requirements(&self) -> Requirements {
        Requirements {
            resources: self.resources.clone(),
            max_price: self.profile.max_price,
            spot: self.profile.spot_policy.spot(),
        }
    }

    pub fn jobs(&self) -> Vec<JobSpec> {
        let nodes = self.nodes.max(1);
        (0..nodes)
            .map(|job_num| JobSpec {
                job_num,
                requirements: self.requirements(),
                multinode: nodes > 1,
            })
            .collect()
    }
}

/// Ranked placement options of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPlan {
    pub job_num: u32,
    /// Name of the chosen fleet; `None` if a new fleet would be created.
    pub fleet: Option<String>,
    /// Existing-instance and backend offers, best first, capped.
    pub offers: Vec<Offer>,
    /// Offers found before capping.
    pub total_offers: usize,
    pub max_price: Option<f64>,
}

/// Plan every job of `run` against the project's fleets.
pub async fn get_job_plans(
    store: &StateStore,
    registry: &BackendRegistry,
    project: &str,
    run: &RunSpec,
    limits: OfferLimits,
) -> PlacementResult<Vec<JobPlan>> {
    let candidates = load_candidates(store, project, &run.profile)?;

    let mut plans = Vec::new();
    for job in run.jobs() {
        let selection = find_optimal_fleet_with_offers(
            &candidates,
            JobQuery {
                profile: &run.profile,
                requirements: &job.requirements,
                multinode: job.multinode,
                master: None,
                volumes: &run.volumes,
            },
            registry,
            limits,
        )
        .await;

        let (offers, total_offers) =
            rank_offers(selection.instance_offers, selection.backend_offers, limits.max_offers);
        let max_price = offers.iter().map(|o| o.price).reduce(f64::max);
        info!(
            run = %run.run_name,
            job_num = job.job_num,
            fleet = ?selection.fleet.as_ref().map(|f| &f.name),
            offers = total_offers,
            "job planned"
        );
        plans.push(JobPlan {
            job_num: job.job_num,
            fleet: selection.fleet.map(|f| f.name),
            offers,
            total_offers,
            max_price,
        });
    }
    Ok(plans)
}

/// Non-deleted fleets of the project, narrowed to the profile's fleet names.
pub fn load_candidates(
    store: &StateStore,
    project: &str,
    profile: &Profile,
) -> PlacementResult<Vec<FleetCandidate>> {
    let mut candidates = Vec::new();
    for fleet in store.list_project_fleets(project)? {
        if !allowed(profile.fleets.as_deref(), &fleet.name) {
            continue;
        }
        let instances = store.list_fleet_instances(&fleet.id)?;
        candidates.push(FleetCandidate { fleet, instances });
    }
    Ok(candidates)
}

/// Merge instance and backend offers into one presentation order: usable
/// before busy before unobtainable, then price. Existing instances win
/// ties. Returns the capped list and the uncapped count.
pub fn rank_offers(instance_offers: Vec<Offer>, backend_offers: Vec<Offer>, cap: usize) -> (Vec<Offer>, usize) {
    let mut offers: Vec<Offer> = instance_offers.into_iter().chain(backend_offers).collect();
    offers.sort_by(|a, b| {
        a.availability
            .rank()
            .cmp(&b.availability.rank())
            .then_with(|| a.price.total_cmp(&b.price))
    });
    let total = offers.len();
    offers.truncate(cap);
    (offers, total)
}
