//! Job assignment — commit a chosen offer to the store.
//!
//! An existing-instance offer reserves blocks on that instance. A backend
//! offer inserts a PENDING instance into the fleet for the provisioning
//! pipeline; the job waits in PROVISIONING until it comes up. Either way the
//! job's blocks count against the instance from this point on.

use tracing::info;
use uuid::Uuid;

use fleetgrid_state::{
    Fleet, FleetMode, FleetStatus, Instance, JobRecord, JobStatus, Offer, StateStore,
};

use crate::error::{PlacementError, PlacementResult};

/// Identity of the job being placed.
#[derive(Debug, Clone)]
pub struct JobRef {
    pub id: String,
    pub run_name: String,
    pub job_num: u32,
}

/// Place `job` into `fleet` using `offer`.
pub fn assign_job(
    store: &StateStore,
    fleet: &Fleet,
    job: &JobRef,
    offer: &Offer,
    now: u64,
) -> PlacementResult<JobRecord> {
    let mut record = JobRecord {
        id: job.id.clone(),
        project: fleet.project.clone(),
        run_name: job.run_name.clone(),
        job_num: job.job_num,
        fleet_id: Some(fleet.id.clone()),
        instance_id: None,
        blocks: offer.blocks,
        status: JobStatus::Running,
        submitted_at: now,
    };

    if let Some(instance_id) = &offer.instance_id {
        record.instance_id = Some(instance_id.clone());
        if !store.reserve_instance_blocks(instance_id, &record, now)? {
            return Err(PlacementError::CapacityLost(instance_id.clone()));
        }
        info!(
            job = %record.id,
            fleet = %fleet.name,
            instance = %instance_id,
            blocks = record.blocks,
            "job assigned to existing instance"
        );
        return Ok(record);
    }

    if fleet.spec.mode != FleetMode::Cloud {
        return Err(PlacementError::InvalidOffer(format!(
            "fleet {} cannot provision instances",
            fleet.name
        )));
    }
    if fleet.status != FleetStatus::Active || fleet.deleted {
        return Err(PlacementError::InvalidOffer(format!(
            "fleet {} is not active",
            fleet.name
        )));
    }

    let instance_id = Uuid::new_v4().to_string();
    let mut instance = Instance::pending(
        &instance_id,
        &fleet.project,
        Some(&fleet.id),
        Some(offer.clone()),
        now,
    );
    let blocks = fleet
        .spec
        .blocks
        .resolve(offer.instance.resources.gpus.len());
    instance.busy_blocks = blocks;
    record.blocks = blocks;
    record.instance_id = Some(instance_id.clone());
    record.status = JobStatus::Provisioning;

    let Some(instance_num) = store.request_fleet_instance(instance, &record)? else {
        return Err(PlacementError::CapacityLost(fleet.name.clone()));
    };
    info!(
        job = %record.id,
        fleet = %fleet.name,
        instance = %instance_id,
        instance_num,
        backend = %offer.backend,
        region = %offer.region,
        "job waiting for new instance"
    );
    Ok(record)
}

/// Finish a job and hand its blocks back. `false` if it was already done.
pub fn release_job(store: &StateStore, job_id: &str) -> PlacementResult<bool> {
    Ok(store.release_job(job_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::InstanceFilter;
    use crate::filter::tests::{gpu_offer, gpus, ready_instance};
    use fleetgrid_state::{Blocks, FleetNodes, FleetSpec, InstanceStatus, Profile};

    fn fleet(spec: FleetSpec) -> Fleet {
        Fleet::new("f-1", "gpu", "main", spec, 0)
    }

    fn job(id: &str) -> JobRef {
        JobRef {
            id: id.to_string(),
            run_name: "train".to_string(),
            job_num: 0,
        }
    }

    fn instance(store: &StateStore, id: &str) -> Instance {
        store.get::<Instance>(id).unwrap().unwrap()
    }

    #[test]
    fn existing_instance_offer_reserves_blocks() {
        let store = StateStore::open_in_memory().unwrap();
        let fleet = fleet(FleetSpec::default());
        store.put(&fleet).unwrap();
        store
            .put(&ready_instance("i-1", "f-1", gpu_offer("aws", "us", 4, 4.0), 4))
            .unwrap();

        let profile = Profile::default();
        let req = gpus(2);
        let offers = InstanceFilter::new(&profile, &req).offers(&[instance(&store, "i-1")]);
        let record = assign_job(&store, &fleet, &job("j-1"), &offers[0], 10).unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.blocks, 2);

        let inst = instance(&store, "i-1");
        assert_eq!(inst.busy_blocks, 2);
        assert_eq!(inst.status, InstanceStatus::Busy);

        assert!(release_job(&store, "j-1").unwrap());
        let inst = instance(&store, "i-1");
        assert_eq!(inst.busy_blocks, 0);
        assert_eq!(inst.status, InstanceStatus::Idle);
        assert!(!release_job(&store, "j-1").unwrap());
    }

    #[test]
    fn stale_offer_loses_capacity() {
        let store = StateStore::open_in_memory().unwrap();
        let fleet = fleet(FleetSpec::default());
        store.put(&fleet).unwrap();
        store
            .put(&ready_instance("i-1", "f-1", gpu_offer("aws", "us", 1, 1.0), 1))
            .unwrap();

        let profile = Profile::default();
        let req = gpus(1);
        let offer = InstanceFilter::new(&profile, &req).offers(&[instance(&store, "i-1")])[0].clone();
        assign_job(&store, &fleet, &job("j-1"), &offer, 10).unwrap();

        let err = assign_job(&store, &fleet, &job("j-2"), &offer, 11).unwrap_err();
        assert!(matches!(err, PlacementError::CapacityLost(id) if id == "i-1"));
        assert!(store.get::<JobRecord>("j-2").unwrap().is_none());
    }

    #[test]
    fn backend_offer_requests_instance() {
        let store = StateStore::open_in_memory().unwrap();
        let fleet = fleet(FleetSpec {
            blocks: Blocks::Auto,
            ..Default::default()
        });
        store.put(&fleet).unwrap();
        store
            .put(&ready_instance("i-0", "f-1", gpu_offer("aws", "us", 1, 1.0), 1))
            .unwrap();

        let offer = gpu_offer("aws", "us", 4, 4.0);
        let record = assign_job(&store, &fleet, &job("j-1"), &offer, 10).unwrap();
        assert_eq!(record.status, JobStatus::Provisioning);
        assert_eq!(record.blocks, 4);

        let inst = instance(&store, record.instance_id.as_deref().unwrap());
        assert_eq!(inst.status, InstanceStatus::Pending);
        assert_eq!(inst.instance_num, 1);
        assert_eq!(inst.name, "gpu-1");
        assert_eq!(inst.busy_blocks, 4);
        assert_eq!(inst.offer.as_ref(), Some(&offer));

        // Released before the instance came up: the preset blocks are freed.
        assert!(release_job(&store, "j-1").unwrap());
        let inst = instance(&store, record.instance_id.as_deref().unwrap());
        assert_eq!(inst.busy_blocks, 0);
    }

    #[test]
    fn backend_offer_on_full_fleet_loses_capacity() {
        let store = StateStore::open_in_memory().unwrap();
        let fleet = fleet(FleetSpec {
            nodes: Some(FleetNodes { min: 0, max: Some(2) }),
            ..Default::default()
        });
        store.put(&fleet).unwrap();
        store
            .put(&ready_instance("i-0", "f-1", gpu_offer("aws", "us", 1, 1.0), 1))
            .unwrap();

        // Both placements planned against the same fleet snapshot, one slot left.
        let offer = gpu_offer("aws", "us", 1, 1.0);
        assign_job(&store, &fleet, &job("j-1"), &offer, 10).unwrap();
        let err = assign_job(&store, &fleet, &job("j-2"), &offer, 10).unwrap_err();
        assert!(matches!(err, PlacementError::CapacityLost(name) if name == "gpu"));
        assert!(store.get::<JobRecord>("j-2").unwrap().is_none());
        assert_eq!(store.list_fleet_instances("f-1").unwrap().len(), 2);
    }

    #[test]
    fn ssh_fleet_rejects_backend_offer() {
        let store = StateStore::open_in_memory().unwrap();
        let fleet = fleet(FleetSpec {
            mode: FleetMode::Ssh,
            ..Default::default()
        });
        store.put(&fleet).unwrap();

        let err = assign_job(&store, &fleet, &job("j-1"), &gpu_offer("aws", "us", 1, 1.0), 10)
            .unwrap_err();
        assert!(matches!(err, PlacementError::InvalidOffer(_)));
        assert!(store.list::<Instance>().unwrap().is_empty());
    }
}
