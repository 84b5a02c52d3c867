//! InstanceWorker — drives instances through their provisioning lifecycle.
//!
//! ```text
//! PENDING ──create_instance──► PROVISIONING ──blocks resolved──► IDLE / BUSY
//!    │ no offer took it
//!    ▼
//! TERMINATED ◄──terminate_instance── TERMINATING
//! ```
//!
//! Fleet-owned TERMINATED instances are left for the fleet consolidator to
//! reap; instances without a fleet are soft-deleted here.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use fleetgrid_compute::{BackendRegistry, ComputeError, InstanceConfig, OfferFilter};
use fleetgrid_pipeline::Worker;
use fleetgrid_state::{
    Blocks, Fleet, Instance, InstanceStatus, InstanceUpdate, Offer, PipelineItem,
    PlacementStrategy, StateResult, StateStore, epoch_millis,
};

pub const NO_OFFERS: &str = "no offers";

pub struct InstanceWorker {
    store: StateStore,
    registry: BackendRegistry,
    /// Offers tried per provisioning attempt.
    max_offers: usize,
}

impl InstanceWorker {
    pub fn new(store: StateStore, registry: BackendRegistry, max_offers: usize) -> Self {
        Self {
            store,
            registry,
            max_offers: max_offers.max(1),
        }
    }

    async fn provision(&self, instance: &Instance) -> StateResult<InstanceUpdate> {
        let fleet = self.owning_fleet(instance)?;
        let offers = self.candidate_offers(instance, fleet.as_ref()).await?;
        let config = InstanceConfig {
            project: instance.project.clone(),
            instance_name: instance.name.clone(),
            fleet: fleet.as_ref().map(|f| f.name.clone()),
            ssh_keys: Vec::new(),
        };

        for offer in offers {
            let Some(backend) = self.registry.get(&offer.backend) else {
                warn!(instance = %instance.id, backend = %offer.backend, "offer from unconfigured backend");
                continue;
            };
            match backend.create_instance(&offer, &config).await {
                Ok(launched) => {
                    info!(
                        instance = %instance.id,
                        backend = %offer.backend,
                        region = %offer.region,
                        instance_type = %offer.instance.name,
                        price = offer.price,
                        "instance launched"
                    );
                    return Ok(InstanceUpdate {
                        status: Some(InstanceStatus::Provisioning),
                        status_message: Some(None),
                        offer: Some(offer),
                        launched: Some(launched),
                        ..InstanceUpdate::default()
                    });
                }
                Err(ComputeError::NoCapacity(reason)) => {
                    info!(instance = %instance.id, backend = %offer.backend, %reason, "no capacity, trying next offer");
                }
                Err(e) if e.is_recoverable() => {
                    warn!(instance = %instance.id, backend = %offer.backend, error = %e, "launch failed, will retry");
                    return Ok(InstanceUpdate {
                        status_message: Some(Some(e.to_string())),
                        ..InstanceUpdate::default()
                    });
                }
                Err(e) => {
                    warn!(instance = %instance.id, backend = %offer.backend, error = %e, "launch failed permanently");
                    return Ok(terminated(&e.to_string()));
                }
            }
        }

        info!(instance = %instance.id, "no offer could be launched");
        Ok(terminated(NO_OFFERS))
    }

    /// The instance's own offer snapshot, or the owning fleet's cheapest
    /// available offers.
    async fn candidate_offers(
        &self,
        instance: &Instance,
        fleet: Option<&Fleet>,
    ) -> StateResult<Vec<Offer>> {
        if let Some(offer) = &instance.offer {
            return Ok(vec![offer.clone()]);
        }
        let Some(fleet) = fleet else {
            return Ok(Vec::new());
        };

        let mut filter = OfferFilter {
            backends: fleet.spec.backends.clone(),
            regions: fleet.spec.regions.clone(),
            availability_zones: fleet.spec.availability_zones.clone(),
            instance_types: fleet.spec.instance_types.clone(),
        };
        // Cluster fleets stay in the backend and region of their first node.
        if fleet.spec.placement == PlacementStrategy::Cluster
            && let Some(anchor) = self
                .store
                .list_fleet_instances(&fleet.id)?
                .into_iter()
                .filter(|i| i.id != instance.id && i.is_active())
                .find_map(|i| i.offer)
        {
            filter.backends = Some(vec![anchor.backend]);
            filter.regions = Some(vec![anchor.region]);
        }

        let offers = self
            .registry
            .get_offers(&fleet.spec.requirements(), &filter, None)
            .await;
        Ok(offers
            .into_iter()
            .filter(|o| o.availability.is_available())
            .take(self.max_offers)
            .collect())
    }

    fn activate(&self, instance: &Instance) -> StateResult<InstanceUpdate> {
        let blocks = self
            .owning_fleet(instance)?
            .map(|f| f.spec.blocks)
            .unwrap_or(Blocks::Auto);
        let gpus = instance
            .offer
            .as_ref()
            .map(|o| o.instance.resources.gpus.len())
            .unwrap_or_default();
        // Jobs placed while the instance was launching already hold blocks.
        let total = blocks.resolve(gpus).max(instance.busy_blocks);
        let status = if instance.busy_blocks > 0 {
            InstanceStatus::Busy
        } else {
            InstanceStatus::Idle
        };
        info!(instance = %instance.id, total_blocks = total, "instance ready");
        Ok(InstanceUpdate {
            status: Some(status),
            total_blocks: Some(total),
            status_message: Some(None),
            ..InstanceUpdate::default()
        })
    }

    async fn terminate(&self, instance: &Instance) -> InstanceUpdate {
        let done = InstanceUpdate {
            status: Some(InstanceStatus::Terminated),
            ..InstanceUpdate::default()
        };
        let (Some(launched), Some(offer)) = (&instance.launched, &instance.offer) else {
            debug!(instance = %instance.id, "instance never launched, nothing to terminate");
            return done;
        };
        let Some(backend) = self.registry.get(&offer.backend) else {
            warn!(instance = %instance.id, backend = %offer.backend, "backend no longer configured, dropping instance");
            return InstanceUpdate {
                status_message: Some(Some(format!("backend {} is not configured", offer.backend))),
                ..done
            };
        };

        match backend
            .terminate_instance(
                &launched.instance_id,
                &launched.region,
                launched.backend_data.as_deref(),
            )
            .await
        {
            Ok(()) => {
                info!(instance = %instance.id, reason = ?instance.termination_reason, "instance terminated");
                done
            }
            Err(ComputeError::NotFound(_)) => {
                debug!(instance = %instance.id, "instance already gone at backend");
                done
            }
            Err(e) => {
                warn!(instance = %instance.id, error = %e, "termination failed, will retry");
                InstanceUpdate {
                    status_message: Some(Some(e.to_string())),
                    ..InstanceUpdate::default()
                }
            }
        }
    }

    /// No fleet, or one that is already deleted, will reap this row.
    fn is_orphaned(&self, instance: &Instance) -> StateResult<bool> {
        if instance.fleet_id.is_none() {
            return Ok(true);
        }
        Ok(self.owning_fleet(instance)?.is_none_or(|fleet| fleet.deleted))
    }

    fn owning_fleet(&self, instance: &Instance) -> StateResult<Option<Fleet>> {
        match instance.fleet_id.as_deref() {
            Some(fleet_id) => self.store.get::<Fleet>(fleet_id),
            None => Ok(None),
        }
    }
}

fn terminated(reason: &str) -> InstanceUpdate {
    InstanceUpdate {
        status: Some(InstanceStatus::Terminated),
        status_message: Some(Some(reason.to_string())),
        termination_reason: Some(Some(reason.to_string())),
        ..InstanceUpdate::default()
    }
}

#[async_trait]
impl Worker for InstanceWorker {
    async fn process(&self, item: &PipelineItem) -> anyhow::Result<()> {
        let Some(instance) = self
            .store
            .get::<Instance>(&item.id)?
            .filter(|i| i.lease.is_token(&item.lock_token))
        else {
            warn!(instance = %item.id, "lease lost before processing");
            return Ok(());
        };

        let update = match instance.status {
            InstanceStatus::Pending => self.provision(&instance).await?,
            InstanceStatus::Provisioning => self.activate(&instance)?,
            InstanceStatus::Terminating => self.terminate(&instance).await,
            InstanceStatus::Terminated if self.is_orphaned(&instance)? => {
                debug!(instance = %instance.id, "reaping instance without a live fleet");
                InstanceUpdate::deleted()
            }
            InstanceStatus::Idle | InstanceStatus::Busy | InstanceStatus::Terminated => {
                InstanceUpdate::default()
            }
        };

        let committed = self.store.commit::<Instance>(
            &item.id,
            &item.lock_token,
            epoch_millis(),
            |instance| update.apply(instance),
        )?;
        if !committed {
            warn!(instance = %item.id, "instance update discarded, lease lost");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_compute::{CatalogEntry, StaticBackendConfig, StaticCompute};
    use fleetgrid_state::{
        Availability, ClaimParams, FleetNodes, FleetSpec, Gpu, InstanceType, Resources,
    };
    use std::sync::Arc;

    fn entry(region: &str, gpus: usize, price: f64, capacity: Option<u32>) -> CatalogEntry {
        CatalogEntry {
            region: region.to_string(),
            availability_zones: None,
            instance: InstanceType {
                name: format!("g{gpus}"),
                resources: Resources {
                    cpus: 8,
                    memory_mib: 64 * 1024,
                    gpus: (0..gpus)
                        .map(|_| Gpu {
                            name: "L4".to_string(),
                            memory_mib: 24 * 1024,
                        })
                        .collect(),
                    disk_mib: 0,
                    spot: false,
                },
            },
            price,
            availability: Availability::Available,
            capacity,
        }
    }

    fn setup(entries: Vec<CatalogEntry>) -> (StateStore, Arc<StaticCompute>, InstanceWorker) {
        let store = StateStore::open_in_memory().unwrap();
        let backend = Arc::new(StaticCompute::new(StaticBackendConfig {
            name: "lab".to_string(),
            offers: entries,
        }));
        let registry = BackendRegistry::new().with_backend(backend.clone());
        let worker = InstanceWorker::new(store.clone(), registry, 5);
        store
            .put(&Fleet::new(
                "f-1",
                "gpu",
                "main",
                FleetSpec {
                    nodes: Some(FleetNodes { min: 1, max: None }),
                    ..Default::default()
                },
                0,
            ))
            .unwrap();
        (store, backend, worker)
    }

    /// Claim every due instance and process it once.
    async fn cycle(store: &StateStore, worker: &InstanceWorker) {
        let items = store
            .claim_batch::<Instance>(
                "instances",
                10,
                ClaimParams {
                    now: epoch_millis(),
                    min_processing_interval: 0,
                    lock_timeout: 60_000,
                },
            )
            .unwrap();
        for item in items {
            worker.process(&item).await.unwrap();
        }
    }

    fn status(store: &StateStore, id: &str) -> Instance {
        store.get::<Instance>(id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn fleet_instance_launches_cheapest_offer_then_becomes_idle() {
        let (store, backend, worker) = setup(vec![entry("eu", 2, 0.9, None), entry("us", 4, 0.6, None)]);
        store
            .put(&Instance::pending("i-1", "main", Some("f-1"), None, 0))
            .unwrap();

        cycle(&store, &worker).await;
        let inst = status(&store, "i-1");
        assert_eq!(inst.status, InstanceStatus::Provisioning);
        assert_eq!(inst.offer.as_ref().unwrap().region, "us");
        assert!(inst.launched.is_some());
        assert_eq!(backend.running_count().await, 1);

        cycle(&store, &worker).await;
        let inst = status(&store, "i-1");
        assert_eq!(inst.status, InstanceStatus::Idle);
        assert_eq!(inst.total_blocks, Some(4));
        assert_eq!(inst.busy_blocks, 0);
        assert!(inst.lease.lock_token.is_none());
    }

    #[tokio::test]
    async fn falls_through_exhausted_offers() {
        let (store, backend, worker) = setup(vec![entry("us", 1, 0.5, Some(0)), entry("eu", 1, 0.7, None)]);
        store
            .put(&Instance::pending("i-1", "main", Some("f-1"), None, 0))
            .unwrap();

        cycle(&store, &worker).await;
        assert_eq!(status(&store, "i-1").offer.unwrap().region, "eu");
        assert_eq!(backend.running_count().await, 1);
    }

    #[tokio::test]
    async fn no_capacity_anywhere_terminates_instance() {
        let (store, _backend, worker) = setup(vec![entry("us", 1, 0.5, Some(0))]);
        store
            .put(&Instance::pending("i-1", "main", Some("f-1"), None, 0))
            .unwrap();

        cycle(&store, &worker).await;
        let inst = status(&store, "i-1");
        assert_eq!(inst.status, InstanceStatus::Terminated);
        assert_eq!(inst.termination_reason.as_deref(), Some(NO_OFFERS));
        // Fleet-owned: left for the consolidator to reap.
        assert!(!inst.deleted);
    }

    #[tokio::test]
    async fn recoverable_backend_error_keeps_instance_pending() {
        let (store, backend, worker) = setup(vec![entry("us", 1, 0.5, None)]);
        store
            .put(&Instance::pending("i-1", "main", Some("f-1"), None, 0))
            .unwrap();
        backend
            .fail_next_create(ComputeError::Backend {
                message: "rate limited".to_string(),
                recoverable: true,
            })
            .await;

        cycle(&store, &worker).await;
        let inst = status(&store, "i-1");
        assert_eq!(inst.status, InstanceStatus::Pending);
        assert_eq!(inst.status_message.as_deref(), Some("backend error: rate limited"));

        cycle(&store, &worker).await;
        assert_eq!(status(&store, "i-1").status, InstanceStatus::Provisioning);
    }

    #[tokio::test]
    async fn unrecoverable_backend_error_terminates() {
        let (store, backend, worker) = setup(vec![entry("us", 1, 0.5, None)]);
        store
            .put(&Instance::pending("i-1", "main", Some("f-1"), None, 0))
            .unwrap();
        backend
            .fail_next_create(ComputeError::Backend {
                message: "image not found".to_string(),
                recoverable: false,
            })
            .await;

        cycle(&store, &worker).await;
        assert_eq!(status(&store, "i-1").status, InstanceStatus::Terminated);
    }

    #[tokio::test]
    async fn terminating_instance_is_released_at_backend() {
        let (store, backend, worker) = setup(vec![entry("us", 1, 0.5, None)]);
        store
            .put(&Instance::pending("i-1", "main", Some("f-1"), None, 0))
            .unwrap();
        cycle(&store, &worker).await;
        cycle(&store, &worker).await;

        let mut inst = status(&store, "i-1");
        InstanceUpdate::terminating("too many instances").apply(&mut inst);
        store.put(&inst).unwrap();

        cycle(&store, &worker).await;
        let inst = status(&store, "i-1");
        assert_eq!(inst.status, InstanceStatus::Terminated);
        assert_eq!(inst.termination_reason.as_deref(), Some("too many instances"));
        assert_eq!(backend.running_count().await, 0);
    }

    #[tokio::test]
    async fn instance_placed_by_a_job_keeps_its_blocks() {
        let (store, _backend, worker) = setup(vec![entry("us", 2, 0.5, None)]);
        let offers = BackendRegistry::new()
            .with_backend(Arc::new(StaticCompute::new(StaticBackendConfig {
                name: "lab".to_string(),
                offers: vec![entry("us", 2, 0.5, None)],
            })))
            .get_offers(&Default::default(), &OfferFilter::default(), None)
            .await;
        let mut inst = Instance::pending("i-1", "main", Some("f-1"), Some(offers[0].clone()), 0);
        inst.busy_blocks = 2;
        store.put(&inst).unwrap();

        cycle(&store, &worker).await;
        cycle(&store, &worker).await;
        let inst = status(&store, "i-1");
        assert_eq!(inst.status, InstanceStatus::Busy);
        assert_eq!(inst.total_blocks, Some(2));
    }

    #[tokio::test]
    async fn fleetless_terminated_instance_is_deleted() {
        let (store, _backend, worker) = setup(vec![]);
        let mut inst = Instance::pending("i-9", "main", None, None, 0);
        inst.status = InstanceStatus::Terminated;
        store.put(&inst).unwrap();

        cycle(&store, &worker).await;
        assert!(status(&store, "i-9").deleted);
    }

    #[tokio::test]
    async fn terminated_instance_of_deleted_fleet_is_deleted() {
        let (store, _backend, worker) = setup(vec![]);
        let mut inst = Instance::pending("i-1", "main", Some("f-1"), None, 0);
        inst.status = InstanceStatus::Terminated;
        store.put(&inst).unwrap();

        // Live fleet: reaping is the consolidator's job.
        cycle(&store, &worker).await;
        assert!(!status(&store, "i-1").deleted);

        let mut fleet = store.get::<Fleet>("f-1").unwrap().unwrap();
        fleet.deleted = true;
        store.put(&fleet).unwrap();
        cycle(&store, &worker).await;
        assert!(status(&store, "i-1").deleted);
    }

    #[tokio::test]
    async fn stale_item_is_ignored() {
        let (store, backend, worker) = setup(vec![entry("us", 1, 0.5, None)]);
        store
            .put(&Instance::pending("i-1", "main", Some("f-1"), None, 0))
            .unwrap();
        let item = store
            .claim_batch::<Instance>(
                "instances",
                1,
                ClaimParams {
                    now: epoch_millis(),
                    min_processing_interval: 0,
                    lock_timeout: 60_000,
                },
            )
            .unwrap()
            .remove(0);
        assert!(store.release::<Instance>("i-1", &item.lock_token).unwrap());

        worker.process(&item).await.unwrap();
        assert_eq!(status(&store, "i-1").status, InstanceStatus::Pending);
        assert_eq!(backend.running_count().await, 0);
    }
}
