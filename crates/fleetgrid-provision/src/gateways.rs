//! GatewayWorker — the gateway lifecycle on the same pipeline machinery.
//!
//! SUBMITTED launches the backing instance, PROVISIONING promotes it to
//! RUNNING, and a gateway marked `to_be_deleted` has its instance
//! terminated before the row is soft-deleted.

use async_trait::async_trait;
use tracing::{info, warn};

use fleetgrid_compute::{BackendRegistry, ComputeError, InstanceConfig, OfferFilter};
use fleetgrid_pipeline::Worker;
use fleetgrid_state::{
    Gateway, GatewayStatus, GatewayUpdate, PipelineItem, Requirements, StateStore, epoch_millis,
};

pub struct GatewayWorker {
    store: StateStore,
    registry: BackendRegistry,
}

impl GatewayWorker {
    pub fn new(store: StateStore, registry: BackendRegistry) -> Self {
        Self { store, registry }
    }

    async fn launch(&self, gateway: &Gateway) -> GatewayUpdate {
        let filter = OfferFilter {
            backends: Some(vec![gateway.backend.clone()]),
            regions: Some(vec![gateway.region.clone()]),
            availability_zones: None,
            instance_types: gateway.instance_type.clone().map(|t| vec![t]),
        };
        let offer = self
            .registry
            .get_offers(&Requirements::default(), &filter, None)
            .await
            .into_iter()
            .find(|o| o.availability.is_available());
        let (Some(offer), Some(backend)) = (offer, self.registry.get(&gateway.backend)) else {
            info!(gateway = %gateway.id, backend = %gateway.backend, region = %gateway.region, "no offer for gateway");
            return failed("no offers");
        };

        let config = InstanceConfig {
            project: gateway.project.clone(),
            instance_name: format!("gateway-{}", gateway.name),
            fleet: None,
            ssh_keys: Vec::new(),
        };
        match backend.create_instance(&offer, &config).await {
            Ok(launched) => {
                info!(gateway = %gateway.id, instance_id = %launched.instance_id, "gateway instance launched");
                GatewayUpdate {
                    status: Some(GatewayStatus::Provisioning),
                    status_message: Some(None),
                    launched: Some(launched),
                    ..GatewayUpdate::default()
                }
            }
            Err(e) if e.is_recoverable() => {
                warn!(gateway = %gateway.id, error = %e, "gateway launch failed, will retry");
                GatewayUpdate {
                    status_message: Some(Some(e.to_string())),
                    ..GatewayUpdate::default()
                }
            }
            Err(e) => {
                warn!(gateway = %gateway.id, error = %e, "gateway launch failed permanently");
                failed(&e.to_string())
            }
        }
    }

    async fn delete(&self, gateway: &Gateway) -> GatewayUpdate {
        let deleted = GatewayUpdate {
            deleted: Some(true),
            ..GatewayUpdate::default()
        };
        let Some(launched) = &gateway.launched else {
            return deleted;
        };
        let Some(backend) = self.registry.get(&gateway.backend) else {
            warn!(gateway = %gateway.id, backend = %gateway.backend, "backend no longer configured, dropping gateway");
            return deleted;
        };
        match backend
            .terminate_instance(
                &launched.instance_id,
                &launched.region,
                launched.backend_data.as_deref(),
            )
            .await
        {
            Ok(()) | Err(ComputeError::NotFound(_)) => {
                info!(gateway = %gateway.id, "gateway deleted");
                deleted
            }
            Err(e) => {
                warn!(gateway = %gateway.id, error = %e, "gateway termination failed, will retry");
                GatewayUpdate {
                    status_message: Some(Some(e.to_string())),
                    ..GatewayUpdate::default()
                }
            }
        }
    }
}

fn failed(reason: &str) -> GatewayUpdate {
    GatewayUpdate {
        status: Some(GatewayStatus::Failed),
        status_message: Some(Some(reason.to_string())),
        ..GatewayUpdate::default()
    }
}

#[async_trait]
impl Worker for GatewayWorker {
    async fn process(&self, item: &PipelineItem) -> anyhow::Result<()> {
        let Some(gateway) = self
            .store
            .get::<Gateway>(&item.id)?
            .filter(|g| g.lease.is_token(&item.lock_token))
        else {
            warn!(gateway = %item.id, "lease lost before processing");
            return Ok(());
        };

        let update = if gateway.to_be_deleted {
            self.delete(&gateway).await
        } else {
            match gateway.status {
                GatewayStatus::Submitted => self.launch(&gateway).await,
                GatewayStatus::Provisioning => {
                    info!(gateway = %gateway.id, "gateway running");
                    GatewayUpdate {
                        status: Some(GatewayStatus::Running),
                        ..GatewayUpdate::default()
                    }
                }
                GatewayStatus::Running | GatewayStatus::Failed => GatewayUpdate::default(),
            }
        };

        let committed = self.store.commit::<Gateway>(
            &item.id,
            &item.lock_token,
            epoch_millis(),
            |gateway| update.apply(gateway),
        )?;
        if !committed {
            warn!(gateway = %item.id, "gateway update discarded, lease lost");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_compute::{CatalogEntry, StaticBackendConfig, StaticCompute};
    use fleetgrid_state::{Availability, ClaimParams, InstanceType, Resources};
    use std::sync::Arc;

    fn setup(capacity: Option<u32>) -> (StateStore, Arc<StaticCompute>, GatewayWorker) {
        let store = StateStore::open_in_memory().unwrap();
        let backend = Arc::new(StaticCompute::new(StaticBackendConfig {
            name: "lab".to_string(),
            offers: vec![CatalogEntry {
                region: "us".to_string(),
                availability_zones: None,
                instance: InstanceType {
                    name: "small".to_string(),
                    resources: Resources {
                        cpus: 2,
                        memory_mib: 4096,
                        gpus: vec![],
                        disk_mib: 0,
                        spot: false,
                    },
                },
                price: 0.02,
                availability: Availability::Available,
                capacity,
            }],
        }));
        let worker = GatewayWorker::new(
            store.clone(),
            BackendRegistry::new().with_backend(backend.clone()),
        );
        store
            .put(&Gateway::submitted("gw-1", "edge", "main", "lab", "us", 0))
            .unwrap();
        (store, backend, worker)
    }

    async fn cycle(store: &StateStore, worker: &GatewayWorker) {
        let items = store
            .claim_batch::<Gateway>(
                "gateways",
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

    fn gateway(store: &StateStore) -> Gateway {
        store.get::<Gateway>("gw-1").unwrap().unwrap()
    }

    #[tokio::test]
    async fn submitted_gateway_reaches_running() {
        let (store, backend, worker) = setup(None);

        cycle(&store, &worker).await;
        assert_eq!(gateway(&store).status, GatewayStatus::Provisioning);
        assert_eq!(backend.running_count().await, 1);

        cycle(&store, &worker).await;
        let gw = gateway(&store);
        assert_eq!(gw.status, GatewayStatus::Running);
        assert!(gw.launched.is_some());
    }

    #[tokio::test]
    async fn gateway_without_capacity_fails() {
        let (store, _backend, worker) = setup(Some(0));
        cycle(&store, &worker).await;
        let gw = gateway(&store);
        assert_eq!(gw.status, GatewayStatus::Failed);
        assert_eq!(gw.status_message.as_deref(), Some("no offers"));
    }

    #[tokio::test]
    async fn deleted_gateway_releases_instance() {
        let (store, backend, worker) = setup(None);
        cycle(&store, &worker).await;
        cycle(&store, &worker).await;

        let mut gw = gateway(&store);
        gw.to_be_deleted = true;
        store.put(&gw).unwrap();

        cycle(&store, &worker).await;
        assert!(gateway(&store).deleted);
        assert_eq!(backend.running_count().await, 0);

        // Soft-deleted rows are never claimed again.
        cycle(&store, &worker).await;
        assert!(gateway(&store).lease.lock_token.is_none());
    }
}
