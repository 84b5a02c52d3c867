//! Pipeline wiring for `fleetd run`.

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use fleetgrid_compute::BackendRegistry;
use fleetgrid_fleets::FleetWorker;
use fleetgrid_pipeline::{Pipeline, StoreFetcher};
use fleetgrid_provision::{GatewayWorker, InstanceWorker};
use fleetgrid_state::{Fleet, Gateway, Instance, StateStore};

use crate::config::{FLEETS_PIPELINE, FleetdConfig, GATEWAYS_PIPELINE, INSTANCES_PIPELINE};

/// Run the fleet, instance, and gateway pipelines until `shutdown` fires.
///
/// Every pipeline is stopped and joined before returning; the first
/// pipeline failure is reported after the others have drained.
pub async fn run_pipelines(
    store: StateStore,
    registry: BackendRegistry,
    config: &FleetdConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let fleets = config.pipeline(FLEETS_PIPELINE)?;
    let instances = config.pipeline(INSTANCES_PIPELINE)?;
    let gateways = config.pipeline(GATEWAYS_PIPELINE)?;

    let mut tasks = JoinSet::new();

    let pipeline = Pipeline::new(
        fleets.clone(),
        StoreFetcher::<Fleet>::new(store.clone(), &fleets),
        FleetWorker::new(store.clone(), &fleets),
    );
    tasks.spawn(pipeline.run(shutdown.clone()));

    let pipeline = Pipeline::new(
        instances.clone(),
        StoreFetcher::<Instance>::new(store.clone(), &instances),
        InstanceWorker::new(store.clone(), registry.clone(), config.placement.max_offers),
    );
    tasks.spawn(pipeline.run(shutdown.clone()));

    let pipeline = Pipeline::new(
        gateways.clone(),
        StoreFetcher::<Gateway>::new(store.clone(), &gateways),
        GatewayWorker::new(store, registry),
    );
    tasks.spawn(pipeline.run(shutdown));

    info!(pipelines = tasks.len(), "pipelines running");

    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::Error::from(e)),
        };
        if let Err(e) = result {
            error!(error = %e, "pipeline failed");
            failure.get_or_insert(e);
        }
    }
    failure.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let config = FleetdConfig::default();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            run_pipelines(store, BackendRegistry::new(), &config, rx).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_pipeline_config_fails_fast() {
        let store = StateStore::open_in_memory().unwrap();
        let mut config = FleetdConfig::default();
        config.pipelines.instances.workers = Some(0);
        let (_tx, rx) = watch::channel(false);

        let err = run_pipelines(store, BackendRegistry::new(), &config, rx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("workers"));
    }
}
