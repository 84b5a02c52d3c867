//! Config-driven backend serving a fixed offer catalog.
//!
//! Stands in for a real cloud: offers come from `[[backends]]` entries in
//! `fleetd.toml`, launches are bookkept in memory, and each catalog entry
//! can carry a capacity that makes the backend run out like a real region.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use fleetgrid_state::{Availability, InstanceType, LaunchedInstance, Offer, Requirements};

use crate::compute::{Compute, InstanceConfig};
use crate::error::{ComputeError, ComputeResult};

/// One sellable instance type in one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub region: String,
    #[serde(default)]
    pub availability_zones: Option<Vec<String>>,
    pub instance: InstanceType,
    /// Hourly price in USD.
    pub price: f64,
    #[serde(default = "default_availability")]
    pub availability: Availability,
    /// Concurrent instances this entry can hold; unlimited when unset.
    #[serde(default)]
    pub capacity: Option<u32>,
}

fn default_availability() -> Availability {
    Availability::Available
}

/// A `[[backends]]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticBackendConfig {
    pub name: String,
    #[serde(default)]
    pub offers: Vec<CatalogEntry>,
}

#[derive(Default)]
struct Launches {
    next_id: u64,
    /// backend instance id → catalog index.
    running: HashMap<String, usize>,
    /// Returned by the next `create_instance` call instead of launching.
    injected_failure: Option<ComputeError>,
}

impl Launches {
    fn in_use(&self, entry: usize) -> u32 {
        self.running.values().filter(|&&idx| idx == entry).count() as u32
    }
}

/// In-memory backend over a static catalog.
pub struct StaticCompute {
    config: StaticBackendConfig,
    launches: Mutex<Launches>,
}

impl StaticCompute {
    pub fn new(config: StaticBackendConfig) -> Self {
        Self {
            config,
            launches: Mutex::new(Launches::default()),
        }
    }

    /// Make the next `create_instance` fail with `error`.
    pub async fn fail_next_create(&self, error: ComputeError) {
        self.launches.lock().await.injected_failure = Some(error);
    }

    /// Number of instances currently launched.
    pub async fn running_count(&self) -> usize {
        self.launches.lock().await.running.len()
    }

    fn entry_index(&self, offer: &Offer) -> Option<usize> {
        self.config.offers.iter().position(|entry| {
            entry.region == offer.region && entry.instance.name == offer.instance.name
        })
    }

    fn to_offer(&self, entry: &CatalogEntry, exhausted: bool) -> Offer {
        Offer {
            backend: self.config.name.clone(),
            region: entry.region.clone(),
            availability_zones: entry.availability_zones.clone(),
            instance: entry.instance.clone(),
            price: entry.price,
            availability: if exhausted {
                Availability::NoQuota
            } else {
                entry.availability
            },
            blocks: 1,
            total_blocks: 1,
            instance_id: None,
        }
    }
}

#[async_trait]
impl Compute for StaticCompute {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn get_offers(&self, requirements: &Requirements) -> ComputeResult<Vec<Offer>> {
        let launches = self.launches.lock().await;
        let offers = self
            .config
            .offers
            .iter()
            .enumerate()
            .filter(|(_, entry)| requirements.matches(&entry.instance.resources, entry.price))
            .map(|(idx, entry)| {
                let exhausted = entry
                    .capacity
                    .is_some_and(|cap| launches.in_use(idx) >= cap);
                self.to_offer(entry, exhausted)
            })
            .collect();
        Ok(offers)
    }

    async fn create_instance(
        &self,
        offer: &Offer,
        config: &InstanceConfig,
    ) -> ComputeResult<LaunchedInstance> {
        let mut launches = self.launches.lock().await;
        if let Some(error) = launches.injected_failure.take() {
            return Err(error);
        }
        let Some(idx) = self.entry_index(offer) else {
            return Err(ComputeError::NoCapacity(format!(
                "{} is not sold in {}",
                offer.instance.name, offer.region
            )));
        };
        let entry = &self.config.offers[idx];
        let exhausted = entry.capacity.is_some_and(|cap| launches.in_use(idx) >= cap);
        if exhausted || !entry.availability.is_available() {
            debug!(
                backend = %self.config.name,
                region = %entry.region,
                instance_type = %entry.instance.name,
                "catalog entry out of capacity"
            );
            return Err(ComputeError::NoCapacity(format!(
                "{} in {}",
                entry.instance.name, entry.region
            )));
        }

        launches.next_id += 1;
        let instance_id = format!("{}-{}", self.config.name, launches.next_id);
        launches.running.insert(instance_id.clone(), idx);
        info!(
            backend = %self.config.name,
            instance_id = %instance_id,
            name = %config.instance_name,
            "instance launched"
        );
        Ok(LaunchedInstance {
            hostname: Some(format!("{instance_id}.{}.internal", entry.region)),
            region: entry.region.clone(),
            availability_zone: entry
                .availability_zones
                .as_ref()
                .and_then(|zones| zones.first().cloned()),
            backend_data: Some(entry.instance.name.clone()),
            instance_id,
        })
    }

    async fn terminate_instance(
        &self,
        instance_id: &str,
        _region: &str,
        _backend_data: Option<&str>,
    ) -> ComputeResult<()> {
        let mut launches = self.launches.lock().await;
        match launches.running.remove(instance_id) {
            Some(_) => {
                info!(backend = %self.config.name, instance_id, "instance terminated");
                Ok(())
            }
            None => Err(ComputeError::NotFound(instance_id.to_string())),
        }
    }
}
