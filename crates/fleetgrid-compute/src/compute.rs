//! The uniform contract every cloud backend implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleetgrid_state::{LaunchedInstance, Offer, Requirements};

use crate::error::ComputeResult;

/// What a backend needs to know about the instance it is launching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub project: String,
    pub instance_name: String,
    #[serde(default)]
    pub fleet: Option<String>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
}

/// A cloud backend.
///
/// Implementations must be cheap to share; the daemon holds them behind `Arc`.
#[async_trait]
pub trait Compute: Send + Sync {
    /// Backend name as it appears in `Offer::backend` and profile allow-lists.
    fn name(&self) -> &str;

    /// Every offer matching `requirements`, in no particular order.
    async fn get_offers(&self, requirements: &Requirements) -> ComputeResult<Vec<Offer>>;

    async fn create_instance(
        &self,
        offer: &Offer,
        config: &InstanceConfig,
    ) -> ComputeResult<LaunchedInstance>;

    async fn terminate_instance(
        &self,
        instance_id: &str,
        region: &str,
        backend_data: Option<&str>,
    ) -> ComputeResult<()>;
}
