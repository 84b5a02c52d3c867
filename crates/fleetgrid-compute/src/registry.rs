//! Backend registry — fan an offer query out to every configured backend.

use std::sync::Arc;

use tracing::{debug, warn};

use fleetgrid_state::{Offer, Requirements, allowed};

use crate::compute::Compute;

/// Location and type constraints applied to backend offers.
///
/// `None` fields allow everything; comparison is case-insensitive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfferFilter {
    pub backends: Option<Vec<String>>,
    pub regions: Option<Vec<String>>,
    pub availability_zones: Option<Vec<String>>,
    pub instance_types: Option<Vec<String>>,
}

impl OfferFilter {
    /// Narrow an offer to the allowed zones, or reject it.
    ///
    /// Offers without zone information pass through unchanged.
    pub fn apply(&self, mut offer: Offer) -> Option<Offer> {
        if !allowed(self.backends.as_deref(), &offer.backend)
            || !allowed(self.regions.as_deref(), &offer.region)
            || !allowed(self.instance_types.as_deref(), &offer.instance.name)
        {
            return None;
        }
        if let (Some(allowed_zones), Some(zones)) =
            (&self.availability_zones, offer.availability_zones.as_mut())
        {
            zones.retain(|z| allowed(Some(allowed_zones.as_slice()), z));
            if zones.is_empty() {
                return None;
            }
        }
        Some(offer)
    }
}

/// The set of backends the daemon can provision from.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Compute>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn Compute>) {
        debug!(backend = backend.name(), "backend registered");
        self.backends.push(backend);
    }

    pub fn with_backend(mut self, backend: Arc<dyn Compute>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Compute>> {
        self.backends
            .iter()
            .find(|b| b.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Query every allowed backend and merge the results.
    ///
    /// Offers are filtered, stably sorted by price, and capped at `limit`
    /// after sorting. A failing backend is logged and skipped; it does not
    /// fail the whole query.
    pub async fn get_offers(
        &self,
        requirements: &Requirements,
        filter: &OfferFilter,
        limit: Option<usize>,
    ) -> Vec<Offer> {
        let mut offers = Vec::new();
        for backend in &self.backends {
            if !allowed(filter.backends.as_deref(), backend.name()) {
                continue;
            }
            match backend.get_offers(requirements).await {
                Ok(found) => offers.extend(
                    found
                        .into_iter()
                        .filter(|o| requirements.matches(&o.instance.resources, o.price))
                        .filter_map(|o| filter.apply(o)),
                ),
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "offer query failed");
                }
            }
        }
        offers.sort_by(|a, b| a.price.total_cmp(&b.price));
        if let Some(limit) = limit {
            offers.truncate(limit);
        }
        offers
    }
}
