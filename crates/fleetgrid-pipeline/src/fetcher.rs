//! The two seams an entity type plugs into the engine through.

use std::marker::PhantomData;

use async_trait::async_trait;

use fleetgrid_state::{ClaimParams, PipelineEntity, PipelineItem, StateStore, epoch_millis};

use crate::config::PipelineConfig;
use crate::error::PipelineResult;

/// Claims due entities under a lease.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Lease up to `limit` due entities.
    async fn fetch(&self, limit: usize) -> PipelineResult<Vec<PipelineItem>>;

    /// Push the item's lease out to `expires_at` (unix ms).
    ///
    /// `false` once the row no longer carries the item's token.
    async fn extend_lease(&self, item: &PipelineItem, expires_at: u64) -> PipelineResult<bool>;

    /// Hand an unprocessed item back without recording a processing pass.
    async fn release(&self, item: &PipelineItem) -> PipelineResult<bool>;
}

/// Processes one leased item.
///
/// Implementations finish with exactly one conditional commit on the
/// item's token. A failed commit means the lease was lost: the result is
/// dropped and the entity is picked up again later.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn process(&self, item: &PipelineItem) -> anyhow::Result<()>;
}

/// [`Fetcher`] over a [`StateStore`] table.
pub struct StoreFetcher<T> {
    store: StateStore,
    owner: String,
    min_processing_interval: u64,
    lock_timeout: u64,
    _entity: PhantomData<fn() -> T>,
}

impl<T: PipelineEntity> StoreFetcher<T> {
    pub fn new(store: StateStore, config: &PipelineConfig) -> Self {
        Self {
            store,
            owner: config.name.clone(),
            min_processing_interval: config.min_processing_interval_ms(),
            lock_timeout: config.lock_timeout_ms(),
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<T: PipelineEntity> Fetcher for StoreFetcher<T> {
    async fn fetch(&self, limit: usize) -> PipelineResult<Vec<PipelineItem>> {
        let params = ClaimParams {
            now: epoch_millis(),
            min_processing_interval: self.min_processing_interval,
            lock_timeout: self.lock_timeout,
        };
        Ok(self.store.claim_batch::<T>(&self.owner, limit, params)?)
    }

    async fn extend_lease(&self, item: &PipelineItem, expires_at: u64) -> PipelineResult<bool> {
        Ok(self
            .store
            .extend_lease::<T>(&item.id, &item.lock_token, expires_at)?)
    }

    async fn release(&self, item: &PipelineItem) -> PipelineResult<bool> {
        Ok(self.store.release::<T>(&item.id, &item.lock_token)?)
    }
}
