//! Heartbeater — keeps the leases of in-flight items alive.
//!
//! One renewal loop runs per item while a worker holds it. Each tick pushes
//! `lock_expires_at` to `now + lock_timeout`, conditioned on the item's
//! token. Once the token no longer matches the loop ends quietly: the row
//! was reclaimed and the worker's commit will be rejected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fleetgrid_state::{PipelineItem, epoch_millis};

use crate::fetcher::Fetcher;

pub struct Heartbeater<F> {
    fetcher: Arc<F>,
    interval: Duration,
    lock_timeout: Duration,
}

impl<F: Fetcher + 'static> Heartbeater<F> {
    pub fn new(fetcher: Arc<F>, interval: Duration, lock_timeout: Duration) -> Self {
        Self {
            fetcher,
            interval,
            lock_timeout,
        }
    }

    /// Begin renewing `item`'s lease until the returned handle is stopped.
    pub fn start(&self, item: &PipelineItem) -> Heartbeat {
        let (done_tx, done_rx) = oneshot::channel();
        let handle = tokio::spawn(renew_loop(
            self.fetcher.clone(),
            item.clone(),
            self.interval.max(Duration::from_millis(1)),
            self.lock_timeout.as_millis() as u64,
            done_rx,
        ));
        Heartbeat {
            done: Some(done_tx),
            handle,
        }
    }
}

/// Running renewal loop of one item.
pub struct Heartbeat {
    done: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Stop renewing and wait for the loop to exit.
    pub async fn stop(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        let _ = (&mut self.handle).await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn renew_loop<F: Fetcher>(
    fetcher: Arc<F>,
    item: PipelineItem,
    interval: Duration,
    lock_timeout: u64,
    mut done: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The claim itself just set the expiry.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expires_at = epoch_millis().saturating_add(lock_timeout);
                match fetcher.extend_lease(&item, expires_at).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(kind = item.kind, id = %item.id, "lease lost, heartbeat stopped");
                        return;
                    }
                    Err(e) => {
                        warn!(kind = item.kind, id = %item.id, error = %e, "lease renewal failed");
                    }
                }
            }
            _ = &mut done => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::fetcher::StoreFetcher;
    use fleetgrid_state::{ClaimParams, Fleet, FleetSpec, StateStore};

    fn setup(lock_timeout: Duration) -> (StateStore, Arc<StoreFetcher<Fleet>>, PipelineItem) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put(&Fleet::new("f-1", "gpu", "main", FleetSpec::default(), 0))
            .unwrap();
        let config = PipelineConfig {
            lock_timeout,
            ..PipelineConfig::named("fleets")
        };
        let fetcher = Arc::new(StoreFetcher::<Fleet>::new(store.clone(), &config));
        let item = store
            .claim_batch::<Fleet>(
                "fleets",
                1,
                ClaimParams {
                    now: epoch_millis(),
                    min_processing_interval: 0,
                    lock_timeout: lock_timeout.as_millis() as u64,
                },
            )
            .unwrap()
            .remove(0);
        (store, fetcher, item)
    }

    fn reclaim(store: &StateStore) -> usize {
        store
            .claim_batch::<Fleet>(
                "other",
                1,
                ClaimParams {
                    now: epoch_millis(),
                    min_processing_interval: 0,
                    lock_timeout: 60_000,
                },
            )
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn heartbeat_outlives_lock_timeout() {
        let lock_timeout = Duration::from_millis(150);
        let (store, fetcher, item) = setup(lock_timeout);
        let heartbeater = Heartbeater::new(fetcher, Duration::from_millis(20), lock_timeout);

        let beat = heartbeater.start(&item);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(reclaim(&store), 0, "lease expired despite heartbeat");
        beat.stop().await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(reclaim(&store), 1);
    }

    #[tokio::test]
    async fn heartbeat_stops_when_token_changes() {
        let lock_timeout = Duration::from_millis(500);
        let (store, fetcher, item) = setup(lock_timeout);
        let heartbeater = Heartbeater::new(fetcher, Duration::from_millis(10), lock_timeout);

        let beat = heartbeater.start(&item);
        assert!(store.commit::<Fleet>("f-1", &item.lock_token, epoch_millis(), |_| {}).unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(beat.is_finished());
        beat.stop().await;

        let row = store.get::<Fleet>("f-1").unwrap().unwrap();
        assert!(row.lease.lock_token.is_none());
    }
}
