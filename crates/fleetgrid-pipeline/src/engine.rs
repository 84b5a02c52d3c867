//! Pipeline — one fetch loop feeding a pool of workers through a bounded queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use fleetgrid_state::PipelineItem;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::fetcher::{Fetcher, Worker};
use crate::heartbeat::Heartbeater;

/// A background reconciliation loop over one entity type.
pub struct Pipeline<F, W> {
    config: PipelineConfig,
    fetcher: Arc<F>,
    worker: Arc<W>,
}

impl<F, W> Pipeline<F, W>
where
    F: Fetcher + 'static,
    W: Worker + 'static,
{
    pub fn new(config: PipelineConfig, fetcher: F, worker: W) -> Self {
        Self {
            config,
            fetcher: Arc::new(fetcher),
            worker: Arc::new(worker),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// Items still queued at shutdown are released unprocessed.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> PipelineResult<()> {
        self.config.validate()?;
        let name = self.config.name.clone();
        info!(
            pipeline = %name,
            workers = self.config.workers,
            queue_upper_limit = self.config.queue_upper_limit(),
            "pipeline started"
        );

        let (tx, rx) = mpsc::channel(self.config.queue_upper_limit());
        let rx = Arc::new(Mutex::new(rx));
        let heartbeater = Arc::new(Heartbeater::new(
            self.fetcher.clone(),
            self.config.heartbeat_trigger,
            self.config.lock_timeout,
        ));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.workers {
            workers.spawn(worker_loop(
                name.clone(),
                worker_id,
                rx.clone(),
                self.worker.clone(),
                heartbeater.clone(),
                shutdown.clone(),
            ));
        }

        fetch_loop(&self.config, self.fetcher.as_ref(), tx, shutdown).await;

        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(pipeline = %name, error = %e, "worker task panicked");
                failure.get_or_insert(PipelineError::Join(e.to_string()));
            }
        }

        let mut queue = rx.lock().await;
        while let Ok(item) = queue.try_recv() {
            if let Err(e) = self.fetcher.release(&item).await {
                warn!(pipeline = %name, id = %item.id, error = %e, "failed to release queued item");
            }
        }
        drop(queue);
        info!(pipeline = %name, "pipeline stopped");
        failure.map_or(Ok(()), Err)
    }
}

async fn fetch_loop<F: Fetcher>(
    config: &PipelineConfig,
    fetcher: &F,
    tx: mpsc::Sender<PipelineItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let queue_len = tx.max_capacity() - tx.capacity();
        let Some(limit) = config.batch_limit(queue_len) else {
            if pause(config.queue_check_delay, &mut shutdown).await {
                break;
            }
            continue;
        };

        let items = match fetcher.fetch(limit).await {
            Ok(items) => items,
            Err(e) => {
                error!(pipeline = %config.name, error = %e, "fetch failed");
                Vec::new()
            }
        };
        if items.is_empty() {
            if pause(config.fetch_delay, &mut shutdown).await {
                break;
            }
            continue;
        }

        debug!(pipeline = %config.name, count = items.len(), queue_len, "fetched items");
        for item in items {
            if tx.send(item).await.is_err() {
                return;
            }
        }
    }
}

/// Sleep for `delay`; `true` if shutdown was signalled meanwhile.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

async fn worker_loop<F, W>(
    pipeline: String,
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<PipelineItem>>>,
    worker: Arc<W>,
    heartbeater: Arc<Heartbeater<F>>,
    mut shutdown: watch::Receiver<bool>,
) where
    F: Fetcher + 'static,
    W: Worker,
{
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                item = queue.recv() => item,
                _ = shutdown.changed() => None,
            }
        };
        let Some(item) = next else {
            break;
        };

        if item.prev_lock_expired {
            warn!(
                pipeline = %pipeline,
                kind = item.kind,
                id = %item.id,
                "previous lease expired before commit, reprocessing"
            );
        }

        let beat = heartbeater.start(&item);
        let result = worker.process(&item).await;
        beat.stop().await;

        if let Err(e) = result {
            error!(
                pipeline = %pipeline,
                worker = worker_id,
                kind = item.kind,
                id = %item.id,
                error = %e,
                "processing failed"
            );
        }
    }
    debug!(pipeline = %pipeline, worker = worker_id, "worker stopped");
}
