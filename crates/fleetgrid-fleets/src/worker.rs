//! FleetWorker — runs one consolidation cycle per leased fleet.
//!
//! The fleet row is already leased by the pipeline. The worker then leases
//! every instance of the fleet (all or nothing), evaluates the cycle, and
//! commits fleet and instance updates in one transaction. Losing either
//! lock discards the cycle; the fleet is picked up again later.
//!
//! Only the fleet lease is renewed by the pipeline heartbeat. The instance
//! lease is taken for one `lock_timeout` and must outlive the cycle, which
//! touches nothing but the store between locking and committing.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fleetgrid_pipeline::{PipelineConfig, Worker};
use fleetgrid_state::{
    Fleet, FleetCycleCommit, FleetStatus, Instance, PipelineItem, StateStore, epoch_millis,
};

use crate::consolidator::{
    Consolidation, CycleOutcome, DeleteReason, FleetContext, SkipReason, evaluate,
};
use crate::error::{FleetError, FleetResult};

pub struct FleetWorker {
    store: StateStore,
    owner: String,
    lock_timeout: u64,
}

impl FleetWorker {
    pub fn new(store: StateStore, config: &PipelineConfig) -> Self {
        Self {
            store,
            owner: config.name.clone(),
            lock_timeout: config.lock_timeout_ms(),
        }
    }

    /// One cycle evaluated at `now`.
    ///
    /// Lease failures surface as [`FleetError::StaleLease`] and
    /// [`FleetError::LockAcquisition`]; nothing is written in either case.
    pub(crate) fn run_cycle(&self, item: &PipelineItem, now: u64) -> FleetResult<CycleOutcome> {
        let fleet = self
            .store
            .get::<Fleet>(&item.id)?
            .filter(|f| f.lease.is_token(&item.lock_token))
            .ok_or_else(|| FleetError::StaleLease(item.id.clone()))?;

        let project_deleted = self.store.is_project_deleted(&fleet.project)?;
        let Some((instance_token, instances)) =
            self.store
                .lock_fleet_instances(&fleet.id, &self.owner, now, self.lock_timeout)?
        else {
            return Err(FleetError::LockAcquisition(fleet.id));
        };
        let active_jobs = self.store.list_active_fleet_jobs(&fleet.id)?.len();

        let outcome = evaluate(
            &fleet,
            &instances,
            FleetContext {
                now,
                active_jobs,
                project_deleted,
            },
        );

        let new_instances = (0..outcome.new_instances_count)
            .map(|_| {
                let id = Uuid::new_v4().to_string();
                Instance::pending(&id, &fleet.project, Some(&fleet.id), None, now)
            })
            .collect();
        let committed = self.store.commit_fleet_cycle(FleetCycleCommit {
            fleet_id: fleet.id.clone(),
            fleet_token: item.lock_token,
            instance_token: Some(instance_token),
            now,
            fleet: outcome.fleet.clone(),
            instances: outcome.instances.clone(),
            new_instances,
        })?;
        if !committed {
            return Err(FleetError::StaleLease(fleet.id));
        }

        log_outcome(&fleet, &outcome);
        Ok(outcome)
    }

    /// Unlock the fleet without changes. Stamping `last_processed_at` keeps
    /// it out of the queue for one processing interval.
    fn postpone(&self, item: &PipelineItem) -> FleetResult<()> {
        self.store
            .commit::<Fleet>(&item.id, &item.lock_token, epoch_millis(), |_| {})?;
        Ok(())
    }
}

fn log_outcome(fleet: &Fleet, outcome: &CycleOutcome) {
    match &outcome.delete {
        Some(DeleteReason::InvalidSpec(reason)) => {
            error!(fleet = %fleet.id, name = %fleet.name, %reason, "fleet configuration invalid, fleet deleted");
            return;
        }
        Some(reason) => {
            info!(fleet = %fleet.id, name = %fleet.name, reason = %reason.message(), "fleet deleted");
            return;
        }
        None => {}
    }
    if outcome.fleet.status == Some(FleetStatus::Terminating) {
        info!(
            fleet = %fleet.id,
            name = %fleet.name,
            terminating = outcome.instances.len(),
            reason = %outcome.fleet.status_message.clone().flatten().unwrap_or_default(),
            "fleet terminating"
        );
        return;
    }
    match &outcome.consolidation {
        Consolidation::Planned(plan) if plan.changed() => info!(
            fleet = %fleet.id,
            name = %fleet.name,
            new_instances = plan.new_instances_count,
            terminated = plan.terminate.len(),
            surplus = plan.surplus,
            reaped = plan.reap.len(),
            "fleet consolidated"
        ),
        Consolidation::Planned(plan) => debug!(
            fleet = %fleet.id,
            reaped = plan.reap.len(),
            "fleet within range"
        ),
        Consolidation::Skipped(SkipReason::BackingOff { ready_at }) => {
            debug!(fleet = %fleet.id, ready_at, "fleet consolidation backing off")
        }
        Consolidation::Skipped(reason) => {
            debug!(fleet = %fleet.id, ?reason, "fleet consolidation skipped")
        }
    }
}

#[async_trait]
impl Worker for FleetWorker {
    async fn process(&self, item: &PipelineItem) -> anyhow::Result<()> {
        match self.run_cycle(item, epoch_millis()) {
            Ok(_) => Ok(()),
            Err(e @ FleetError::LockAcquisition(_)) => {
                debug!(fleet = %item.id, error = %e, "postponing consolidation");
                self.postpone(item)?;
                Ok(())
            }
            Err(e @ FleetError::StaleLease(_)) => {
                warn!(fleet = %item.id, error = %e, "consolidation result discarded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
