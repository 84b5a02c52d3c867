//! Lease primitives: claim, heartbeat, conditional commit, two-phase fleet lock.
//!
//! Each primitive is one redb write transaction. A worker's result only lands
//! if the row still carries the token the worker was issued. Returning before
//! `commit` drops the transaction, which rolls it back.

use redb::ReadableTable;
use tracing::debug;
use uuid::Uuid;

use crate::error::StateResult;
use crate::lease::{ClaimParams, LockToken, PipelineEntity, PipelineItem};
use crate::store::{StateStore, live, map_err, read_all, read_record, write_record};
use crate::tables::{FLEETS, INSTANCES};
use crate::types::*;

/// Everything one fleet consolidation cycle writes, applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct FleetCycleCommit {
    pub fleet_id: FleetId,
    pub fleet_token: LockToken,
    /// Token the fleet's instances were locked with, if any were.
    pub instance_token: Option<LockToken>,
    pub now: u64,
    pub fleet: FleetUpdate,
    pub instances: Vec<(InstanceId, InstanceUpdate)>,
    /// New pending instances; `instance_num` is assigned on commit.
    pub new_instances: Vec<Instance>,
}

impl StateStore {
    /// Lease up to `limit` due, unleased rows of `T`, least recently processed first.
    pub fn claim_batch<T: PipelineEntity>(
        &self,
        owner: &str,
        limit: usize,
        params: ClaimParams,
    ) -> StateResult<Vec<PipelineItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut items = Vec::new();
        {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
            let mut due: Vec<T> = live(read_all::<T>(&table)?)
                .filter(|row| {
                    !row.lease().is_held(params.now)
                        && row.is_due(params.now, params.min_processing_interval)
                })
                .collect();
            // `None` sorts before `Some`, so never-processed rows go first.
            due.sort_by(|a, b| {
                a.last_processed_at()
                    .cmp(&b.last_processed_at())
                    .then_with(|| a.key().cmp(b.key()))
            });
            due.truncate(limit);

            let expires_at = params.now.saturating_add(params.lock_timeout);
            for mut row in due {
                let prev_lock_expired = row.lease().lock_token.is_some();
                let token = Uuid::new_v4();
                row.lease_mut().grant(token, owner, expires_at);
                write_record(&mut table, &row)?;
                items.push(PipelineItem {
                    kind: T::KIND,
                    id: row.key().to_string(),
                    lock_token: token,
                    lock_expires_at: expires_at,
                    prev_lock_expired,
                });
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if !items.is_empty() {
            debug!(kind = T::KIND, owner, count = items.len(), "claimed batch");
        }
        Ok(items)
    }

    /// Push a lease's expiry out. `false` once the token no longer matches.
    pub fn extend_lease<T: PipelineEntity>(
        &self,
        id: &str,
        token: &LockToken,
        expires_at: u64,
    ) -> StateResult<bool> {
        self.with_leased::<T>(id, token, |row| {
            row.lease_mut().lock_expires_at = Some(expires_at);
        })
    }

    /// Apply a worker's result, unlock the row, and stamp `last_processed_at`.
    ///
    /// Returns `false` (nothing written) when the row was reclaimed.
    pub fn commit<T: PipelineEntity>(
        &self,
        id: &str,
        token: &LockToken,
        now: u64,
        apply: impl FnOnce(&mut T),
    ) -> StateResult<bool> {
        self.with_leased::<T>(id, token, |row| {
            apply(row);
            row.lease_mut().clear();
            row.set_last_processed_at(now);
        })
    }

    /// Unlock a row without recording a processing pass.
    pub fn release<T: PipelineEntity>(&self, id: &str, token: &LockToken) -> StateResult<bool> {
        self.with_leased::<T>(id, token, |row| row.lease_mut().clear())
    }

    fn with_leased<T: PipelineEntity>(
        &self,
        id: &str,
        token: &LockToken,
        f: impl FnOnce(&mut T),
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
            let row = read_record::<T>(&table, id)?;
            let Some(mut row) = row.filter(|r| r.lease().is_token(token)) else {
                return Ok(false);
            };
            f(&mut row);
            write_record(&mut table, &row)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    /// Second phase of the fleet lock: lease every non-deleted instance of
    /// the fleet under one token, or none of them.
    ///
    /// Returns `None` when any instance is currently leased elsewhere.
    pub fn lock_fleet_instances(
        &self,
        fleet_id: &str,
        owner: &str,
        now: u64,
        lock_timeout: u64,
    ) -> StateResult<Option<(LockToken, Vec<Instance>)>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let token = Uuid::new_v4();
        let mut locked = Vec::new();
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let instances: Vec<Instance> = live(read_all::<Instance>(&table)?)
                .filter(|i| i.fleet_id.as_deref() == Some(fleet_id))
                .collect();
            if instances.iter().any(|i| i.lease.is_held(now)) {
                debug!(fleet = %fleet_id, "fleet instances busy, lock not acquired");
                return Ok(None);
            }
            let expires_at = now.saturating_add(lock_timeout);
            for mut instance in instances {
                instance.lease.grant(token, owner, expires_at);
                write_record(&mut table, &instance)?;
                locked.push(instance);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some((token, locked)))
    }

    /// Apply a consolidation cycle atomically.
    ///
    /// Fails (returns `false`, writes nothing) if the fleet or any updated
    /// instance lost its lease. Every instance locked under
    /// `instance_token` is unlocked. New instances get the lowest free
    /// ordinals among the fleet's non-deleted instances.
    pub fn commit_fleet_cycle(&self, commit: FleetCycleCommit) -> StateResult<bool> {
        let FleetCycleCommit {
            fleet_id,
            fleet_token,
            instance_token,
            now,
            fleet: fleet_update,
            instances: instance_updates,
            new_instances,
        } = commit;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut fleets = txn.open_table(FLEETS).map_err(map_err!(Table))?;
            let fleet = read_record::<Fleet>(&fleets, &fleet_id)?;
            let Some(mut fleet) = fleet.filter(|f| f.lease.is_token(&fleet_token)) else {
                return Ok(false);
            };

            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let owned: Vec<Instance> = read_all::<Instance>(&instances)?
                .into_iter()
                .filter(|i| i.fleet_id.as_deref() == Some(fleet_id.as_str()))
                .collect();

            let mut staged = Vec::with_capacity(owned.len());
            for mut instance in owned {
                let locked_here = instance_token
                    .as_ref()
                    .is_some_and(|t| instance.lease.is_token(t));
                let update = instance_updates
                    .iter()
                    .find(|(id, _)| *id == instance.id)
                    .map(|(_, u)| u.clone());
                match (update, locked_here) {
                    (Some(_), false) => {
                        return Ok(false);
                    }
                    (Some(update), true) => {
                        update.apply(&mut instance);
                        instance.lease.clear();
                        instance.last_processed_at = Some(now);
                    }
                    (None, true) => instance.lease.clear(),
                    (None, false) => continue,
                }
                staged.push(instance);
            }
            // Updates for ids that are not (or no longer) in the fleet.
            if instance_updates
                .iter()
                .any(|(id, _)| !staged.iter().any(|i| i.id == *id))
            {
                return Ok(false);
            }

            let taken = read_all::<Instance>(&instances)?
                .into_iter()
                .filter(|i| i.fleet_id.as_deref() == Some(fleet_id.as_str()))
                .filter(|i| !i.deleted)
                .filter(|i| {
                    !staged
                        .iter()
                        .any(|s| s.id == i.id && s.deleted)
                })
                .map(|i| i.instance_num);
            let nums = lowest_free_instance_nums(taken, new_instances.len());

            for instance in &staged {
                write_record(&mut instances, instance)?;
            }
            for (mut instance, num) in new_instances.into_iter().zip(nums) {
                instance.fleet_id = Some(fleet_id.clone());
                instance.instance_num = num;
                instance.name = format!("{}-{num}", fleet.name);
                write_record(&mut instances, &instance)?;
            }

            fleet_update.apply(&mut fleet);
            fleet.lease.clear();
            fleet.last_processed_at = Some(now);
            write_record(&mut fleets, &fleet)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(fleet = %fleet_id, "fleet cycle committed");
        Ok(true)
    }
}
