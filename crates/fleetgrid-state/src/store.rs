//! StateStore — redb-backed state persistence for fleetgrid.
//!
//! Provides typed CRUD over every [`Record`] type plus the job placement
//! transactions (block reservation, new-instance requests, release). The
//! lease primitives used by pipelines live in [`crate::leases`]. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::lease::{PipelineEntity, Record};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(FLEETS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(GATEWAYS).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(PROJECTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic records ────────────────────────────────────────────

    /// Insert or replace a record.
    pub fn put<T: Record>(&self, record: &T) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
            write_record(&mut table, record)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = T::KIND, key = record.key(), "record stored");
        Ok(())
    }

    /// Get a record by key.
    pub fn get<T: Record>(&self, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
        read_record(&table, key)
    }

    /// List every record of a type, in key order.
    pub fn list<T: Record>(&self) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
        read_all(&table)
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Non-deleted fleets of a project.
    pub fn list_project_fleets(&self, project: &str) -> StateResult<Vec<Fleet>> {
        Ok(self
            .list::<Fleet>()?
            .into_iter()
            .filter(|f| f.project == project && !f.deleted)
            .collect())
    }

    /// All instance rows (including soft-deleted) owned by a fleet.
    pub fn list_fleet_instances(&self, fleet_id: &str) -> StateResult<Vec<Instance>> {
        Ok(self
            .list::<Instance>()?
            .into_iter()
            .filter(|i| i.fleet_id.as_deref() == Some(fleet_id))
            .collect())
    }

    /// Jobs placed in a fleet that have not finished.
    pub fn list_active_fleet_jobs(&self, fleet_id: &str) -> StateResult<Vec<JobRecord>> {
        Ok(self
            .list::<JobRecord>()?
            .into_iter()
            .filter(|j| j.fleet_id.as_deref() == Some(fleet_id) && j.is_active())
            .collect())
    }

    /// True when the project row exists and is soft-deleted.
    pub fn is_project_deleted(&self, project: &str) -> StateResult<bool> {
        Ok(self
            .get::<Project>(project)?
            .is_some_and(|p| p.deleted))
    }

    // ── Job placement ──────────────────────────────────────────────

    /// Reserve `job.blocks` on an existing instance and record the job.
    ///
    /// Fails (returns `false`) without writing anything when the instance is
    /// gone, leased by a pipeline, not accepting jobs, or short of free blocks.
    pub fn reserve_instance_blocks(
        &self,
        instance_id: &str,
        job: &JobRecord,
        now: u64,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let Some(mut instance) = read_record::<Instance>(&instances, instance_id)? else {
                return Ok(false);
            };
            let fits = instance
                .free_blocks()
                .is_some_and(|free| free >= job.blocks);
            if instance.deleted
                || instance.unreachable
                || !instance.status.is_available()
                || instance.lease.is_held(now)
                || !fits
            {
                return Ok(false);
            }
            instance.busy_blocks += job.blocks;
            instance.status = InstanceStatus::Busy;
            write_record(&mut instances, &instance)?;

            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            write_record(&mut jobs, job)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance = %instance_id, job = %job.id, blocks = job.blocks, "blocks reserved");
        Ok(true)
    }

    /// Insert a pending instance for a job, numbered with the fleet's lowest
    /// free ordinal and named after the fleet. Returns the assigned
    /// `instance_num`, or `None` when the fleet is gone, no longer ACTIVE,
    /// or already at `nodes.max`. Both are checked against the rows as they
    /// are inside the write transaction.
    pub fn request_fleet_instance(
        &self,
        mut instance: Instance,
        job: &JobRecord,
    ) -> StateResult<Option<u32>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let num;
        {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            if let Some(fleet_id) = instance.fleet_id.clone() {
                let fleets = txn.open_table(FLEETS).map_err(map_err!(Table))?;
                let Some(fleet) = read_record::<Fleet>(&fleets, &fleet_id)? else {
                    return Ok(None);
                };
                if fleet.deleted || fleet.status != FleetStatus::Active {
                    return Ok(None);
                }
                let members: Vec<Instance> = read_all::<Instance>(&instances)?
                    .into_iter()
                    .filter(|i| i.fleet_id.as_deref() == Some(fleet_id.as_str()) && !i.deleted)
                    .collect();
                let active = members.iter().filter(|i| i.is_active()).count();
                if fleet.spec.max_nodes().is_some_and(|max| active >= max as usize) {
                    return Ok(None);
                }
                instance.instance_num =
                    lowest_free_instance_nums(members.iter().map(|i| i.instance_num), 1)
                        .first()
                        .copied()
                        .unwrap_or_default();
                instance.name = format!("{}-{}", fleet.name, instance.instance_num);
            }
            num = instance.instance_num;
            write_record(&mut instances, &instance)?;

            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            write_record(&mut jobs, job)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance = %instance.id, instance_num = num, job = %job.id, "instance requested");
        Ok(Some(num))
    }

    /// Mark a job done and give its blocks back. Returns `false` if the job
    /// is unknown or already done.
    pub fn release_job(&self, job_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let Some(mut job) = read_record::<JobRecord>(&jobs, job_id)? else {
                return Ok(false);
            };
            if !job.is_active() {
                return Ok(false);
            }
            job.status = JobStatus::Done;
            write_record(&mut jobs, &job)?;

            // Blocks are held from placement on, even while the instance
            // is still being provisioned.
            if let Some(instance_id) = job.instance_id.as_deref() {
                let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
                if let Some(mut instance) = read_record::<Instance>(&instances, instance_id)? {
                    instance.busy_blocks = instance.busy_blocks.saturating_sub(job.blocks);
                    if instance.busy_blocks == 0 && instance.status == InstanceStatus::Busy {
                        instance.status = InstanceStatus::Idle;
                    }
                    write_record(&mut instances, &instance)?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job = %job_id, "job released");
        Ok(true)
    }
}

// ── Table helpers ─────────────────────────────────────────────────

pub(crate) fn read_record<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let record: T =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

pub(crate) fn read_all<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let record: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(record);
    }
    Ok(results)
}

pub(crate) fn write_record<T: Record>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    record: &T,
) -> StateResult<()> {
    let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
    table
        .insert(record.key(), value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Pipeline rows never leave the table; they are only flagged deleted.
pub(crate) fn live<T: PipelineEntity>(rows: Vec<T>) -> impl Iterator<Item = T> {
    rows.into_iter().filter(|row| !row.is_deleted())
}
