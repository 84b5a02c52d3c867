//! Per-row leases and the traits that make a row pipeline-processable.

use std::time::{SystemTime, UNIX_EPOCH};

use redb::TableDefinition;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock time in unix milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Opaque lock token issued on every claim.
pub type LockToken = Uuid;

/// Optimistic lock embedded in every pipeline-managed row.
///
/// A worker may mutate a row only while the row still carries the token it
/// was issued; any claim that replaces the token invalidates the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    #[serde(default)]
    pub lock_token: Option<LockToken>,
    /// Unix milliseconds.
    #[serde(default)]
    pub lock_expires_at: Option<u64>,
    #[serde(default)]
    pub lock_owner: Option<String>,
}

impl Lease {
    /// True while a token is set and has not expired at `now`.
    pub fn is_held(&self, now: u64) -> bool {
        self.lock_token.is_some() && self.lock_expires_at.is_some_and(|at| at > now)
    }

    pub fn is_token(&self, token: &LockToken) -> bool {
        self.lock_token.as_ref() == Some(token)
    }

    pub fn grant(&mut self, token: LockToken, owner: &str, expires_at: u64) {
        self.lock_token = Some(token);
        self.lock_expires_at = Some(expires_at);
        self.lock_owner = Some(owner.to_string());
    }

    pub fn clear(&mut self) {
        *self = Lease::default();
    }
}

/// The envelope passed Fetcher → Queue → Worker → Heartbeater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineItem {
    /// Table the row lives in.
    pub kind: &'static str,
    pub id: String,
    pub lock_token: LockToken,
    pub lock_expires_at: u64,
    /// The row carried a lease that had already run out when it was claimed.
    pub prev_lock_expired: bool,
}

/// Timing inputs of a claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimParams {
    pub now: u64,
    /// Rows processed more recently than this (ms) are not due yet.
    pub min_processing_interval: u64,
    /// Lease length granted to claimed rows (ms).
    pub lock_timeout: u64,
}

/// A row type stored as JSON in its own table.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;
    /// Table name, used in logs and `PipelineItem::kind`.
    const KIND: &'static str;

    fn key(&self) -> &str;
}

/// A row type background pipelines can claim and process.
pub trait PipelineEntity: Record {
    fn lease(&self) -> &Lease;
    fn lease_mut(&mut self) -> &mut Lease;
    fn last_processed_at(&self) -> Option<u64>;
    fn set_last_processed_at(&mut self, at: u64);
    fn is_deleted(&self) -> bool;

    /// Due when never processed or processed at least `interval` ms ago.
    fn is_due(&self, now: u64, interval: u64) -> bool {
        self.last_processed_at()
            .is_none_or(|at| at.saturating_add(interval) <= now)
    }
}

/// Implements [`Record`] + [`PipelineEntity`] for a struct with `id`,
/// `lease`, `last_processed_at`, and `deleted` fields.
macro_rules! pipeline_entity {
    ($ty:ty, $table:expr, $kind:literal) => {
        impl $crate::lease::Record for $ty {
            const TABLE: ::redb::TableDefinition<'static, &'static str, &'static [u8]> = $table;
            const KIND: &'static str = $kind;

            fn key(&self) -> &str {
                &self.id
            }
        }

        impl $crate::lease::PipelineEntity for $ty {
            fn lease(&self) -> &$crate::lease::Lease {
                &self.lease
            }

            fn lease_mut(&mut self) -> &mut $crate::lease::Lease {
                &mut self.lease
            }

            fn last_processed_at(&self) -> Option<u64> {
                self.last_processed_at
            }

            fn set_last_processed_at(&mut self, at: u64) {
                self.last_processed_at = Some(at);
            }

            fn is_deleted(&self) -> bool {
                self.deleted
            }
        }
    };
}

pub(crate) use pipeline_entity;
