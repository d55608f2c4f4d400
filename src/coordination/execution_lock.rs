//! Distributed execution lock.
//!
//! A lease, not a mutex: the row self-expires after the lease window, so a
//! crashed holder blocks an account for at most that long. Acquisition never
//! waits; a caller that cannot get the lock skips the account for this cycle.
//! Every externally visible side effect must complete well inside the lease.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::persistence::Store;

/// Proof of acquisition; release requires the exact pair it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub account_id: String,
    pub lock_id: Uuid,
}

pub struct ExecutionLock {
    store: Arc<dyn Store>,
    lease: Duration,
}

impl ExecutionLock {
    pub fn new(store: Arc<dyn Store>, lease_secs: u64) -> Self {
        Self {
            store,
            lease: Duration::seconds(lease_secs as i64),
        }
    }

    /// Two-phase, non-blocking acquisition. Phase one creates the lease row
    /// if the account has none; phase two takes over a row whose holder
    /// released it or let the lease lapse. `None` means another live holder
    /// exists and the caller must skip the account this cycle.
    pub async fn acquire(&self, account_id: &str) -> Result<Option<LockHandle>> {
        let lock_id = Uuid::new_v4();
        let expires_at = Utc::now() + self.lease;

        if self
            .store
            .try_insert_lock(account_id, lock_id, expires_at)
            .await?
        {
            debug!("Acquired execution lock for {} (fresh)", account_id);
            return Ok(Some(LockHandle {
                account_id: account_id.to_string(),
                lock_id,
            }));
        }

        if self
            .store
            .try_takeover_lock(account_id, lock_id, expires_at)
            .await?
        {
            debug!("Acquired execution lock for {} (takeover)", account_id);
            return Ok(Some(LockHandle {
                account_id: account_id.to_string(),
                lock_id,
            }));
        }

        debug!("Execution lock unavailable for {}", account_id);
        Ok(None)
    }

    /// Unconditional release of the exact handle. A stale or mismatched
    /// handle is a silent no-op; the lease self-expires either way.
    pub async fn release(&self, handle: &LockHandle) {
        if let Err(e) = self
            .store
            .release_lock(&handle.account_id, handle.lock_id)
            .await
        {
            // The lease bounds the damage; do not propagate
            warn!(
                "Failed to release execution lock for {}: {}",
                handle.account_id, e
            );
        }
    }

    /// Drop lock rows whose lease lapsed at least one full lease window ago
    pub async fn reap_expired(&self) -> Result<u64> {
        self.store.reap_expired_locks(self.lease).await
    }
}
