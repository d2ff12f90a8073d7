//! Cluster-wide named locks backed by lease rows
//!
//! A lease row names its owner and an expiry. Whoever holds an unexpired
//! lease holds the lock; an expired lease can be taken over by anyone, which
//! bounds how long a crashed holder can block others.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MIN_LOCK_LEASE_TTL_MS;
use crate::db::database::Database;
use crate::error::StoreError;

/// A held lock. Exclusive until released or until its lease expires.
pub trait Lock: Send + Sync {
    /// Give the lock up. Releasing twice is a no-op.
    fn release(&self) -> Result<(), StoreError>;

    /// Extend the lease. Returns false if the lease was lost in the meantime.
    fn renew(&self) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockId(String);

impl LockId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Lock guarding checks of one resource config scope
    pub fn resource_checking(scope_id: i64) -> Self {
        Self(format!("resource-checking:{scope_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out [`LeaseLock`]s on one database
#[derive(Clone)]
pub struct LockFactory {
    db: Arc<Database>,
    lease_ttl: Duration,
}

impl fmt::Debug for LockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFactory")
            .field("lease_ttl", &self.lease_ttl)
            .finish()
    }
}

impl LockFactory {
    /// `lease_ttl` is raised to [`MIN_LOCK_LEASE_TTL_MS`] if shorter
    pub fn new(db: Arc<Database>, lease_ttl: Duration) -> Self {
        let min_ttl = Duration::from_millis(MIN_LOCK_LEASE_TTL_MS);
        if lease_ttl < min_ttl {
            warn!("Lock lease {:?} is too short, using {:?}", lease_ttl, min_ttl);
        }
        Self {
            db,
            lease_ttl: lease_ttl.max(min_ttl),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Try to take the lock. `None` means someone else holds it.
    pub fn acquire(&self, id: &LockId) -> Result<Option<LeaseLock>, StoreError> {
        self.acquire_with(id, |_, _| Ok(true))
    }

    /// Take the lock only if it is free and `precondition` holds.
    ///
    /// The lease check, the precondition, and the grant run in one immediate
    /// transaction, so writes made by `precondition` commit only together
    /// with the grant and no other process can interleave.
    pub(crate) fn acquire_with(
        &self,
        id: &LockId,
        precondition: impl FnOnce(&Connection, i64) -> Result<bool, StoreError>,
    ) -> Result<Option<LeaseLock>, StoreError> {
        let owner = Uuid::new_v4().to_string();
        let ttl_ms = Database::duration_ms(self.lease_ttl);

        let acquired = self.db.immediate(|tx| {
            let now = Database::current_timestamp_ms();

            let expires_at: Option<i64> = tx
                .query_row(
                    "SELECT expires_at FROM lock_leases WHERE lock_id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if expires_at.is_some_and(|expires_at| expires_at > now) {
                return Ok(false);
            }

            if !precondition(tx, now)? {
                return Ok(false);
            }

            tx.execute(
                r#"
                INSERT INTO lock_leases (lock_id, owner, expires_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(lock_id) DO UPDATE SET
                    owner = excluded.owner,
                    expires_at = excluded.expires_at
                "#,
                (id.as_str(), &owner, now.saturating_add(ttl_ms)),
            )?;
            Ok(true)
        })?;

        if !acquired {
            debug!("Lock {} not acquired", id);
            return Ok(None);
        }

        debug!("Lock {} acquired by {}", id, owner);
        Ok(Some(LeaseLock {
            db: Arc::clone(&self.db),
            id: id.clone(),
            owner,
            lease_ttl: self.lease_ttl,
            released: AtomicBool::new(false),
        }))
    }
}

pub struct LeaseLock {
    db: Arc<Database>,
    id: LockId,
    owner: String,
    lease_ttl: Duration,
    released: AtomicBool,
}

impl fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseLock")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl LeaseLock {
    pub fn id(&self) -> &LockId {
        &self.id
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }
}

impl Lock for LeaseLock {
    fn release(&self) -> Result<(), StoreError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let conn = self.db.lock_conn()?;
        conn.execute(
            "DELETE FROM lock_leases WHERE lock_id = ?1 AND owner = ?2",
            (self.id.as_str(), &self.owner),
        )?;
        debug!("Lock {} released by {}", self.id, self.owner);
        Ok(())
    }

    fn renew(&self) -> Result<bool, StoreError> {
        if self.released.load(Ordering::Acquire) {
            return Ok(false);
        }

        let expires_at = Database::current_timestamp_ms()
            .saturating_add(Database::duration_ms(self.lease_ttl));
        let conn = self.db.lock_conn()?;
        let rows_affected = conn.execute(
            "UPDATE lock_leases SET expires_at = ?1 WHERE lock_id = ?2 AND owner = ?3",
            (expires_at, self.id.as_str(), &self.owner),
        )?;
        Ok(rows_affected > 0)
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release lock {} on drop: {}", self.id, e);
        }
    }
}
