//! Check rate gating and mutual exclusion per resource config scope

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::db::database::Database;
use crate::db::lock::{LeaseLock, LockFactory, LockId};
use crate::db::resource_config::ResourceConfig;
use crate::error::StoreError;

/// A resource config bound to the check-rate state of one pipeline resource
pub struct ResourceConfigScope {
    db: Arc<Database>,
    id: i64,
    resource_config: ResourceConfig,
    locks: LockFactory,
}

impl fmt::Debug for ResourceConfigScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfigScope")
            .field("id", &self.id)
            .field("resource_config", &self.resource_config)
            .finish()
    }
}

impl ResourceConfigScope {
    pub(crate) fn new(
        db: Arc<Database>,
        id: i64,
        resource_config: ResourceConfig,
        locks: LockFactory,
    ) -> Self {
        Self {
            db,
            id,
            resource_config,
            locks,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn resource_config(&self) -> &ResourceConfig {
        &self.resource_config
    }

    /// When this scope was last checked, if ever
    pub fn last_checked(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.db.lock_conn()?;
        let last_checked: i64 = conn
            .query_row(
                "SELECT last_checked FROM resource_config_scopes WHERE id = ?1",
                [self.id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::ResourceConfigScopeNotFound(self.id))?;

        if last_checked == 0 {
            return Ok(None);
        }
        Ok(DateTime::from_timestamp_millis(last_checked))
    }

    /// Advance `last_checked` to now if `interval` has elapsed since the
    /// stored value, or unconditionally when `immediate` is set.
    ///
    /// This is a rate gate only. Use
    /// [`acquire_resource_checking_lock`](Self::acquire_resource_checking_lock)
    /// where at most one checker may proceed.
    pub fn update_last_checked(
        &self,
        interval: Duration,
        immediate: bool,
    ) -> Result<bool, StoreError> {
        let now = Database::current_timestamp_ms();
        let conn = self.db.lock_conn()?;

        let updated = if immediate {
            Self::touch(&conn, self.id, now)?
        } else {
            Self::touch_if_elapsed(&conn, self.id, now, interval)?
        };

        if !updated {
            Self::require_exists(&conn, self.id)?;
            debug!("Scope {} checked less than {:?} ago", self.id, interval);
        }
        Ok(updated)
    }

    /// Take the cluster-wide right to check this scope.
    ///
    /// Returns `None` when another checker holds the lock or a check started
    /// within `interval`. On success `last_checked` is advanced in the same
    /// transaction that grants the lock.
    pub fn acquire_resource_checking_lock(
        &self,
        interval: Duration,
    ) -> Result<Option<LeaseLock>, StoreError> {
        let id = self.id;
        let mut scope_exists = true;

        let lock = self
            .locks
            .acquire_with(&LockId::resource_checking(id), |conn, now| {
                if Self::touch_if_elapsed(conn, id, now, interval)? {
                    return Ok(true);
                }
                scope_exists = Self::require_exists(conn, id).is_ok();
                Ok(false)
            })?;

        if !scope_exists {
            return Err(StoreError::ResourceConfigScopeNotFound(id));
        }
        Ok(lock)
    }

    fn touch(conn: &Connection, id: i64, now: i64) -> Result<bool, StoreError> {
        let rows_affected = conn.execute(
            "UPDATE resource_config_scopes SET last_checked = ?1 WHERE id = ?2",
            (now, id),
        )?;
        Ok(rows_affected > 0)
    }

    fn touch_if_elapsed(
        conn: &Connection,
        id: i64,
        now: i64,
        interval: Duration,
    ) -> Result<bool, StoreError> {
        let threshold = now.saturating_sub(Database::duration_ms(interval));
        let rows_affected = conn.execute(
            r#"
            UPDATE resource_config_scopes SET last_checked = ?1
            WHERE id = ?2 AND (last_checked = 0 OR last_checked <= ?3)
            "#,
            (now, id, threshold),
        )?;
        Ok(rows_affected > 0)
    }

    fn require_exists(conn: &Connection, id: i64) -> Result<(), StoreError> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM resource_config_scopes WHERE id = ?1)",
            [id],
            |row| row.get(0),
        )?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::ResourceConfigScopeNotFound(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::lock::Lock;
    use crate::db::resource_config::ResourceConfigFactory;
    use crate::db::types::ResourceRef;
    use serde_json::json;
    use tempfile::TempDir;

    const INTERVAL: Duration = Duration::from_millis(200);

    fn create_test_scope() -> (TempDir, ResourceConfigScope) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(&temp_dir.path().join("test.db")).unwrap();
        let factory = ResourceConfigFactory::new(Arc::new(db));
        let config = factory
            .find_or_create_resource_config("some-type", &json!({"some": "source"}), &[])
            .unwrap();
        let resource = ResourceRef {
            team_name: "main".to_string(),
            pipeline_name: "scope-pipeline".to_string(),
            resource_name: "some-resource".to_string(),
        };
        let scope = factory.find_or_create_scope(&config, Some(&resource)).unwrap();
        (temp_dir, scope)
    }

    #[test]
    fn update_last_checked_succeeds_when_never_checked() {
        let (_temp_dir, scope) = create_test_scope();
        assert_eq!(scope.last_checked().unwrap(), None);

        assert!(scope.update_last_checked(INTERVAL, false).unwrap());
        assert!(scope.last_checked().unwrap().is_some());
    }

    #[test]
    fn update_last_checked_immediate_succeeds_when_never_checked() {
        let (_temp_dir, scope) = create_test_scope();
        assert!(scope.update_last_checked(INTERVAL, true).unwrap());
    }

    #[test]
    fn update_last_checked_gates_within_interval() {
        let (_temp_dir, scope) = create_test_scope();
        assert!(scope.update_last_checked(INTERVAL, false).unwrap());

        for _ in 0..3 {
            assert!(!scope.update_last_checked(INTERVAL, false).unwrap());
            std::thread::sleep(Duration::from_millis(20));
        }

        std::thread::sleep(INTERVAL);
        assert!(scope.update_last_checked(INTERVAL, false).unwrap());
    }

    #[test]
    fn update_last_checked_immediate_ignores_interval() {
        let (_temp_dir, scope) = create_test_scope();
        assert!(scope.update_last_checked(INTERVAL, false).unwrap());

        assert!(scope.update_last_checked(INTERVAL, true).unwrap());
        assert!(!scope.update_last_checked(INTERVAL, false).unwrap());
    }

    #[test]
    fn update_last_checked_gates_huge_interval() {
        let (_temp_dir, scope) = create_test_scope();
        let forever = Duration::from_millis(u64::MAX);

        assert!(scope.update_last_checked(forever, false).unwrap());
        assert!(!scope.update_last_checked(forever, false).unwrap());
        assert!(scope.acquire_resource_checking_lock(forever).unwrap().is_none());
    }

    #[test]
    fn acquire_resource_checking_lock_is_exclusive() {
        let (_temp_dir, scope) = create_test_scope();

        let lock = scope.acquire_resource_checking_lock(INTERVAL).unwrap();
        assert!(lock.is_some());

        assert!(scope.acquire_resource_checking_lock(INTERVAL).unwrap().is_none());
    }

    #[test]
    fn acquire_resource_checking_lock_is_gated_after_release_until_interval_elapses() {
        let (_temp_dir, scope) = create_test_scope();
        let lock = scope.acquire_resource_checking_lock(INTERVAL).unwrap().unwrap();

        lock.release().unwrap();
        assert!(scope.acquire_resource_checking_lock(INTERVAL).unwrap().is_none());

        std::thread::sleep(INTERVAL + Duration::from_millis(20));

        let lock = scope.acquire_resource_checking_lock(INTERVAL).unwrap();
        assert!(lock.is_some());
        lock.unwrap().release().unwrap();
    }

    #[test]
    fn held_lock_keeps_others_out_even_after_interval() {
        let (_temp_dir, scope) = create_test_scope();
        let lock = scope.acquire_resource_checking_lock(INTERVAL).unwrap().unwrap();

        std::thread::sleep(INTERVAL + Duration::from_millis(20));
        assert!(scope.acquire_resource_checking_lock(INTERVAL).unwrap().is_none());

        lock.release().unwrap();
        assert!(scope.acquire_resource_checking_lock(INTERVAL).unwrap().is_some());
    }

    #[test]
    fn refused_lock_leaves_last_checked_untouched() {
        let (_temp_dir, scope) = create_test_scope();
        let _lock = scope.acquire_resource_checking_lock(INTERVAL).unwrap().unwrap();
        let before = scope.last_checked().unwrap();

        std::thread::sleep(INTERVAL + Duration::from_millis(20));
        assert!(scope.acquire_resource_checking_lock(INTERVAL).unwrap().is_none());

        assert_eq!(scope.last_checked().unwrap(), before);
    }

    #[test]
    fn zero_interval_only_waits_for_the_holder() {
        let (_temp_dir, scope) = create_test_scope();
        let lock = scope
            .acquire_resource_checking_lock(Duration::ZERO)
            .unwrap()
            .unwrap();
        assert!(scope.acquire_resource_checking_lock(Duration::ZERO).unwrap().is_none());

        lock.release().unwrap();
        assert!(scope.acquire_resource_checking_lock(Duration::ZERO).unwrap().is_some());
    }
}
