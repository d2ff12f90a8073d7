//! Resource configs and their version history
//!
//! A resource config is the deduplicated identity of a (type, source,
//! pinned custom types) tuple. Its history is split into spaces, and every
//! version in a space carries a `check_order`: the rank of its most recent
//! appearance in a check, assigned when the check's batch is committed.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::DEFAULT_LOCK_LEASE_TTL_MS;
use crate::db::database::Database;
use crate::db::lock::LockFactory;
use crate::db::resource_config_scope::ResourceConfigScope;
use crate::db::types::{
    Metadata, ResourceRef, Space, SpaceVersion, Version, VersionedResourceType, decode_version,
    encode_version, resource_config_digest,
};
use crate::error::StoreError;

/// One observed version of a resource within a space
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceVersion {
    pub id: i64,
    pub resource_config_id: i64,
    pub space: Space,
    pub version: Version,
    pub metadata: Metadata,
    /// 0 while unchecked, otherwise unique within the space
    pub check_order: i64,
}

/// Handle on one resource config.
///
/// The handle carries the batch buffered by
/// [`save_partial_version`](Self::save_partial_version), so it should be used
/// by one check at a time.
pub struct ResourceConfig {
    db: Arc<Database>,
    id: i64,
    base_type: String,
    source: serde_json::Value,
    pending: Mutex<Vec<SpaceVersion>>,
}

impl fmt::Debug for ResourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfig")
            .field("id", &self.id)
            .field("base_type", &self.base_type)
            .finish()
    }
}

const VERSION_COLUMNS: &str = "rv.id, s.name, rv.version, rv.metadata, rv.check_order";

impl ResourceConfig {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn base_type(&self) -> &str {
        &self.base_type
    }

    pub fn source(&self) -> &serde_json::Value {
        &self.source
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, Vec<SpaceVersion>>, StoreError> {
        self.pending.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn space_id(conn: &Connection, config_id: i64, space: &Space) -> Result<Option<i64>, StoreError> {
        let id = conn
            .query_row(
                "SELECT id FROM spaces WHERE resource_config_id = ?1 AND name = ?2",
                (config_id, space.as_str()),
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn require_space_id(conn: &Connection, config_id: i64, space: &Space) -> Result<i64, StoreError> {
        Self::space_id(conn, config_id, space)?
            .ok_or_else(|| StoreError::SpaceNotFound(space.to_string()))
    }

    fn read_version(&self, row: &Row<'_>) -> Result<ResourceVersion, StoreError> {
        let version: String = row.get(2)?;
        let metadata: String = row.get(3)?;
        Ok(ResourceVersion {
            id: row.get(0)?,
            resource_config_id: self.id,
            space: Space(row.get(1)?),
            version: decode_version(&version)?,
            metadata: serde_json::from_str(&metadata)?,
            check_order: row.get(4)?,
        })
    }

    /// Register a space. Saving an existing space is a no-op.
    pub fn save_space(&self, space: &Space) -> Result<(), StoreError> {
        let conn = self.db.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO spaces (resource_config_id, name) VALUES (?1, ?2)",
            (self.id, space.as_str()),
        )?;
        Ok(())
    }

    /// Designate the space used when nothing names one explicitly
    pub fn save_default_space(&self, space: &Space) -> Result<(), StoreError> {
        let conn = self.db.lock_conn()?;
        Self::require_space_id(&conn, self.id, space)?;
        conn.execute(
            "UPDATE resource_configs SET default_space = ?1 WHERE id = ?2",
            (space.as_str(), self.id),
        )?;
        Ok(())
    }

    pub fn default_space(&self) -> Result<Option<Space>, StoreError> {
        let conn = self.db.lock_conn()?;
        let space: Option<String> = conn.query_row(
            "SELECT default_space FROM resource_configs WHERE id = ?1",
            [self.id],
            |row| row.get(0),
        )?;
        Ok(space.map(Space))
    }

    /// Buffer a version for the next [`finish_saving_versions`](Self::finish_saving_versions).
    ///
    /// Nothing is written until the batch is committed. A check that gives up
    /// before committing must call
    /// [`discard_pending_versions`](Self::discard_pending_versions), or the
    /// next batch on this handle will include its versions.
    pub fn save_partial_version(
        &self,
        space: &Space,
        version: &Version,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        {
            let conn = self.db.lock_conn()?;
            Self::require_space_id(&conn, self.id, space)?;
        }

        self.lock_pending()?.push(SpaceVersion {
            space: space.clone(),
            version: version.clone(),
            metadata: metadata.clone(),
        });
        Ok(())
    }

    /// Commit every buffered version in one transaction.
    ///
    /// Each version, new or already known, is given the next `check_order` of
    /// its space in the order it was buffered. If the commit fails the buffer
    /// is kept so the batch can be retried as a whole.
    pub fn finish_saving_versions(&self) -> Result<(), StoreError> {
        let mut pending = self.lock_pending()?;
        if pending.is_empty() {
            debug!("No versions to save for resource config {}", self.id);
            return Ok(());
        }

        let config_id = self.id;
        self.db.immediate(|tx| {
            let mut next_order = tx.prepare(
                "SELECT COALESCE(MAX(check_order), 0) + 1 FROM resource_versions WHERE space_id = ?1",
            )?;
            let mut upsert = tx.prepare(
                r#"
                INSERT INTO resource_versions (space_id, version, metadata, check_order)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(space_id, version) DO UPDATE SET
                    check_order = excluded.check_order,
                    metadata = CASE
                        WHEN excluded.metadata = '[]' THEN resource_versions.metadata
                        ELSE excluded.metadata
                    END
                "#,
            )?;

            for saved in pending.iter() {
                let space_id = Self::require_space_id(tx, config_id, &saved.space)?;
                let order: i64 = next_order.query_row([space_id], |row| row.get(0))?;
                upsert.execute((
                    space_id,
                    encode_version(&saved.version)?,
                    serde_json::to_string(&saved.metadata)?,
                    order,
                ))?;
            }
            Ok(())
        })?;

        info!(
            "Saved {} versions for resource config {}",
            pending.len(),
            self.id
        );
        pending.clear();
        Ok(())
    }

    /// Drop every buffered version without writing it. Returns how many were dropped.
    pub fn discard_pending_versions(&self) -> Result<usize, StoreError> {
        let mut pending = self.lock_pending()?;
        let dropped = pending.len();
        if dropped > 0 {
            debug!(
                "Discarded {} unsaved versions for resource config {}",
                dropped, self.id
            );
        }
        pending.clear();
        Ok(dropped)
    }

    /// Insert a version outside of a check batch, with `check_order = 0`.
    ///
    /// Returns true if a new row was created. An existing version keeps its
    /// order.
    pub fn save_unchecked_version(
        &self,
        space: &Space,
        version: &Version,
        metadata: &Metadata,
    ) -> Result<bool, StoreError> {
        let conn = self.db.lock_conn()?;
        let space_id = Self::require_space_id(&conn, self.id, space)?;
        let rows_inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO resource_versions (space_id, version, metadata, check_order)
            VALUES (?1, ?2, ?3, 0)
            "#,
            (
                space_id,
                encode_version(version)?,
                serde_json::to_string(metadata)?,
            ),
        )?;
        Ok(rows_inserted > 0)
    }

    /// Point the space's latest version at an existing version
    pub fn save_space_latest_version(
        &self,
        space: &Space,
        version: &Version,
    ) -> Result<(), StoreError> {
        let encoded = encode_version(version)?;
        let conn = self.db.lock_conn()?;
        let space_id = Self::require_space_id(&conn, self.id, space)?;

        let version_id: i64 = conn
            .query_row(
                "SELECT id FROM resource_versions WHERE space_id = ?1 AND version = ?2",
                (space_id, &encoded),
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::VersionNotFound {
                space: space.to_string(),
                version: encoded.clone(),
            })?;

        conn.execute(
            "UPDATE spaces SET latest_resource_version_id = ?1 WHERE id = ?2",
            (version_id, space_id),
        )?;
        Ok(())
    }

    /// The latest version of every space that has one, in space registration order
    pub fn latest_versions(&self) -> Result<Vec<ResourceVersion>, StoreError> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {VERSION_COLUMNS} FROM spaces s
            JOIN resource_versions rv ON rv.id = s.latest_resource_version_id
            WHERE s.resource_config_id = ?1
            ORDER BY s.id
            "#
        ))?;

        let mut rows = stmt.query([self.id])?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next()? {
            versions.push(self.read_version(row)?);
        }
        Ok(versions)
    }

    /// All versions of a space, most recently checked first. Unchecked
    /// versions come last.
    pub fn versions(&self, space: &Space) -> Result<Vec<ResourceVersion>, StoreError> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {VERSION_COLUMNS} FROM resource_versions rv
            JOIN spaces s ON rv.space_id = s.id
            WHERE s.resource_config_id = ?1 AND s.name = ?2
            ORDER BY rv.check_order DESC, rv.id DESC
            "#
        ))?;

        let mut rows = stmt.query((self.id, space.as_str()))?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next()? {
            versions.push(self.read_version(row)?);
        }
        Ok(versions)
    }

    pub fn find_version(
        &self,
        space: &Space,
        version: &Version,
    ) -> Result<Option<ResourceVersion>, StoreError> {
        self.find_version_where(space, version, "")
    }

    /// Like [`find_version`](Self::find_version), restricted to versions that
    /// no check has ordered yet
    pub fn find_unchecked_version(
        &self,
        space: &Space,
        version: &Version,
    ) -> Result<Option<ResourceVersion>, StoreError> {
        self.find_version_where(space, version, "AND rv.check_order = 0")
    }

    fn find_version_where(
        &self,
        space: &Space,
        version: &Version,
        filter: &str,
    ) -> Result<Option<ResourceVersion>, StoreError> {
        let encoded = encode_version(version)?;
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {VERSION_COLUMNS} FROM resource_versions rv
            JOIN spaces s ON rv.space_id = s.id
            WHERE s.resource_config_id = ?1 AND s.name = ?2 AND rv.version = ?3 {filter}
            "#
        ))?;

        let mut rows = stmt.query((self.id, space.as_str(), &encoded))?;
        match rows.next()? {
            Some(row) => Ok(Some(self.read_version(row)?)),
            None => Ok(None),
        }
    }
}

/// Creates and looks up resource configs and their scopes
#[derive(Debug, Clone)]
pub struct ResourceConfigFactory {
    db: Arc<Database>,
    locks: LockFactory,
}

impl ResourceConfigFactory {
    pub fn new(db: Arc<Database>) -> Self {
        let locks = LockFactory::new(
            Arc::clone(&db),
            Duration::from_millis(DEFAULT_LOCK_LEASE_TTL_MS as u64),
        );
        Self { db, locks }
    }

    /// Use `lease_ttl` for checking locks handed out by scopes from this factory
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.locks = LockFactory::new(Arc::clone(&self.db), lease_ttl);
        self
    }

    fn build_config(&self, id: i64, base_type: String, source: &str) -> Result<ResourceConfig, StoreError> {
        Ok(ResourceConfig {
            db: Arc::clone(&self.db),
            id,
            base_type,
            source: serde_json::from_str(source)?,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Return the config for this (type, source, types) tuple, creating it on
    /// first use. Resources sharing a tuple share one version history.
    pub fn find_or_create_resource_config(
        &self,
        base_type: &str,
        source: &serde_json::Value,
        resource_types: &[VersionedResourceType],
    ) -> Result<ResourceConfig, StoreError> {
        let digest = resource_config_digest(base_type, source, resource_types)?;
        let encoded_source = serde_json::to_string(source)?;
        let now = Database::current_timestamp_ms();

        let id: i64 = {
            let conn = self.db.lock_conn()?;
            conn.execute(
                r#"
                INSERT INTO resource_configs (digest, base_type, source, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(digest) DO NOTHING
                "#,
                (&digest, base_type, &encoded_source, now),
            )?;
            conn.query_row(
                "SELECT id FROM resource_configs WHERE digest = ?1",
                [&digest],
                |row| row.get(0),
            )?
        };

        debug!("Resolved resource config {} for type {}", id, base_type);
        self.build_config(id, base_type.to_string(), &encoded_source)
    }

    pub fn find_resource_config_by_id(&self, id: i64) -> Result<Option<ResourceConfig>, StoreError> {
        let row: Option<(String, String)> = {
            let conn = self.db.lock_conn()?;
            conn.query_row(
                "SELECT base_type, source FROM resource_configs WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        row.map(|(base_type, source)| self.build_config(id, base_type, &source))
            .transpose()
    }

    /// Return the scope binding `config` to `resource`. Without a resource
    /// the scope is shared by every pipeline using the config.
    pub fn find_or_create_scope(
        &self,
        config: &ResourceConfig,
        resource: Option<&ResourceRef>,
    ) -> Result<ResourceConfigScope, StoreError> {
        let (team, pipeline, name) = match resource {
            Some(r) => (
                r.team_name.as_str(),
                r.pipeline_name.as_str(),
                r.resource_name.as_str(),
            ),
            None => ("", "", ""),
        };

        let id: i64 = {
            let conn = self.db.lock_conn()?;
            conn.execute(
                r#"
                INSERT OR IGNORE INTO resource_config_scopes
                    (resource_config_id, team_name, pipeline_name, resource_name)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                (config.id, team, pipeline, name),
            )?;
            conn.query_row(
                r#"
                SELECT id FROM resource_config_scopes
                WHERE resource_config_id = ?1 AND team_name = ?2
                  AND pipeline_name = ?3 AND resource_name = ?4
                "#,
                (config.id, team, pipeline, name),
                |row| row.get(0),
            )?
        };

        let config = self
            .find_resource_config_by_id(config.id)?
            .ok_or(StoreError::ResourceConfigNotFound(config.id))?;
        Ok(ResourceConfigScope::new(
            Arc::clone(&self.db),
            id,
            config,
            self.locks.clone(),
        ))
    }

    pub fn find_scope_by_id(&self, id: i64) -> Result<Option<ResourceConfigScope>, StoreError> {
        let config_id: Option<i64> = {
            let conn = self.db.lock_conn()?;
            conn.query_row(
                "SELECT resource_config_id FROM resource_config_scopes WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?
        };

        let Some(config_id) = config_id else {
            return Ok(None);
        };
        let config = self
            .find_resource_config_by_id(config_id)?
            .ok_or(StoreError::ResourceConfigNotFound(config_id))?;
        Ok(Some(ResourceConfigScope::new(
            Arc::clone(&self.db),
            id,
            config,
            self.locks.clone(),
        )))
    }
}
