use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::config::DB_BUSY_TIMEOUT_MS;
use crate::error::StoreError;

/// Schema migrations
/// Each version contains a list of SQL statements to execute
const MIGRATIONS: &[&[&str]] = &[
    // v1: error message for errored checks
    &["ALTER TABLE checks ADD COLUMN check_error TEXT"],
    // v2: manual triggers bypass the check interval
    &["ALTER TABLE checks ADD COLUMN manually_triggered INTEGER NOT NULL DEFAULT 0"],
];

/// Shared handle to the scheduler database.
///
/// Every process that takes part in scheduling opens its own `Database` on
/// the same file. Writes that must be atomic across processes go through
/// [`Database::immediate`].
pub struct Database {
    conn: Mutex<Connection>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Database")
    }
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        info!("Initializing database at {:?}", db_path);

        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(DB_BUSY_TIMEOUT_MS))?;

        debug!("Database connection established");

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.create_schema()?;
        info!("Database initialized successfully");

        Ok(db)
    }

    /// Acquire database connection lock with proper error handling
    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so no other connection to the same
    /// file can interleave between the reads and writes `f` performs.
    pub(crate) fn immediate<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Get current timestamp in milliseconds since UNIX epoch
    pub(crate) fn current_timestamp_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// `duration` in milliseconds, saturating at `i64::MAX`
    pub(crate) fn duration_ms(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        debug!("Creating database schema");

        let conn = self.lock_conn()?;

        // Create base tables (without migration columns)
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS resource_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                digest TEXT NOT NULL UNIQUE,
                base_type TEXT NOT NULL,
                source TEXT NOT NULL,
                default_space TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS resource_config_scopes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_config_id INTEGER NOT NULL,
                team_name TEXT NOT NULL DEFAULT '',
                pipeline_name TEXT NOT NULL DEFAULT '',
                resource_name TEXT NOT NULL DEFAULT '',
                last_checked INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (resource_config_id) REFERENCES resource_configs(id) ON DELETE CASCADE,
                UNIQUE(resource_config_id, team_name, pipeline_name, resource_name)
            );

            CREATE TABLE IF NOT EXISTS spaces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_config_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                latest_resource_version_id INTEGER,
                FOREIGN KEY (resource_config_id) REFERENCES resource_configs(id) ON DELETE CASCADE,
                UNIQUE(resource_config_id, name)
            );

            CREATE TABLE IF NOT EXISTS resource_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                space_id INTEGER NOT NULL,
                version TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '[]',
                check_order INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (space_id) REFERENCES spaces(id) ON DELETE CASCADE,
                UNIQUE(space_id, version)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_versions_check_order
                ON resource_versions(space_id, check_order) WHERE check_order > 0;

            CREATE TABLE IF NOT EXISTS checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_config_scope_id INTEGER NOT NULL,
                team_name TEXT NOT NULL,
                pipeline_name TEXT NOT NULL,
                status TEXT NOT NULL,
                span_context TEXT,
                create_time INTEGER NOT NULL,
                start_time INTEGER,
                end_time INTEGER,
                FOREIGN KEY (resource_config_scope_id) REFERENCES resource_config_scopes(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_checks_status ON checks(status);

            CREATE TABLE IF NOT EXISTS lock_leases (
                lock_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            "#,
        )?;

        // Apply migrations
        Self::apply_migrations(&conn)?;

        debug!("Database schema created successfully");
        Ok(())
    }

    /// Apply pending migrations based on user_version pragma
    fn apply_migrations(conn: &Connection) -> Result<(), StoreError> {
        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        for (i, statements) in MIGRATIONS.iter().enumerate() {
            let version = (i + 1) as i32;
            if version > current_version {
                for sql in *statements {
                    // Another process may have applied the same migration
                    // between our user_version read and this statement
                    match conn.execute(sql, []) {
                        Ok(_) => {}
                        Err(rusqlite::Error::SqliteFailure(_, Some(ref msg)))
                            if msg.contains("duplicate column name") =>
                        {
                            debug!("Column already exists, skipping: {}", sql);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                debug!("Applied migration v{}", version);
            }
        }

        let target_version = MIGRATIONS.len() as i32;
        if target_version > current_version {
            conn.pragma_update(None, "user_version", target_version)?;
            debug!("Updated schema version to v{}", target_version);
        }

        Ok(())
    }
}
