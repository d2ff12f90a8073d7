//! Check jobs and the query the dispatcher pulls them from

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::db::database::Database;
use crate::db::resource_config_scope::ResourceConfigScope;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Created,
    Started,
    Running,
    Succeeded,
    Errored,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Created => "created",
            CheckStatus::Started => "started",
            CheckStatus::Running => "running",
            CheckStatus::Succeeded => "succeeded",
            CheckStatus::Errored => "errored",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, CheckStatus::Succeeded | CheckStatus::Errored)
    }

    /// Statuses a check may move to from `self`. A check may error out of
    /// any unfinished state.
    fn can_become(&self, next: CheckStatus) -> bool {
        match (self, next) {
            (CheckStatus::Created, CheckStatus::Started) => true,
            (CheckStatus::Started, CheckStatus::Running) => true,
            (CheckStatus::Running, CheckStatus::Succeeded) => true,
            (from, CheckStatus::Errored) => !from.is_finished(),
            _ => false,
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(CheckStatus::Created),
            "started" => Ok(CheckStatus::Started),
            "running" => Ok(CheckStatus::Running),
            "succeeded" => Ok(CheckStatus::Succeeded),
            "errored" => Ok(CheckStatus::Errored),
            other => Err(format!("unknown check status: {other}")),
        }
    }
}

/// One scheduled or running check of a resource config scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub id: i64,
    pub resource_config_scope_id: i64,
    pub team_name: String,
    pub pipeline_name: String,
    pub status: CheckStatus,
    /// Skip the check interval; set for user-requested checks
    pub manually_triggered: bool,
    /// Trace context of the request that created the check
    pub span_context: Option<String>,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub check_error: Option<String>,
}

/// Source of runnable check jobs
#[cfg_attr(test, automock)]
pub trait CheckFactory: Send + Sync + 'static {
    /// All checks currently in `started` status, oldest first
    fn started_checks(&self) -> Result<Vec<Check>, StoreError>;
}

/// Parameters for a new check
#[derive(Debug, Clone, Default)]
pub struct NewCheck {
    pub team_name: String,
    pub pipeline_name: String,
    pub manually_triggered: bool,
    pub span_context: Option<String>,
}

const CHECK_COLUMNS: &str = "id, resource_config_scope_id, team_name, pipeline_name, status, \
     manually_triggered, span_context, create_time, start_time, end_time, check_error";

#[derive(Debug, Clone)]
pub struct SqliteCheckFactory {
    db: Arc<Database>,
}

impl SqliteCheckFactory {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Parse the stored status found in column `column`
    fn parse_status(column: usize, raw: &str) -> Result<CheckStatus, rusqlite::Error> {
        raw.parse::<CheckStatus>().map_err(|msg| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                msg.into(),
            )
        })
    }

    fn read_check(row: &Row<'_>) -> Result<Check, StoreError> {
        let status: String = row.get(4)?;
        let status = Self::parse_status(4, &status)?;

        Ok(Check {
            id: row.get(0)?,
            resource_config_scope_id: row.get(1)?,
            team_name: row.get(2)?,
            pipeline_name: row.get(3)?,
            status,
            manually_triggered: row.get(5)?,
            span_context: row.get(6)?,
            create_time: to_datetime(row.get(7)?).unwrap_or_default(),
            start_time: row.get::<_, Option<i64>>(8)?.and_then(to_datetime),
            end_time: row.get::<_, Option<i64>>(9)?.and_then(to_datetime),
            check_error: row.get(10)?,
        })
    }

    /// Create a check for `scope` in `created` status
    pub fn create_check(
        &self,
        scope: &ResourceConfigScope,
        new_check: &NewCheck,
    ) -> Result<Check, StoreError> {
        let now = Database::current_timestamp_ms();
        let id = {
            let conn = self.db.lock_conn()?;
            conn.execute(
                r#"
                INSERT INTO checks (resource_config_scope_id, team_name, pipeline_name, status,
                                    manually_triggered, span_context, create_time)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                (
                    scope.id(),
                    &new_check.team_name,
                    &new_check.pipeline_name,
                    CheckStatus::Created.as_str(),
                    new_check.manually_triggered,
                    &new_check.span_context,
                    now,
                ),
            )?;
            conn.last_insert_rowid()
        };

        debug!("Created check {} for scope {}", id, scope.id());
        self.find_check(id)?.ok_or(StoreError::CheckNotFound(id))
    }

    pub fn find_check(&self, id: i64) -> Result<Option<Check>, StoreError> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {CHECK_COLUMNS} FROM checks WHERE id = ?1"))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::read_check(row)?)),
            None => Ok(None),
        }
    }

    /// Make the check visible to dispatchers
    pub fn start_check(&self, id: i64) -> Result<(), StoreError> {
        self.transition(id, CheckStatus::Started, None)
    }

    /// Claimed by an engine
    pub fn mark_running(&self, id: i64) -> Result<(), StoreError> {
        self.transition(id, CheckStatus::Running, None)
    }

    pub fn finish_check(&self, id: i64, outcome: Result<(), String>) -> Result<(), StoreError> {
        match outcome {
            Ok(()) => self.transition(id, CheckStatus::Succeeded, None),
            Err(message) => self.transition(id, CheckStatus::Errored, Some(message)),
        }
    }

    fn transition(
        &self,
        id: i64,
        next: CheckStatus,
        check_error: Option<String>,
    ) -> Result<(), StoreError> {
        let now = Database::current_timestamp_ms();
        self.db.immediate(|tx| {
            let current: String = tx
                .query_row("SELECT status FROM checks WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?
                .ok_or(StoreError::CheckNotFound(id))?;
            let current = Self::parse_status(0, &current)?;

            if !current.can_become(next) {
                return Err(StoreError::InvalidCheckTransition {
                    id,
                    from: current,
                    to: next,
                });
            }

            tx.execute(
                r#"
                UPDATE checks SET
                    status = ?1,
                    start_time = CASE WHEN ?1 = 'started' THEN ?2 ELSE start_time END,
                    end_time = CASE WHEN ?1 IN ('succeeded', 'errored') THEN ?2 ELSE end_time END,
                    check_error = COALESCE(?3, check_error)
                WHERE id = ?4
                "#,
                (next.as_str(), now, &check_error, id),
            )?;
            Ok(())
        })?;

        debug!("Check {} is now {}", id, next);
        Ok(())
    }
}

impl CheckFactory for SqliteCheckFactory {
    fn started_checks(&self) -> Result<Vec<Check>, StoreError> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECK_COLUMNS} FROM checks WHERE status = 'started' ORDER BY id"
        ))?;

        let mut rows = stmt.query([])?;
        let mut checks = Vec::new();
        while let Some(row) = rows.next()? {
            checks.push(Self::read_check(row)?);
        }
        Ok(checks)
    }
}

fn to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::resource_config::ResourceConfigFactory;
    use rstest::rstest;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_factory() -> (TempDir, SqliteCheckFactory, ResourceConfigScope) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&temp_dir.path().join("test.db")).unwrap());
        let configs = ResourceConfigFactory::new(Arc::clone(&db));
        let config = configs
            .find_or_create_resource_config("git", &json!({"uri": "https://example.com/repo"}), &[])
            .unwrap();
        let scope = configs.find_or_create_scope(&config, None).unwrap();
        (temp_dir, SqliteCheckFactory::new(db), scope)
    }

    fn new_check() -> NewCheck {
        NewCheck {
            team_name: "main".to_string(),
            pipeline_name: "some-pipeline".to_string(),
            manually_triggered: false,
            span_context: Some("00-trace-span-01".to_string()),
        }
    }

    #[test]
    fn create_check_starts_in_created_status() {
        let (_temp_dir, factory, scope) = create_test_factory();

        let check = factory.create_check(&scope, &new_check()).unwrap();

        assert_eq!(check.status, CheckStatus::Created);
        assert_eq!(check.resource_config_scope_id, scope.id());
        assert_eq!(check.team_name, "main");
        assert_eq!(check.span_context.as_deref(), Some("00-trace-span-01"));
        assert_eq!(check.start_time, None);
    }

    #[test]
    fn started_checks_lists_only_started_checks_in_creation_order() {
        let (_temp_dir, factory, scope) = create_test_factory();
        let created = factory.create_check(&scope, &new_check()).unwrap();
        let first = factory.create_check(&scope, &new_check()).unwrap();
        let second = factory.create_check(&scope, &new_check()).unwrap();
        let running = factory.create_check(&scope, &new_check()).unwrap();

        factory.start_check(first.id).unwrap();
        factory.start_check(second.id).unwrap();
        factory.start_check(running.id).unwrap();
        factory.mark_running(running.id).unwrap();

        let ids: Vec<_> = factory
            .started_checks()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(!ids.contains(&created.id));
    }

    #[test]
    fn finish_check_records_outcome() {
        let (_temp_dir, factory, scope) = create_test_factory();
        let ok = factory.create_check(&scope, &new_check()).unwrap();
        let failed = factory.create_check(&scope, &new_check()).unwrap();
        for id in [ok.id, failed.id] {
            factory.start_check(id).unwrap();
            factory.mark_running(id).unwrap();
        }

        factory.finish_check(ok.id, Ok(())).unwrap();
        factory
            .finish_check(failed.id, Err("exit status 1".to_string()))
            .unwrap();

        let ok = factory.find_check(ok.id).unwrap().unwrap();
        assert_eq!(ok.status, CheckStatus::Succeeded);
        assert!(ok.start_time.is_some());
        assert!(ok.end_time.is_some());
        assert_eq!(ok.check_error, None);

        let failed = factory.find_check(failed.id).unwrap().unwrap();
        assert_eq!(failed.status, CheckStatus::Errored);
        assert_eq!(failed.check_error.as_deref(), Some("exit status 1"));
    }

    #[test]
    fn finished_check_cannot_be_restarted() {
        let (_temp_dir, factory, scope) = create_test_factory();
        let check = factory.create_check(&scope, &new_check()).unwrap();
        factory.start_check(check.id).unwrap();
        factory.finish_check(check.id, Err("interrupted".to_string())).unwrap();

        let err = factory.mark_running(check.id).unwrap_err();

        assert!(matches!(
            err,
            StoreError::InvalidCheckTransition {
                from: CheckStatus::Errored,
                to: CheckStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn transition_of_unknown_check_fails() {
        let (_temp_dir, factory, _scope) = create_test_factory();
        let err = factory.start_check(42).unwrap_err();
        assert!(matches!(err, StoreError::CheckNotFound(42)));
    }

    #[test]
    fn unreadable_status_is_an_error_not_a_transition() {
        let (_temp_dir, factory, scope) = create_test_factory();
        let check = factory.create_check(&scope, &new_check()).unwrap();
        factory
            .db
            .lock_conn()
            .unwrap()
            .execute("UPDATE checks SET status = 'bogus' WHERE id = ?1", [check.id])
            .unwrap();

        let err = factory.start_check(check.id).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Database(rusqlite::Error::FromSqlConversionFailure(..))
        ));
        let err = factory.finish_check(check.id, Ok(())).unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        assert!(factory.find_check(check.id).is_err());

        let status: String = factory
            .db
            .lock_conn()
            .unwrap()
            .query_row("SELECT status FROM checks WHERE id = ?1", [check.id], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(status, "bogus");
    }

    #[rstest]
    #[case(CheckStatus::Created, CheckStatus::Started, true)]
    #[case(CheckStatus::Started, CheckStatus::Running, true)]
    #[case(CheckStatus::Running, CheckStatus::Succeeded, true)]
    #[case(CheckStatus::Started, CheckStatus::Errored, true)]
    #[case(CheckStatus::Created, CheckStatus::Running, false)]
    #[case(CheckStatus::Started, CheckStatus::Succeeded, false)]
    #[case(CheckStatus::Succeeded, CheckStatus::Errored, false)]
    #[case(CheckStatus::Running, CheckStatus::Started, false)]
    fn can_become_follows_the_lifecycle(
        #[case] from: CheckStatus,
        #[case] to: CheckStatus,
        #[case] expected: bool,
    ) {
        assert_eq!(from.can_become(to), expected);
    }

    #[rstest]
    #[case("created", CheckStatus::Created)]
    #[case("running", CheckStatus::Running)]
    #[case("errored", CheckStatus::Errored)]
    fn check_status_parses_stored_values(#[case] raw: &str, #[case] expected: CheckStatus) {
        assert_eq!(raw.parse::<CheckStatus>().unwrap(), expected);
        assert_eq!(expected.as_str(), raw);
    }
}
