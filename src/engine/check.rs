//! Stock check engine: query a resource and record its versions

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::SchedulerConfig;
use crate::db::check::{Check, SqliteCheckFactory};
use crate::db::database::Database;
use crate::db::lock::{LeaseLock, Lock};
use crate::db::resource_config::{ResourceConfig, ResourceConfigFactory, ResourceVersion};
use crate::db::types::{Space, SpaceVersion, Version};
use crate::engine::{Engine, Runnable};
use crate::error::{EngineError, ResourceError, StoreError};

/// Bounds on the interval between two lease renewals
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);
const MAX_RENEW_INTERVAL: Duration = Duration::from_secs(60);

/// What a resource reported for one check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub spaces: Vec<Space>,
    pub default_space: Option<Space>,
    /// Versions in the order the resource reported them
    pub versions: Vec<SpaceVersion>,
}

/// An external versioned artifact source
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    /// Report the versions available since `from`, the current latest
    /// version of each space.
    async fn check(
        &self,
        source: &serde_json::Value,
        from: &[ResourceVersion],
    ) -> Result<CheckResponse, ResourceError>;
}

pub struct CheckEngine<R: Resource> {
    checks: SqliteCheckFactory,
    configs: ResourceConfigFactory,
    resource: Arc<R>,
    interval: Duration,
}

impl<R: Resource> CheckEngine<R> {
    /// `interval` is the minimum time between two checks of one scope.
    /// Manually triggered checks ignore it.
    pub fn new(
        checks: SqliteCheckFactory,
        configs: ResourceConfigFactory,
        resource: Arc<R>,
        interval: Duration,
    ) -> Self {
        Self {
            checks,
            configs,
            resource,
            interval,
        }
    }

    /// Build an engine over `db` with the check settings from `config`
    pub fn from_config(db: Arc<Database>, config: &SchedulerConfig, resource: Arc<R>) -> Self {
        Self::new(
            SqliteCheckFactory::new(Arc::clone(&db)),
            ResourceConfigFactory::new(db).with_lease_ttl(config.lock_lease_ttl()),
            resource,
            config.check_interval(),
        )
    }
}

impl<R: Resource> Engine for CheckEngine<R> {
    fn new_check(&self, check: Check) -> Box<dyn Runnable> {
        Box::new(CheckRun {
            check,
            checks: self.checks.clone(),
            configs: self.configs.clone(),
            resource: Arc::clone(&self.resource),
            interval: self.interval,
        })
    }
}

struct CheckRun<R: Resource> {
    check: Check,
    checks: SqliteCheckFactory,
    configs: ResourceConfigFactory,
    resource: Arc<R>,
    interval: Duration,
}

#[async_trait]
impl<R: Resource> Runnable for CheckRun<R> {
    async fn run(self: Box<Self>, cancel: CancellationToken) {
        let id = self.check.id;

        // Several processes may list the same started check; only one claims it
        match self.checks.mark_running(id) {
            Ok(()) => {}
            Err(StoreError::InvalidCheckTransition { from, .. }) => {
                debug!("Check {} is already {}, skipping", id, from);
                return;
            }
            Err(e) => {
                error!("Failed to claim check {}: {}", id, e);
                return;
            }
        }

        let outcome = match self.execute(&cancel).await {
            Ok(true) => {
                info!("Check {} finished", id);
                Ok(())
            }
            Ok(false) => {
                debug!(
                    "Scope {} is locked or was checked recently, skipping check {}",
                    self.check.resource_config_scope_id, id
                );
                Ok(())
            }
            Err(EngineError::Interrupted) => {
                info!("Check {} interrupted", id);
                Err(EngineError::Interrupted.to_string())
            }
            Err(e) => {
                error!("Check {} failed: {}", id, e);
                Err(e.to_string())
            }
        };

        if let Err(e) = self.checks.finish_check(id, outcome) {
            error!("Failed to record result of check {}: {}", id, e);
        }
    }
}

impl<R: Resource> CheckRun<R> {
    /// Returns false when the scope was not due or someone else is checking it
    async fn execute(&self, cancel: &CancellationToken) -> Result<bool, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Interrupted);
        }

        let scope_id = self.check.resource_config_scope_id;
        let scope = self
            .configs
            .find_scope_by_id(scope_id)?
            .ok_or(StoreError::ResourceConfigScopeNotFound(scope_id))?;

        let interval = if self.check.manually_triggered {
            Duration::ZERO
        } else {
            self.interval
        };
        let Some(lock) = scope.acquire_resource_checking_lock(interval)? else {
            return Ok(false);
        };

        let config = scope.resource_config();
        let from = config.latest_versions()?;
        let response = self.query(config, &from, &lock, cancel).await?;
        save_response(config, &response)?;

        lock.release()?;
        Ok(true)
    }

    /// Query the resource, keeping the checking lock alive until it answers
    async fn query(
        &self,
        config: &ResourceConfig,
        from: &[ResourceVersion],
        lock: &LeaseLock,
        cancel: &CancellationToken,
    ) -> Result<CheckResponse, EngineError> {
        let mut response = self.resource.check(config.source(), from);
        let renew_every = (lock.lease_ttl() / 2).clamp(MIN_RENEW_INTERVAL, MAX_RENEW_INTERVAL);
        let mut heartbeat = tokio::time::interval(renew_every);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Interrupted),
                result = &mut response => return Ok(result?),
                _ = heartbeat.tick() => {
                    if !lock.renew()? {
                        return Err(EngineError::LockLost);
                    }
                }
            }
        }
    }
}

/// Persist a check response as one batch and move each reported space's
/// latest pointer to the last version reported for it.
///
/// On failure nothing stays buffered on `config`.
fn save_response(config: &ResourceConfig, response: &CheckResponse) -> Result<(), StoreError> {
    let saved = save_versions(config, response);
    if saved.is_err() {
        if let Err(e) = config.discard_pending_versions() {
            warn!("Failed to discard unsaved versions of resource config {}: {}", config.id(), e);
        }
    }
    saved
}

fn save_versions(config: &ResourceConfig, response: &CheckResponse) -> Result<(), StoreError> {
    for space in &response.spaces {
        config.save_space(space)?;
    }
    if let Some(default_space) = &response.default_space {
        config.save_default_space(default_space)?;
    }

    let mut latest: BTreeMap<&Space, &Version> = BTreeMap::new();
    for saved in &response.versions {
        config.save_partial_version(&saved.space, &saved.version, &saved.metadata)?;
        latest.insert(&saved.space, &saved.version);
    }
    config.finish_saving_versions()?;

    for (space, version) in latest {
        config.save_space_latest_version(space, version)?;
    }
    Ok(())
}
