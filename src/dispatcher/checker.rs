//! Fan-out of started checks into concurrently running units

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span};

use crate::db::check::CheckFactory;
use crate::dispatcher::running::RunningChecks;
use crate::engine::Engine;
use crate::error::StoreError;
use crate::metrics::Metrics;

/// Launches every started check that is not already running in this process
pub struct Checker<F, E, M> {
    check_factory: Arc<F>,
    engine: Arc<E>,
    metrics: Arc<M>,
    running: Arc<RunningChecks>,
}

impl<F, E, M> Checker<F, E, M>
where
    F: CheckFactory,
    E: Engine,
    M: Metrics,
{
    pub fn new(check_factory: Arc<F>, engine: Arc<E>, metrics: Arc<M>) -> Self {
        Self {
            check_factory,
            engine,
            metrics,
            running: Arc::new(RunningChecks::new()),
        }
    }

    /// Share an in-flight set with other checkers
    pub fn with_running_checks(mut self, running: Arc<RunningChecks>) -> Self {
        self.running = running;
        self
    }

    pub fn running_checks(&self) -> &Arc<RunningChecks> {
        &self.running
    }

    /// Run one dispatch cycle.
    ///
    /// Returns as soon as every unit is spawned. Each unit gets a child of
    /// `cancel`. Must be called from within a tokio runtime.
    pub fn run(&self, cancel: &CancellationToken) -> Result<Vec<JoinHandle<()>>, StoreError> {
        let checks = self
            .check_factory
            .started_checks()
            .inspect_err(|e| error!("Failed to list started checks: {}", e))?;

        self.metrics.set_checks_queue_size(checks.len());

        let mut handles = Vec::with_capacity(checks.len());
        for check in checks {
            let Some(guard) = self.running.try_claim(check.id) else {
                debug!("Check {} is already running", check.id);
                continue;
            };

            // The check may outlive the cycle that launched it
            let span = info_span!(
                parent: None,
                "check",
                check_id = check.id,
                team = %check.team_name,
                pipeline = %check.pipeline_name,
                resource_config_scope_id = check.resource_config_scope_id,
                follows_from = check.span_context.as_deref().unwrap_or_default(),
            );
            span.follows_from(&Span::current());

            let runnable = self.engine.new_check(check);
            let cancel = cancel.child_token();
            handles.push(tokio::spawn(
                async move {
                    let _guard = guard;
                    runnable.run(cancel).await;
                }
                .instrument(span),
            ));
        }

        Ok(handles)
    }
}

/// Drive `checker` every `interval` until `shutdown` is cancelled, then wait
/// for the checks it launched to wind down.
///
/// A failed cycle is logged and retried on the next tick.
pub async fn run_periodically<F, E, M>(
    checker: &Checker<F, E, M>,
    interval: Duration,
    shutdown: CancellationToken,
) where
    F: CheckFactory,
    E: Engine,
    M: Metrics,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

    info!("Dispatching checks every {:?}", interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                in_flight.retain(|handle| !handle.is_finished());
                match checker.run(&shutdown) {
                    Ok(handles) => in_flight.extend(handles),
                    Err(e) => error!("Dispatch cycle failed: {}", e),
                }
            }
        }
    }

    info!("Stopping dispatcher, waiting for {} checks", in_flight.len());
    for result in join_all(in_flight).await {
        if let Err(e) = result {
            error!("Check task failed: {}", e);
        }
    }
}
