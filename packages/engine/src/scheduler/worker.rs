//! Scheduler worker - the poller/dispatcher loop.
//!
//! Per tick the worker claims a batch of due endpoints, executes each one,
//! records the run, re-reads the endpoint to pick up hints written during
//! execution, plans the next fire, and writes the result back. Multiple
//! worker processes are safe: the claim is the serialization point.
//!
//! ```text
//! SchedulerWorker
//!     │
//!     ├─► claim_due (FOR UPDATE SKIP LOCKED batch)
//!     ├─► per endpoint (concurrent within the batch):
//!     │       read → create run → dispatch → finish run
//!     │       → re-read → plan_next_run → past-time guard
//!     │       → update_after_run (releases lock)
//!     └─► sleep tick_interval when idle
//! ```
//!
//! The zombie sweeper runs as its own service on a separate cadence and
//! cancels runs stuck in `running` beyond the threshold.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use super::endpoint::DEFAULT_BASELINE_INTERVAL_MS;
use super::planner::plan_next_run;
use super::run::{RunSource, RunStatus};
use super::store::{AfterRun, EndpointStore, FailurePolicy, NewRun, RunOutcome, RunStore};
use crate::kernel::traits::{Clock, Cron};

/// Configuration for the scheduler worker.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker ID for this instance
    pub worker_id: String,
    /// Maximum number of endpoints to claim at once
    pub batch_size: i64,
    /// Lock lease for claims when the endpoint has no execution-time cap
    pub lock_ttl_ms: i64,
    /// How long to wait when no endpoints are due
    pub tick_interval_ms: i64,
    /// Response-body storage cap when the endpoint has none
    pub default_max_response_size_kb: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("scheduler-{}", Uuid::new_v4()),
            batch_size: 10,
            lock_ttl_ms: 60_000,
            tick_interval_ms: 1_000,
            default_max_response_size_kb: 100,
        }
    }
}

impl SchedulerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// The scheduling loop. One instance per process; scale out by running
/// more processes.
pub struct SchedulerWorker {
    endpoints: Arc<dyn EndpointStore>,
    runs: Arc<dyn RunStore>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    cron: Arc<dyn Cron>,
    config: SchedulerConfig,
}

impl SchedulerWorker {
    pub fn new(
        endpoints: Arc<dyn EndpointStore>,
        runs: Arc<dyn RunStore>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        cron: Arc<dyn Cron>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            endpoints,
            runs,
            dispatcher,
            clock,
            cron,
            config,
        }
    }

    /// Run until the token is cancelled. In-flight endpoint handling
    /// drains before this returns.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            tick_interval_ms = self.config.tick_interval_ms,
            "scheduler worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.tick().await {
                Ok(0) => {
                    // Idle: wait out the tick interval.
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self
                            .clock
                            .sleep(Duration::from_millis(self.config.tick_interval_ms.max(1) as u64)) => {}
                    }
                }
                // Work was done; claim again immediately so a backlog drains
                // at the pool's pace rather than the tick cadence.
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "tick failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.clock.sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "scheduler worker stopped");
    }

    /// One scheduling cycle: claim a batch and handle every claimed
    /// endpoint. Returns how many endpoints were claimed.
    pub async fn tick(&self) -> anyhow::Result<usize> {
        let claimed = self
            .endpoints
            .claim_due(
                &self.config.worker_id,
                self.config.batch_size,
                self.config.lock_ttl_ms,
            )
            .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        debug!(count = claimed.len(), "claimed endpoints");

        // Concurrent within the batch; batch_size bounds in-flight work.
        let count = claimed.len();
        let handles = claimed.into_iter().map(|id| self.handle_endpoint(id));
        futures::future::join_all(handles).await;

        Ok(count)
    }

    /// Execute one claimed endpoint. Never propagates an error: every
    /// failure is either recorded on the run or logged, and the lock is
    /// left to expire when the write-back itself fails.
    async fn handle_endpoint(&self, id: Uuid) {
        let ep = match self.endpoints.get(id).await {
            Ok(Some(ep)) => ep,
            Ok(None) => {
                warn!(endpoint_id = %id, "claimed endpoint vanished");
                return;
            }
            Err(e) => {
                error!(endpoint_id = %id, error = %e, "failed to read endpoint");
                return;
            }
        };

        let now_before = self.clock.now();

        let run_id = match self
            .runs
            .create(NewRun {
                endpoint_id: id,
                attempt: ep.failure_count + 1,
                source: RunSource::Scheduler,
            })
            .await
        {
            Ok(run_id) => run_id,
            Err(e) => {
                error!(endpoint_id = %id, error = %e, "failed to create run");
                return;
            }
        };

        let result = self.dispatcher.execute(&ep).await;

        debug!(
            endpoint_id = %id,
            run_id = %run_id,
            status = ?result.status,
            status_code = ?result.status_code,
            duration_ms = result.duration_ms,
            "dispatch finished"
        );

        let max_kb = ep
            .max_response_size_kb
            .unwrap_or(self.config.default_max_response_size_kb);
        if let Err(e) = self
            .runs
            .finish(
                run_id,
                RunOutcome {
                    status: result.status,
                    duration_ms: result.duration_ms,
                    status_code: result.status_code,
                    response_body: result.response_body.clone(),
                    error_message: result.error_message.clone(),
                    max_response_size_kb: max_kb,
                },
            )
            .await
        {
            error!(run_id = %run_id, error = %e, "failed to finish run");
        }

        let now_after = self.clock.now();

        // Re-read: the AI planner may have written hints mid-execution.
        let fresh = match self.endpoints.get(id).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => {
                warn!(endpoint_id = %id, "endpoint archived during execution");
                return;
            }
            Err(e) => {
                // Leave the lock to expire; the endpoint becomes claimable
                // again after the lease.
                error!(endpoint_id = %id, error = %e, "failed to re-read endpoint");
                return;
            }
        };

        let mut next_run_at = match plan_next_run(now_before, &fresh, self.cron.as_ref()) {
            Ok(plan) => {
                debug!(
                    endpoint_id = %id,
                    next_run_at = %plan.next_run_at,
                    source = %plan.source,
                    "planned next run"
                );
                plan.next_run_at
            }
            Err(e) => {
                error!(endpoint_id = %id, error = %e, "planning failed, applying fallback interval");
                now_after + chrono::Duration::milliseconds(DEFAULT_BASELINE_INTERVAL_MS)
            }
        };

        // Past-time guard: a slow execution can outrun its own interval.
        // Shift forward by the computed interval (not re-clamped) so the
        // endpoint is not immediately re-claimed.
        if next_run_at < now_after {
            let intended = (next_run_at - now_before).max(chrono::Duration::seconds(1));
            next_run_at = now_after + intended;
        }

        let failure_policy = if result.status == RunStatus::Success {
            FailurePolicy::Reset
        } else {
            FailurePolicy::Increment
        };

        if let Err(e) = self
            .endpoints
            .update_after_run(
                id,
                AfterRun {
                    last_run_at: now_before,
                    next_run_at,
                    failure_policy,
                    clear_expired_hints: true,
                },
            )
            .await
        {
            error!(endpoint_id = %id, error = %e, "failed to update endpoint after run");
        }
    }
}

// =============================================================================
// Zombie sweeper
// =============================================================================

#[derive(Debug, Clone)]
pub struct ZombieSweeperConfig {
    /// Age at which a `running` run is considered orphaned. Must exceed
    /// the largest configured execution-time cap.
    pub zombie_threshold_ms: i64,
    /// Sweep cadence.
    pub sweep_interval_ms: i64,
}

impl Default for ZombieSweeperConfig {
    fn default() -> Self {
        Self {
            zombie_threshold_ms: 300_000,
            sweep_interval_ms: 150_000,
        }
    }
}

impl ZombieSweeperConfig {
    /// Derive a config from the threshold, sweeping at half the threshold
    /// with a 30s floor.
    pub fn from_threshold(zombie_threshold_ms: i64) -> Self {
        Self {
            zombie_threshold_ms,
            sweep_interval_ms: (zombie_threshold_ms / 2).max(30_000),
        }
    }
}

/// Cancels runs stuck in `running` past the threshold. A crashed worker
/// leaves such runs behind; its endpoint lock expires separately.
pub struct ZombieSweeper {
    runs: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    config: ZombieSweeperConfig,
}

impl ZombieSweeper {
    pub fn new(runs: Arc<dyn RunStore>, clock: Arc<dyn Clock>, config: ZombieSweeperConfig) -> Self {
        Self {
            runs,
            clock,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            zombie_threshold_ms = self.config.zombie_threshold_ms,
            sweep_interval_ms = self.config.sweep_interval_ms,
            "zombie sweeper starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self
                    .clock
                    .sleep(Duration::from_millis(self.config.sweep_interval_ms.max(1) as u64)) => {}
            }

            match self.runs.cleanup_zombies(self.config.zombie_threshold_ms).await {
                Ok(0) => {}
                Ok(count) => info!(count = count, "canceled zombie runs"),
                Err(e) => error!(error = %e, "zombie sweep failed"),
            }
        }

        info!("zombie sweeper stopped");
    }
}
