//! Store traits for endpoints and runs.
//!
//! The scheduler and the AI planner talk to persistence exclusively through
//! these traits. Production uses the Postgres adapters; tests use the
//! in-memory adapters with a fake clock.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::endpoint::Endpoint;
use super::run::{Run, RunSource, RunStatus};

/// What happens to `failure_count` in the post-run update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Successful run: the streak ends.
    Reset,
    /// Failed run: the streak grows.
    Increment,
}

/// Post-run write-back. Applied in a single statement: runtime state,
/// failure counter, expired-hint cleanup, and lock release are never
/// partially visible.
#[derive(Debug, Clone)]
pub struct AfterRun {
    pub last_run_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub failure_policy: FailurePolicy,
    /// Null out hint fields whose expiry is at or before `last_run_at`
    /// (the body hint is checked against its own expiry).
    pub clear_expired_hints: bool,
}

/// Persistence port for endpoints.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// Atomically claim up to `batch_size` due endpoints for `worker_id`.
    ///
    /// A row is due when it is not archived, `next_run_at <= now`, and its
    /// lock is absent or expired. Claiming sets `locked_by` and a lease of
    /// the endpoint's `max_execution_time_ms` (falling back to
    /// `lock_ttl_ms`). Race-free across concurrent workers.
    async fn claim_due(
        &self,
        worker_id: &str,
        batch_size: i64,
        lock_ttl_ms: i64,
    ) -> Result<Vec<Uuid>>;

    /// Fresh read. The scheduler calls this twice per cycle: before
    /// dispatch and again after, to observe hints written mid-execution.
    async fn get(&self, id: Uuid) -> Result<Option<Endpoint>>;

    async fn insert(&self, endpoint: &Endpoint) -> Result<()>;

    /// Record the outcome of a run and release the claim lock.
    async fn update_after_run(&self, id: Uuid, update: AfterRun) -> Result<()>;

    // ---- Hint writers (AI planner side channel) ----
    //
    // Hint writers touch hint fields only; they never move `next_run_at`,
    // the lock fields, or the failure counter (except `reset_failures`).
    // The next planning cycle folds them in.

    /// Replace the scheduling hint with an interval proposal.
    async fn apply_interval_hint(
        &self,
        id: Uuid,
        interval_ms: i64,
        reason: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Replace the scheduling hint with a one-shot fire time.
    async fn schedule_one_shot(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Pause the endpoint until an absolute time.
    async fn pause_until(&self, id: Uuid, at: DateTime<Utc>, reason: &str) -> Result<()>;

    /// Drop every hint, including a pending pause and body hint.
    async fn clear_hints(&self, id: Uuid) -> Result<()>;

    /// Zero the failure counter.
    async fn reset_failures(&self, id: Uuid) -> Result<()>;

    /// Soft-delete; archived rows are excluded from claims.
    async fn archive(&self, id: Uuid) -> Result<()>;

    // ---- AI planner eligibility ----

    /// Endpoints worth analyzing: failure streak at `min_failures` or
    /// beyond, never analyzed, or analyzed longer than
    /// `reanalyze_after_ms` ago. Oldest analysis first.
    async fn find_due_for_analysis(
        &self,
        limit: i64,
        min_failures: i32,
        reanalyze_after_ms: i64,
    ) -> Result<Vec<Endpoint>>;

    async fn mark_analyzed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

/// Parameters for opening a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub endpoint_id: Uuid,
    pub attempt: i32,
    pub source: RunSource,
}

/// Terminal outcome of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub duration_ms: i64,
    pub status_code: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    /// Storage cap for the body; applied again here even though the
    /// dispatcher already truncates at capture time.
    pub max_response_size_kb: i64,
}

/// Persistence port for runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Open a run in `running` status. Returns the run id.
    async fn create(&self, run: NewRun) -> Result<Uuid>;

    /// Close a run. Idempotent: a second finish of the same run is a no-op
    /// (only rows still in `running` transition).
    async fn finish(&self, run_id: Uuid, outcome: RunOutcome) -> Result<()>;

    /// Cancel `running` rows older than the threshold. Returns how many
    /// were reaped.
    async fn cleanup_zombies(&self, older_than_ms: i64) -> Result<u64>;

    /// Most recent runs for an endpoint, newest first.
    async fn recent_for_endpoint(&self, endpoint_id: Uuid, limit: i64) -> Result<Vec<Run>>;
}
