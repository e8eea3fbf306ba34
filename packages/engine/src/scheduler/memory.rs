//! In-memory store implementations.
//!
//! Behavior-equivalent adapters for tests: same claim, lease, and
//! idempotency semantics as the Postgres stores, driven by an injected
//! clock so time can be simulated.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::endpoint::Endpoint;
use super::run::{truncate_body, Run, RunStatus};
use super::store::{AfterRun, EndpointStore, FailurePolicy, NewRun, RunOutcome, RunStore};
use crate::common::db_id;
use crate::kernel::traits::Clock;

// =============================================================================
// Endpoint store
// =============================================================================

#[derive(Clone)]
pub struct InMemoryEndpointStore {
    clock: Arc<dyn Clock>,
    endpoints: Arc<Mutex<HashMap<Uuid, Endpoint>>>,
}

impl InMemoryEndpointStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Direct snapshot for assertions.
    pub async fn snapshot(&self, id: Uuid) -> Option<Endpoint> {
        self.endpoints.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl EndpointStore for InMemoryEndpointStore {
    async fn claim_due(
        &self,
        worker_id: &str,
        batch_size: i64,
        lock_ttl_ms: i64,
    ) -> Result<Vec<Uuid>> {
        let now = self.clock.now();
        let mut endpoints = self.endpoints.lock().await;

        let mut due: Vec<(DateTime<Utc>, Uuid)> = endpoints
            .values()
            .filter(|ep| {
                ep.archived_at.is_none()
                    && ep.next_run_at.map_or(false, |at| at <= now)
                    && ep.lock_expires_at.map_or(true, |at| at <= now)
            })
            .map(|ep| (ep.next_run_at.unwrap_or(now), ep.id))
            .collect();
        due.sort();
        due.truncate(batch_size.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(ep) = endpoints.get_mut(&id) {
                let lease = ep.lease_ms(lock_ttl_ms);
                ep.locked_by = Some(worker_id.to_string());
                ep.lock_expires_at = Some(now + Duration::milliseconds(lease));
                ep.updated_at = now;
                claimed.push(id);
            }
        }

        Ok(claimed)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Endpoint>> {
        Ok(self.endpoints.lock().await.get(&id).cloned())
    }

    async fn insert(&self, endpoint: &Endpoint) -> Result<()> {
        self.endpoints
            .lock()
            .await
            .insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn update_after_run(&self, id: Uuid, update: AfterRun) -> Result<()> {
        let now = self.clock.now();
        let mut endpoints = self.endpoints.lock().await;
        let ep = endpoints
            .get_mut(&id)
            .ok_or_else(|| anyhow!("endpoint {} not found", id))?;

        ep.last_run_at = Some(update.last_run_at);
        ep.next_run_at = Some(update.next_run_at);
        ep.failure_count = match update.failure_policy {
            FailurePolicy::Reset => 0,
            FailurePolicy::Increment => ep.failure_count + 1,
        };

        if update.clear_expired_hints {
            if ep
                .ai_hint_expires_at
                .map_or(false, |at| at <= update.last_run_at)
            {
                ep.ai_hint_interval_ms = None;
                ep.ai_hint_next_run_at = None;
                ep.ai_hint_reason = None;
                ep.ai_hint_expires_at = None;
            }
            if ep
                .ai_hint_body_expires_at
                .map_or(false, |at| at <= update.last_run_at)
            {
                ep.ai_hint_body_json = None;
                ep.ai_hint_body_expires_at = None;
            }
        }

        ep.locked_by = None;
        ep.lock_expires_at = None;
        ep.updated_at = now;
        Ok(())
    }

    async fn apply_interval_hint(
        &self,
        id: Uuid,
        interval_ms: i64,
        reason: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(ep) = endpoints.get_mut(&id).filter(|ep| ep.archived_at.is_none()) {
            ep.ai_hint_interval_ms = Some(interval_ms);
            ep.ai_hint_next_run_at = None;
            ep.ai_hint_reason = Some(reason.to_string());
            ep.ai_hint_expires_at = Some(expires_at);
            ep.updated_at = self.clock.now();
        }
        Ok(())
    }

    async fn schedule_one_shot(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(ep) = endpoints.get_mut(&id).filter(|ep| ep.archived_at.is_none()) {
            ep.ai_hint_next_run_at = Some(at);
            ep.ai_hint_interval_ms = None;
            ep.ai_hint_reason = Some(reason.to_string());
            ep.ai_hint_expires_at = Some(expires_at);
            ep.updated_at = self.clock.now();
        }
        Ok(())
    }

    async fn pause_until(&self, id: Uuid, at: DateTime<Utc>, reason: &str) -> Result<()> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(ep) = endpoints.get_mut(&id).filter(|ep| ep.archived_at.is_none()) {
            ep.paused_until = Some(at);
            ep.ai_hint_reason = Some(reason.to_string());
            ep.updated_at = self.clock.now();
        }
        Ok(())
    }

    async fn clear_hints(&self, id: Uuid) -> Result<()> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(ep) = endpoints.get_mut(&id) {
            ep.ai_hint_interval_ms = None;
            ep.ai_hint_next_run_at = None;
            ep.ai_hint_reason = None;
            ep.ai_hint_expires_at = None;
            ep.ai_hint_body_json = None;
            ep.ai_hint_body_expires_at = None;
            ep.paused_until = None;
            ep.updated_at = self.clock.now();
        }
        Ok(())
    }

    async fn reset_failures(&self, id: Uuid) -> Result<()> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(ep) = endpoints.get_mut(&id) {
            ep.failure_count = 0;
            ep.updated_at = self.clock.now();
        }
        Ok(())
    }

    async fn archive(&self, id: Uuid) -> Result<()> {
        let now = self.clock.now();
        let mut endpoints = self.endpoints.lock().await;
        if let Some(ep) = endpoints.get_mut(&id).filter(|ep| ep.archived_at.is_none()) {
            ep.archived_at = Some(now);
            ep.updated_at = now;
        }
        Ok(())
    }

    async fn find_due_for_analysis(
        &self,
        limit: i64,
        min_failures: i32,
        reanalyze_after_ms: i64,
    ) -> Result<Vec<Endpoint>> {
        let now = self.clock.now();
        let stale_before = now - Duration::milliseconds(reanalyze_after_ms);
        let endpoints = self.endpoints.lock().await;

        let mut due: Vec<Endpoint> = endpoints
            .values()
            .filter(|ep| {
                ep.archived_at.is_none()
                    && (ep.failure_count >= min_failures
                        || ep.ai_analyzed_at.map_or(true, |at| at <= stale_before))
            })
            .cloned()
            .collect();
        // Oldest (or never) analyzed first.
        due.sort_by_key(|ep| ep.ai_analyzed_at);
        due.truncate(limit.max(0) as usize);

        Ok(due)
    }

    async fn mark_analyzed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(ep) = endpoints.get_mut(&id) {
            ep.ai_analyzed_at = Some(at);
            ep.updated_at = self.clock.now();
        }
        Ok(())
    }
}

// =============================================================================
// Run store
// =============================================================================

#[derive(Clone)]
pub struct InMemoryRunStore {
    clock: Arc<dyn Clock>,
    runs: Arc<Mutex<HashMap<Uuid, Run>>>,
}

impl InMemoryRunStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn snapshot(&self, id: Uuid) -> Option<Run> {
        self.runs.lock().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.lock().await.values().cloned().collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, new_run: NewRun) -> Result<Uuid> {
        let run = Run::builder()
            .id(db_id())
            .endpoint_id(new_run.endpoint_id)
            .attempt(new_run.attempt)
            .source(new_run.source)
            .started_at(self.clock.now())
            .build();

        let id = run.id;
        self.runs.lock().await.insert(id, run);
        Ok(id)
    }

    async fn finish(&self, run_id: Uuid, outcome: RunOutcome) -> Result<()> {
        let now = self.clock.now();
        let mut runs = self.runs.lock().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run {} not found", run_id))?;

        // Second finish of the same run is a no-op.
        if run.status != RunStatus::Running {
            return Ok(());
        }

        run.status = outcome.status;
        run.finished_at = Some(now);
        run.duration_ms = Some(outcome.duration_ms);
        run.status_code = outcome.status_code;
        run.response_body = outcome
            .response_body
            .as_deref()
            .map(|b| truncate_body(b, outcome.max_response_size_kb));
        run.error_message = outcome.error_message;
        Ok(())
    }

    async fn cleanup_zombies(&self, older_than_ms: i64) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = now - Duration::milliseconds(older_than_ms);
        let mut runs = self.runs.lock().await;

        let mut reaped = 0;
        for run in runs.values_mut() {
            if run.status == RunStatus::Running && run.started_at <= cutoff {
                run.status = RunStatus::Canceled;
                run.finished_at = Some(now);
                run.error_message = Some("execution exceeded zombie threshold".to_string());
                reaped += 1;
            }
        }

        Ok(reaped)
    }

    async fn recent_for_endpoint(&self, endpoint_id: Uuid, limit: i64) -> Result<Vec<Run>> {
        let runs = self.runs.lock().await;
        let mut matching: Vec<Run> = runs
            .values()
            .filter(|r| r.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }
}
