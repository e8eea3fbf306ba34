//! PostgreSQL-backed store implementations.
//!
//! Claiming uses a CTE with `FOR UPDATE SKIP LOCKED` so concurrent
//! scheduler processes never claim the same endpoint. All writes are
//! single statements; there is no partially-applied post-run state.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::endpoint::Endpoint;
use super::run::{truncate_body, Run, RunStatus};
use super::store::{AfterRun, EndpointStore, FailurePolicy, NewRun, RunOutcome, RunStore};
use crate::common::db_id;

const ENDPOINT_COLUMNS: &str = r#"
    id, tenant_id, job_id, name, description,
    baseline_cron, baseline_interval_ms,
    min_interval_ms, max_interval_ms,
    ai_hint_interval_ms, ai_hint_next_run_at, ai_hint_reason, ai_hint_expires_at,
    ai_hint_body_json, ai_hint_body_expires_at,
    paused_until, archived_at,
    last_run_at, next_run_at, failure_count, locked_by, lock_expires_at, ai_analyzed_at,
    url, method, headers_json, body_json, body_schema_json,
    timeout_ms, max_execution_time_ms, max_response_size_kb,
    created_at, updated_at
"#;

// =============================================================================
// Endpoint store
// =============================================================================

#[derive(Clone)]
pub struct PostgresEndpointStore {
    pool: PgPool,
}

impl PostgresEndpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EndpointStore for PostgresEndpointStore {
    async fn claim_due(
        &self,
        worker_id: &str,
        batch_size: i64,
        lock_ttl_ms: i64,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            WITH due AS (
                SELECT id
                FROM endpoint
                WHERE archived_at IS NULL
                  AND next_run_at IS NOT NULL
                  AND next_run_at <= NOW()
                  AND (lock_expires_at IS NULL OR lock_expires_at <= NOW())
                ORDER BY next_run_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE endpoint
            SET
                locked_by = $2,
                lock_expires_at = NOW()
                    + ((COALESCE(max_execution_time_ms, $3))::TEXT || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM due)
            RETURNING id
            "#,
        )
        .bind(batch_size)
        .bind(worker_id)
        .bind(lock_ttl_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(&format!(
            "SELECT {} FROM endpoint WHERE id = $1",
            ENDPOINT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(endpoint)
    }

    async fn insert(&self, ep: &Endpoint) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO endpoint ({})
            VALUES (
                $1, $2, $3, $4, $5,
                $6, $7,
                $8, $9,
                $10, $11, $12, $13,
                $14, $15,
                $16, $17,
                $18, $19, $20, $21, $22, $23,
                $24, $25, $26, $27, $28,
                $29, $30, $31,
                $32, $33
            )
            "#,
            ENDPOINT_COLUMNS
        ))
        .bind(ep.id)
        .bind(&ep.tenant_id)
        .bind(ep.job_id)
        .bind(&ep.name)
        .bind(&ep.description)
        .bind(&ep.baseline_cron)
        .bind(ep.baseline_interval_ms)
        .bind(ep.min_interval_ms)
        .bind(ep.max_interval_ms)
        .bind(ep.ai_hint_interval_ms)
        .bind(ep.ai_hint_next_run_at)
        .bind(&ep.ai_hint_reason)
        .bind(ep.ai_hint_expires_at)
        .bind(&ep.ai_hint_body_json)
        .bind(ep.ai_hint_body_expires_at)
        .bind(ep.paused_until)
        .bind(ep.archived_at)
        .bind(ep.last_run_at)
        .bind(ep.next_run_at)
        .bind(ep.failure_count)
        .bind(&ep.locked_by)
        .bind(ep.lock_expires_at)
        .bind(ep.ai_analyzed_at)
        .bind(&ep.url)
        .bind(ep.method)
        .bind(&ep.headers_json)
        .bind(&ep.body_json)
        .bind(&ep.body_schema_json)
        .bind(ep.timeout_ms)
        .bind(ep.max_execution_time_ms)
        .bind(ep.max_response_size_kb)
        .bind(ep.created_at)
        .bind(ep.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_after_run(&self, id: Uuid, update: AfterRun) -> Result<()> {
        let reset = update.failure_policy == FailurePolicy::Reset;

        sqlx::query(
            r#"
            UPDATE endpoint
            SET
                last_run_at = $2,
                next_run_at = $3,
                failure_count = CASE WHEN $4 THEN 0 ELSE failure_count + 1 END,
                ai_hint_interval_ms = CASE
                    WHEN $5 AND ai_hint_expires_at IS NOT NULL AND ai_hint_expires_at <= $2
                    THEN NULL ELSE ai_hint_interval_ms END,
                ai_hint_next_run_at = CASE
                    WHEN $5 AND ai_hint_expires_at IS NOT NULL AND ai_hint_expires_at <= $2
                    THEN NULL ELSE ai_hint_next_run_at END,
                ai_hint_reason = CASE
                    WHEN $5 AND ai_hint_expires_at IS NOT NULL AND ai_hint_expires_at <= $2
                    THEN NULL ELSE ai_hint_reason END,
                ai_hint_expires_at = CASE
                    WHEN $5 AND ai_hint_expires_at IS NOT NULL AND ai_hint_expires_at <= $2
                    THEN NULL ELSE ai_hint_expires_at END,
                ai_hint_body_json = CASE
                    WHEN $5 AND ai_hint_body_expires_at IS NOT NULL AND ai_hint_body_expires_at <= $2
                    THEN NULL ELSE ai_hint_body_json END,
                ai_hint_body_expires_at = CASE
                    WHEN $5 AND ai_hint_body_expires_at IS NOT NULL AND ai_hint_body_expires_at <= $2
                    THEN NULL ELSE ai_hint_body_expires_at END,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.last_run_at)
        .bind(update.next_run_at)
        .bind(reset)
        .bind(update.clear_expired_hints)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply_interval_hint(
        &self,
        id: Uuid,
        interval_ms: i64,
        reason: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE endpoint
            SET ai_hint_interval_ms = $2,
                ai_hint_next_run_at = NULL,
                ai_hint_reason = $3,
                ai_hint_expires_at = $4,
                updated_at = NOW()
            WHERE id = $1 AND archived_at IS NULL
            "#,
        )
        .bind(id)
        .bind(interval_ms)
        .bind(reason)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn schedule_one_shot(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE endpoint
            SET ai_hint_next_run_at = $2,
                ai_hint_interval_ms = NULL,
                ai_hint_reason = $3,
                ai_hint_expires_at = $4,
                updated_at = NOW()
            WHERE id = $1 AND archived_at IS NULL
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(reason)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pause_until(&self, id: Uuid, at: DateTime<Utc>, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE endpoint
            SET paused_until = $2,
                ai_hint_reason = $3,
                updated_at = NOW()
            WHERE id = $1 AND archived_at IS NULL
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_hints(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE endpoint
            SET ai_hint_interval_ms = NULL,
                ai_hint_next_run_at = NULL,
                ai_hint_reason = NULL,
                ai_hint_expires_at = NULL,
                ai_hint_body_json = NULL,
                ai_hint_body_expires_at = NULL,
                paused_until = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset_failures(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE endpoint
            SET failure_count = 0,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn archive(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE endpoint
            SET archived_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND archived_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_due_for_analysis(
        &self,
        limit: i64,
        min_failures: i32,
        reanalyze_after_ms: i64,
    ) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(&format!(
            r#"
            SELECT {}
            FROM endpoint
            WHERE archived_at IS NULL
              AND (
                  failure_count >= $2
                  OR ai_analyzed_at IS NULL
                  OR ai_analyzed_at <= NOW() - (($3)::TEXT || ' milliseconds')::INTERVAL
              )
            ORDER BY ai_analyzed_at ASC NULLS FIRST
            LIMIT $1
            "#,
            ENDPOINT_COLUMNS
        ))
        .bind(limit)
        .bind(min_failures)
        .bind(reanalyze_after_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(endpoints)
    }

    async fn mark_analyzed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE endpoint
            SET ai_analyzed_at = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// Run store
// =============================================================================

#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn create(&self, run: NewRun) -> Result<Uuid> {
        let id = db_id();

        sqlx::query(
            r#"
            INSERT INTO run (id, endpoint_id, status, attempt, source, started_at)
            VALUES ($1, $2, 'running', $3, $4, NOW())
            "#,
        )
        .bind(id)
        .bind(run.endpoint_id)
        .bind(run.attempt)
        .bind(run.source)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn finish(&self, run_id: Uuid, outcome: RunOutcome) -> Result<()> {
        let body = outcome
            .response_body
            .as_deref()
            .map(|b| truncate_body(b, outcome.max_response_size_kb));

        // Guarding on `status = 'running'` makes a repeated finish a no-op.
        sqlx::query(
            r#"
            UPDATE run
            SET status = $2,
                finished_at = NOW(),
                duration_ms = $3,
                status_code = $4,
                response_body = $5,
                error_message = $6
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(outcome.status)
        .bind(outcome.duration_ms)
        .bind(outcome.status_code)
        .bind(body)
        .bind(&outcome.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cleanup_zombies(&self, older_than_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE run
            SET status = 'canceled',
                finished_at = NOW(),
                error_message = 'execution exceeded zombie threshold'
            WHERE status = 'running'
              AND started_at <= NOW() - (($1)::TEXT || ' milliseconds')::INTERVAL
            "#,
        )
        .bind(older_than_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn recent_for_endpoint(&self, endpoint_id: Uuid, limit: i64) -> Result<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>(
            r#"
            SELECT id, endpoint_id, status, attempt, started_at, finished_at,
                   duration_ms, status_code, response_body, error_message, source
            FROM run
            WHERE endpoint_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(endpoint_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }
}
