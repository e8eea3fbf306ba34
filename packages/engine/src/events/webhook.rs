//! Processed-event ledger for at-least-once webhook delivery.
//!
//! `record_processed` is insert-if-absent on the event id; callers run it
//! in the same transaction scope as the business write so a retried
//! delivery observes the first attempt. The pattern applies to any
//! at-least-once event the engine consumes, payment webhooks included.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tokio::sync::Mutex;

use crate::kernel::traits::Clock;

#[derive(FromRow, Debug, Clone)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
    pub status: String,
}

#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Record an event as processed. Returns `true` when this call stored
    /// the event, `false` when it had already been recorded.
    async fn record_processed(
        &self,
        event_id: &str,
        event_type: &str,
        status: &str,
    ) -> Result<bool>;

    async fn has_been_processed(&self, event_id: &str) -> Result<bool>;
}

// =============================================================================
// Postgres
// =============================================================================

#[derive(Clone)]
pub struct PostgresProcessedEvents {
    pool: PgPool,
}

impl PostgresProcessedEvents {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventStore for PostgresProcessedEvents {
    async fn record_processed(
        &self,
        event_id: &str,
        event_type: &str,
        status: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_event (event_id, event_type, processed_at, status)
            VALUES ($1, $2, NOW(), $3)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn has_been_processed(&self, event_id: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM webhook_event WHERE event_id = $1)
            "#,
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Clone)]
pub struct InMemoryProcessedEvents {
    clock: Arc<dyn Clock>,
    events: Arc<Mutex<HashMap<String, WebhookEvent>>>,
}

impl InMemoryProcessedEvents {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            events: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn snapshot(&self, event_id: &str) -> Option<WebhookEvent> {
        self.events.lock().await.get(event_id).cloned()
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryProcessedEvents {
    async fn record_processed(
        &self,
        event_id: &str,
        event_type: &str,
        status: &str,
    ) -> Result<bool> {
        let mut events = self.events.lock().await;
        if events.contains_key(event_id) {
            return Ok(false);
        }
        events.insert(
            event_id.to_string(),
            WebhookEvent {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                processed_at: self.clock.now(),
                status: status.to_string(),
            },
        );
        Ok(true)
    }

    async fn has_been_processed(&self, event_id: &str) -> Result<bool> {
        Ok(self.events.lock().await.contains_key(event_id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::kernel::test_dependencies::FakeClock;

    fn store() -> InMemoryProcessedEvents {
        let clock = FakeClock::at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        InMemoryProcessedEvents::new(Arc::new(clock))
    }

    #[tokio::test]
    async fn test_double_record_yields_single_row() {
        let store = store();

        assert!(store
            .record_processed("evt_1", "invoice.paid", "handled")
            .await
            .unwrap());
        assert!(!store
            .record_processed("evt_1", "invoice.paid", "handled")
            .await
            .unwrap());

        let event = store.snapshot("evt_1").await.unwrap();
        assert_eq!(event.event_type, "invoice.paid");
    }

    #[tokio::test]
    async fn test_has_been_processed_after_first_record() {
        let store = store();

        assert!(!store.has_been_processed("evt_2").await.unwrap());
        store
            .record_processed("evt_2", "invoice.paid", "handled")
            .await
            .unwrap();
        assert!(store.has_been_processed("evt_2").await.unwrap());
    }

    #[tokio::test]
    async fn test_first_write_wins() {
        let store = store();

        store
            .record_processed("evt_3", "invoice.paid", "handled")
            .await
            .unwrap();
        store
            .record_processed("evt_3", "invoice.paid", "retried")
            .await
            .unwrap();

        assert_eq!(store.snapshot("evt_3").await.unwrap().status, "handled");
    }
}
