//! Endpoint model - the unit of scheduling.
//!
//! An endpoint is an HTTP call configuration plus its runtime scheduling
//! state. Rows are mutated by three writers only: the scheduler (post-run
//! update under a claim lock), the AI planner (hint fields), and the CRUD
//! layer (config edits, pause, archive).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::db_id;
use crate::kernel::cron::{validate_expression, CronError};

/// Baseline cadence when neither a cron expression nor an interval is set.
pub const DEFAULT_BASELINE_INTERVAL_MS: i64 = 60_000;

/// Lock lease when the endpoint does not override `max_execution_time_ms`.
pub const DEFAULT_MAX_EXECUTION_TIME_MS: i64 = 60_000;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "http_method", rename_all = "snake_case")]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Debug, Error)]
pub enum EndpointConfigError {
    #[error("baseline_cron and baseline_interval_ms are mutually exclusive")]
    ConflictingBaseline,

    #[error("baseline_interval_ms must be positive, got {0}")]
    NonPositiveInterval(i64),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("min_interval_ms {min} exceeds max_interval_ms {max}")]
    InvertedGuardrails { min: i64, max: i64 },
}

// ============================================================================
// Endpoint Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Endpoint {
    #[builder(default = db_id())]
    pub id: Uuid,

    // Identity
    pub tenant_id: String,
    #[builder(default, setter(strip_option))]
    pub job_id: Option<Uuid>,
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,

    // Baseline cadence (cron wins when both are present; validation rejects
    // the combination for new rows)
    #[builder(default, setter(strip_option))]
    pub baseline_cron: Option<String>,
    #[builder(default, setter(strip_option))]
    pub baseline_interval_ms: Option<i64>,

    // Guardrails
    #[builder(default, setter(strip_option))]
    pub min_interval_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_interval_ms: Option<i64>,

    // AI hints (TTL-scoped via ai_hint_expires_at)
    #[builder(default, setter(strip_option))]
    pub ai_hint_interval_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub ai_hint_next_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub ai_hint_reason: Option<String>,
    #[builder(default, setter(strip_option))]
    pub ai_hint_expires_at: Option<DateTime<Utc>>,

    // AI body hint (separate TTL; consumed by the dispatcher)
    #[builder(default, setter(strip_option))]
    pub ai_hint_body_json: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub ai_hint_body_expires_at: Option<DateTime<Utc>>,

    // Pause / archive
    #[builder(default, setter(strip_option))]
    pub paused_until: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub archived_at: Option<DateTime<Utc>>,

    // Runtime state
    #[builder(default, setter(strip_option))]
    pub last_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub failure_count: i32,
    #[builder(default, setter(strip_option))]
    pub locked_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub ai_analyzed_at: Option<DateTime<Utc>>,

    // Execution config
    pub url: String,
    #[builder(default)]
    pub method: HttpMethod,
    #[builder(default, setter(strip_option))]
    pub headers_json: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub body_json: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub body_schema_json: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub timeout_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_execution_time_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_response_size_kb: Option<i64>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Config-time validation of the cadence settings. Called by whatever
    /// layer creates or edits endpoints; the scheduler assumes rows passed it.
    pub fn validate_baseline(&self) -> Result<(), EndpointConfigError> {
        if self.baseline_cron.is_some() && self.baseline_interval_ms.is_some() {
            return Err(EndpointConfigError::ConflictingBaseline);
        }
        if let Some(expr) = &self.baseline_cron {
            validate_expression(expr)?;
        }
        if let Some(interval) = self.baseline_interval_ms {
            if interval <= 0 {
                return Err(EndpointConfigError::NonPositiveInterval(interval));
            }
        }
        if let (Some(min), Some(max)) = (self.min_interval_ms, self.max_interval_ms) {
            if min > max {
                return Err(EndpointConfigError::InvertedGuardrails { min, max });
            }
        }
        Ok(())
    }

    /// Whether the scheduling hint fields are live at `now`.
    pub fn has_fresh_hint(&self, now: DateTime<Utc>) -> bool {
        self.ai_hint_expires_at.map_or(false, |at| at > now)
    }

    /// Whether the body hint is live at `now`.
    pub fn has_fresh_body_hint(&self, now: DateTime<Utc>) -> bool {
        self.ai_hint_body_expires_at.map_or(false, |at| at > now)
    }

    /// The request body the dispatcher should send at `now`:
    /// fresh AI body hint > static body > none.
    pub fn resolve_body(&self, now: DateTime<Utc>) -> Option<&serde_json::Value> {
        if self.has_fresh_body_hint(now) {
            if let Some(body) = &self.ai_hint_body_json {
                return Some(body);
            }
        }
        self.body_json.as_ref()
    }

    /// Lock lease duration for a claim of this endpoint.
    pub fn lease_ms(&self, default_ttl_ms: i64) -> i64 {
        self.max_execution_time_ms.unwrap_or(default_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::builder()
            .tenant_id("tenant-1")
            .name("health probe")
            .url("https://api.example.com/health")
            .build()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_validate_rejects_conflicting_baseline() {
        let mut ep = endpoint();
        ep.baseline_cron = Some("0 * * * *".to_string());
        ep.baseline_interval_ms = Some(60_000);
        assert!(matches!(
            ep.validate_baseline(),
            Err(EndpointConfigError::ConflictingBaseline)
        ));
    }

    #[test]
    fn test_validate_rejects_bad_cron_and_interval() {
        let mut ep = endpoint();
        ep.baseline_cron = Some("not a cron".to_string());
        assert!(matches!(
            ep.validate_baseline(),
            Err(EndpointConfigError::Cron(_))
        ));

        let mut ep = endpoint();
        ep.baseline_interval_ms = Some(0);
        assert!(matches!(
            ep.validate_baseline(),
            Err(EndpointConfigError::NonPositiveInterval(0))
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_guardrails() {
        let mut ep = endpoint();
        ep.min_interval_ms = Some(60_000);
        ep.max_interval_ms = Some(30_000);
        assert!(matches!(
            ep.validate_baseline(),
            Err(EndpointConfigError::InvertedGuardrails { .. })
        ));
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(endpoint().validate_baseline().is_ok());
    }

    #[test]
    fn test_hint_freshness_is_strict() {
        let mut ep = endpoint();
        ep.ai_hint_expires_at = Some(at(1, 0));
        assert!(ep.has_fresh_hint(at(0, 59)));
        assert!(!ep.has_fresh_hint(at(1, 0)));
        assert!(!ep.has_fresh_hint(at(1, 1)));
    }

    #[test]
    fn test_resolve_body_prefers_fresh_hint() {
        let mut ep = endpoint();
        ep.body_json = Some(json!({"static": true}));
        ep.ai_hint_body_json = Some(json!({"hinted": true}));
        ep.ai_hint_body_expires_at = Some(at(1, 0));

        assert_eq!(ep.resolve_body(at(0, 30)), Some(&json!({"hinted": true})));
        // Expired hint falls back to the static body.
        assert_eq!(ep.resolve_body(at(2, 0)), Some(&json!({"static": true})));
    }

    #[test]
    fn test_lease_prefers_endpoint_override() {
        let mut ep = endpoint();
        assert_eq!(ep.lease_ms(60_000), 60_000);
        ep.max_execution_time_ms = Some(120_000);
        assert_eq!(ep.lease_ms(60_000), 120_000);
    }
}
