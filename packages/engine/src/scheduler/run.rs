//! Run model - a single execution attempt of an endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::db_id;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "run_source", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum RunSource {
    #[default]
    Scheduler,
    ManualTest,
    Ai,
}

// ============================================================================
// Run Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Run {
    #[builder(default = db_id())]
    pub id: Uuid,

    pub endpoint_id: Uuid,

    #[builder(default)]
    pub status: RunStatus,

    /// 1-based position within the current failure streak; equals the
    /// endpoint's `failure_count + 1` at the moment of claim.
    #[builder(default = 1)]
    pub attempt: i32,

    #[builder(default = Utc::now())]
    pub started_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub duration_ms: Option<i64>,

    #[builder(default, setter(strip_option))]
    pub status_code: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub response_body: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    #[builder(default)]
    pub source: RunSource,
}

/// Truncate a captured response body to a KiB cap.
///
/// Cuts on a char boundary at or below the byte limit so the stored string
/// stays valid UTF-8.
pub fn truncate_body(body: &str, max_kb: i64) -> String {
    let max_bytes = (max_kb.max(0) as usize) * 1024;
    if body.len() <= max_bytes {
        return body.to_string();
    }

    let mut cut = max_bytes;
    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body[..cut].to_string()
}
