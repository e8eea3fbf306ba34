//! Hint tool surface for the AI planner.
//!
//! The model never sees a repository; it sees five operations with typed
//! parameters, and the toolbox validates, clamps, and writes. Every write
//! is scoped to the endpoint under analysis by construction.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::scheduler::endpoint::Endpoint;
use crate::scheduler::store::EndpointStore;

/// Floor for hint TTLs; anything shorter would expire before the next
/// planning cycle can observe it.
const MIN_HINT_TTL_MS: i64 = 1_000;

/// Error type for hint tools.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArgs { tool: String, reason: String },

    #[error("proposed time {at} is not in the future")]
    TimeInPast { at: DateTime<Utc> },

    #[error("hint write failed: {0}")]
    Write(#[from] anyhow::Error),
}

// =============================================================================
// Tool arguments
// =============================================================================

/// Arguments for proposing a recurring interval.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ProposeIntervalArgs {
    /// Proposed interval between runs, in milliseconds.
    pub interval_ms: i64,
    /// Why the cadence should change.
    pub reason: String,
    /// How long the hint stays in effect, in milliseconds.
    pub ttl_ms: i64,
}

/// Arguments for proposing a single fire time.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ProposeNextTimeArgs {
    /// Absolute fire time (RFC 3339, UTC).
    pub at: DateTime<Utc>,
    /// Why this one-shot run is needed.
    pub reason: String,
    /// How long the hint stays in effect, in milliseconds.
    pub ttl_ms: i64,
}

/// Arguments for pausing the endpoint.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PauseUntilArgs {
    /// Absolute time to resume (RFC 3339, UTC).
    pub at: DateTime<Utc>,
    /// Why the endpoint should pause.
    pub reason: String,
}

/// The closed set of operations the model may call.
#[derive(Debug, Clone)]
pub enum HintTool {
    ProposeInterval(ProposeIntervalArgs),
    ProposeNextTime(ProposeNextTimeArgs),
    PauseUntil(PauseUntilArgs),
    ResetFailures,
    ClearHints,
}

impl HintTool {
    /// Parse a tool call by name and raw JSON arguments.
    pub fn parse(name: &str, args: Value) -> Result<Self, ToolError> {
        let invalid = |reason: serde_json::Error| ToolError::InvalidArgs {
            tool: name.to_string(),
            reason: reason.to_string(),
        };

        match name {
            "propose_interval" => Ok(HintTool::ProposeInterval(
                serde_json::from_value(args).map_err(invalid)?,
            )),
            "propose_next_time" => Ok(HintTool::ProposeNextTime(
                serde_json::from_value(args).map_err(invalid)?,
            )),
            "pause_until" => Ok(HintTool::PauseUntil(
                serde_json::from_value(args).map_err(invalid)?,
            )),
            "reset_failures" => Ok(HintTool::ResetFailures),
            "clear_hints" => Ok(HintTool::ClearHints),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HintTool::ProposeInterval(_) => "propose_interval",
            HintTool::ProposeNextTime(_) => "propose_next_time",
            HintTool::PauseUntil(_) => "pause_until",
            HintTool::ResetFailures => "reset_failures",
            HintTool::ClearHints => "clear_hints",
        }
    }
}

/// Tool definitions in the wire format the model sees.
pub fn hint_tool_definitions() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": "propose_interval",
                "description": "Propose a new recurring interval between runs. Use when the run history suggests the endpoint should be polled faster or slower. The interval is clamped to the endpoint's guardrails.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "interval_ms": {"type": "integer", "description": "Proposed interval in milliseconds"},
                        "reason": {"type": "string", "description": "Why the cadence should change"},
                        "ttl_ms": {"type": "integer", "description": "How long the hint stays in effect, in milliseconds"}
                    },
                    "required": ["interval_ms", "reason", "ttl_ms"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "propose_next_time",
                "description": "Propose a single absolute fire time. Use for a one-off check, e.g. shortly after a failure streak or an announced maintenance window.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "at": {"type": "string", "format": "date-time", "description": "Absolute fire time (RFC 3339, UTC)"},
                        "reason": {"type": "string", "description": "Why this one-shot run is needed"},
                        "ttl_ms": {"type": "integer", "description": "How long the hint stays in effect, in milliseconds"}
                    },
                    "required": ["at", "reason", "ttl_ms"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "pause_until",
                "description": "Pause the endpoint until an absolute time. Use when the target is clearly down and further polling is pointless.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "at": {"type": "string", "format": "date-time", "description": "Absolute time to resume (RFC 3339, UTC)"},
                        "reason": {"type": "string", "description": "Why the endpoint should pause"}
                    },
                    "required": ["at", "reason"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "reset_failures",
                "description": "Zero the failure counter. Use when the history shows the endpoint has recovered.",
                "parameters": {"type": "object", "properties": {}}
            }
        },
        {
            "type": "function",
            "function": {
                "name": "clear_hints",
                "description": "Drop every active hint and pause, returning the endpoint to its baseline cadence.",
                "parameters": {"type": "object", "properties": {}}
            }
        }
    ])
}

// =============================================================================
// Toolbox - validated, clamped writes
// =============================================================================

/// Applies tool calls for exactly one endpoint.
pub struct HintToolbox<'a> {
    store: &'a dyn EndpointStore,
    endpoint: &'a Endpoint,
    now: DateTime<Utc>,
    max_ttl_ms: i64,
}

impl<'a> HintToolbox<'a> {
    pub fn new(
        store: &'a dyn EndpointStore,
        endpoint: &'a Endpoint,
        now: DateTime<Utc>,
        max_ttl_ms: i64,
    ) -> Self {
        Self {
            store,
            endpoint,
            now,
            max_ttl_ms,
        }
    }

    fn clamp_ttl(&self, ttl_ms: i64) -> i64 {
        ttl_ms.clamp(MIN_HINT_TTL_MS, self.max_ttl_ms)
    }

    fn clamp_interval(&self, interval_ms: i64) -> i64 {
        let mut clamped = interval_ms.max(1);
        if let Some(min) = self.endpoint.min_interval_ms {
            clamped = clamped.max(min);
        }
        if let Some(max) = self.endpoint.max_interval_ms {
            clamped = clamped.min(max);
        }
        clamped
    }

    /// Validate and apply one tool call. Returns the confirmation text fed
    /// back to the model.
    pub async fn apply(&self, tool: HintTool) -> Result<String, ToolError> {
        let endpoint_id = self.endpoint.id;

        match tool {
            HintTool::ProposeInterval(args) => {
                if args.interval_ms <= 0 {
                    return Err(ToolError::InvalidArgs {
                        tool: "propose_interval".to_string(),
                        reason: format!("interval_ms must be positive, got {}", args.interval_ms),
                    });
                }
                let interval_ms = self.clamp_interval(args.interval_ms);
                let expires_at = self.now + Duration::milliseconds(self.clamp_ttl(args.ttl_ms));

                self.store
                    .apply_interval_hint(endpoint_id, interval_ms, &args.reason, expires_at)
                    .await?;

                info!(
                    endpoint_id = %endpoint_id,
                    interval_ms = interval_ms,
                    proposed_ms = args.interval_ms,
                    expires_at = %expires_at,
                    "interval hint applied"
                );
                Ok(format!(
                    "Interval hint of {}ms recorded (expires {})",
                    interval_ms, expires_at
                ))
            }
            HintTool::ProposeNextTime(args) => {
                if args.at <= self.now {
                    return Err(ToolError::TimeInPast { at: args.at });
                }
                let ttl_ms = self.clamp_ttl(args.ttl_ms);
                // The hint must outlive the proposed time to be plannable.
                let expires_at =
                    (self.now + Duration::milliseconds(ttl_ms)).max(args.at + Duration::seconds(1));

                self.store
                    .schedule_one_shot(endpoint_id, args.at, &args.reason, expires_at)
                    .await?;

                info!(
                    endpoint_id = %endpoint_id,
                    at = %args.at,
                    expires_at = %expires_at,
                    "one-shot hint applied"
                );
                Ok(format!("One-shot run at {} recorded", args.at))
            }
            HintTool::PauseUntil(args) => {
                if args.at <= self.now {
                    return Err(ToolError::TimeInPast { at: args.at });
                }

                self.store
                    .pause_until(endpoint_id, args.at, &args.reason)
                    .await?;

                info!(endpoint_id = %endpoint_id, until = %args.at, "endpoint paused");
                Ok(format!("Endpoint paused until {}", args.at))
            }
            HintTool::ResetFailures => {
                self.store.reset_failures(endpoint_id).await?;
                info!(endpoint_id = %endpoint_id, "failure counter reset");
                Ok("Failure counter reset".to_string())
            }
            HintTool::ClearHints => {
                self.store.clear_hints(endpoint_id).await?;
                info!(endpoint_id = %endpoint_id, "hints cleared");
                Ok("All hints cleared".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::kernel::test_dependencies::FakeClock;
    use crate::scheduler::memory::InMemoryEndpointStore;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, 0).unwrap()
    }

    async fn setup(min: Option<i64>, max: Option<i64>) -> (InMemoryEndpointStore, Endpoint) {
        let clock = FakeClock::at(at(0, 0));
        let store = InMemoryEndpointStore::new(Arc::new(clock));
        let mut ep = Endpoint::builder()
            .tenant_id("tenant-1")
            .name("probe")
            .url("https://api.example.com/health")
            .build();
        ep.min_interval_ms = min;
        ep.max_interval_ms = max;
        store.insert(&ep).await.unwrap();
        (store, ep)
    }

    #[tokio::test]
    async fn test_interval_hint_is_clamped_to_guardrails() {
        let (store, ep) = setup(Some(60_000), Some(600_000)).await;
        let toolbox = HintToolbox::new(&store, &ep, at(0, 0), 86_400_000);

        let tool = HintTool::parse(
            "propose_interval",
            json!({"interval_ms": 5_000, "reason": "failing fast", "ttl_ms": 60_000}),
        )
        .unwrap();
        toolbox.apply(tool).await.unwrap();

        let hinted = store.snapshot(ep.id).await.unwrap();
        assert_eq!(hinted.ai_hint_interval_ms, Some(60_000));

        let tool = HintTool::parse(
            "propose_interval",
            json!({"interval_ms": 3_600_000, "reason": "quiet", "ttl_ms": 60_000}),
        )
        .unwrap();
        toolbox.apply(tool).await.unwrap();
        assert_eq!(
            store.snapshot(ep.id).await.unwrap().ai_hint_interval_ms,
            Some(600_000)
        );
    }

    #[tokio::test]
    async fn test_ttl_is_bounded() {
        let (store, ep) = setup(None, None).await;
        let toolbox = HintToolbox::new(&store, &ep, at(0, 0), 3_600_000);

        let tool = HintTool::parse(
            "propose_interval",
            json!({"interval_ms": 30_000, "reason": "r", "ttl_ms": 999_999_999_999i64}),
        )
        .unwrap();
        toolbox.apply(tool).await.unwrap();

        let hinted = store.snapshot(ep.id).await.unwrap();
        assert_eq!(hinted.ai_hint_expires_at, Some(at(1, 0)));
    }

    #[tokio::test]
    async fn test_one_shot_in_past_is_rejected() {
        let (store, ep) = setup(None, None).await;
        let toolbox = HintToolbox::new(&store, &ep, at(1, 0), 3_600_000);

        let tool = HintTool::parse(
            "propose_next_time",
            json!({"at": "2025-01-01T00:30:00Z", "reason": "r", "ttl_ms": 60_000}),
        )
        .unwrap();
        assert!(matches!(
            toolbox.apply(tool).await,
            Err(ToolError::TimeInPast { .. })
        ));
        assert!(store.snapshot(ep.id).await.unwrap().ai_hint_next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_one_shot_hint_expiry_covers_fire_time() {
        let (store, ep) = setup(None, None).await;
        let toolbox = HintToolbox::new(&store, &ep, at(0, 0), 3_600_000);

        // TTL shorter than the distance to the proposed time.
        let tool = HintTool::parse(
            "propose_next_time",
            json!({"at": "2025-01-01T02:00:00Z", "reason": "r", "ttl_ms": 1_000}),
        )
        .unwrap();
        toolbox.apply(tool).await.unwrap();

        let hinted = store.snapshot(ep.id).await.unwrap();
        assert_eq!(hinted.ai_hint_next_run_at, Some(at(2, 0)));
        assert!(hinted.ai_hint_expires_at.unwrap() > at(2, 0));
    }

    #[tokio::test]
    async fn test_pause_and_reset_and_clear() {
        let (store, ep) = setup(None, None).await;
        let toolbox = HintToolbox::new(&store, &ep, at(0, 0), 3_600_000);

        toolbox
            .apply(HintTool::parse("pause_until", json!({"at": "2025-01-01T03:00:00Z", "reason": "down"})).unwrap())
            .await
            .unwrap();
        assert_eq!(store.snapshot(ep.id).await.unwrap().paused_until, Some(at(3, 0)));

        toolbox
            .apply(HintTool::parse("reset_failures", json!({})).unwrap())
            .await
            .unwrap();
        assert_eq!(store.snapshot(ep.id).await.unwrap().failure_count, 0);

        toolbox
            .apply(HintTool::parse("clear_hints", json!({})).unwrap())
            .await
            .unwrap();
        let cleared = store.snapshot(ep.id).await.unwrap();
        assert!(cleared.paused_until.is_none());
        assert!(cleared.ai_hint_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_args() {
        assert!(matches!(
            HintTool::parse("drop_table", json!({})),
            Err(ToolError::UnknownTool(_))
        ));
        assert!(matches!(
            HintTool::parse("propose_interval", json!({"reason": "missing fields"})),
            Err(ToolError::InvalidArgs { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_positive_interval_is_rejected() {
        let (store, ep) = setup(None, None).await;
        let toolbox = HintToolbox::new(&store, &ep, at(0, 0), 3_600_000);

        let tool = HintTool::parse(
            "propose_interval",
            json!({"interval_ms": 0, "reason": "r", "ttl_ms": 60_000}),
        )
        .unwrap();
        assert!(matches!(
            toolbox.apply(tool).await,
            Err(ToolError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn test_definitions_match_parser() {
        let definitions = hint_tool_definitions();
        for def in definitions.as_array().unwrap() {
            let name = def["function"]["name"].as_str().unwrap();
            // Every advertised tool parses (with minimal valid args).
            let args = match name {
                "propose_interval" => json!({"interval_ms": 1000, "reason": "r", "ttl_ms": 1000}),
                "propose_next_time" => {
                    json!({"at": "2025-01-01T00:00:00Z", "reason": "r", "ttl_ms": 1000})
                }
                "pause_until" => json!({"at": "2025-01-01T00:00:00Z", "reason": "r"}),
                _ => json!({}),
            };
            assert!(HintTool::parse(name, args).is_ok(), "tool {} must parse", name);
        }
        assert_eq!(definitions.as_array().unwrap().len(), 5);
    }

    #[test]
    fn test_args_schemas_generate() {
        // Verify the schemas can be generated
        let schema = schemars::schema_for!(ProposeIntervalArgs);
        assert!(schema.schema.object.is_some());

        let schema = schemars::schema_for!(ProposeNextTimeArgs);
        assert!(schema.schema.object.is_some());

        let schema = schemars::schema_for!(PauseUntilArgs);
        assert!(schema.schema.object.is_some());
    }
}
