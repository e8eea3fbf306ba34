//! AI planner worker - periodic endpoint analysis.
//!
//! ```text
//! AiPlannerWorker
//!     │
//!     ├─► find_due_for_analysis (failure streak or stale analysis)
//!     ├─► per endpoint:
//!     │       quota.can_proceed → skip when denied
//!     │       gather config + recent runs → prompt
//!     │       model tool loop (HintToolbox validates and writes)
//!     │       quota.record_usage
//!     │       mark_analyzed
//!     └─► sleep analysis_interval
//! ```
//!
//! One endpoint's failure never stops the sweep; analyses are isolated and
//! logged individually.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::tools::{hint_tool_definitions, HintTool, HintToolbox};
use crate::kernel::traits::{BaseAI, Clock, QuotaGuard};
use crate::scheduler::endpoint::Endpoint;
use crate::scheduler::run::Run;
use crate::scheduler::store::{EndpointStore, RunStore};

const ANALYSIS_SYSTEM_PROMPT: &str = r#"You tune the polling cadence of HTTP endpoints.

You receive one endpoint's configuration and its recent run history. Decide
whether the cadence should change and record your decision through the tools:
- propose_interval: recurring cadence change (clamped to the guardrails)
- propose_next_time: a single extra check at an absolute time
- pause_until: stop polling a clearly-down target for a while
- reset_failures: the endpoint has recovered
- clear_hints: return to the baseline cadence

Call at most the tools you need. If the current cadence is fine, call no tools."#;

/// Per-prompt cap on run-history entries and body excerpt size.
const RUN_BODY_EXCERPT_CHARS: usize = 400;

/// Rounds of tool calling per analysis.
const MAX_TOOL_ROUNDS: usize = 4;

/// Configuration for the AI planner worker.
#[derive(Debug, Clone)]
pub struct AiPlannerConfig {
    /// Sweep cadence.
    pub analysis_interval_ms: i64,
    /// Endpoints analyzed per sweep.
    pub batch_size: i64,
    /// Runs shown to the model per endpoint.
    pub run_window: i64,
    /// Failure streak that makes an endpoint eligible immediately.
    pub min_failures: i32,
    /// Age after which an endpoint is re-analyzed regardless of failures.
    pub reanalyze_after_ms: i64,
    /// Upper bound on hint TTLs written through the toolbox.
    pub max_hint_ttl_ms: i64,
}

impl Default for AiPlannerConfig {
    fn default() -> Self {
        Self {
            analysis_interval_ms: 60_000,
            batch_size: 10,
            run_window: 10,
            min_failures: 2,
            reanalyze_after_ms: 3_600_000,
            max_hint_ttl_ms: 86_400_000,
        }
    }
}

/// Periodic analysis loop. Writes hints through the store; never touches
/// `next_run_at`.
pub struct AiPlannerWorker {
    endpoints: Arc<dyn EndpointStore>,
    runs: Arc<dyn RunStore>,
    ai: Arc<dyn BaseAI>,
    quota: Arc<dyn QuotaGuard>,
    clock: Arc<dyn Clock>,
    config: AiPlannerConfig,
}

impl AiPlannerWorker {
    pub fn new(
        endpoints: Arc<dyn EndpointStore>,
        runs: Arc<dyn RunStore>,
        ai: Arc<dyn BaseAI>,
        quota: Arc<dyn QuotaGuard>,
        clock: Arc<dyn Clock>,
        config: AiPlannerConfig,
    ) -> Self {
        Self {
            endpoints,
            runs,
            ai,
            quota,
            clock,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            analysis_interval_ms = self.config.analysis_interval_ms,
            min_failures = self.config.min_failures,
            "ai planner worker starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self
                    .clock
                    .sleep(Duration::from_millis(self.config.analysis_interval_ms.max(1) as u64)) => {}
            }

            let due = match self
                .endpoints
                .find_due_for_analysis(
                    self.config.batch_size,
                    self.config.min_failures,
                    self.config.reanalyze_after_ms,
                )
                .await
            {
                Ok(due) => due,
                Err(e) => {
                    error!(error = %e, "failed to find endpoints for analysis");
                    continue;
                }
            };

            if due.is_empty() {
                continue;
            }

            debug!(count = due.len(), "analyzing endpoints");

            for endpoint in due {
                let endpoint_id = endpoint.id;
                if let Err(e) = self.analyze_endpoint(&endpoint).await {
                    warn!(endpoint_id = %endpoint_id, error = %e, "endpoint analysis failed");
                }
            }
        }

        info!("ai planner worker stopped");
    }

    /// Analyze one endpoint: quota gate, context, tool loop, usage, cursor.
    pub async fn analyze_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let now = self.clock.now();

        match self.quota.can_proceed(&endpoint.tenant_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    endpoint_id = %endpoint.id,
                    tenant_id = %endpoint.tenant_id,
                    "analysis skipped, quota denied"
                );
                return Ok(());
            }
            Err(e) => return Err(e).context("quota check failed"),
        }

        let recent = self
            .runs
            .recent_for_endpoint(endpoint.id, self.config.run_window)
            .await
            .context("failed to load run history")?;

        let tools = hint_tool_definitions();
        let mut messages = vec![
            json!({"role": "system", "content": ANALYSIS_SYSTEM_PROMPT}),
            json!({"role": "user", "content": build_analysis_context(endpoint, &recent, now)}),
        ];

        let toolbox = HintToolbox::new(
            self.endpoints.as_ref(),
            endpoint,
            now,
            self.config.max_hint_ttl_ms,
        );

        let mut token_estimate: i64 = 0;

        for round in 0..MAX_TOOL_ROUNDS {
            let response = self
                .ai
                .generate_with_tools(&messages, &tools)
                .await
                .context("model call failed")?;

            token_estimate += estimate_tokens(&messages, &response);

            let Some(tool_calls) = response
                .get("tool_calls")
                .and_then(|t| t.as_array())
                .filter(|calls| !calls.is_empty())
                .cloned()
            else {
                break;
            };

            let mut tool_results = Vec::with_capacity(tool_calls.len());
            for tool_call in &tool_calls {
                let function = &tool_call["function"];
                let name = function["name"].as_str().unwrap_or("");
                // Arguments may arrive as an object or a JSON-encoded string.
                let args = match &function["arguments"] {
                    Value::String(s) => serde_json::from_str(s).unwrap_or(json!({})),
                    other => other.clone(),
                };
                let tool_call_id = tool_call["id"].as_str().unwrap_or("");

                debug!(
                    endpoint_id = %endpoint.id,
                    round = round,
                    tool = name,
                    "applying tool call"
                );

                let content = match HintTool::parse(name, args) {
                    Ok(tool) => match toolbox.apply(tool).await {
                        Ok(confirmation) => confirmation,
                        Err(e) => format!("Rejected: {}", e),
                    },
                    Err(e) => format!("Rejected: {}", e),
                };

                tool_results.push(json!({
                    "role": "tool",
                    "content": content,
                    "tool_call_id": tool_call_id,
                }));
            }

            messages.push(json!({"role": "assistant", "tool_calls": tool_calls}));
            messages.extend(tool_results);
        }

        if let Err(e) = self
            .quota
            .record_usage(&endpoint.tenant_id, token_estimate)
            .await
        {
            warn!(tenant_id = %endpoint.tenant_id, error = %e, "failed to record usage");
        }

        self.endpoints
            .mark_analyzed(endpoint.id, now)
            .await
            .context("failed to mark endpoint analyzed")?;

        Ok(())
    }
}

/// Render the endpoint configuration and run history for the model.
fn build_analysis_context(endpoint: &Endpoint, runs: &[Run], now: chrono::DateTime<chrono::Utc>) -> String {
    let mut out = String::new();

    out.push_str(&format!("Endpoint: {}\n", endpoint.name));
    out.push_str(&format!("URL: {} {:?}\n", endpoint.url, endpoint.method));
    if let Some(description) = &endpoint.description {
        out.push_str(&format!("Description: {}\n", description));
    }
    if let Some(schema) = &endpoint.body_schema_json {
        out.push_str(&format!("Response body schema: {}\n", schema));
    }

    match (&endpoint.baseline_cron, endpoint.baseline_interval_ms) {
        (Some(expr), _) => out.push_str(&format!("Baseline cadence: cron `{}` (UTC)\n", expr)),
        (None, Some(ms)) => out.push_str(&format!("Baseline cadence: every {}ms\n", ms)),
        (None, None) => out.push_str("Baseline cadence: every 60000ms (default)\n"),
    }
    if let Some(min) = endpoint.min_interval_ms {
        out.push_str(&format!("Guardrail: min interval {}ms\n", min));
    }
    if let Some(max) = endpoint.max_interval_ms {
        out.push_str(&format!("Guardrail: max interval {}ms\n", max));
    }
    out.push_str(&format!("Consecutive failures: {}\n", endpoint.failure_count));
    if endpoint.has_fresh_hint(now) {
        out.push_str(&format!(
            "Active hint: interval={:?} one_shot={:?} reason={:?} expires={:?}\n",
            endpoint.ai_hint_interval_ms,
            endpoint.ai_hint_next_run_at,
            endpoint.ai_hint_reason,
            endpoint.ai_hint_expires_at,
        ));
    }

    out.push_str(&format!("\nRecent runs (newest first, {} shown):\n", runs.len()));
    for run in runs {
        let body = run
            .response_body
            .as_deref()
            .map(|b| excerpt(b, RUN_BODY_EXCERPT_CHARS))
            .unwrap_or_default();
        out.push_str(&format!(
            "- {} status={:?} code={:?} duration={:?}ms attempt={} error={:?} body={}\n",
            run.started_at,
            run.status,
            run.status_code,
            run.duration_ms,
            run.attempt,
            run.error_message,
            body,
        ));
    }
    if runs.is_empty() {
        out.push_str("- (no runs recorded yet)\n");
    }

    out
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut)
}

/// Rough chars-per-token estimate over the transcript and response.
fn estimate_tokens(messages: &[Value], response: &Value) -> i64 {
    let prompt_chars: usize = messages.iter().map(|m| m.to_string().len()).sum();
    let response_chars = response.to_string().len();
    ((prompt_chars + response_chars) / 4) as i64
}
