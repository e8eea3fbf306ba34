// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no scheduling logic.
// Scheduling decisions (what to fire, when) are domain functions that
// consume these traits.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::cron::CronError;

// =============================================================================
// Clock (Infrastructure - time source)
// =============================================================================

/// Time source for the workers.
///
/// Everything that schedules reads the clock through this trait so tests
/// can drive time with `FakeClock`.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

// =============================================================================
// Cron (Infrastructure - next-fire calculation)
// =============================================================================

/// Next-fire calculation for a standard 5-field cron expression in UTC.
pub trait Cron: Send + Sync {
    /// Returns the first fire time strictly after `from`.
    fn next(&self, expr: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, CronError>;
}

// =============================================================================
// Signing key lookup (Infrastructure)
// =============================================================================

/// Tenant-scoped lookup of raw HMAC key material for outbound signing.
#[async_trait]
pub trait SigningKeyProvider: Send + Sync {
    /// Returns the active signing secret for a tenant, if one exists.
    async fn get_key(&self, tenant_id: &str) -> Result<Option<String>>;
}

// =============================================================================
// Quota (Infrastructure - soft usage gating)
// =============================================================================

/// Soft usage gate for AI analysis.
///
/// Check-then-record: `can_proceed` may allow bursts between the check and
/// the matching `record_usage`. That is acceptable; do not add locks to
/// make it strict.
#[async_trait]
pub trait QuotaGuard: Send + Sync {
    async fn can_proceed(&self, tenant_id: &str) -> Result<bool>;

    async fn record_usage(&self, tenant_id: &str, tokens: i64) -> Result<()>;
}

// =============================================================================
// AI Trait (Infrastructure - Generic LLM capabilities)
// =============================================================================

#[async_trait]
pub trait BaseAI: Send + Sync {
    /// Complete a prompt with an LLM (returns raw text response)
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Complete a prompt expecting JSON response (returns raw JSON string)
    /// Parse with serde_json::from_str in calling code
    async fn complete_json(&self, prompt: &str) -> Result<String> {
        // Default implementation calls complete
        self.complete(prompt).await
    }

    /// Generate with tool calling support.
    ///
    /// `messages` is an OpenAI-style role/content transcript, `tools` a
    /// function-definition array. Returns the assistant turn as JSON; a
    /// `tool_calls` array is present when the model invoked tools.
    ///
    /// The default implementation renders the transcript and tool schemas
    /// into a single prompt and asks for a JSON tool-call envelope, so any
    /// text-completion provider supports the tool surface. Providers with
    /// native tool APIs can override.
    async fn generate_with_tools(&self, messages: &[Value], tools: &Value) -> Result<Value> {
        let prompt = render_tool_prompt(messages, tools);
        let raw = self.complete_json(&prompt).await?;
        Ok(parse_tool_envelope(&raw))
    }
}

/// Render a message transcript plus tool definitions into a single prompt
/// asking for a `{"tool_calls": [...]}` envelope.
pub fn render_tool_prompt(messages: &[Value], tools: &Value) -> String {
    let mut out = String::new();

    out.push_str("You can call the following tools. Respond with ONLY a JSON object of the form\n");
    out.push_str(
        r#"{"tool_calls": [{"id": "call_1", "function": {"name": "...", "arguments": {...}}}]}"#,
    );
    out.push_str("\nor {\"tool_calls\": []} if no tool applies.\n\nTools:\n");
    out.push_str(&tools.to_string());
    out.push_str("\n\nConversation:\n");

    for message in messages {
        let role = message
            .get("role")
            .and_then(|r| r.as_str())
            .unwrap_or("user");
        let content = message
            .get("content")
            .map(|c| match c.as_str() {
                Some(s) => s.to_string(),
                None => c.to_string(),
            })
            .unwrap_or_default();
        out.push_str(&format!("[{}] {}\n", role, content));
    }

    out
}

/// Parse a model response into a tool-call envelope.
///
/// Strips Markdown code fences; anything that does not parse as JSON is
/// returned as a plain `content` turn (the caller treats that as "no tool
/// calls").
pub fn parse_tool_envelope(raw: &str) -> Value {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed).trim();

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if value.is_object() => value,
        _ => json!({ "content": raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_envelope_plain_json() {
        let parsed = parse_tool_envelope(r#"{"tool_calls": []}"#);
        assert!(parsed["tool_calls"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_parse_tool_envelope_fenced() {
        let parsed = parse_tool_envelope(
            "```json\n{\"tool_calls\": [{\"id\": \"call_1\", \"function\": {\"name\": \"clear_hints\", \"arguments\": {}}}]}\n```",
        );
        assert_eq!(
            parsed["tool_calls"][0]["function"]["name"].as_str(),
            Some("clear_hints")
        );
    }

    #[test]
    fn test_parse_tool_envelope_prose_falls_back_to_content() {
        let parsed = parse_tool_envelope("The endpoint looks healthy to me.");
        assert!(parsed.get("tool_calls").is_none());
        assert!(parsed["content"].as_str().unwrap().contains("healthy"));
    }

    #[test]
    fn test_render_tool_prompt_includes_roles_and_tools() {
        let messages = vec![
            json!({"role": "system", "content": "You tune schedules."}),
            json!({"role": "user", "content": "Analyze endpoint."}),
        ];
        let tools = json!([{"type": "function", "function": {"name": "clear_hints"}}]);

        let prompt = render_tool_prompt(&messages, &tools);
        assert!(prompt.contains("[system] You tune schedules."));
        assert!(prompt.contains("[user] Analyze endpoint."));
        assert!(prompt.contains("clear_hints"));
    }
}
