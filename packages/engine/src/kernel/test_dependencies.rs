// Test dependencies - mock implementations of the kernel ports.
//
// These back the in-memory store tests and the worker integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::cron::CronError;
use super::traits::{BaseAI, Clock, Cron, QuotaGuard, SigningKeyProvider};

// =============================================================================
// Fake Clock
// =============================================================================

/// Manually advanced clock. `sleep` advances the clock instead of waiting,
/// so worker loops run through simulated time instantly.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(chrono::Duration::milliseconds(duration.as_millis() as i64));
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Fake Cron
// =============================================================================

/// Cron that fires a fixed delta after `from`, regardless of expression.
#[derive(Debug, Clone, Copy)]
pub struct FakeCron {
    pub delta_ms: i64,
}

impl FakeCron {
    pub fn new(delta_ms: i64) -> Self {
        Self { delta_ms }
    }
}

impl Cron for FakeCron {
    fn next(&self, _expr: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        Ok(from + chrono::Duration::milliseconds(self.delta_ms))
    }
}

// =============================================================================
// Static signing keys
// =============================================================================

/// Fixed tenant -> secret map.
#[derive(Default, Clone)]
pub struct StaticSigningKeys {
    keys: HashMap<String, String>,
}

impl StaticSigningKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, tenant_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.keys.insert(tenant_id.into(), secret.into());
        self
    }
}

#[async_trait]
impl SigningKeyProvider for StaticSigningKeys {
    async fn get_key(&self, tenant_id: &str) -> Result<Option<String>> {
        Ok(self.keys.get(tenant_id).cloned())
    }
}

// =============================================================================
// Mock quota
// =============================================================================

/// Scriptable quota gate that records usage for assertions.
pub struct MockQuota {
    allow: Arc<Mutex<bool>>,
    usage: Arc<Mutex<Vec<(String, i64)>>>,
}

impl MockQuota {
    pub fn allowing() -> Self {
        Self {
            allow: Arc::new(Mutex::new(true)),
            usage: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn denying() -> Self {
        let quota = Self::allowing();
        *quota.allow.lock().unwrap() = false;
        quota
    }

    pub fn set_allow(&self, allow: bool) {
        *self.allow.lock().unwrap() = allow;
    }

    /// All (tenant, tokens) pairs recorded so far.
    pub fn usage(&self) -> Vec<(String, i64)> {
        self.usage.lock().unwrap().clone()
    }
}

#[async_trait]
impl QuotaGuard for MockQuota {
    async fn can_proceed(&self, _tenant_id: &str) -> Result<bool> {
        Ok(*self.allow.lock().unwrap())
    }

    async fn record_usage(&self, tenant_id: &str, tokens: i64) -> Result<()> {
        self.usage
            .lock()
            .unwrap()
            .push((tenant_id.to_string(), tokens));
        Ok(())
    }
}

// =============================================================================
// Mock AI (Generic LLM capabilities)
// =============================================================================

/// Queue-scripted AI client that records every prompt it receives.
pub struct MockAI {
    responses: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockAI {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a text response to the queue
    pub fn with_response(self, response: impl Into<String>) -> Self {
        self.responses.lock().unwrap().push(response.into());
        self
    }

    /// Add a JSON response to the queue (will be serialized)
    pub fn with_json_response<T: serde::Serialize>(self, data: &T) -> Self {
        let json = serde_json::to_string(data).expect("Failed to serialize mock response");
        self.responses.lock().unwrap().push(json);
        self
    }

    /// Get all prompts that were sent to the AI
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Get the last prompt sent to the AI
    pub fn last_prompt(&self) -> Option<String> {
        self.calls.lock().unwrap().last().cloned()
    }

    /// Check if a prompt containing the given text was sent
    pub fn was_called_with(&self, text: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|p| p.contains(text))
    }
}

impl Default for MockAI {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseAI for MockAI {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.lock().unwrap().push(prompt.to_string());

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            // Out of scripted responses: behave like a model with nothing
            // further to propose.
            return Ok(r#"{"tool_calls": []}"#.to_string());
        }
        Ok(responses.remove(0))
    }
}
