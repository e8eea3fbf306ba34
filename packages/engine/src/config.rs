use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub anthropic_api_key: Option<String>,
    pub worker_id: Option<String>,
    pub tick_interval_ms: i64,
    pub batch_size: i64,
    pub lock_ttl_ms: i64,
    pub zombie_threshold_ms: i64,
    pub default_timeout_ms: i64,
    pub max_response_size_kb: i64,
    pub signing_required: bool,
    pub allow_private_urls: bool,
    pub ai_planner_interval_ms: i64,
    pub ai_max_hint_ttl_ms: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").ok(),
            worker_id: env::var("WORKER_ID").ok(),
            tick_interval_ms: env_i64("TICK_INTERVAL_MS", 1_000)?,
            batch_size: env_i64("BATCH_SIZE", 10)?,
            lock_ttl_ms: env_i64("LOCK_TTL_MS", 60_000)?,
            zombie_threshold_ms: env_i64("ZOMBIE_THRESHOLD_MS", 300_000)?,
            default_timeout_ms: env_i64("DEFAULT_TIMEOUT_MS", 30_000)?,
            max_response_size_kb: env_i64("MAX_RESPONSE_SIZE_KB", 100)?,
            signing_required: env_bool("SIGNING_REQUIRED", false)?,
            allow_private_urls: env_bool("ALLOW_PRIVATE_URLS", false)?,
            ai_planner_interval_ms: env_i64("AI_PLANNER_INTERVAL_MS", 60_000)?,
            ai_max_hint_ttl_ms: env_i64("AI_MAX_HINT_TTL_MS", 86_400_000)?,
        })
    }
}

fn env_i64(key: &str, default: i64) -> Result<i64> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a valid integer", key)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => anyhow::bail!("{} must be a boolean, got `{}`", key, other),
        },
        Err(_) => Ok(default),
    }
}
