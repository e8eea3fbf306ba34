// AI implementation using Anthropic Claude
//
// This is the infrastructure implementation of BaseAI.
// What to prompt for (endpoint analysis) lives in the ai_planner layer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rig::completion::Prompt;
use rig::providers::anthropic;

use super::traits::BaseAI;

const ANALYSIS_PREAMBLE: &str =
    "You are a scheduling analyst. You read HTTP endpoint run history and \
     propose cadence adjustments through the provided tools. Respond only \
     in the requested JSON envelope.";

/// Anthropic Claude implementation of AI capabilities
pub struct ClaudeClient {
    client: anthropic::Client,
}

impl ClaudeClient {
    pub fn new(api_key: String) -> Self {
        let client = anthropic::ClientBuilder::new(&api_key).build();
        Self { client }
    }
}

#[async_trait]
impl BaseAI for ClaudeClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let agent = self
            .client
            .agent(anthropic::CLAUDE_3_5_SONNET)
            .preamble(ANALYSIS_PREAMBLE)
            .max_tokens(4096)
            .build();

        let response = agent
            .prompt(prompt)
            .await
            .context("Failed to call Anthropic API")?;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires API key
    async fn test_complete() {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .expect("ANTHROPIC_API_KEY must be set for integration tests");

        let client = ClaudeClient::new(api_key);

        let response = client
            .complete("Say 'Hello, World!' and nothing else.")
            .await
            .expect("AI completion should succeed");

        assert!(response.contains("Hello"));
    }
}
