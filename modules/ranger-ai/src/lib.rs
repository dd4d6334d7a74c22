//! Minimal Anthropic Messages client for structured extraction.
//!
//! One capability: force the model through a single tool whose input schema
//! is derived from a Rust type, and deserialize the tool input back into
//! that type. Calls are bounded by a timeout and a fixed retry budget;
//! retries reuse the identical prompt.

mod client;
mod types;

use std::time::Duration;

use anyhow::{anyhow, Result};
use schemars::{gen::SchemaGenerator, JsonSchema};
use serde::de::DeserializeOwned;
use tracing::warn;

use client::{CallError, ClaudeClient};
use types::{ChatRequest, ToolDefinitionWire, WireMessage};

const STRUCTURED_TOOL: &str = "structured_response";

#[derive(Clone)]
pub struct Claude {
    api_key: String,
    model: String,
    base_url: Option<String>,
    timeout: Duration,
    /// Retries of the same prompt after the first attempt.
    max_retries: u32,
}

impl Claude {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
            timeout: Duration::from_secs(30),
            max_retries: 2,
        }
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key, model))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn client(&self) -> ClaudeClient {
        let client = ClaudeClient::new(&self.api_key, self.timeout);
        match &self.base_url {
            Some(url) => client.with_base_url(url),
            None => client,
        }
    }

    /// Extract a `T` from the prompt via forced tool use.
    ///
    /// The model must call the structured-output tool; its input is
    /// deserialized into `T`. Transport errors, 429/5xx, and missing tool
    /// calls are retried up to the retry budget with the same prompt;
    /// 4xx responses fail immediately.
    pub async fn extract<T: JsonSchema + DeserializeOwned>(
        &self,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Result<T> {
        let schema = SchemaGenerator::default().into_root_schema_for::<T>();
        let schema = serde_json::to_value(schema)?;

        let request = ChatRequest::new(&self.model)
            .system(system_prompt)
            .message(WireMessage::user(user_prompt))
            .temperature(0.0)
            .forced_tool(ToolDefinitionWire {
                name: STRUCTURED_TOOL.to_string(),
                description: "Report the structured data extracted from the input.".to_string(),
                input_schema: schema,
            });

        let client = self.client();
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=self.max_retries {
            match client.chat(&request).await {
                Ok(response) => match response.tool_input(STRUCTURED_TOOL) {
                    Some(input) => {
                        return serde_json::from_value(input.clone())
                            .map_err(|e| anyhow!("Failed to deserialize structured output: {e}"));
                    }
                    None => {
                        warn!(attempt, model = %self.model, "No structured output in response");
                        last_err = Some(anyhow!("No structured output in Claude response"));
                    }
                },
                Err(CallError::Retryable(e)) => {
                    warn!(attempt, model = %self.model, error = %e, "Retryable Claude error");
                    last_err = Some(e);
                }
                Err(CallError::Fatal(e)) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Claude extraction failed")))
    }
}
