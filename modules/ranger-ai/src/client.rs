use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use tracing::debug;

use crate::types::{ChatRequest, ChatResponse};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Error classification for the retry loop: transport failures and
/// 429/5xx responses are retryable, 4xx are not.
#[derive(Debug)]
pub(crate) enum CallError {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

pub(crate) struct ClaudeClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl ClaudeClient {
    pub fn new(api_key: &str, timeout: Duration) -> Self {
        Self {
            api_key: api_key.to_string(),
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build Anthropic HTTP client"),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key)?);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    pub async fn chat(&self, request: &ChatRequest) -> std::result::Result<ChatResponse, CallError> {
        let url = format!("{}/messages", self.base_url);

        debug!(model = %request.model, "Claude chat request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers().map_err(CallError::Fatal)?)
            .json(request)
            .send()
            .await
            .map_err(|e| CallError::Retryable(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let err = anyhow!("Claude API error ({status}): {error_text}");
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(CallError::Retryable(err))
            } else {
                Err(CallError::Fatal(err))
            };
        }

        response
            .json()
            .await
            .map_err(|e| CallError::Fatal(anyhow!("Malformed Claude response body: {e}")))
    }
}
