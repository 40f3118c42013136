use std::sync::Arc;

use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;

use crate::config::CompletionConfig;
use crate::error::{RelayError, Result};
use crate::http::RetryingClient;
use crate::types::{CompletionRequest, CompletionResult};

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug)]
pub struct CompletionClient {
    http: Arc<RetryingClient>,
    config: CompletionConfig,
}

impl CompletionClient {
    pub fn new(http: Arc<RetryingClient>, config: CompletionConfig) -> Self {
        Self { http, config }
    }

    /// Whether an API key is configured. Without one every request fails.
    pub fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// Ask the model for a reply to `prompt`. Never fails: errors are folded
    /// into [`CompletionResult::Failure`].
    pub async fn complete(&self, prompt: &str) -> CompletionResult {
        match self.request(prompt).await {
            Ok(text) => CompletionResult::Success(text),
            Err(e) => {
                warn!("Completion request failed: {e}");
                CompletionResult::Failure {
                    kind: e.kind(),
                    detail: e.to_string(),
                }
            }
        }
    }

    async fn request(&self, prompt: &str) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| RelayError::Config("DEEPSEEK_API_KEY is not set".to_string()))?;

        let request = CompletionRequest::new(
            &self.config.model,
            self.config.system_prompt.as_deref(),
            prompt,
            self.config.temperature,
        );
        debug!(
            "Sending {} character prompt to model {}",
            prompt.chars().count(),
            request.model
        );

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| RelayError::Config(format!("invalid DEEPSEEK_API_KEY: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);

        let response = self
            .http
            .post(&self.config.api_url, headers, &request)
            .await?;
        if response.status != StatusCode::OK {
            return Err(RelayError::Upstream {
                status: response.status,
                message: response.body,
            });
        }

        extract_reply(&response.body)
    }
}

/// Pull `choices[0].message.content` out of a completion response body.
fn extract_reply(body: &str) -> Result<String> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| RelayError::ResponseShape(format!("invalid completion body: {e}")))?;

    let content = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| RelayError::ResponseShape("No choices in response".to_string()))?
        .message
        .content
        .ok_or_else(|| RelayError::ResponseShape("First choice has no content".to_string()))?;

    debug!("Received {} character reply", content.chars().count());
    Ok(content)
}
