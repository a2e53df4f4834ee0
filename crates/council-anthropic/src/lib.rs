//! Anthropic Messages API adapter.
//!
//! Hand-rolls a `reqwest` client against the Messages API rather than
//! pulling in a third-party Anthropic SDK, for the same reason the crate
//! this is grounded on gives: an Anthropic-specific Rust SDK isn't mature
//! enough to depend on yet.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use council_core::error::ProviderError;
use council_core::provider::{retry, ProviderAdapter, ProviderPrompt, ProviderResponse};
use council_core::types::{CouncilMember, Role, TokenUsage};

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_API_VERSION: &str = "2023-06-01";
const HEALTH_PROBE_MAX_TOKENS: u32 = 1;
const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseBlock>,
    usage: Usage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicErrorEnvelope {
    error: AnthropicErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

/// An Anthropic Messages API [`ProviderAdapter`].
pub struct AnthropicAdapter {
    api_key: String,
    api_url: String,
    api_version: String,
    temperature: f32,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicAdapter")
            .field("api_key", &"[REDACTED]")
            .field("api_url", &self.api_url)
            .field("api_version", &self.api_version)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl AnthropicAdapter {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            http_client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    #[must_use]
    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// There is no system-role variant in [`Role`], so the returned system
    /// prompt is always `None`; kept as part of the return shape because
    /// Anthropic's request format carries `system` as a top-level field.
    fn build_messages(prompt: &ProviderPrompt) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut messages: Vec<AnthropicMessage> = prompt
            .context
            .iter()
            .map(|(role, content)| match role {
                Role::User => AnthropicMessage { role: "user".to_string(), content: content.clone() },
                Role::Assistant => AnthropicMessage { role: "assistant".to_string(), content: content.clone() },
            })
            .collect();
        messages.push(AnthropicMessage { role: "user".to_string(), content: prompt.query.clone() });
        (None, messages)
    }

    fn map_http_error(provider: &str, status: reqwest::StatusCode, retry_after: Option<&str>, body: &str) -> ProviderError {
        let parsed: Option<AnthropicErrorEnvelope> = serde_json::from_str(body).ok();
        let (error_type, message) = parsed
            .as_ref()
            .map(|e| (e.error.error_type.as_str(), e.error.message.as_str()))
            .unwrap_or(("unknown_error", body));
        let message = if message.trim().is_empty() { "unknown error".to_string() } else { message.to_string() };

        let retry_after_ms = retry_after.and_then(|v| retry::parse_retry_after(v, Utc::now())).map(|d| d.as_millis() as u64);

        match (status.as_u16(), error_type) {
            (429, _) | (_, "rate_limit_error") => {
                ProviderError::RateLimit { provider: provider.to_string(), message, retry_after_ms }
            }
            (401, _) | (403, _) | (_, "authentication_error") | (_, "permission_error") => {
                ProviderError::AuthError { provider: provider.to_string(), message }
            }
            (503, _) | (_, "overloaded_error") => {
                ProviderError::ServiceUnavailable { provider: provider.to_string(), message }
            }
            _ if status.is_server_error() => {
                ProviderError::ServiceUnavailable { provider: provider.to_string(), message }
            }
            _ => ProviderError::Unknown { provider: provider.to_string(), message },
        }
    }

    async fn call(&self, model: &str, max_tokens: u32, prompt: &ProviderPrompt) -> Result<AnthropicResponse, ProviderError> {
        let (system, messages) = Self::build_messages(prompt);
        let request =
            AnthropicRequest { model: model.to_string(), max_tokens, messages, temperature: self.temperature, system };

        let response = self
            .http_client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| retry::classify_message("anthropic", format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = response.headers().get("retry-after").and_then(|v| v.to_str().ok()).map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error("anthropic", status, retry_after.as_deref(), &body));
        }

        response
            .json::<AnthropicResponse>()
            .await
            .map_err(|e| ProviderError::Unknown { provider: "anthropic".to_string(), message: format!("failed to parse response: {e}") })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn send(&self, member: &CouncilMember, prompt: &ProviderPrompt) -> Result<ProviderResponse, ProviderError> {
        let start = Instant::now();
        let response = self.call(&member.model, 4096, prompt).await?;
        let content = response
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text),
                ResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(ProviderResponse {
            content,
            token_usage: TokenUsage { prompt: response.usage.input_tokens, completion: response.usage.output_tokens },
            latency: start.elapsed(),
        })
    }

    async fn health(&self) -> Result<Duration, ProviderError> {
        let start = Instant::now();
        let probe = ProviderPrompt { query: "ping".to_string(), context: vec![] };
        self.call("claude-3-5-haiku-latest", HEALTH_PROBE_MAX_TOKENS, &probe).await?;
        Ok(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_status_classifies_as_rate_limit() {
        let err = AnthropicAdapter::map_http_error(
            "anthropic",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some("2"),
            r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#,
        );
        match err {
            ProviderError::RateLimit { retry_after_ms, .. } => assert_eq!(retry_after_ms, Some(2000)),
            other => panic!("expected RateLimit, got {other:?}"),
        }
    }

    #[test]
    fn auth_error_type_classifies_as_auth_error_even_with_200_adjacent_status() {
        let err = AnthropicAdapter::map_http_error(
            "anthropic",
            reqwest::StatusCode::BAD_REQUEST,
            None,
            r#"{"type":"error","error":{"type":"authentication_error","message":"invalid key"}}"#,
        );
        assert!(matches!(err, ProviderError::AuthError { .. }));
    }

    #[test]
    fn server_error_without_recognized_type_classifies_as_service_unavailable() {
        let err = AnthropicAdapter::map_http_error("anthropic", reqwest::StatusCode::INTERNAL_SERVER_ERROR, None, "oops");
        assert!(matches!(err, ProviderError::ServiceUnavailable { .. }));
    }

    #[test]
    fn unparseable_body_falls_back_to_raw_text_as_message() {
        let err = AnthropicAdapter::map_http_error("anthropic", reqwest::StatusCode::NOT_FOUND, None, "not json");
        match err {
            ProviderError::Unknown { message, .. } => assert_eq!(message, "not json"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn build_messages_appends_query_as_final_user_turn() {
        let prompt = ProviderPrompt {
            query: "what next?".to_string(),
            context: vec![(Role::User, "hello".to_string()), (Role::Assistant, "hi there".to_string())],
        };
        let (_, messages) = AnthropicAdapter::build_messages(&prompt);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages.last().unwrap().content, "what next?");
        assert_eq!(messages.last().unwrap().role, "user");
    }
}
