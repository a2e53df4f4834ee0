//! OpenAI chat completions adapter and embedding service.
//!
//! Wraps `async-openai`'s [`Client`] the way the crate this is grounded on
//! wraps it for its own chat model: a thin builder around
//! `Client<OpenAIConfig>`, translating the council's [`ProviderPrompt`]/
//! [`EmbeddingService`] seams into `CreateChatCompletionRequest` /
//! `CreateEmbeddingRequest` calls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    CreateEmbeddingRequestArgs, EmbeddingInput,
};
use async_openai::Client;
use async_trait::async_trait;

use council_core::embeddings::{EmbeddingError, EmbeddingService};
use council_core::error::ProviderError;
use council_core::provider::{retry, ProviderAdapter, ProviderPrompt, ProviderResponse};
use council_core::types::{CouncilMember, Role, TokenUsage};

const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const HEALTH_PROBE_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TEMPERATURE: f32 = 0.7;

fn classify_openai_error(provider: &str, err: OpenAIError) -> ProviderError {
    match err {
        OpenAIError::ApiError(api_err) => {
            let code = api_err.code.as_ref().map(ToString::to_string).unwrap_or_default();
            let kind = api_err.r#type.as_deref().unwrap_or("");
            let message = api_err.message;
            if code.contains("rate_limit") || kind.contains("rate_limit") {
                ProviderError::RateLimit { provider: provider.to_string(), message, retry_after_ms: None }
            } else if code.contains("invalid_api_key")
                || code.contains("insufficient_quota")
                || kind.contains("authentication")
                || kind.contains("permission")
            {
                ProviderError::AuthError { provider: provider.to_string(), message }
            } else if kind.contains("server_error") {
                ProviderError::ServiceUnavailable { provider: provider.to_string(), message }
            } else {
                ProviderError::Unknown { provider: provider.to_string(), message }
            }
        }
        OpenAIError::Reqwest(e) => retry::classify_message(provider, format!("request failed: {e}")),
        other => ProviderError::Unknown { provider: provider.to_string(), message: other.to_string() },
    }
}

fn to_request_message(role: &Role, content: &str) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    match role {
        Role::User => Ok(ChatCompletionRequestUserMessageArgs::default().content(content).build()?.into()),
        Role::Assistant => {
            Ok(ChatCompletionRequestAssistantMessageArgs::default().content(content).build()?.into())
        }
    }
}

fn build_messages(prompt: &ProviderPrompt) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    let mut messages = prompt
        .context
        .iter()
        .map(|(role, content)| to_request_message(role, content))
        .collect::<Result<Vec<_>, _>>()?;
    messages.push(to_request_message(&Role::User, &prompt.query)?);
    Ok(messages)
}

/// An OpenAI chat completions [`ProviderAdapter`].
pub struct OpenAIAdapter {
    client: Client<OpenAIConfig>,
    max_tokens: u32,
    temperature: f32,
}

impl std::fmt::Debug for OpenAIAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIAdapter")
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl OpenAIAdapter {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self { client: Client::with_config(config), max_tokens: 4096, temperature: DEFAULT_TEMPERATURE }
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        let config = self.client.config().clone().with_api_base(api_base);
        self.client = Client::with_config(config);
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    async fn call(
        &self,
        model: &str,
        max_tokens: u32,
        prompt: &ProviderPrompt,
    ) -> Result<(String, TokenUsage), ProviderError> {
        let messages = build_messages(prompt)
            .map_err(|e| ProviderError::Unknown { provider: "openai".to_string(), message: format!("failed to build request: {e}") })?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages)
            .max_tokens(max_tokens)
            .temperature(self.temperature)
            .build()
            .map_err(|e| ProviderError::Unknown { provider: "openai".to_string(), message: format!("failed to build request: {e}") })?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_openai_error("openai", e))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        let usage = response
            .usage
            .map(|u| TokenUsage { prompt: u.prompt_tokens, completion: u.completion_tokens })
            .unwrap_or(TokenUsage { prompt: 0, completion: 0 });

        Ok((content, usage))
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn send(&self, member: &CouncilMember, prompt: &ProviderPrompt) -> Result<ProviderResponse, ProviderError> {
        let start = Instant::now();
        let (content, token_usage) = self.call(&member.model, self.max_tokens, prompt).await?;
        Ok(ProviderResponse { content, token_usage, latency: start.elapsed() })
    }

    async fn health(&self) -> Result<Duration, ProviderError> {
        let start = Instant::now();
        let probe = ProviderPrompt { query: "ping".to_string(), context: vec![] };
        self.call(HEALTH_PROBE_MODEL, 1, &probe).await?;
        Ok(start.elapsed())
    }
}

/// An OpenAI embeddings [`EmbeddingService`], used by the iterative consensus
/// synthesizer's cosine-similarity comparisons.
pub struct OpenAIEmbeddingService {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAIEmbeddingService {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self { client: Arc::new(Client::with_config(config)), model: DEFAULT_EMBEDDING_MODEL.to_string() }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl EmbeddingService for OpenAIEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| EmbeddingError::RequestFailed(format!("failed to build request: {e}")))?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| EmbeddingError::RequestFailed(e.to_string()))?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::RequestFailed("empty embedding response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_messages_in_role_order_with_query_last() {
        let prompt = ProviderPrompt {
            query: "what next?".to_string(),
            context: vec![(Role::User, "hello".to_string()), (Role::Assistant, "hi there".to_string())],
        };
        let messages = build_messages(&prompt).unwrap();
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn rate_limit_code_classifies_as_rate_limit() {
        let err = OpenAIError::ApiError(async_openai::error::ApiError {
            message: "slow down".to_string(),
            r#type: Some("rate_limit_error".to_string()),
            param: None,
            code: Some(serde_json::Value::String("rate_limit_exceeded".to_string())),
        });
        assert!(matches!(classify_openai_error("openai", err), ProviderError::RateLimit { .. }));
    }

    #[test]
    fn invalid_api_key_code_classifies_as_auth_error() {
        let err = OpenAIError::ApiError(async_openai::error::ApiError {
            message: "bad key".to_string(),
            r#type: Some("invalid_request_error".to_string()),
            param: None,
            code: Some(serde_json::Value::String("invalid_api_key".to_string())),
        });
        assert!(matches!(classify_openai_error("openai", err), ProviderError::AuthError { .. }));
    }

    #[test]
    fn unrecognized_api_error_classifies_as_unknown() {
        let err = OpenAIError::ApiError(async_openai::error::ApiError {
            message: "bad request".to_string(),
            r#type: Some("invalid_request_error".to_string()),
            param: None,
            code: None,
        });
        assert!(matches!(classify_openai_error("openai", err), ProviderError::Unknown { .. }));
    }
}
