//! DeepSeek chat completions (OpenAI-compatible wire format).

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

use super::openai::chat_body;
use super::{http_client, required, send, send_json};
use crate::llm::normalize::{self, ChunkContext};
use crate::llm::sse;
use crate::llm::traits::{ChatProvider, ChatStream, ModelConfig, ProviderError, ProviderKind, Sampling};
use crate::types::{ChatRequest, ChatResponse};

/// Public DeepSeek endpoint
pub const DEFAULT_API_BASE: &str = "https://api.deepseek.com/v1";

const DEFAULTS: Sampling = Sampling {
    temperature: 1.0,
    max_tokens: 4096,
    top_p: 1.0,
};

/// DeepSeek chat completions (OpenAI-compatible wire format)
pub struct DeepSeekProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    config: ModelConfig,
}

impl DeepSeekProvider {
    /// Create a new DeepSeek adapter; requires `api_key`
    pub fn new(config: &ModelConfig) -> Result<Self, ProviderError> {
        let api_key = required(config, &config.api_key, "api_key")?.to_string();
        let base = config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
        Ok(Self {
            client: http_client(config)?,
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            config: config.clone(),
        })
    }

    /// Fully resolved chat-completions URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        chat_body(request, &self.config, DEFAULTS, stream)
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
    }
}

impl fmt::Debug for DeepSeekProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepSeekProvider")
            .field("endpoint", &self.endpoint)
            .field("backend", &self.config.label())
            .finish()
    }
}

#[async_trait]
impl ChatProvider for DeepSeekProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DeepSeek
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = self.build_body(request, false);
        let payload = send_json(ProviderKind::DeepSeek, self.post(&body)).await?;
        normalize::openai_response(ProviderKind::DeepSeek, &payload, self.config.vendor_model())
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
        let body = self.build_body(request, true);
        let response = send(ProviderKind::DeepSeek, self.post(&body)).await?;

        let ctx = ChunkContext::new("chatcmpl", self.config.vendor_model());
        Ok(normalize::normalize_stream(
            sse::from_response(ProviderKind::DeepSeek, response),
            move |payload| normalize::openai_chunk(ProviderKind::DeepSeek, &payload, &ctx),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    #[test]
    fn test_default_endpoint_and_override() {
        let config = ModelConfig::new(ProviderKind::DeepSeek, "deepseek-chat").with_api_key("sk-test");
        let provider = DeepSeekProvider::new(&config).unwrap();
        assert_eq!(provider.endpoint(), "https://api.deepseek.com/v1/chat/completions");

        let custom = config.with_api_base("http://localhost:9000/v1/");
        assert_eq!(
            DeepSeekProvider::new(&custom).unwrap().endpoint(),
            "http://localhost:9000/v1/chat/completions"
        );
    }

    #[test]
    fn test_body_uses_vendor_defaults() {
        let config = ModelConfig::new(ProviderKind::DeepSeek, "deepseek-chat").with_api_key("sk-test");
        let provider = DeepSeekProvider::new(&config).unwrap();
        let request = ChatRequest::new("deepseek-chat", vec![ChatMessage::user("hello")]);

        let body = provider.build_body(&request, true);
        assert_eq!(body["model"], "deepseek-chat");
        assert_eq!(body["temperature"], 1.0);
        assert_eq!(body["top_p"], 1.0);
        assert_eq!(body["stream"], true);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_missing_key() {
        let config = ModelConfig::new(ProviderKind::DeepSeek, "deepseek-chat");
        assert!(matches!(DeepSeekProvider::new(&config), Err(ProviderError::Configuration { .. })));
    }
}
