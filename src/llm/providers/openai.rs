//! Azure-hosted OpenAI chat completions.
//!
//! Also home of the OpenAI-compatible body builder shared with DeepSeek.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;

use super::{http_client, required, send, send_json};
use crate::llm::normalize::{self, ChunkContext};
use crate::llm::sse;
use crate::llm::traits::{ChatProvider, ChatStream, ModelConfig, ProviderError, ProviderKind, Sampling};
use crate::types::{ChatRequest, ChatResponse};

/// Azure API version used when the backend config does not name one
pub const DEFAULT_API_VERSION: &str = "2024-02-01";

const DEFAULTS: Sampling = Sampling {
    temperature: 1.0,
    max_tokens: 4096,
    top_p: 1.0,
};

/// Azure-hosted OpenAI deployment
pub struct OpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    config: ModelConfig,
}

impl OpenAiProvider {
    /// Create a new Azure OpenAI adapter; requires `api_key` and `api_base`
    pub fn new(config: &ModelConfig) -> Result<Self, ProviderError> {
        let api_key = required(config, &config.api_key, "api_key")?.to_string();
        let base = required(config, &config.api_base, "api_base")?;
        let version = config.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION);
        let endpoint = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            base.trim_end_matches('/'),
            config.vendor_model(),
            version
        );
        url::Url::parse(&endpoint)
            .map_err(|e| ProviderError::configuration(ProviderKind::OpenAi, format!("invalid endpoint: {}", e)))?;

        Ok(Self {
            client: http_client(config)?,
            endpoint,
            api_key,
            config: config.clone(),
        })
    }

    /// Deployment URL including the `api-version` query
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = chat_body(request, &self.config, DEFAULTS, stream);
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }
}

impl fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("endpoint", &self.endpoint)
            .field("backend", &self.config.label())
            .finish()
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = self.build_body(request, false);
        tracing::debug!(backend = %self.config.label(), "Azure OpenAI chat completion");
        let payload = send_json(
            ProviderKind::OpenAi,
            self.client.post(&self.endpoint).header("api-key", &self.api_key).json(&body),
        )
        .await?;
        normalize::openai_response(ProviderKind::OpenAi, &payload, self.config.vendor_model())
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
        let body = self.build_body(request, true);
        tracing::debug!(backend = %self.config.label(), "Azure OpenAI streaming chat completion");
        let response = send(
            ProviderKind::OpenAi,
            self.client.post(&self.endpoint).header("api-key", &self.api_key).json(&body),
        )
        .await?;

        let ctx = ChunkContext::new("chatcmpl", self.config.vendor_model());
        Ok(normalize::normalize_stream(
            sse::from_response(ProviderKind::OpenAi, response),
            move |payload| normalize::openai_chunk(ProviderKind::OpenAi, &payload, &ctx),
        ))
    }
}

/// OpenAI-style request body. `max_tokens` is only sent when the request
/// or the backend config sets it; the vendor picks otherwise.
pub(crate) fn chat_body(request: &ChatRequest, config: &ModelConfig, defaults: Sampling, stream: bool) -> Value {
    let sampling = config.sampling(request, defaults);
    let mut body = json!({
        "model": config.vendor_model(),
        "messages": request.messages,
        "temperature": sampling.temperature,
        "top_p": sampling.top_p,
        "stream": stream,
    });

    if let Some(max_tokens) = request.max_tokens.or(config.max_tokens) {
        body["max_tokens"] = json!(max_tokens);
    }
    if !request.stop.is_empty() {
        body["stop"] = json!(request.stop);
    }
    if !request.tools.is_empty() {
        body["tools"] = json!(request.tools);
    }
    if let Some(choice) = &request.tool_choice {
        body["tool_choice"] = json!(choice);
    }
    if let Some(format) = &request.response_format {
        body["response_format"] = json!(format);
    }
    body
}
