//! Alibaba DashScope text-generation API.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;

use super::{http_client, required, send, send_json};
use crate::llm::normalize::{self, ChunkContext};
use crate::llm::sse;
use crate::llm::traits::{ChatProvider, ChatStream, ModelConfig, ProviderError, ProviderKind, Sampling};
use crate::types::{ChatRequest, ChatResponse};

pub const DEFAULT_API_BASE: &str = "https://dashscope.aliyuncs.com/api/v1";

const DEFAULTS: Sampling = Sampling {
    temperature: 0.7,
    max_tokens: 2000,
    top_p: 0.8,
};

/// Qwen through the DashScope text-generation API
pub struct QwenProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    config: ModelConfig,
}

impl QwenProvider {
    /// Create a new Qwen adapter; requires `api_key`
    pub fn new(config: &ModelConfig) -> Result<Self, ProviderError> {
        let api_key = required(config, &config.api_key, "api_key")?.to_string();
        let base = config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
        Ok(Self {
            client: http_client(config)?,
            endpoint: format!("{}/services/aigc/text-generation/generation", base.trim_end_matches('/')),
            api_key,
            config: config.clone(),
        })
    }

    /// Fully resolved generation URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let sampling = self.config.sampling(request, DEFAULTS);
        let mut parameters = json!({
            "temperature": sampling.temperature,
            "max_tokens": sampling.max_tokens,
            "top_p": sampling.top_p,
            // message format carries tool calls; the text format does not
            "result_format": "message",
        });
        if stream {
            parameters["incremental_output"] = json!(true);
        }
        if !request.stop.is_empty() {
            parameters["stop"] = json!(request.stop);
        }
        if !request.tools.is_empty() {
            parameters["tools"] = json!(request.tools);
        }
        if let Some(choice) = &request.tool_choice {
            parameters["tool_choice"] = json!(choice);
        }
        if let Some(format) = &request.response_format {
            parameters["response_format"] = json!(format);
        }

        json!({
            "model": self.config.vendor_model(),
            "input": { "messages": request.messages },
            "parameters": parameters,
        })
    }

    fn post(&self, body: &Value, stream: bool) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body);
        if stream {
            builder.header("X-DashScope-SSE", "enable")
        } else {
            builder
        }
    }
}

impl fmt::Debug for QwenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QwenProvider")
            .field("endpoint", &self.endpoint)
            .field("backend", &self.config.label())
            .finish()
    }
}

#[async_trait]
impl ChatProvider for QwenProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Qwen
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = self.build_body(request, false);
        let payload = send_json(ProviderKind::Qwen, self.post(&body, false)).await?;
        normalize::qwen_response(&payload, self.config.vendor_model())
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
        let body = self.build_body(request, true);
        let response = send(ProviderKind::Qwen, self.post(&body, true)).await?;

        let ctx = ChunkContext::new("qwen", self.config.vendor_model());
        Ok(normalize::normalize_stream(
            sse::from_response(ProviderKind::Qwen, response),
            move |payload| normalize::qwen_chunk(&payload, &ctx),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn provider() -> QwenProvider {
        let config = ModelConfig::new(ProviderKind::Qwen, "qwen-turbo").with_api_key("dash-key");
        QwenProvider::new(&config).unwrap()
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            provider().endpoint(),
            "https://dashscope.aliyuncs.com/api/v1/services/aigc/text-generation/generation"
        );
    }

    #[test]
    fn test_body_shape_and_defaults() {
        let request = ChatRequest::new(
            "qwen-turbo",
            vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
        );
        let body = provider().build_body(&request, false);

        assert_eq!(body["model"], "qwen-turbo");
        assert_eq!(body["input"]["messages"][0]["role"], "system");
        assert_eq!(body["input"]["messages"][1]["content"], "hi");
        assert_eq!(body["parameters"]["temperature"].as_f64().unwrap() as f32, 0.7);
        assert_eq!(body["parameters"]["max_tokens"], 2000);
        assert_eq!(body["parameters"]["top_p"].as_f64().unwrap() as f32, 0.8);
        assert_eq!(body["parameters"]["result_format"], "message");
        assert!(body["parameters"].get("incremental_output").is_none());
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_streaming_body_is_incremental() {
        let request = ChatRequest::new("qwen-turbo", vec![ChatMessage::user("hi")])
            .with_temperature(0.1)
            .with_max_tokens(32);
        let body = provider().build_body(&request, true);
        assert_eq!(body["parameters"]["incremental_output"], true);
        assert_eq!(body["parameters"]["max_tokens"], 32);
        assert_eq!(body["parameters"]["temperature"].as_f64().unwrap() as f32, 0.1);
    }
}
