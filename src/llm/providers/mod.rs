//! Provider implementations.
//!
//! One adapter per vendor. Each one owns request building, auth, and
//! error classification for its vendor, and makes exactly one network
//! call per invocation. Retries belong to the dispatcher.

pub mod bedrock;
pub mod deepseek;
pub mod gemini;
pub mod openai;
pub mod qwen;

// Retry utilities used by the dispatcher
pub mod retry;

pub use bedrock::BedrockProvider;
pub use deepseek::DeepSeekProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use qwen::QwenProvider;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::llm::traits::{ChatProvider, ModelConfig, ProviderError, ProviderKind};

/// Build the adapter for one backend configuration
pub async fn build_provider(config: &ModelConfig) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    let provider: Arc<dyn ChatProvider> = match config.provider {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(config)?),
        ProviderKind::Qwen => Arc::new(QwenProvider::new(config)?),
        ProviderKind::DeepSeek => Arc::new(DeepSeekProvider::new(config)?),
        ProviderKind::Claude => Arc::new(BedrockProvider::new(config).await?),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(config)?),
    };
    Ok(provider)
}

/// HTTP client honoring the backend's timeout and proxy settings
pub(crate) fn http_client(config: &ModelConfig) -> Result<reqwest::Client, ProviderError> {
    let provider = config.provider;
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.timeout.min(Duration::from_secs(10)));

    if let Some(proxy) = &config.proxy {
        if let Some(http) = &proxy.http {
            let proxy = reqwest::Proxy::http(http)
                .map_err(|e| ProviderError::configuration(provider, format!("invalid http proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        if let Some(https) = &proxy.https {
            let proxy = reqwest::Proxy::https(https)
                .map_err(|e| ProviderError::configuration(provider, format!("invalid https proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }
    }

    builder
        .build()
        .map_err(|e| ProviderError::configuration(provider, format!("failed to build HTTP client: {}", e)))
}

pub(crate) fn required<'a>(config: &'a ModelConfig, value: &'a Option<String>, field: &str) -> Result<&'a str, ProviderError> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ProviderError::configuration(config.provider, format!("{} is required", field)))
}

/// Send a request and turn any non-success status into a classified error
pub(crate) async fn send(provider: ProviderKind, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, &e))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let error = ProviderError::from_status(provider, status.as_u16(), &body, retry_after);
    tracing::debug!(provider = %provider, status = status.as_u16(), error_kind = error.kind_str(), "Vendor returned an error status");
    Err(error)
}

/// Send a request and decode the JSON body
pub(crate) async fn send_json(provider: ProviderKind, request: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
    let response = send(provider, request).await?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, &e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        ProviderError::protocol(
            provider,
            format!(
                "invalid JSON body: {} ({})",
                e,
                crate::utils::logging::truncate_string(&String::from_utf8_lossy(&bytes), 200)
            ),
        )
    })
}

/// `Retry-After` in seconds, or Azure's `retry-after-ms`
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
    };
    if let Some(ms) = header("retry-after-ms") {
        return Some(Duration::from_secs_f64(ms / 1000.0));
    }
    header(RETRY_AFTER.as_str()).map(Duration::from_secs_f64)
}
