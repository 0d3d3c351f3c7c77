//! Provider capability contract, backend descriptors and error classification.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::ConfigError;
use crate::types::{ChatRequest, ChatResponse, StreamChunk};
use crate::utils::logging::obscure_credential;

/// Lazy, finite sequence of canonical chunks produced by one streaming call.
///
/// Dropping the stream releases the underlying connection.
pub type ChatStream = BoxStream<'static, Result<StreamChunk, ProviderError>>;

/// Capability contract implemented once per vendor.
///
/// Implementations issue exactly one network call (or open one streaming
/// connection) per invocation and never retry internally.
#[async_trait]
pub trait ChatProvider: Send + Sync + fmt::Debug {
    /// Vendor this adapter speaks to
    fn kind(&self) -> ProviderKind;

    /// Run a complete (non-streaming) chat completion
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Open a streaming chat completion
    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError>;
}

/// Supported vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI models hosted on Azure
    OpenAi,
    /// Alibaba DashScope
    Qwen,
    DeepSeek,
    /// Anthropic Claude via AWS Bedrock
    Claude,
    /// Google Gemini (AI Studio or Vertex)
    Gemini,
}

impl ProviderKind {
    /// Every supported vendor, in reporting order
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::OpenAi,
        ProviderKind::Qwen,
        ProviderKind::DeepSeek,
        ProviderKind::Claude,
        ProviderKind::Gemini,
    ];

    /// Get string representation of provider kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Qwen => "qwen",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| ConfigError::Validation(format!("unknown provider '{}'", s)))
    }
}

/// HTTP(S) proxy settings for one backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy for plain HTTP
    #[serde(default, alias = "http_proxy", skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    /// Proxy for HTTPS
    #[serde(default, alias = "https_proxy", skip_serializing_if = "Option::is_none")]
    pub https: Option<String>,
}

impl ProxyConfig {
    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for proxy in [&self.http, &self.https].into_iter().flatten() {
            url::Url::parse(proxy)
                .map_err(|e| ConfigError::Validation(format!("invalid proxy url '{}': {}", proxy, e)))?;
        }
        Ok(())
    }
}

/// Immutable descriptor of one backend binding.
///
/// Several configs may share a logical `model_name`; each becomes one
/// instance in that model's pool.
#[derive(Clone, PartialEq)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    /// Caller-facing name selecting the pool
    pub model_name: String,
    /// Vendor model id or Azure deployment; defaults to `model_name`
    pub model_id: Option<String>,
    /// API key, bearer token, or AWS access key id for Claude
    pub api_key: Option<String>,
    /// AWS secret access key for Claude
    pub api_secret: Option<String>,
    /// Endpoint override; required for Azure
    pub api_base: Option<String>,
    /// Azure API version
    pub api_version: Option<String>,
    /// AWS region for Claude
    pub region: Option<String>,
    pub project_id: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    /// Per-call timeout
    pub timeout: Duration,
    /// Retries after the first attempt before failing over
    pub max_retries: u32,
    pub proxy: Option<ProxyConfig>,
}

impl ModelConfig {
    /// Per-call timeout when the config sets none
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Create a new config with default timeout and retries and no credentials
    pub fn new<S: Into<String>>(provider: ProviderKind, model_name: S) -> Self {
        Self {
            provider,
            model_name: model_name.into(),
            model_id: None,
            api_key: None,
            api_secret: None,
            api_base: None,
            api_version: None,
            region: None,
            project_id: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            timeout: Self::DEFAULT_TIMEOUT,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            proxy: None,
        }
    }

    /// API key, or the AWS access key id for Bedrock
    pub fn with_api_key<S: Into<String>>(mut self, api_key: S) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// AWS secret access key (Bedrock only)
    pub fn with_api_secret<S: Into<String>>(mut self, api_secret: S) -> Self {
        self.api_secret = Some(api_secret.into());
        self
    }

    pub fn with_api_base<S: Into<String>>(mut self, api_base: S) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    /// Vendor model id or deployment, when it differs from the logical name
    pub fn with_model_id<S: Into<String>>(mut self, model_id: S) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
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

    /// Model identifier sent to the vendor
    pub fn vendor_model(&self) -> &str {
        self.model_id.as_deref().unwrap_or(&self.model_name)
    }

    /// Request overrides first, then this config, then the vendor defaults
    pub fn sampling(&self, request: &ChatRequest, defaults: Sampling) -> Sampling {
        Sampling {
            temperature: request
                .temperature
                .or(self.temperature)
                .unwrap_or(defaults.temperature),
            max_tokens: request
                .max_tokens
                .or(self.max_tokens)
                .unwrap_or(defaults.max_tokens),
            top_p: request.top_p.or(self.top_p).unwrap_or(defaults.top_p),
        }
    }

    /// Short label used in logs and status output, never containing secrets
    pub fn label(&self) -> String {
        match &self.api_key {
            Some(key) => format!("{}:{}[{}]", self.provider, self.vendor_model(), obscure_credential(key)),
            None => format!("{}:{}", self.provider, self.vendor_model()),
        }
    }

    /// Reject values no adapter could use: empty names, zero timeouts,
    /// out-of-range sampling, bad proxy URLs and missing vendor fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::Validation("model_name cannot be empty".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Validation(format!(
                "{}: timeout must be greater than 0",
                self.label()
            )));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::Validation(format!(
                    "{}: temperature must be between 0.0 and 2.0",
                    self.label()
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Validation(format!(
                    "{}: top_p must be between 0.0 and 1.0",
                    self.label()
                )));
            }
        }
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        if let Some(base) = &self.api_base {
            url::Url::parse(base).map_err(|e| {
                ConfigError::Validation(format!("{}: invalid api_base '{}': {}", self.label(), base, e))
            })?;
        }

        let missing = |field: &str| {
            ConfigError::Validation(format!("{}: {} is required", self.label(), field))
        };
        match self.provider {
            ProviderKind::OpenAi => {
                self.api_key.as_ref().ok_or_else(|| missing("api_key"))?;
                self.api_base.as_ref().ok_or_else(|| missing("api_base"))?;
            }
            ProviderKind::Qwen | ProviderKind::DeepSeek => {
                self.api_key.as_ref().ok_or_else(|| missing("api_key"))?;
            }
            ProviderKind::Claude => {
                self.api_key.as_ref().ok_or_else(|| missing("api_key (access key id)"))?;
                self.api_secret.as_ref().ok_or_else(|| missing("api_secret (secret access key)"))?;
            }
            ProviderKind::Gemini => {
                self.api_key.as_ref().ok_or_else(|| missing("api_key"))?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("model_name", &self.model_name)
            .field("model_id", &self.model_id)
            .field("api_key", &self.api_key.as_deref().map(obscure_credential))
            .field("api_secret", &self.api_secret.as_ref().map(|_| "***"))
            .field("api_base", &self.api_base)
            .field("api_version", &self.api_version)
            .field("region", &self.region)
            .field("project_id", &self.project_id)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("top_p", &self.top_p)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// Resolved sampling parameters for one request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

/// Whether a failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, connection failures, rate limits, vendor-side faults
    Transient,
    /// Caused by the request itself; fails identically on every backend
    Request,
    /// Fault of one backend binding (bad endpoint, missing deployment or
    /// model). Retrying the same instance is pointless, another may serve.
    Instance,
}

/// Adapter-level failure, already classified.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} request timed out: {message}")]
    Timeout { provider: ProviderKind, message: String },

    #[error("{provider} connection failed: {message}")]
    Connection { provider: ProviderKind, message: String },

    #[error("{provider} rate limit exceeded: {message}")]
    RateLimited {
        provider: ProviderKind,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider} service error (status {status}): {message}")]
    Server {
        provider: ProviderKind,
        status: u16,
        message: String,
    },

    #[error("{provider} returned an unreadable payload: {message}")]
    Protocol { provider: ProviderKind, message: String },

    #[error("{provider} rejected the request: {message}")]
    InvalidRequest {
        provider: ProviderKind,
        status: Option<u16>,
        message: String,
    },

    #[error("{provider} authentication failed: {message}")]
    Authentication {
        provider: ProviderKind,
        status: Option<u16>,
        message: String,
    },

    #[error("{provider} content policy rejection: {message}")]
    ContentPolicy { provider: ProviderKind, message: String },

    #[error("{provider} is misconfigured: {message}")]
    Configuration { provider: ProviderKind, message: String },

    /// The endpoint, deployment or model this instance points at does not exist
    #[error("{provider} endpoint or model not found (status {status}): {message}")]
    NotFound {
        provider: ProviderKind,
        status: u16,
        message: String,
    },
}

impl ProviderError {
    /// Create a timeout error
    pub fn timeout(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::Timeout { provider, message: message.into() }
    }

    pub fn connection(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::Connection { provider, message: message.into() }
    }

    pub fn protocol(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::Protocol { provider, message: message.into() }
    }

    /// Create a request error with no vendor status
    pub fn invalid_request(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            provider,
            status: None,
            message: message.into(),
        }
    }

    /// Create an error for an unusable instance config
    pub fn configuration(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::Configuration { provider, message: message.into() }
    }

    /// Vendor that produced the error
    pub fn provider(&self) -> ProviderKind {
        match self {
            Self::Timeout { provider, .. }
            | Self::Connection { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::Server { provider, .. }
            | Self::Protocol { provider, .. }
            | Self::InvalidRequest { provider, .. }
            | Self::Authentication { provider, .. }
            | Self::ContentPolicy { provider, .. }
            | Self::Configuration { provider, .. }
            | Self::NotFound { provider, .. } => *provider,
        }
    }

    /// Retry and failover class; the dispatcher decides on this alone
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. }
            | Self::Connection { .. }
            | Self::RateLimited { .. }
            | Self::Server { .. }
            | Self::Protocol { .. } => ErrorClass::Transient,
            Self::InvalidRequest { .. } | Self::Authentication { .. } | Self::ContentPolicy { .. } => {
                ErrorClass::Request
            }
            Self::Configuration { .. } | Self::NotFound { .. } => ErrorClass::Instance,
        }
    }

    /// Worth another call against the same instance
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Worth trying the next instance in the pool
    pub fn fails_over(&self) -> bool {
        self.class() != ErrorClass::Request
    }

    /// Vendor HTTP status, when the failure came with one
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } | Self::NotFound { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::InvalidRequest { status, .. } | Self::Authentication { status, .. } => *status,
            _ => None,
        }
    }

    /// Wait the vendor asked for, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short machine-readable tag for logs
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Connection { .. } => "connection",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server",
            Self::Protocol { .. } => "protocol",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Authentication { .. } => "authentication",
            Self::ContentPolicy { .. } => "content_policy",
            Self::Configuration { .. } => "configuration",
            Self::NotFound { .. } => "not_found",
        }
    }

    /// Classify a non-success HTTP status and its body
    pub fn from_status(
        provider: ProviderKind,
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, crate::utils::logging::truncate_string(body.trim(), 2000))
        };

        match status {
            408 => Self::Timeout { provider, message },
            429 => Self::RateLimited {
                provider,
                message,
                retry_after,
            },
            401 | 403 => Self::Authentication {
                provider,
                status: Some(status),
                message,
            },
            404 => Self::NotFound {
                provider,
                status,
                message,
            },
            500..=599 => Self::Server {
                provider,
                status,
                message,
            },
            _ if looks_like_content_filter(body) => Self::ContentPolicy { provider, message },
            _ => Self::InvalidRequest {
                provider,
                status: Some(status),
                message,
            },
        }
    }

    /// Classify a transport-level reqwest failure
    pub fn from_reqwest(provider: ProviderKind, error: &reqwest::Error) -> Self {
        let message = error.to_string();
        if error.is_timeout() {
            Self::Timeout { provider, message }
        } else if error.is_decode() {
            Self::Protocol { provider, message }
        } else if error.is_builder() {
            Self::Configuration { provider, message }
        } else if let Some(status) = error.status() {
            Self::from_status(provider, status.as_u16(), &message, None)
        } else {
            Self::Connection { provider, message }
        }
    }
}

fn looks_like_content_filter(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    ["content_filter", "content management policy", "responsibleaipolicyviolation", "datainspectionfailed", "content_policy"]
        .iter()
        .any(|marker| lowered.contains(marker))
}
