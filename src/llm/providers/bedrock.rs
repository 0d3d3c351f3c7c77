//! Anthropic Claude on AWS Bedrock.
//!
//! Uses the Bedrock runtime SDK with static credentials taken from the
//! backend config (`api_key` = access key id, `api_secret` = secret key).
//! SDK-level retries are disabled; the dispatcher owns retrying.

use async_trait::async_trait;
use aws_sdk_bedrockruntime::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::ResponseStream;
use aws_sdk_bedrockruntime::Client as BedrockRuntimeClient;
use serde_json::{json, Value};
use std::fmt;

use super::required;
use crate::llm::normalize::{self, ChunkContext, ClaudeStreamState};
use crate::llm::traits::{ChatProvider, ChatStream, ModelConfig, ProviderError, ProviderKind, Sampling};
use crate::types::{ChatMessage, ChatRequest, ChatResponse, MessageRole, ToolChoice};

/// Region used when the config names none
pub const DEFAULT_REGION: &str = "us-east-1";
pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

const DEFAULTS: Sampling = Sampling {
    temperature: 0.1,
    max_tokens: 4096,
    top_p: 1.0,
};

/// Claude adapter over the Bedrock runtime API
pub struct BedrockProvider {
    client: BedrockRuntimeClient,
    config: ModelConfig,
}

impl BedrockProvider {
    /// Build the SDK client. Fails when either half of the key pair is missing.
    pub async fn new(config: &ModelConfig) -> Result<Self, ProviderError> {
        let access_key = required(config, &config.api_key, "api_key (access key id)")?;
        let secret_key = required(config, &config.api_secret, "api_secret (secret access key)")?;
        let region = config.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string());

        if config.proxy.as_ref().is_some_and(|p| !p.is_empty()) {
            tracing::warn!(
                backend = %config.label(),
                "Proxy settings are not applied to Bedrock; use HTTPS_PROXY in the environment instead"
            );
        }

        let credentials = aws_credential_types::Credentials::new(
            access_key.to_string(),
            secret_key.to_string(),
            None,
            None,
            "switchboard",
        );
        let timeouts = aws_config::timeout::TimeoutConfig::builder()
            .operation_timeout(config.timeout)
            .connect_timeout(config.timeout.min(std::time::Duration::from_secs(10)))
            .build();

        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region))
            .credentials_provider(credentials)
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .timeout_config(timeouts)
            .load()
            .await;

        Ok(Self {
            client: BedrockRuntimeClient::new(&aws_config),
            config: config.clone(),
        })
    }
}

impl fmt::Debug for BedrockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BedrockProvider")
            .field("backend", &self.config.label())
            .field("region", &self.config.region)
            .finish()
    }
}

#[async_trait]
impl ChatProvider for BedrockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = claude_body(request, &self.config);
        let model_id = self.config.vendor_model();
        tracing::debug!(backend = %self.config.label(), "Bedrock invoke_model");

        let output = self
            .client
            .invoke_model()
            .model_id(model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body.to_string().into_bytes()))
            .send()
            .await
            .map_err(|e| {
                let status = match &e {
                    SdkError::ServiceError(context) => Some(context.raw().status().as_u16()),
                    _ => None,
                };
                classify_sdk_error(&e, status)
            })?;

        let payload: Value = serde_json::from_slice(output.body().as_ref()).map_err(|e| {
            ProviderError::protocol(ProviderKind::Claude, format!("invalid JSON body: {}", e))
        })?;
        normalize::claude_response(&payload, model_id)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
        let body = claude_body(request, &self.config);
        let model_id = self.config.vendor_model();
        tracing::debug!(backend = %self.config.label(), "Bedrock invoke_model_with_response_stream");

        let output = self
            .client
            .invoke_model_with_response_stream()
            .model_id(model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body.to_string().into_bytes()))
            .send()
            .await
            .map_err(|e| {
                let status = match &e {
                    SdkError::ServiceError(context) => Some(context.raw().status().as_u16()),
                    _ => None,
                };
                classify_sdk_error(&e, status)
            })?;

        let mut receiver = output.body;
        let raw = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(Some(ResponseStream::Chunk(part))) => {
                        let bytes = part.bytes().map(|b| b.as_ref()).unwrap_or(&[]);
                        if bytes.is_empty() {
                            continue;
                        }
                        match serde_json::from_slice::<Value>(bytes) {
                            Ok(event) => yield Ok(event),
                            Err(e) => {
                                yield Err(ProviderError::protocol(
                                    ProviderKind::Claude,
                                    format!("invalid stream event: {}", e),
                                ));
                                break;
                            }
                        }
                    }
                    Ok(Some(other)) => {
                        tracing::trace!(event = ?other, "Ignoring Bedrock stream event");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(classify_sdk_error(&e, None));
                        break;
                    }
                }
            }
        };

        let mut state = ClaudeStreamState::new(ChunkContext::new("msg", model_id));
        Ok(normalize::normalize_stream(
            Box::pin(raw),
            move |event| state.map_event(&event),
        ))
    }
}

/// Anthropic messages body. System messages move to `system`, tool
/// results become `tool_result` blocks, and consecutive messages of the
/// same role are merged since the API requires alternation.
pub(crate) fn claude_body(request: &ChatRequest, config: &ModelConfig) -> Value {
    let sampling = config.sampling(request, DEFAULTS);
    let mut body = json!({
        "anthropic_version": ANTHROPIC_VERSION,
        "max_tokens": sampling.max_tokens,
        "temperature": sampling.temperature,
        "messages": claude_messages(request),
    });

    if let Some(system) = request.system_prompt() {
        body["system"] = json!(system);
    }
    if let Some(top_p) = request.top_p.or(config.top_p) {
        body["top_p"] = json!(top_p);
    }
    if !request.stop.is_empty() {
        body["stop_sequences"] = json!(request.stop);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                let mut spec = json!({
                    "name": tool.function.name,
                    "input_schema": tool.function.parameters,
                });
                if let Some(description) = &tool.function.description {
                    spec["description"] = json!(description);
                }
                spec
            })
            .collect();
        body["tools"] = json!(tools);
        if let Some(choice) = request.tool_choice.as_ref().and_then(claude_tool_choice) {
            body["tool_choice"] = choice;
        }
    }
    if request.response_format.is_some() {
        tracing::debug!("response_format is not supported by Claude; ignoring");
    }
    body
}

fn claude_messages(request: &ChatRequest) -> Vec<Value> {
    let mut messages: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for message in request.conversation() {
        let (role, blocks) = claude_blocks(message);
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => messages.push((role, blocks)),
        }
    }

    messages
        .into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect()
}

fn claude_blocks(message: &ChatMessage) -> (&'static str, Vec<Value>) {
    let mut blocks = Vec::new();
    match message.role {
        MessageRole::Tool => {
            blocks.push(json!({
                "type": "tool_result",
                "tool_use_id": message.tool_call_id.as_deref().unwrap_or_default(),
                "content": message.content,
            }));
            ("user", blocks)
        }
        MessageRole::Assistant => {
            if !message.content.is_empty() {
                blocks.push(json!({ "type": "text", "text": message.content }));
            }
            for call in message.tool_calls.iter().flatten() {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.function.name,
                    "input": call.arguments_json(),
                }));
            }
            ("assistant", blocks)
        }
        // system messages are filtered out before this point
        MessageRole::User | MessageRole::System => {
            if !message.content.is_empty() {
                blocks.push(json!({ "type": "text", "text": message.content }));
            }
            ("user", blocks)
        }
    }
}

fn claude_tool_choice(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => Some(json!({ "type": "auto" })),
            "required" | "any" => Some(json!({ "type": "any" })),
            "none" => Some(json!({ "type": "none" })),
            _ => None,
        },
        ToolChoice::Function(value) => value
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .map(|name| json!({ "type": "tool", "name": name })),
    }
}

/// Classify an SDK failure. `status` is the HTTP status of a service
/// error response, when one was received.
fn classify_sdk_error<E, R>(error: &SdkError<E, R>, status: Option<u16>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: fmt::Debug,
{
    let provider = ProviderKind::Claude;
    match error {
        SdkError::ServiceError(context) => {
            let service_error = context.err();
            let message = service_error
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(service_error).to_string());
            classify_service_code(service_error.code(), message, status)
        }
        SdkError::TimeoutError(_) => ProviderError::timeout(provider, "Bedrock call timed out"),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => {
            ProviderError::timeout(provider, DisplayErrorContext(error).to_string())
        }
        SdkError::DispatchFailure(_) => ProviderError::connection(provider, DisplayErrorContext(error).to_string()),
        SdkError::ConstructionFailure(_) => {
            ProviderError::configuration(provider, DisplayErrorContext(error).to_string())
        }
        SdkError::ResponseError(_) => ProviderError::protocol(provider, DisplayErrorContext(error).to_string()),
        _ => ProviderError::connection(provider, DisplayErrorContext(error).to_string()),
    }
}

/// Map a Bedrock exception code onto the shared error classes
fn classify_service_code(code: Option<&str>, message: String, status: Option<u16>) -> ProviderError {
    let provider = ProviderKind::Claude;
    let message = match code {
        Some(code) => format!("{}: {}", code, message),
        None => message,
    };
    match code.unwrap_or_default() {
        "ThrottlingException" | "ServiceQuotaExceededException" => ProviderError::RateLimited {
            provider,
            message,
            retry_after: None,
        },
        "ModelTimeoutException" => ProviderError::Timeout { provider, message },
        "ServiceUnavailableException" | "ModelNotReadyException" => ProviderError::Server {
            provider,
            status: status.unwrap_or(503),
            message,
        },
        "InternalServerException" | "ModelErrorException" | "ModelStreamErrorException" => ProviderError::Server {
            provider,
            status: status.unwrap_or(500),
            message,
        },
        "AccessDeniedException"
        | "UnrecognizedClientException"
        | "ExpiredTokenException"
        | "InvalidSignatureException"
        | "IncompleteSignature" => ProviderError::Authentication {
            provider,
            status: status.or(Some(403)),
            message,
        },
        "ValidationException" => ProviderError::InvalidRequest {
            provider,
            status: status.or(Some(400)),
            message,
        },
        // model id unknown or not enabled in this account and region
        "ResourceNotFoundException" => ProviderError::NotFound {
            provider,
            status: status.unwrap_or(404),
            message,
        },
        _ => match status {
            Some(status) => ProviderError::from_status(provider, status, &message, None),
            None => ProviderError::Server {
                provider,
                status: 500,
                message,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCall, ToolDefinition};

    fn config() -> ModelConfig {
        ModelConfig::new(ProviderKind::Claude, "claude-3-sonnet")
            .with_model_id("anthropic.claude-3-sonnet-20240229-v1:0")
            .with_api_key("AKIAEXAMPLE")
            .with_api_secret("secret")
    }

    #[test]
    fn test_body_defaults_and_system() {
        let request = ChatRequest::new(
            "claude-3-sonnet",
            vec![
                ChatMessage::system("rule one"),
                ChatMessage::system("rule two"),
                ChatMessage::user("hi"),
            ],
        );
        let body = claude_body(&request, &config());

        assert_eq!(body["anthropic_version"], ANTHROPIC_VERSION);
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["temperature"].as_f64().unwrap() as f32, 0.1);
        assert_eq!(body["system"], "rule one\n\nrule two");
        assert!(body.get("top_p").is_none());
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn test_tool_round_trip_messages() {
        let call = ToolCall::new("toolu_1", "lookup", r#"{"q":"rust"}"#.to_string());
        let request = ChatRequest::new(
            "claude-3-sonnet",
            vec![
                ChatMessage::user("search"),
                ChatMessage::assistant("").with_tool_calls(vec![call]),
                ChatMessage::tool("toolu_1", "found it"),
                ChatMessage::user("thanks"),
            ],
        )
        .with_tools(vec![ToolDefinition::function(
            "lookup",
            Some("Search things".to_string()),
            json!({"type": "object"}),
        )]);
        let body = claude_body(&request, &config());

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[1]["content"][0]["input"]["q"], "rust");
        // tool result and the following user text share one user turn
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(messages[2]["content"][1]["text"], "thanks");

        assert_eq!(body["tools"][0]["name"], "lookup");
        assert_eq!(body["tools"][0]["description"], "Search things");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn test_tool_choice_mapping() {
        assert_eq!(
            claude_tool_choice(&ToolChoice::Mode("required".to_string())),
            Some(json!({"type": "any"}))
        );
        assert_eq!(
            claude_tool_choice(&ToolChoice::Function(json!({"type": "function", "function": {"name": "lookup"}}))),
            Some(json!({"type": "tool", "name": "lookup"}))
        );
        assert_eq!(claude_tool_choice(&ToolChoice::Mode("sometimes".to_string())), None);
    }

    #[test]
    fn test_service_code_classification() {
        let throttled = classify_service_code(Some("ThrottlingException"), "slow down".to_string(), Some(429));
        assert!(matches!(throttled, ProviderError::RateLimited { .. }));
        assert!(throttled.is_transient());

        let denied = classify_service_code(Some("AccessDeniedException"), "no".to_string(), None);
        assert_eq!(denied.status(), Some(403));
        assert!(!denied.is_transient());

        let invalid = classify_service_code(Some("ValidationException"), "bad".to_string(), Some(400));
        assert!(matches!(invalid, ProviderError::InvalidRequest { .. }));
        assert!(!invalid.fails_over());

        let missing = classify_service_code(Some("ResourceNotFoundException"), "no such model".to_string(), None);
        assert!(matches!(missing, ProviderError::NotFound { status: 404, .. }));
        assert!(missing.fails_over());
        assert!(!missing.is_transient());

        let timeout = classify_service_code(Some("ModelTimeoutException"), "late".to_string(), Some(408));
        assert!(matches!(timeout, ProviderError::Timeout { .. }));

        let unknown = classify_service_code(Some("SomethingNew"), "??".to_string(), Some(502));
        assert!(matches!(unknown, ProviderError::Server { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_missing_secret_is_configuration_error() {
        let config = ModelConfig::new(ProviderKind::Claude, "claude").with_api_key("AKIA");
        assert!(matches!(
            BedrockProvider::new(&config).await,
            Err(ProviderError::Configuration { .. })
        ));
    }
}
