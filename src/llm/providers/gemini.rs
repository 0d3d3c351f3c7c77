//! Google Gemini, through AI Studio (API key) or Vertex AI (project id set).

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;

use super::{http_client, required, send, send_json};
use crate::llm::normalize::{self, ChunkContext};
use crate::llm::sse;
use crate::llm::traits::{ChatProvider, ChatStream, ModelConfig, ProviderError, ProviderKind, Sampling};
use crate::types::{ChatMessage, ChatRequest, ChatResponse, MessageRole, ResponseFormat, ToolChoice};

/// AI Studio endpoint
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_VERTEX_REGION: &str = "us-central1";

const DEFAULTS: Sampling = Sampling {
    temperature: 1.0,
    max_tokens: 8192,
    top_p: 1.0,
};

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_HARASSMENT",
];

#[derive(Clone, PartialEq)]
enum Auth {
    /// AI Studio key, sent as `x-goog-api-key`
    ApiKey(String),
    /// Vertex access token, sent as a bearer token
    Bearer(String),
}

/// Gemini adapter for AI Studio keys or Vertex bearer tokens
pub struct GeminiProvider {
    client: reqwest::Client,
    /// `.../models/{model}`; the method suffix is appended per call
    model_url: String,
    auth: Auth,
    config: ModelConfig,
}

impl GeminiProvider {
    /// Create a new Gemini adapter. Setting `project_id` selects Vertex.
    pub fn new(config: &ModelConfig) -> Result<Self, ProviderError> {
        let credential = required(config, &config.api_key, "api_key")?.to_string();
        let model = config.vendor_model();

        let (model_url, auth) = match config.project_id.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(project) => {
                let region = config.region.as_deref().unwrap_or(DEFAULT_VERTEX_REGION);
                let base = config
                    .api_base
                    .clone()
                    .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com/v1", region));
                (
                    format!(
                        "{}/projects/{}/locations/{}/publishers/google/models/{}",
                        base.trim_end_matches('/'),
                        project,
                        region,
                        model
                    ),
                    Auth::Bearer(credential),
                )
            }
            None => {
                let base = config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
                (
                    format!("{}/models/{}", base.trim_end_matches('/'), model),
                    Auth::ApiKey(credential),
                )
            }
        };

        Ok(Self {
            client: http_client(config)?,
            model_url,
            auth,
            config: config.clone(),
        })
    }

    pub fn is_vertex(&self) -> bool {
        matches!(self.auth, Auth::Bearer(_))
    }

    fn url(&self, stream: bool) -> String {
        if stream {
            format!("{}:streamGenerateContent?alt=sse", self.model_url)
        } else {
            format!("{}:generateContent", self.model_url)
        }
    }

    fn post(&self, body: &Value, stream: bool) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.url(stream)).json(body);
        match &self.auth {
            Auth::ApiKey(key) => builder.header("x-goog-api-key", key),
            Auth::Bearer(token) => builder.bearer_auth(token),
        }
    }
}

impl fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("model_url", &self.model_url)
            .field("vertex", &self.is_vertex())
            .field("backend", &self.config.label())
            .finish()
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = gemini_body(request, &self.config);
        let payload = send_json(ProviderKind::Gemini, self.post(&body, false)).await?;
        normalize::gemini_response(&payload, self.config.vendor_model())
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
        let body = gemini_body(request, &self.config);
        let response = send(ProviderKind::Gemini, self.post(&body, true)).await?;

        let ctx = ChunkContext::new("gemini", self.config.vendor_model());
        Ok(normalize::normalize_stream(
            sse::from_response(ProviderKind::Gemini, response),
            move |payload| normalize::gemini_chunk(&payload, &ctx),
        ))
    }
}

pub(crate) fn gemini_body(request: &ChatRequest, config: &ModelConfig) -> Value {
    let sampling = config.sampling(request, DEFAULTS);
    let mut generation = json!({
        "temperature": sampling.temperature,
        "topP": sampling.top_p,
        "maxOutputTokens": sampling.max_tokens,
    });
    if !request.stop.is_empty() {
        generation["stopSequences"] = json!(request.stop);
    }
    if request.response_format == Some(ResponseFormat::JsonObject) {
        generation["responseMimeType"] = json!("application/json");
    }

    let mut body = json!({
        "contents": gemini_contents(request),
        "generationConfig": generation,
        "safetySettings": SAFETY_CATEGORIES
            .iter()
            .map(|category| json!({ "category": category, "threshold": "OFF" }))
            .collect::<Vec<_>>(),
    });

    if let Some(system) = request.system_prompt() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                let mut declaration = json!({
                    "name": tool.function.name,
                    "parameters": tool.function.parameters,
                });
                if let Some(description) = &tool.function.description {
                    declaration["description"] = json!(description);
                }
                declaration
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
        if let Some(config) = request.tool_choice.as_ref().and_then(gemini_tool_config) {
            body["toolConfig"] = config;
        }
    }
    body
}

fn gemini_contents(request: &ChatRequest) -> Vec<Value> {
    // functionResponse parts need the function name, tool messages only carry the call id
    let call_names: HashMap<&str, &str> = request
        .messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|call| (call.id.as_str(), call.function.name.as_str()))
        .collect();

    let mut contents: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for message in request.conversation() {
        let (role, parts) = gemini_parts(message, &call_names);
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some((last_role, last_parts)) if *last_role == role => last_parts.extend(parts),
            _ => contents.push((role, parts)),
        }
    }

    contents
        .into_iter()
        .map(|(role, parts)| json!({ "role": role, "parts": parts }))
        .collect()
}

fn gemini_parts(message: &ChatMessage, call_names: &HashMap<&str, &str>) -> (&'static str, Vec<Value>) {
    let mut parts = Vec::new();
    match message.role {
        MessageRole::Tool => {
            let name = message
                .name
                .as_deref()
                .or_else(|| message.tool_call_id.as_deref().and_then(|id| call_names.get(id).copied()))
                .unwrap_or_default();
            parts.push(json!({
                "functionResponse": {
                    "name": name,
                    "response": { "content": message.content },
                }
            }));
            ("user", parts)
        }
        MessageRole::Assistant => {
            if !message.content.is_empty() {
                parts.push(json!({ "text": message.content }));
            }
            for call in message.tool_calls.iter().flatten() {
                parts.push(json!({
                    "functionCall": { "name": call.function.name, "args": call.arguments_json() }
                }));
            }
            ("model", parts)
        }
        MessageRole::User | MessageRole::System => {
            if !message.content.is_empty() {
                parts.push(json!({ "text": message.content }));
            }
            ("user", parts)
        }
    }
}

fn gemini_tool_config(choice: &ToolChoice) -> Option<Value> {
    let config = match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => json!({ "mode": "AUTO" }),
            "required" | "any" => json!({ "mode": "ANY" }),
            "none" => json!({ "mode": "NONE" }),
            _ => return None,
        },
        ToolChoice::Function(value) => {
            let name = value.get("function")?.get("name")?.as_str()?;
            json!({ "mode": "ANY", "allowedFunctionNames": [name] })
        }
    };
    Some(json!({ "functionCallingConfig": config }))
}
