//! Vendor payload → canonical response mapping.
//!
//! Every function here is pure: it reads one decoded vendor payload and
//! produces the canonical value, or classifies an error payload. Token
//! counts are copied when the vendor reports them; cost is only ever
//! copied, never computed.

use futures::future;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;

use crate::llm::traits::{ChatStream, ProviderError, ProviderKind};
use crate::types::{
    ChatMessage, ChatResponse, Choice, ChunkChoice, Delta, FinishReason, MessageRole, StreamChunk, ToolCall,
    ToolCallDelta, Usage,
};

/// Identity shared by every chunk of one stream, for vendors whose
/// events do not carry their own
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkContext {
    /// Shared by every chunk of one stream
    pub id: String,
    /// Unix seconds when the stream began
    pub created: i64,
    pub model: String,
}

impl ChunkContext {
    /// Fresh id and timestamp for a stream that does not supply its own
    pub fn new<S: Into<String>>(prefix: &str, model: S) -> Self {
        Self {
            id: generated_id(prefix),
            created: now(),
            model: model.into(),
        }
    }

    fn chunk(&self, choices: Vec<ChunkChoice>, usage: Option<Usage>) -> StreamChunk {
        StreamChunk {
            id: self.id.clone(),
            created: self.created,
            model: self.model.clone(),
            choices,
            usage,
        }
    }
}

/// Re-emit a decoded vendor stream as canonical chunks, one for one.
///
/// `mapper` may drop payloads that carry nothing (keep-alives, bookkeeping
/// events). Errors, from the transport or the mapper, pass through in
/// place; nothing is reordered or merged.
pub fn normalize_stream<M>(raw: BoxStream<'static, Result<Value, ProviderError>>, mut mapper: M) -> ChatStream
where
    M: FnMut(Value) -> Result<Option<StreamChunk>, ProviderError> + Send + 'static,
{
    raw.filter_map(move |item| {
        let mapped = match item {
            Ok(payload) => mapper(payload).transpose(),
            Err(e) => Some(Err(e)),
        };
        future::ready(mapped)
    })
    .boxed()
}

// ---------------------------------------------------------------------------
// Finish reasons
// ---------------------------------------------------------------------------

/// OpenAI, DeepSeek and Qwen share one vocabulary. `None` means the
/// choice is still in progress.
pub fn openai_finish_reason(raw: Option<&str>) -> Option<FinishReason> {
    let raw = raw?;
    Some(match raw {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        // DashScope sends the literal string while a stream is running
        "null" | "" => return None,
        other => unknown_finish_reason("openai", other),
    })
}

/// Anthropic `stop_reason` values
pub fn claude_finish_reason(raw: Option<&str>) -> Option<FinishReason> {
    let raw = raw?;
    Some(match raw {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        other => unknown_finish_reason("claude", other),
    })
}

/// Gemini `finishReason`; anything unrecognized is an error finish
pub fn gemini_finish_reason(raw: Option<&str>) -> Option<FinishReason> {
    let raw = raw?;
    Some(match raw {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => FinishReason::ContentFilter,
        _ => FinishReason::Error,
    })
}

fn unknown_finish_reason(vendor: &str, raw: &str) -> FinishReason {
    tracing::warn!(vendor = vendor, finish_reason = raw, "Unknown finish reason, treating as stop");
    FinishReason::Stop
}

// ---------------------------------------------------------------------------
// Error payloads
// ---------------------------------------------------------------------------

/// Classify an error carried inside a success-status payload or a stream
/// event. Returns `None` when the payload is not an error.
pub fn vendor_error(provider: ProviderKind, payload: &Value) -> Option<ProviderError> {
    let (status, kind, message) = if let Some(error) = payload.get("error") {
        match error {
            Value::String(text) => (None, String::new(), text.clone()),
            Value::Null => return None,
            object => (
                object.get("code").and_then(status_code),
                object
                    .get("type")
                    .or_else(|| object.get("status"))
                    .or_else(|| object.get("code"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                object
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| object.to_string()),
            ),
        }
    } else if payload.get("output").is_none() {
        // DashScope: top-level code/message, no output
        let code = payload.get("code").and_then(Value::as_str).filter(|c| !c.is_empty())?;
        (
            None,
            code.to_string(),
            payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(code)
                .to_string(),
        )
    } else {
        return None;
    };

    let detail = if kind.is_empty() {
        message
    } else {
        format!("{}: {}", kind, message)
    };

    if let Some(status) = status {
        return Some(ProviderError::from_status(provider, status, &detail, None));
    }

    let lowered = kind.to_ascii_lowercase();
    let error = if lowered.contains("rate") || lowered.contains("throttl") || lowered.contains("resource_exhausted") {
        ProviderError::RateLimited {
            provider,
            message: detail,
            retry_after: None,
        }
    } else if lowered.contains("overloaded") || lowered.contains("server") || lowered.contains("internal") || lowered.contains("unavailable") {
        ProviderError::Server {
            provider,
            status: 503,
            message: detail,
        }
    } else if lowered.contains("timeout") || lowered.contains("deadline") {
        ProviderError::timeout(provider, detail)
    } else if lowered.contains("auth") || lowered.contains("permission") || lowered.contains("apikey") {
        ProviderError::Authentication {
            provider,
            status: None,
            message: detail,
        }
    } else if lowered.contains("content_filter") || lowered.contains("datainspection") || lowered.contains("safety") {
        ProviderError::ContentPolicy { provider, message: detail }
    } else {
        ProviderError::invalid_request(provider, detail)
    };
    Some(error)
}

fn status_code(value: &Value) -> Option<u16> {
    let code = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.parse::<u64>().ok()?,
        _ => return None,
    };
    (400..600).contains(&code).then_some(code as u16)
}

// ---------------------------------------------------------------------------
// OpenAI-compatible (Azure OpenAI, DeepSeek)
// ---------------------------------------------------------------------------

/// Map a chat-completions body. `fallback_model` fills in a missing `model`.
pub fn openai_response(provider: ProviderKind, payload: &Value, fallback_model: &str) -> Result<ChatResponse, ProviderError> {
    if let Some(error) = vendor_error(provider, payload) {
        return Err(error);
    }
    let choices = payload
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::protocol(provider, "response has no choices"))?;

    let choices = choices
        .iter()
        .enumerate()
        .map(|(position, choice)| {
            let message = choice.get("message").cloned().unwrap_or(Value::Null);
            let message = openai_message(&message);
            let finish_reason = openai_finish_reason(choice.get("finish_reason").and_then(Value::as_str))
                .unwrap_or(FinishReason::Stop);
            Choice {
                index: index_of(choice, position),
                message,
                finish_reason,
            }
        })
        .collect();

    Ok(ChatResponse {
        id: string_or(payload, "id", || generated_id("chatcmpl")),
        created: payload.get("created").and_then(Value::as_i64).unwrap_or_else(now),
        model: string_or(payload, "model", || fallback_model.to_string()),
        choices,
        usage: payload.get("usage").and_then(openai_usage),
    })
}

/// Map one `chat.completion.chunk` event; `None` for events with no content
pub fn openai_chunk(provider: ProviderKind, payload: &Value, ctx: &ChunkContext) -> Result<Option<StreamChunk>, ProviderError> {
    if let Some(error) = vendor_error(provider, payload) {
        return Err(error);
    }

    let choices: Vec<ChunkChoice> = payload
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .enumerate()
                .map(|(position, choice)| {
                    let delta = choice.get("delta").cloned().unwrap_or(Value::Null);
                    ChunkChoice {
                        index: index_of(choice, position),
                        delta: openai_delta(&delta),
                        finish_reason: openai_finish_reason(choice.get("finish_reason").and_then(Value::as_str)),
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    let usage = payload.get("usage").and_then(openai_usage);

    // Azure opens with a prompt-filter event that has neither
    if choices.is_empty() && usage.is_none() {
        return Ok(None);
    }

    Ok(Some(StreamChunk {
        id: string_or(payload, "id", || ctx.id.clone()),
        created: payload.get("created").and_then(Value::as_i64).unwrap_or(ctx.created),
        model: string_or(payload, "model", || ctx.model.clone()),
        choices,
        usage,
    }))
}

fn openai_message(message: &Value) -> ChatMessage {
    let role = message
        .get("role")
        .cloned()
        .and_then(|r| serde_json::from_value::<MessageRole>(r).ok())
        .unwrap_or(MessageRole::Assistant);
    let mut canonical = ChatMessage::new(role, message.get("content").and_then(Value::as_str).unwrap_or_default());
    if let Some(calls) = parse_tool_calls(message.get("tool_calls")) {
        canonical = canonical.with_tool_calls(calls);
    }
    canonical
}

fn parse_tool_calls(value: Option<&Value>) -> Option<Vec<ToolCall>> {
    let calls: Vec<ToolCall> = value?
        .as_array()?
        .iter()
        .enumerate()
        .filter_map(|(position, call)| {
            let function = call.get("function")?;
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            Some(ToolCall::new(
                string_or(call, "id", || format!("call_{}", position)),
                function.get("name").and_then(Value::as_str).unwrap_or_default(),
                arguments,
            ))
        })
        .collect();
    (!calls.is_empty()).then_some(calls)
}

fn openai_delta(delta: &Value) -> Delta {
    let tool_calls: Vec<ToolCallDelta> = delta
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(position, call)| {
                    let function = call.get("function");
                    ToolCallDelta {
                        index: index_of(call, position),
                        id: call.get("id").and_then(Value::as_str).map(str::to_string),
                        name: function
                            .and_then(|f| f.get("name"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        arguments: function
                            .and_then(|f| f.get("arguments"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Delta {
        role: delta
            .get("role")
            .cloned()
            .and_then(|r| serde_json::from_value(r).ok()),
        content: delta.get("content").and_then(Value::as_str).map(str::to_string),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
    }
}

fn openai_usage(usage: &Value) -> Option<Usage> {
    if !usage.is_object() {
        return None;
    }
    let prompt = u32_field(usage, "prompt_tokens");
    let completion = u32_field(usage, "completion_tokens");
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .map(clamp_u32)
            .unwrap_or(prompt.saturating_add(completion)),
        cost: usage.get("cost").and_then(Value::as_f64),
    })
}

// ---------------------------------------------------------------------------
// Qwen (DashScope)
// ---------------------------------------------------------------------------

/// Map a DashScope generation body in either result format
pub fn qwen_response(payload: &Value, fallback_model: &str) -> Result<ChatResponse, ProviderError> {
    let provider = ProviderKind::Qwen;
    if let Some(error) = vendor_error(provider, payload) {
        return Err(error);
    }
    let output = payload
        .get("output")
        .ok_or_else(|| ProviderError::protocol(provider, "response has no output"))?;

    let choices = match output.get("choices").and_then(Value::as_array) {
        Some(choices) => choices
            .iter()
            .enumerate()
            .map(|(position, choice)| Choice {
                index: index_of(choice, position),
                message: openai_message(choice.get("message").unwrap_or(&Value::Null)),
                finish_reason: openai_finish_reason(choice.get("finish_reason").and_then(Value::as_str))
                    .unwrap_or(FinishReason::Stop),
            })
            .collect(),
        // text result format
        None => vec![Choice {
            index: 0,
            message: ChatMessage::assistant(output.get("text").and_then(Value::as_str).unwrap_or_default()),
            finish_reason: openai_finish_reason(output.get("finish_reason").and_then(Value::as_str))
                .unwrap_or(FinishReason::Stop),
        }],
    };

    Ok(ChatResponse {
        id: string_or(payload, "request_id", || generated_id("qwen")),
        created: now(),
        model: fallback_model.to_string(),
        choices,
        usage: payload.get("usage").and_then(qwen_usage),
    })
}

/// Map one incremental DashScope event
pub fn qwen_chunk(payload: &Value, ctx: &ChunkContext) -> Result<Option<StreamChunk>, ProviderError> {
    let provider = ProviderKind::Qwen;
    if let Some(error) = vendor_error(provider, payload) {
        return Err(error);
    }
    let output = match payload.get("output") {
        Some(output) => output,
        None => return Ok(None),
    };

    let choices: Vec<ChunkChoice> = match output.get("choices").and_then(Value::as_array) {
        Some(choices) => choices
            .iter()
            .enumerate()
            .map(|(position, choice)| {
                let message = choice.get("message").unwrap_or(&Value::Null);
                ChunkChoice {
                    index: index_of(choice, position),
                    delta: openai_delta(message),
                    finish_reason: openai_finish_reason(choice.get("finish_reason").and_then(Value::as_str)),
                }
            })
            .collect(),
        None => vec![ChunkChoice {
            index: 0,
            delta: Delta {
                content: output.get("text").and_then(Value::as_str).map(str::to_string),
                ..Delta::default()
            },
            finish_reason: openai_finish_reason(output.get("finish_reason").and_then(Value::as_str)),
        }],
    };

    // Usage is cumulative on every event; keep it on the closing one only
    let finished = choices.iter().any(|c| c.finish_reason.is_some());
    let usage = if finished {
        payload.get("usage").and_then(qwen_usage)
    } else {
        None
    };

    let mut chunk = ctx.chunk(choices, usage);
    if let Some(id) = payload.get("request_id").and_then(Value::as_str) {
        chunk.id = id.to_string();
    }
    Ok(Some(chunk))
}

fn qwen_usage(usage: &Value) -> Option<Usage> {
    if !usage.is_object() {
        return None;
    }
    let prompt = u32_field(usage, "input_tokens");
    let completion = u32_field(usage, "output_tokens");
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .map(clamp_u32)
            .unwrap_or(prompt.saturating_add(completion)),
        cost: usage.get("cost").and_then(Value::as_f64),
    })
}

// ---------------------------------------------------------------------------
// Claude (Anthropic messages API on Bedrock)
// ---------------------------------------------------------------------------

/// Map an Anthropic messages body. Text blocks are joined, `tool_use`
/// blocks become tool calls.
pub fn claude_response(payload: &Value, fallback_model: &str) -> Result<ChatResponse, ProviderError> {
    let provider = ProviderKind::Claude;
    if let Some(error) = vendor_error(provider, payload) {
        return Err(error);
    }
    let blocks = payload
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::protocol(provider, "response has no content blocks"))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => text.push_str(block.get("text").and_then(Value::as_str).unwrap_or_default()),
            Some("tool_use") => tool_calls.push(ToolCall::new(
                string_or(block, "id", || format!("call_{}", tool_calls.len())),
                block.get("name").and_then(Value::as_str).unwrap_or_default(),
                block.get("input").map(Value::to_string).unwrap_or_else(|| "{}".to_string()),
            )),
            _ => {}
        }
    }

    let mut message = ChatMessage::assistant(text);
    if !tool_calls.is_empty() {
        message = message.with_tool_calls(tool_calls);
    }

    let usage = payload.get("usage").map(|u| {
        Usage::new(u32_field(u, "input_tokens"), u32_field(u, "output_tokens"))
    });

    Ok(ChatResponse {
        id: string_or(payload, "id", || generated_id("msg")),
        created: now(),
        model: string_or(payload, "model", || fallback_model.to_string()),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: claude_finish_reason(payload.get("stop_reason").and_then(Value::as_str))
                .unwrap_or(FinishReason::Stop),
        }],
        usage,
    })
}

/// Claude stream events refer back to earlier ones (message id, input
/// token count, content block positions), so mapping keeps a little state.
#[derive(Debug)]
pub struct ClaudeStreamState {
    ctx: ChunkContext,
    input_tokens: u32,
    /// content block index → tool call position
    tool_blocks: HashMap<u64, u32>,
}

impl ClaudeStreamState {
    pub fn new(ctx: ChunkContext) -> Self {
        Self {
            ctx,
            input_tokens: 0,
            tool_blocks: HashMap::new(),
        }
    }

    /// Map one stream event; bookkeeping events yield `None`
    pub fn map_event(&mut self, event: &Value) -> Result<Option<StreamChunk>, ProviderError> {
        let provider = ProviderKind::Claude;
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let message = event.get("message").unwrap_or(&Value::Null);
                if let Some(id) = message.get("id").and_then(Value::as_str) {
                    self.ctx.id = id.to_string();
                }
                if let Some(model) = message.get("model").and_then(Value::as_str) {
                    self.ctx.model = model.to_string();
                }
                self.input_tokens = message
                    .get("usage")
                    .map(|u| u32_field(u, "input_tokens"))
                    .unwrap_or(0);
                Ok(None)
            }
            Some("content_block_start") => {
                let block = event.get("content_block").unwrap_or(&Value::Null);
                if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    return Ok(None);
                }
                let position = self.tool_blocks.len() as u32;
                let block_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                self.tool_blocks.insert(block_index, position);
                Ok(Some(self.tool_delta(ToolCallDelta {
                    index: position,
                    id: block.get("id").and_then(Value::as_str).map(str::to_string),
                    name: block.get("name").and_then(Value::as_str).map(str::to_string),
                    arguments: None,
                })))
            }
            Some("content_block_delta") => {
                let delta = event.get("delta").unwrap_or(&Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                        Ok(Some(self.ctx.chunk(
                            vec![ChunkChoice {
                                index: 0,
                                delta: Delta::text(text),
                                finish_reason: None,
                            }],
                            None,
                        )))
                    }
                    Some("input_json_delta") => {
                        let block_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                        let position = self.tool_blocks.get(&block_index).copied().unwrap_or(0);
                        Ok(Some(self.tool_delta(ToolCallDelta {
                            index: position,
                            id: None,
                            name: None,
                            arguments: delta.get("partial_json").and_then(Value::as_str).map(str::to_string),
                        })))
                    }
                    _ => Ok(None),
                }
            }
            Some("message_delta") => {
                let finish_reason = claude_finish_reason(
                    event
                        .get("delta")
                        .and_then(|d| d.get("stop_reason"))
                        .and_then(Value::as_str),
                )
                .unwrap_or(FinishReason::Stop);
                let output_tokens = event
                    .get("usage")
                    .map(|u| u32_field(u, "output_tokens"))
                    .unwrap_or(0);
                Ok(Some(self.ctx.chunk(
                    vec![ChunkChoice {
                        index: 0,
                        delta: Delta::default(),
                        finish_reason: Some(finish_reason),
                    }],
                    Some(Usage::new(self.input_tokens, output_tokens)),
                )))
            }
            Some("error") => Err(vendor_error(provider, event)
                .unwrap_or_else(|| ProviderError::protocol(provider, event.to_string()))),
            // ping, content_block_stop, message_stop
            _ => Ok(None),
        }
    }

    fn tool_delta(&self, call: ToolCallDelta) -> StreamChunk {
        self.ctx.chunk(
            vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    tool_calls: Some(vec![call]),
                    ..Delta::default()
                },
                finish_reason: None,
            }],
            None,
        )
    }
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

/// Map a `generateContent` body. A blocked prompt is a content-policy error.
pub fn gemini_response(payload: &Value, fallback_model: &str) -> Result<ChatResponse, ProviderError> {
    let provider = ProviderKind::Gemini;
    if let Some(error) = vendor_error(provider, payload) {
        return Err(error);
    }
    let candidates = gemini_candidates(payload)?;

    let choices = candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| {
            let (text, tool_calls) = gemini_parts(candidate);
            let mut finish_reason = gemini_finish_reason(candidate.get("finishReason").and_then(Value::as_str))
                .unwrap_or(FinishReason::Stop);
            let mut message = ChatMessage::assistant(text);
            if !tool_calls.is_empty() {
                if finish_reason == FinishReason::Stop {
                    finish_reason = FinishReason::ToolCalls;
                }
                message = message.with_tool_calls(tool_calls);
            }
            Choice {
                index: index_of(candidate, position),
                message,
                finish_reason,
            }
        })
        .collect();

    Ok(ChatResponse {
        id: string_or(payload, "responseId", || generated_id("gemini")),
        created: now(),
        model: string_or(payload, "modelVersion", || fallback_model.to_string()),
        choices,
        usage: payload.get("usageMetadata").and_then(gemini_usage),
    })
}

/// Map one `streamGenerateContent` event
pub fn gemini_chunk(payload: &Value, ctx: &ChunkContext) -> Result<Option<StreamChunk>, ProviderError> {
    let provider = ProviderKind::Gemini;
    if let Some(error) = vendor_error(provider, payload) {
        return Err(error);
    }
    let usage = payload.get("usageMetadata").and_then(gemini_usage);
    let candidates = match payload.get("candidates").and_then(Value::as_array) {
        Some(candidates) => candidates,
        None if usage.is_some() => return Ok(Some(ctx.chunk(Vec::new(), usage))),
        None => {
            gemini_candidates(payload)?;
            return Ok(None);
        }
    };

    let choices: Vec<ChunkChoice> = candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| {
            let (text, tool_calls) = gemini_parts(candidate);
            let mut finish_reason = gemini_finish_reason(candidate.get("finishReason").and_then(Value::as_str));
            let tool_deltas: Vec<ToolCallDelta> = tool_calls
                .into_iter()
                .enumerate()
                .map(|(i, call)| ToolCallDelta {
                    index: i as u32,
                    id: Some(call.id),
                    name: Some(call.function.name),
                    arguments: Some(call.function.arguments),
                })
                .collect();
            if !tool_deltas.is_empty() && finish_reason == Some(FinishReason::Stop) {
                finish_reason = Some(FinishReason::ToolCalls);
            }
            ChunkChoice {
                index: index_of(candidate, position),
                delta: Delta {
                    role: None,
                    content: (!text.is_empty()).then_some(text),
                    tool_calls: (!tool_deltas.is_empty()).then_some(tool_deltas),
                },
                finish_reason,
            }
        })
        .collect();

    // Usage metadata rides on every event; keep it on the closing one only
    let finished = choices.iter().any(|c| c.finish_reason.is_some());
    let mut chunk = ctx.chunk(choices, if finished { usage } else { None });
    if let Some(model) = payload.get("modelVersion").and_then(Value::as_str) {
        chunk.model = model.to_string();
    }
    Ok(Some(chunk))
}

fn gemini_candidates(payload: &Value) -> Result<&Vec<Value>, ProviderError> {
    let provider = ProviderKind::Gemini;
    if let Some(reason) = payload
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(Value::as_str)
    {
        return Err(ProviderError::ContentPolicy {
            provider,
            message: format!("prompt blocked: {}", reason),
        });
    }
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::protocol(provider, "response has no candidates"))
}

fn gemini_parts(candidate: &Value) -> (String, Vec<ToolCall>) {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array);
    for part in parts.into_iter().flatten() {
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
            let args = call.get("args").cloned().unwrap_or_else(|| serde_json::json!({}));
            tool_calls.push(ToolCall::new(format!("call_{}", tool_calls.len()), name, args.to_string()));
        }
    }
    (text, tool_calls)
}

fn gemini_usage(usage: &Value) -> Option<Usage> {
    if !usage.is_object() {
        return None;
    }
    let prompt = u32_field(usage, "promptTokenCount");
    let completion = u32_field(usage, "candidatesTokenCount");
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: usage
            .get("totalTokenCount")
            .and_then(Value::as_u64)
            .map(clamp_u32)
            .unwrap_or(prompt.saturating_add(completion)),
        cost: None,
    })
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn index_of(value: &Value, position: usize) -> u32 {
    value
        .get("index")
        .and_then(Value::as_u64)
        .map(clamp_u32)
        .unwrap_or(position as u32)
}

fn u32_field(value: &Value, key: &str) -> u32 {
    value.get(key).and_then(Value::as_u64).map(clamp_u32).unwrap_or(0)
}

fn clamp_u32(n: u64) -> u32 {
    n.min(u32::MAX as u64) as u32
}

fn string_or<F: FnOnce() -> String>(value: &Value, key: &str, fallback: F) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(fallback)
}

fn generated_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
