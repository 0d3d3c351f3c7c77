//! OpenAI-compatible HTTP front end.
//!
//! Thin axum layer over a shared [`Dispatcher`]:
//!
//! - `POST /v1/chat/completions` (also `/chat/completions`) - JSON or SSE
//! - `GET /v1/models` - logical model names
//! - `GET /v1/providers/status` - instance health plus metrics
//! - `GET /health` - liveness
//!
//! Every failure is answered with an [`ErrorEnvelope`] and the HTTP
//! status taken from [`DispatchError::code`].

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{DispatchError, ErrorBody, ErrorEnvelope};
use crate::llm::Dispatcher;
use crate::types::{ChatRequest, ChatResponse, StreamChunk};

/// HTTP server bound to one dispatcher
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
}

impl Server {
    /// Create a server for `dispatcher`; nothing is bound until [`start`](Self::start)
    pub fn new(dispatcher: Arc<Dispatcher>, config: ServerConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Router for embedding into another axum app
    pub fn router(&self) -> Router {
        router(self.dispatcher.clone())
    }

    /// Serve until Ctrl-C
    pub async fn start(self) -> Result<(), std::io::Error> {
        let app = self.router();
        let bind_addr = self.config.addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

        info!(
            addr = %bind_addr,
            models = self.dispatcher.models().len(),
            instances = self.dispatcher.registry().instance_count(),
            "Starting switchboard HTTP server"
        );

        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await
    }
}

/// Router with every endpoint and permissive CORS
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/providers/status", get(provider_status))
        .route("/health", get(health))
        .with_state(dispatcher)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Error response carrying the JSON envelope
struct ApiError {
    status: StatusCode,
    envelope: ErrorEnvelope,
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        Self {
            status: StatusCode::from_u16(error.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            envelope: ErrorEnvelope::from(&error),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = rejection.status();
        Self {
            status,
            envelope: ErrorEnvelope {
                error: ErrorBody {
                    message: rejection.body_text(),
                    kind: "invalid_request",
                    code: status.as_u16(),
                    attempts: Vec::new(),
                },
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}

async fn chat_completions(
    State(dispatcher): State<Arc<Dispatcher>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;

    if !request.stream {
        let response = dispatcher.complete(&request).await?;
        return Ok(Json(completion_body(&response)).into_response());
    }

    let stream = dispatcher.stream(&request).await?;
    let events = stream
        .map(|item| match item {
            Ok(chunk) => Event::default().data(chunk_body(&chunk).to_string()),
            Err(e) => {
                warn!(error_kind = e.kind(), "Stream ended with error: {}", e);
                Event::default().data(json!(ErrorEnvelope::from(&e)).to_string())
            }
        })
        .chain(futures::stream::once(async { Event::default().data("[DONE]") }))
        .map(Ok::<_, Infallible>);

    Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response())
}

fn completion_body(response: &ChatResponse) -> Value {
    let mut body = json!(response);
    body["object"] = json!("chat.completion");
    body
}

fn chunk_body(chunk: &StreamChunk) -> Value {
    let mut body = json!(chunk);
    body["object"] = json!("chat.completion.chunk");
    body
}

async fn list_models(State(dispatcher): State<Arc<Dispatcher>>) -> Json<Value> {
    let data: Vec<Value> = dispatcher
        .registry()
        .pools()
        .map(|pool| {
            let owned_by = pool
                .instances()
                .first()
                .map(|i| i.provider_kind().as_str())
                .unwrap_or("switchboard");
            json!({ "id": pool.model(), "object": "model", "owned_by": owned_by })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

async fn provider_status(State(dispatcher): State<Arc<Dispatcher>>) -> Json<Value> {
    Json(json!({
        "timestamp": chrono::Utc::now(),
        "pools": dispatcher.status(),
        "metrics": dispatcher.metrics().provider_breakdown(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": chrono::Utc::now() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::llm::instance::tests::EchoProvider;
    use crate::llm::providers::retry::RetryConfig;
    use crate::llm::traits::{ChatProvider, ChatStream, ModelConfig, ProviderError, ProviderKind};
    use crate::llm::PoolRegistry;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    /// Streams "Hel" then "lo"; refuses plain completions
    #[derive(Debug)]
    struct SplitProvider;

    #[async_trait]
    impl ChatProvider for SplitProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Qwen
        }

        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Err(ProviderError::invalid_request(ProviderKind::Qwen, "stream only"))
        }

        async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
            let chunks = vec![
                Ok(StreamChunk::text("s-1", 0, request.model.clone(), "Hel")),
                Ok(StreamChunk::text("s-1", 0, request.model.clone(), "lo")),
            ];
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    fn app() -> Router {
        let bindings: Vec<(ModelConfig, Arc<dyn ChatProvider>)> = vec![
            (
                ModelConfig::new(ProviderKind::DeepSeek, "echo").with_api_key("k1"),
                Arc::new(EchoProvider),
            ),
            (
                ModelConfig::new(ProviderKind::Qwen, "split").with_api_key("k2"),
                Arc::new(SplitProvider),
            ),
        ];
        let config = DispatcherConfig {
            retry: RetryConfig::immediate(),
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(PoolRegistry::from_providers(bindings).unwrap(), config);
        router(Arc::new(dispatcher))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_completion_envelope() {
        let response = app()
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "model": "echo", "messages": [{ "role": "user", "content": "ping" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "ping");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn test_unknown_model_is_404_envelope() {
        let response = app()
            .oneshot(post_json(
                "/chat/completions",
                json!({ "model": "nope", "messages": [{ "role": "user", "content": "ping" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["type"], "unknown_model");
        assert_eq!(body["error"]["code"], 404);
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let response = app()
            .oneshot(post_json("/v1/chat/completions", json!({ "messages": "nope" })))
            .await
            .unwrap();
        assert!(response.status().is_client_error());

        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn test_streaming_sse_ends_with_done() {
        let response = app()
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "model": "split", "stream": true, "messages": [{ "role": "user", "content": "hi" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let text = body_text(response).await;
        let data: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .collect();
        assert_eq!(data.len(), 3);
        assert_eq!(data[2], "[DONE]");

        let first: Value = serde_json::from_str(data[0]).unwrap();
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
    }

    #[tokio::test]
    async fn test_models_and_status() {
        let app = app();
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "echo");
        assert_eq!(body["data"][1]["owned_by"], "qwen");

        let response = app
            .oneshot(Request::builder().uri("/v1/providers/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["pools"].as_array().unwrap().len(), 2);
        assert_eq!(body["pools"][0]["instances"][0]["available"], true);
    }
}
