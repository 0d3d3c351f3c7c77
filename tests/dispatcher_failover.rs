//! Failover behaviour of the dispatcher against scripted in-process providers

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use switchboard::config::DispatcherConfig;
use switchboard::error::DispatchError;
use switchboard::llm::providers::retry::RetryConfig;
use switchboard::llm::traits::{ChatProvider, ChatStream, ModelConfig, ProviderError, ProviderKind};
use switchboard::llm::{DispatchOptions, Dispatcher, HealthPolicy, LoadBalanceStrategy, PoolRegistry};
use switchboard::types::{ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, StreamChunk};

#[derive(Debug, Clone)]
enum Outcome {
    Reply(&'static str),
    /// Streams these pieces; the last one carries `stop`
    Pieces(Vec<&'static str>),
    /// Streams one piece, then drops the connection
    BreakAfter(&'static str),
    /// Streams one piece, then the vendor rejects the content
    RejectAfter(&'static str),
    /// Stream opens but its first item is an error
    EmptyTimeout,
    Timeout,
    RateLimited,
    ServerError,
    BadRequest,
    /// The deployment behind this instance does not exist
    MissingDeployment,
    Hang,
}

#[derive(Debug)]
struct ScriptedProvider {
    kind: ProviderKind,
    /// One outcome per call; the last one repeats
    script: Vec<Outcome>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    fn new(kind: ProviderKind, script: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script,
            calls: AtomicU32::new(0),
        })
    }

    fn always(outcome: Outcome) -> Arc<Self> {
        Self::new(ProviderKind::DeepSeek, vec![outcome])
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Outcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        self.script[call.min(self.script.len() - 1)].clone()
    }

    fn error(&self, outcome: &Outcome) -> ProviderError {
        match outcome {
            Outcome::RateLimited => ProviderError::from_status(self.kind, 429, "slow down", None),
            Outcome::ServerError => ProviderError::from_status(self.kind, 503, "overloaded", None),
            Outcome::BadRequest => ProviderError::from_status(self.kind, 400, "messages must not be empty", None),
            Outcome::MissingDeployment => ProviderError::from_status(self.kind, 404, "DeploymentNotFound", None),
            _ => ProviderError::timeout(self.kind, "no response within 60s"),
        }
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        match self.next_outcome() {
            Outcome::Reply(text) => Ok(ChatResponse {
                id: "resp-1".to_string(),
                created: 0,
                model: request.model.clone(),
                choices: vec![Choice {
                    index: 0,
                    message: ChatMessage::assistant(text),
                    finish_reason: FinishReason::Stop,
                }],
                usage: None,
            }),
            Outcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::timeout(self.kind, "hung"))
            }
            other => Err(self.error(&other)),
        }
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
        let model = request.model.clone();
        match self.next_outcome() {
            Outcome::Pieces(pieces) => {
                let last = pieces.len() - 1;
                let chunks: Vec<Result<StreamChunk, ProviderError>> = pieces
                    .into_iter()
                    .enumerate()
                    .map(|(i, piece)| {
                        let mut chunk = StreamChunk::text("s-1", 0, model.clone(), piece);
                        if i == last {
                            chunk.choices[0].finish_reason = Some(FinishReason::Stop);
                        }
                        Ok(chunk)
                    })
                    .collect();
                Ok(futures::stream::iter(chunks).boxed())
            }
            Outcome::BreakAfter(piece) => {
                let kind = self.kind;
                let chunks = vec![
                    Ok(StreamChunk::text("s-1", 0, model, piece)),
                    Err(ProviderError::connection(kind, "connection reset by peer")),
                ];
                Ok(futures::stream::iter(chunks).boxed())
            }
            Outcome::RejectAfter(piece) => {
                let kind = self.kind;
                let chunks = vec![
                    Ok(StreamChunk::text("s-1", 0, model, piece)),
                    Err(ProviderError::ContentPolicy {
                        provider: kind,
                        message: "output blocked".to_string(),
                    }),
                ];
                Ok(futures::stream::iter(chunks).boxed())
            }
            Outcome::EmptyTimeout => {
                let error = ProviderError::timeout(self.kind, "first chunk never arrived");
                Ok(futures::stream::iter(vec![Err(error)]).boxed())
            }
            Outcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::timeout(self.kind, "hung"))
            }
            other => Err(self.error(&other)),
        }
    }
}

fn dispatcher(model: &str, providers: &[Arc<ScriptedProvider>], max_retries: u32) -> Dispatcher {
    dispatcher_with(model, providers, max_retries, HealthPolicy::default())
}

fn dispatcher_with(model: &str, providers: &[Arc<ScriptedProvider>], max_retries: u32, health: HealthPolicy) -> Dispatcher {
    let bindings = providers
        .iter()
        .enumerate()
        .map(|(i, provider)| {
            let config = ModelConfig::new(provider.kind, model)
                .with_api_key(format!("key-{}", i))
                .with_max_retries(max_retries);
            (config, Arc::clone(provider) as Arc<dyn ChatProvider>)
        })
        .collect();
    let config = DispatcherConfig {
        default_strategy: LoadBalanceStrategy::RoundRobin,
        retry: RetryConfig::immediate(),
        health,
    };
    Dispatcher::new(PoolRegistry::from_providers(bindings).unwrap(), config)
}

fn request(model: &str) -> ChatRequest {
    ChatRequest::new(model, vec![ChatMessage::user("hello")])
}

fn first_available() -> DispatchOptions {
    DispatchOptions::default().with_strategy(LoadBalanceStrategy::FirstAvailable)
}

fn availability(dispatcher: &Dispatcher) -> Vec<bool> {
    dispatcher.status()[0].instances.iter().map(|i| i.available).collect()
}

#[tokio::test]
async fn test_round_robin_visits_every_instance_once_per_cycle() {
    let providers = vec![
        ScriptedProvider::always(Outcome::Reply("a")),
        ScriptedProvider::always(Outcome::Reply("b")),
        ScriptedProvider::always(Outcome::Reply("c")),
    ];
    let dispatcher = dispatcher("chat", &providers, 0);

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(dispatcher.complete(&request("chat")).await.unwrap().content().to_string());
    }
    seen.sort();
    assert_eq!(seen, ["a", "b", "c"]);
    assert!(providers.iter().all(|p| p.calls() == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_robin_cursor_under_concurrency() {
    let providers = vec![
        ScriptedProvider::always(Outcome::Reply("a")),
        ScriptedProvider::always(Outcome::Reply("b")),
        ScriptedProvider::always(Outcome::Reply("c")),
    ];
    let dispatcher = Arc::new(dispatcher("chat", &providers, 0));

    let tasks: Vec<_> = (0..30)
        .map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.complete(&request("chat")).await })
        })
        .collect();

    let mut counts: HashMap<String, u32> = HashMap::new();
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        *counts.entry(response.content().to_string()).or_default() += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 10), "uneven rotation: {:?}", counts);
}

#[tokio::test]
async fn test_transient_failures_fail_over_to_next_instance() {
    let providers = vec![
        ScriptedProvider::always(Outcome::Timeout),
        ScriptedProvider::always(Outcome::RateLimited),
        ScriptedProvider::always(Outcome::Reply("served")),
    ];
    let dispatcher = dispatcher("chat", &providers, 0);

    let response = dispatcher.complete_with(&request("chat"), first_available()).await.unwrap();
    assert_eq!(response.content(), "served");
    assert_eq!(availability(&dispatcher), [false, false, true]);
    assert_eq!(providers.iter().map(|p| p.calls()).collect::<Vec<_>>(), [1, 1, 1]);
}

#[tokio::test]
async fn test_retries_stay_on_instance_within_budget() {
    let flaky = ScriptedProvider::new(
        ProviderKind::Qwen,
        vec![Outcome::ServerError, Outcome::Timeout, Outcome::Reply("third time")],
    );
    let spare = ScriptedProvider::always(Outcome::Reply("spare"));
    let dispatcher = dispatcher("chat", &[flaky.clone(), spare.clone()], 3);

    let response = dispatcher.complete_with(&request("chat"), first_available()).await.unwrap();
    assert_eq!(response.content(), "third time");
    assert_eq!(flaky.calls(), 3);
    assert_eq!(spare.calls(), 0);
    assert_eq!(dispatcher.status()[0].instances[0].consecutive_failures, 0);
}

#[tokio::test]
async fn test_all_transient_failures_exhaust_pool() {
    let providers = vec![
        ScriptedProvider::always(Outcome::Timeout),
        ScriptedProvider::always(Outcome::ServerError),
        ScriptedProvider::always(Outcome::RateLimited),
    ];
    let dispatcher = dispatcher("chat", &providers, 1);

    let err = dispatcher.complete(&request("chat")).await.unwrap_err();
    assert_eq!(err.kind(), "exhausted");
    assert_eq!(err.code(), 503);
    assert_eq!(err.instances_tried(), providers.len());
    match &err {
        DispatchError::Exhausted { model, attempts } => {
            assert_eq!(model, "chat");
            assert!(attempts.iter().all(|a| a.attempts == 2));
            let mut instances: Vec<&str> = attempts.iter().map(|a| a.instance.as_str()).collect();
            instances.sort();
            assert_eq!(instances, ["chat#0", "chat#1", "chat#2"]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.last_cause().unwrap().is_transient());
    assert!(providers.iter().all(|p| p.calls() == 2));
}

#[tokio::test]
async fn test_request_error_stops_dispatch() {
    let rejecting = ScriptedProvider::always(Outcome::BadRequest);
    let healthy = ScriptedProvider::always(Outcome::Reply("never"));
    let dispatcher = dispatcher("chat", &[rejecting.clone(), healthy.clone()], 3);

    let err = dispatcher.complete_with(&request("chat"), first_available()).await.unwrap_err();
    match &err {
        DispatchError::Request { instance, attempts, source } => {
            assert_eq!(instance, "chat#0");
            assert_eq!(*attempts, 1);
            assert!(source.to_string().contains("messages must not be empty"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.code(), 400);
    assert_eq!(rejecting.calls(), 1);
    assert_eq!(healthy.calls(), 0);
    // the request was at fault, not the instance
    assert_eq!(availability(&dispatcher), [true, true]);
}

#[tokio::test]
async fn test_missing_deployment_fails_over_without_retry() {
    let misconfigured = ScriptedProvider::new(ProviderKind::OpenAi, vec![Outcome::MissingDeployment]);
    let healthy = ScriptedProvider::always(Outcome::Reply("served"));
    let dispatcher = dispatcher("chat", &[misconfigured.clone(), healthy.clone()], 3);

    let response = dispatcher.complete_with(&request("chat"), first_available()).await.unwrap();
    assert_eq!(response.content(), "served");
    // retrying a missing deployment cannot help
    assert_eq!(misconfigured.calls(), 1);
    assert_eq!(healthy.calls(), 1);
    assert_eq!(availability(&dispatcher), [false, true]);
}

#[tokio::test]
async fn test_timeout_then_hi_with_first_available() {
    let a = ScriptedProvider::always(Outcome::Timeout);
    let b = ScriptedProvider::always(Outcome::Reply("hi"));
    let dispatcher = dispatcher("chat", &[a, b], 0);

    let response = dispatcher.complete_with(&request("chat"), first_available()).await.unwrap();
    assert_eq!(response.content(), "hi");
    assert_eq!(response.finish_reason(), Some(FinishReason::Stop));
    assert_eq!(availability(&dispatcher), [false, true]);

    let metrics = dispatcher.metrics().summary(ProviderKind::DeepSeek);
    assert_eq!(metrics.total_requests, 2);
    assert_eq!(metrics.successful_requests, 1);
    assert_eq!(metrics.errors.get("timeout"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_cooling_instance_is_readmitted_after_cooldown() {
    let a = ScriptedProvider::new(ProviderKind::DeepSeek, vec![Outcome::Timeout, Outcome::Reply("a")]);
    let b = ScriptedProvider::always(Outcome::Reply("b"));
    let health = HealthPolicy {
        cooldown: Duration::from_secs(10),
        cooldown_multiplier: 2.0,
        max_cooldown: Duration::from_secs(60),
    };
    let dispatcher = dispatcher_with("chat", &[a.clone(), b.clone()], 0, health);

    assert_eq!(dispatcher.complete_with(&request("chat"), first_available()).await.unwrap().content(), "b");
    // a is cooling, so b goes first
    assert_eq!(dispatcher.complete_with(&request("chat"), first_available()).await.unwrap().content(), "b");
    assert_eq!(a.calls(), 1);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(dispatcher.complete_with(&request("chat"), first_available()).await.unwrap().content(), "a");
    assert_eq!(availability(&dispatcher), [true, true]);
}

#[tokio::test]
async fn test_all_cooling_instances_are_still_tried() {
    let only = ScriptedProvider::new(ProviderKind::Gemini, vec![Outcome::Timeout, Outcome::Reply("back")]);
    let dispatcher = dispatcher("chat", &[only.clone()], 0);

    assert!(dispatcher.complete(&request("chat")).await.is_err());
    assert_eq!(availability(&dispatcher), [false]);

    let response = dispatcher.complete(&request("chat")).await.unwrap();
    assert_eq!(response.content(), "back");
    assert_eq!(only.calls(), 2);
}

#[tokio::test]
async fn test_stream_preserves_chunk_order() {
    let provider = ScriptedProvider::always(Outcome::Pieces(vec!["Hel", "lo", "!"]));
    let dispatcher = dispatcher("chat", &[provider], 0);

    let stream = dispatcher.stream(&request("chat")).await.unwrap();
    assert_eq!(stream.instance(), "chat#0");
    let chunks: Vec<StreamChunk> = stream.map(|c| c.unwrap()).collect().await;

    let texts: Vec<String> = chunks.iter().map(|c| c.content()).collect();
    assert_eq!(texts, ["Hel", "lo", "!"]);
    let reasons: Vec<Option<FinishReason>> = chunks.iter().map(|c| c.finish_reason()).collect();
    assert_eq!(reasons, [None, None, Some(FinishReason::Stop)]);

    // the ledger records the stream once it is dropped
    assert_eq!(dispatcher.metrics().summary(ProviderKind::DeepSeek).successful_requests, 1);
}

#[tokio::test]
async fn test_stream_fails_over_before_first_chunk() {
    let broken = ScriptedProvider::always(Outcome::EmptyTimeout);
    let working = ScriptedProvider::always(Outcome::Pieces(vec!["ok"]));
    let dispatcher = dispatcher("chat", &[broken.clone(), working], 0);

    let stream = dispatcher.stream_with(&request("chat"), first_available()).await.unwrap();
    assert_eq!(stream.instance(), "chat#1");
    let texts: Vec<String> = stream.map(|c| c.unwrap().content()).collect().await;
    assert_eq!(texts, ["ok"]);
    assert_eq!(broken.calls(), 1);
    assert_eq!(availability(&dispatcher), [false, true]);
}

#[tokio::test]
async fn test_mid_stream_failure_is_delivered_without_failover() {
    let breaking = ScriptedProvider::always(Outcome::BreakAfter("Hel"));
    let spare = ScriptedProvider::always(Outcome::Pieces(vec!["unused"]));
    let dispatcher = dispatcher("chat", &[breaking, spare.clone()], 0);

    let items: Vec<_> = dispatcher
        .stream_with(&request("chat"), first_available())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap().content(), "Hel");
    match &items[1] {
        Err(DispatchError::Interrupted { instance, source }) => {
            assert_eq!(instance, "chat#0");
            assert_eq!(source.kind_str(), "connection");
        }
        other => panic!("unexpected item: {other:?}"),
    }
    assert_eq!(spare.calls(), 0);
    assert_eq!(availability(&dispatcher), [false, true]);
}

#[tokio::test]
async fn test_mid_stream_rejection_reports_attempts_used() {
    let flaky = ScriptedProvider::new(
        ProviderKind::Gemini,
        vec![Outcome::EmptyTimeout, Outcome::RejectAfter("Hel")],
    );
    let dispatcher = dispatcher("chat", &[flaky.clone()], 2);

    let items: Vec<_> = dispatcher.stream(&request("chat")).await.unwrap().collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap().content(), "Hel");
    match &items[1] {
        Err(DispatchError::Request { instance, attempts, source }) => {
            assert_eq!(instance, "chat#0");
            assert_eq!(*attempts, 2);
            assert_eq!(source.kind_str(), "content_policy");
        }
        other => panic!("unexpected item: {other:?}"),
    }
    assert_eq!(flaky.calls(), 2);
    // content rejection is not the instance's fault
    assert_eq!(availability(&dispatcher), [true]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_aborts_in_flight_call() {
    let hanging = ScriptedProvider::always(Outcome::Hang);
    let dispatcher = dispatcher("chat", &[hanging.clone()], 3);

    let options = DispatchOptions::default().with_timeout(Duration::from_secs(5));
    let err = dispatcher.complete_with(&request("chat"), options).await.unwrap_err();
    assert_eq!(err.code(), 504);
    match err {
        DispatchError::DeadlineExceeded { model, timeout } => {
            assert_eq!(model, "chat");
            assert_eq!(timeout, Duration::from_secs(5));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(hanging.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_dispatch() {
    let hanging = ScriptedProvider::always(Outcome::Hang);
    let dispatcher = dispatcher("chat", &[hanging], 0);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = dispatcher
        .complete_with(&request("chat"), DispatchOptions::default().with_cancel(token))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "cancelled");
    assert_eq!(err.code(), 499);
}

#[tokio::test]
async fn test_cancellation_terminates_returned_stream() {
    let provider = ScriptedProvider::always(Outcome::Pieces(vec!["a", "b", "c"]));
    let dispatcher = dispatcher("chat", &[provider], 0);
    let token = CancellationToken::new();

    let mut stream = dispatcher
        .stream_with(&request("chat"), DispatchOptions::default().with_cancel(token.clone()))
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap().content(), "a");

    token.cancel();
    assert!(matches!(stream.next().await, Some(Err(DispatchError::Cancelled { .. }))));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_blocking_call_inside_runtime_makes_no_network_call() {
    let provider = ScriptedProvider::always(Outcome::Reply("hi"));
    let dispatcher = dispatcher("chat", &[provider.clone()], 0);

    let err = dispatcher.complete_blocking(&request("chat")).unwrap_err();
    assert_eq!(err.kind(), "concurrency_misuse");
    assert_eq!(provider.calls(), 0);
}

#[test]
fn test_blocking_stream_outside_runtime() {
    let provider = ScriptedProvider::always(Outcome::Pieces(vec!["Hel", "lo", "!"]));
    let dispatcher = dispatcher("chat", &[provider], 0);

    let texts: Vec<String> = dispatcher
        .stream_blocking(&request("chat"))
        .unwrap()
        .map(|c| c.unwrap().content())
        .collect();
    assert_eq!(texts, ["Hel", "lo", "!"]);
}

#[tokio::test]
async fn test_unknown_model() {
    let dispatcher = dispatcher("chat", &[ScriptedProvider::always(Outcome::Reply("x"))], 0);
    let err = dispatcher.complete(&request("missing")).await.unwrap_err();
    assert_eq!(err.kind(), "unknown_model");
    assert_eq!(err.code(), 404);
    assert_eq!(err.instances_tried(), 0);
}
