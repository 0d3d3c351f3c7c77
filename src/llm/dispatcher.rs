//! Failover engine.
//!
//! A [`Dispatcher`] owns the pool registry and is the single entry point
//! for chat completions. For each dispatch it ranks the pool's instances
//! with the requested [`LoadBalanceStrategy`], tries them in order (healthy
//! ones first), retries each one within its own `max_retries` budget and
//! fails over on transient errors. Request errors end the dispatch at once.
//!
//! ```no_run
//! use switchboard::llm::dispatcher::{DispatchOptions, Dispatcher};
//! use switchboard::config::DispatcherConfig;
//! use switchboard::llm::traits::{ModelConfig, ProviderKind};
//! use switchboard::types::{ChatMessage, ChatRequest};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let configs = vec![
//!     ModelConfig::new(ProviderKind::DeepSeek, "chat").with_api_key("sk-one"),
//!     ModelConfig::new(ProviderKind::Qwen, "chat").with_api_key("sk-two"),
//! ];
//! let dispatcher = Dispatcher::from_configs(configs, DispatcherConfig::default()).await?;
//!
//! let request = ChatRequest::new("chat", vec![ChatMessage::user("Hello")]);
//! let options = DispatchOptions::default().with_timeout(Duration::from_secs(30));
//! let response = dispatcher.complete_with(&request, options).await?;
//! println!("{}", response.content());
//! # Ok(())
//! # }
//! ```

use futures::stream::{BoxStream, Stream, StreamExt};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, DispatcherConfig, GatewayConfig};
use crate::error::{AttemptFailure, DispatchError, Result};
use crate::llm::instance::{InstanceStatus, ProviderInstance};
use crate::llm::pool::{LoadBalanceStrategy, ProviderPool};
use crate::llm::providers::retry::{retry_with_backoff, should_retry_provider_error, RetryOutcome};
use crate::llm::registry::PoolRegistry;
use crate::llm::traits::{ChatStream, ModelConfig, ProviderError, ProviderKind};
use crate::metrics::{MetricsCollector, RequestRecord};
use crate::types::{ChatRequest, ChatResponse, StreamChunk, Usage};

/// Per-dispatch overrides
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Takes precedence over the request's own strategy and the default
    pub strategy: Option<LoadBalanceStrategy>,
    /// Deadline for the whole dispatch, including a returned stream
    pub timeout: Option<Duration>,
    /// Abort the dispatch when this token fires
    pub cancel: Option<CancellationToken>,
}

impl DispatchOptions {
    /// Override the ranking strategy for this dispatch
    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Bound the whole dispatch, retries and backoff included.
    /// A duration too large to represent means no deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Abort the dispatch, and any stream it returned, when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Result of [`Dispatcher::dispatch`]
#[derive(Debug)]
pub enum Dispatched {
    Complete(ChatResponse),
    Stream(DispatchStream),
}

/// Health snapshot of one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub model: String,
    /// Instances eligible for selection right now
    pub available_instances: usize,
    pub instances: Vec<InstanceStatus>,
}

/// Resolved pool and controls for one dispatch
struct Plan<'a> {
    pool: &'a ProviderPool,
    strategy: LoadBalanceStrategy,
    cancel: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

/// Winning attempt of a failover walk
struct Served<T> {
    value: T,
    instance: Arc<ProviderInstance>,
    started: Instant,
    /// Calls made against the winning instance
    attempts: u32,
}

/// A stream opened on some instance, with its first item already read
type Primed = (Option<StreamChunk>, ChatStream);

/// Load-balancing, failover dispatch over a set of provider pools.
///
/// Share one instance by `Arc`; every method takes `&self`.
pub struct Dispatcher {
    registry: PoolRegistry,
    config: DispatcherConfig,
    metrics: Arc<MetricsCollector>,
    /// Created on first blocking call, then reused
    runtime: OnceCell<tokio::runtime::Runtime>,
}

impl Dispatcher {
    /// Create a dispatcher over already-built pools
    pub fn new(registry: PoolRegistry, config: DispatcherConfig) -> Self {
        Self {
            registry,
            config,
            metrics: Arc::new(MetricsCollector::new()),
            runtime: OnceCell::new(),
        }
    }

    /// Build adapters for every config and group them into pools
    pub async fn from_configs(configs: Vec<ModelConfig>, config: DispatcherConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let registry = PoolRegistry::from_configs(configs).await?;
        Ok(Self::new(registry, config))
    }

    /// Build from a loaded [`GatewayConfig`], expanding multi-key entries
    pub async fn from_gateway_config(gateway: &GatewayConfig) -> std::result::Result<Self, ConfigError> {
        Self::from_configs(gateway.model_configs()?, gateway.dispatcher.clone()).await
    }

    /// Synchronous construction for callers without an async runtime.
    /// The runtime used here is kept for the blocking entry points.
    pub fn from_configs_blocking(
        configs: Vec<ModelConfig>,
        config: DispatcherConfig,
    ) -> std::result::Result<Self, ConfigError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(ConfigError::ConcurrencyMisuse);
        }
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let dispatcher = runtime.block_on(Self::from_configs(configs, config))?;
        // freshly built, so the cell is empty
        let _ = dispatcher.runtime.set(runtime);
        Ok(dispatcher)
    }

    /// Get the pools this dispatcher routes over
    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Per-provider request metrics recorded by this dispatcher
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Logical model names in registration order
    pub fn models(&self) -> &[String] {
        self.registry.models()
    }

    /// Per-pool, per-instance health and counters
    pub fn status(&self) -> Vec<PoolStatus> {
        self.registry
            .pools()
            .map(|pool| {
                let instances: Vec<InstanceStatus> = pool
                    .instances()
                    .iter()
                    .map(|i| i.status(&self.config.health))
                    .collect();
                PoolStatus {
                    model: pool.model().to_string(),
                    available_instances: instances.iter().filter(|s| s.available).count(),
                    instances,
                }
            })
            .collect()
    }

    /// Complete `request` on the pool named by `request.model`
    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.complete_with(request, DispatchOptions::default()).await
    }

    /// Complete with explicit strategy, deadline or cancellation.
    ///
    /// Fails with [`DispatchError::UnknownModel`] when no pool matches,
    /// [`DispatchError::Request`] when the request itself is rejected and
    /// [`DispatchError::Exhausted`] when every instance failed.
    pub async fn complete_with(&self, request: &ChatRequest, options: DispatchOptions) -> Result<ChatResponse> {
        let plan = self.plan(request, options, false)?;
        let served = abortable(
            self.failover(plan.pool, plan.strategy, |instance| async move {
                self.attempt_complete(&instance, request).await
            }),
            &request.model,
            &plan.cancel,
            plan.deadline,
        )
        .await?;

        self.metrics.record(RequestRecord::success(
            served.instance.provider_kind(),
            served.instance.config().vendor_model(),
            served.started.elapsed(),
            served.value.usage,
        ));
        Ok(served.value)
    }

    /// Open a canonical chunk stream on the pool named by `request.model`
    pub async fn stream(&self, request: &ChatRequest) -> Result<DispatchStream> {
        self.stream_with(request, DispatchOptions::default()).await
    }

    /// Streaming counterpart of [`complete_with`](Self::complete_with).
    ///
    /// Failover covers opening the stream and its first item; later
    /// failures are delivered through the stream.
    pub async fn stream_with(&self, request: &ChatRequest, options: DispatchOptions) -> Result<DispatchStream> {
        let plan = self.plan(request, options, true)?;
        let served = abortable(
            self.failover(plan.pool, plan.strategy, |instance| async move {
                self.attempt_stream(&instance, request).await
            }),
            &request.model,
            &plan.cancel,
            plan.deadline,
        )
        .await?;

        Ok(DispatchStream::new(
            served,
            request.model.clone(),
            plan.cancel,
            plan.deadline,
            Arc::clone(&self.metrics),
        ))
    }

    /// Single entry point covering both shapes; the pool is selected by
    /// `request.model`
    pub async fn dispatch(&self, request: &ChatRequest, options: DispatchOptions, streaming: bool) -> Result<Dispatched> {
        if streaming {
            self.stream_with(request, options).await.map(Dispatched::Stream)
        } else {
            self.complete_with(request, options).await.map(Dispatched::Complete)
        }
    }

    fn plan(&self, request: &ChatRequest, options: DispatchOptions, streaming: bool) -> Result<Plan<'_>> {
        let model = request.model.as_str();
        let pool = self.registry.get(model).ok_or_else(|| DispatchError::UnknownModel {
            model: model.to_string(),
            available: self.registry.models().to_vec(),
        })?;
        let strategy = options
            .strategy
            .or(request.strategy)
            .unwrap_or(self.config.default_strategy);

        tracing::debug!(model = %model, strategy = %strategy, streaming, "Dispatching request");
        Ok(Plan {
            pool,
            strategy,
            cancel: options.cancel.unwrap_or_default(),
            // a timeout too large to represent means no deadline
            deadline: options
                .timeout
                .and_then(|timeout| Instant::now().checked_add(timeout).map(|at| (at, timeout))),
        })
    }

    /// Healthy instances in ranking order, then the cooling ones as a
    /// last resort
    fn candidates(&self, pool: &ProviderPool, strategy: LoadBalanceStrategy) -> Vec<Arc<ProviderInstance>> {
        let (ready, cooling): (Vec<_>, Vec<_>) = pool
            .select(strategy)
            .into_iter()
            .partition(|instance| instance.is_available(&self.config.health));
        if ready.is_empty() {
            tracing::warn!(model = %pool.model(), "No healthy instances; trying cooling ones anyway");
        }
        ready.into_iter().chain(cooling).collect()
    }

    async fn failover<T, F, Fut>(&self, pool: &ProviderPool, strategy: LoadBalanceStrategy, mut call: F) -> Result<Served<T>>
    where
        F: FnMut(Arc<ProviderInstance>) -> Fut,
        Fut: Future<Output = RetryOutcome<T, ProviderError>>,
    {
        let mut failures = Vec::new();

        for instance in self.candidates(pool, strategy) {
            let started = Instant::now();
            let RetryOutcome { result, attempts } = call(Arc::clone(&instance)).await;

            let error = match result {
                Ok(value) => {
                    instance.mark_success();
                    tracing::info!(
                        model = %pool.model(),
                        instance = %instance.id(),
                        provider = %instance.provider_kind(),
                        attempt = attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Dispatch served"
                    );
                    return Ok(Served {
                        value,
                        instance,
                        started,
                        attempts,
                    });
                }
                Err(error) => error,
            };

            self.metrics.record(RequestRecord::failure(
                instance.provider_kind(),
                instance.config().vendor_model(),
                started.elapsed(),
                error.kind_str(),
            ));

            if !error.fails_over() {
                tracing::info!(
                    model = %pool.model(),
                    instance = %instance.id(),
                    error_kind = error.kind_str(),
                    "Request rejected; not failing over"
                );
                return Err(DispatchError::Request {
                    instance: instance.id().to_string(),
                    attempts,
                    source: error,
                });
            }

            instance.mark_failure();
            tracing::warn!(
                model = %pool.model(),
                instance = %instance.id(),
                provider = %instance.provider_kind(),
                attempt = attempts,
                error_kind = error.kind_str(),
                error = %error,
                "Instance failed; failing over"
            );
            failures.push(AttemptFailure {
                instance: instance.id().to_string(),
                provider: instance.provider_kind(),
                attempts,
                cause: error,
            });
        }

        tracing::error!(model = %pool.model(), instances_tried = failures.len(), "All instances failed");
        Err(DispatchError::Exhausted {
            model: pool.model().to_string(),
            attempts: failures,
        })
    }

    async fn attempt_complete(
        &self,
        instance: &ProviderInstance,
        request: &ChatRequest,
    ) -> RetryOutcome<ChatResponse, ProviderError> {
        retry_with_backoff(
            move |attempt| {
                Box::pin(async move {
                    tracing::debug!(instance = %instance.id(), attempt = attempt + 1, "Calling provider");
                    instance.complete(request).await
                })
            },
            &self.config.retry,
            instance.config().max_retries,
            should_retry_provider_error,
        )
        .await
    }

    /// Opening a stream counts as successful only once its first item
    /// arrives, so a stream that fails immediately still fails over.
    async fn attempt_stream(&self, instance: &ProviderInstance, request: &ChatRequest) -> RetryOutcome<Primed, ProviderError> {
        retry_with_backoff(
            move |attempt| {
                Box::pin(async move {
                    tracing::debug!(instance = %instance.id(), attempt = attempt + 1, "Opening provider stream");
                    let mut stream = instance.stream(request).await?;
                    match stream.next().await {
                        Some(Ok(chunk)) => Ok((Some(chunk), stream)),
                        Some(Err(error)) => Err(error),
                        None => Ok((None, stream)),
                    }
                })
            },
            &self.config.retry,
            instance.config().max_retries,
            should_retry_provider_error,
        )
        .await
    }

    /// Blocking [`complete`](Self::complete). Fails with
    /// [`DispatchError::ConcurrencyMisuse`] inside an async runtime.
    pub fn complete_blocking(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.complete_blocking_with(request, DispatchOptions::default())
    }

    /// Blocking [`complete_with`](Self::complete_with)
    pub fn complete_blocking_with(&self, request: &ChatRequest, options: DispatchOptions) -> Result<ChatResponse> {
        let runtime = self.blocking_runtime()?;
        runtime.block_on(self.complete_with(request, options))
    }

    /// Blocking [`stream`](Self::stream); chunks are pulled by iterating
    pub fn stream_blocking(&self, request: &ChatRequest) -> Result<BlockingStream<'_>> {
        self.stream_blocking_with(request, DispatchOptions::default())
    }

    /// Blocking [`stream_with`](Self::stream_with)
    pub fn stream_blocking_with(&self, request: &ChatRequest, options: DispatchOptions) -> Result<BlockingStream<'_>> {
        let runtime = self.blocking_runtime()?;
        let stream = runtime.block_on(self.stream_with(request, options))?;
        Ok(BlockingStream {
            runtime,
            stream: Some(stream),
        })
    }

    fn blocking_runtime(&self) -> Result<&tokio::runtime::Runtime> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(DispatchError::ConcurrencyMisuse);
        }
        self.runtime.get_or_try_init(|| {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| DispatchError::Runtime { message: e.to_string() })
        })
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics when the last handle
        // goes away inside another runtime
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("models", &self.registry.models())
            .field("instances", &self.registry.instance_count())
            .field("config", &self.config)
            .finish()
    }
}

/// Run `work` unless the token fires or the deadline passes first.
/// Losing the race drops `work`, aborting any in-flight call.
async fn abortable<T>(
    work: impl Future<Output = Result<T>>,
    model: &str,
    cancel: &CancellationToken,
    deadline: Option<(Instant, Duration)>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::info!(model = %model, "Dispatch cancelled");
            Err(DispatchError::Cancelled { model: model.to_string() })
        }
        _ = expiry(deadline) => {
            tracing::info!(model = %model, "Dispatch deadline exceeded");
            Err(deadline_exceeded(model, deadline))
        }
        result = work => result,
    }
}

async fn expiry(deadline: Option<(Instant, Duration)>) {
    match deadline {
        Some((at, _)) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn deadline_exceeded(model: &str, deadline: Option<(Instant, Duration)>) -> DispatchError {
    DispatchError::DeadlineExceeded {
        model: model.to_string(),
        timeout: deadline.map(|(_, timeout)| timeout).unwrap_or_default(),
    }
}

/// Canonical chunk stream returned by a streaming dispatch.
///
/// Dropping it closes the vendor connection. Cancellation and the
/// dispatch deadline still apply while it is being consumed.
pub struct DispatchStream {
    instance: String,
    provider: ProviderKind,
    inner: BoxStream<'static, Result<StreamChunk>>,
}

enum Step {
    Cancelled,
    Expired,
    Item(Option<std::result::Result<StreamChunk, ProviderError>>),
}

impl DispatchStream {
    fn new(
        served: Served<Primed>,
        model: String,
        cancel: CancellationToken,
        deadline: Option<(Instant, Duration)>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let Served {
            value: (first, mut rest),
            instance,
            started,
            attempts,
        } = served;
        let instance_id = instance.id().to_string();
        let provider = instance.provider_kind();
        let mut ledger = StreamLedger {
            metrics,
            provider,
            vendor_model: instance.config().vendor_model().to_string(),
            instance: instance_id.clone(),
            started,
            usage: None,
            chunks: 0,
            outcome: StreamOutcome::Open,
        };

        let inner = async_stream::stream! {
            match first {
                Some(chunk) => {
                    ledger.observe(&chunk);
                    yield Ok(chunk);
                }
                None => {
                    ledger.outcome = StreamOutcome::Completed;
                    return;
                }
            }

            let expired = expiry(deadline);
            tokio::pin!(expired);

            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    _ = &mut expired => Step::Expired,
                    item = rest.next() => Step::Item(item),
                };

                match step {
                    Step::Cancelled => {
                        ledger.outcome = StreamOutcome::Aborted;
                        yield Err(DispatchError::Cancelled { model: model.clone() });
                        break;
                    }
                    Step::Expired => {
                        ledger.outcome = StreamOutcome::Aborted;
                        yield Err(deadline_exceeded(&model, deadline));
                        break;
                    }
                    Step::Item(None) => {
                        ledger.outcome = StreamOutcome::Completed;
                        break;
                    }
                    Step::Item(Some(Ok(chunk))) => {
                        ledger.observe(&chunk);
                        yield Ok(chunk);
                    }
                    Step::Item(Some(Err(error))) => {
                        ledger.outcome = StreamOutcome::Failed(error.kind_str());
                        let error = if error.fails_over() {
                            instance.mark_failure();
                            tracing::warn!(
                                model = %model,
                                instance = %instance.id(),
                                error_kind = error.kind_str(),
                                "Stream failed after first chunk"
                            );
                            DispatchError::Interrupted { instance: instance.id().to_string(), source: error }
                        } else {
                            DispatchError::Request { instance: instance.id().to_string(), attempts, source: error }
                        };
                        yield Err(error);
                        break;
                    }
                }
            }
        };

        Self {
            instance: instance_id,
            provider,
            inner: inner.boxed(),
        }
    }

    /// Instance serving this stream
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Vendor behind the serving instance
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }
}

impl Stream for DispatchStream {
    type Item = Result<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl fmt::Debug for DispatchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchStream")
            .field("instance", &self.instance)
            .field("provider", &self.provider)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StreamOutcome {
    Open,
    Completed,
    Aborted,
    Failed(&'static str),
}

/// Records the stream's metrics exactly once, when the stream is dropped
struct StreamLedger {
    metrics: Arc<MetricsCollector>,
    provider: ProviderKind,
    vendor_model: String,
    instance: String,
    started: Instant,
    usage: Option<Usage>,
    chunks: u64,
    outcome: StreamOutcome,
}

impl StreamLedger {
    fn observe(&mut self, chunk: &StreamChunk) {
        self.chunks += 1;
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }
}

impl Drop for StreamLedger {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let record = match self.outcome {
            StreamOutcome::Failed(kind) => RequestRecord::failure(self.provider, self.vendor_model.as_str(), elapsed, kind),
            _ => RequestRecord::success(self.provider, self.vendor_model.as_str(), elapsed, self.usage),
        };
        self.metrics.record(record);

        match self.outcome {
            StreamOutcome::Open => tracing::debug!(
                instance = %self.instance,
                chunks = self.chunks,
                "Stream dropped before completion"
            ),
            outcome => tracing::debug!(
                instance = %self.instance,
                chunks = self.chunks,
                elapsed_ms = elapsed.as_millis() as u64,
                outcome = ?outcome,
                "Stream closed"
            ),
        }
    }
}

/// Iterator over a streaming dispatch for synchronous callers
pub struct BlockingStream<'a> {
    runtime: &'a tokio::runtime::Runtime,
    stream: Option<DispatchStream>,
}

impl BlockingStream<'_> {
    /// Serving instance, until the stream is exhausted
    pub fn instance(&self) -> Option<&str> {
        self.stream.as_ref().map(|s| s.instance())
    }
}

impl Iterator for BlockingStream<'_> {
    type Item = Result<StreamChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let stream = self.stream.as_mut()?;
        if tokio::runtime::Handle::try_current().is_ok() {
            self.stream = None;
            return Some(Err(DispatchError::ConcurrencyMisuse));
        }
        let item = self.runtime.block_on(stream.next());
        if item.is_none() {
            self.stream = None;
        }
        item
    }
}

impl fmt::Debug for BlockingStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingStream").field("stream", &self.stream).finish()
    }
}
