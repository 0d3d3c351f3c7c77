//! Health-tracked binding of one backend configuration to its adapter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::llm::traits::{ChatProvider, ChatStream, ModelConfig, ProviderError, ProviderKind};
use crate::types::{ChatRequest, ChatResponse};

/// Re-admission policy for instances marked unavailable.
///
/// After `n` consecutive failures an instance sits out
/// `cooldown * cooldown_multiplier^(n-1)`, capped at `max_cooldown`.
/// A cooling instance is still tried when every other candidate is
/// cooling too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Cool-down after the first failure
    #[serde(with = "crate::config::duration_seconds", default = "default_cooldown")]
    pub cooldown: Duration,
    /// Growth factor per further consecutive failure
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,
    /// Upper bound on any single cool-down
    #[serde(with = "crate::config::duration_seconds", default = "default_max_cooldown")]
    pub max_cooldown: Duration,
}

impl HealthPolicy {
    /// Cool-down owed after `consecutive_failures` failures in a row
    pub fn cooldown_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let growth = self
            .cooldown_multiplier
            .max(1.0)
            .powi((consecutive_failures - 1).min(32) as i32);
        let secs = (self.cooldown.as_secs_f64() * growth).min(self.max_cooldown.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            cooldown: default_cooldown(),
            cooldown_multiplier: default_cooldown_multiplier(),
            max_cooldown: default_max_cooldown(),
        }
    }
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_cooldown_multiplier() -> f64 {
    2.0
}

fn default_max_cooldown() -> Duration {
    Duration::from_secs(300)
}

/// What an invocation produced
pub enum Invocation {
    Complete(ChatResponse),
    Stream(ChatStream),
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Complete(response) => f.debug_tuple("Complete").field(response).finish(),
            Invocation::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// One configured backend inside a pool.
///
/// Health state is a handful of atomics. Concurrent dispatches may race
/// on them; any interleaving leaves a valid state and the next outcome
/// overwrites it.
pub struct ProviderInstance {
    id: String,
    config: Arc<ModelConfig>,
    provider: Arc<dyn ChatProvider>,
    available: AtomicBool,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `epoch` at the last failure, plus one; 0 means never
    last_failure: AtomicU64,
    epoch: Instant,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ProviderInstance {
    /// Bind an adapter to its config; starts available
    pub fn new<S: Into<String>>(id: S, config: ModelConfig, provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            id: id.into(),
            config: Arc::new(config),
            provider,
            available: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
            epoch: Instant::now(),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Instance identifier, `model#n`
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// Delegate one call to the adapter
    pub async fn invoke(&self, request: &ChatRequest, streaming: bool) -> Result<Invocation, ProviderError> {
        if streaming {
            self.provider.stream(request).await.map(Invocation::Stream)
        } else {
            self.provider.complete(request).await.map(Invocation::Complete)
        }
    }

    /// One non-streaming call, no retries
    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.provider.complete(request).await
    }

    /// Open one vendor stream, no retries
    pub async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
        self.provider.stream(request).await
    }

    /// Record a terminal failure and start (or extend) the cool-down
    pub fn mark_failure(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_failure.store(elapsed.saturating_add(1), Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        self.failures.fetch_add(1, Ordering::Relaxed);
        if self.available.swap(false, Ordering::AcqRel) {
            tracing::warn!(instance = %self.id, consecutive_failures = failures, "Instance marked unavailable");
        }
    }

    /// Clear the failure streak and mark the instance available
    pub fn mark_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
        if !self.available.swap(true, Ordering::AcqRel) {
            tracing::info!(instance = %self.id, "Instance available again");
        }
    }

    /// Raw health flag, ignoring cool-down expiry
    pub fn is_marked_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Healthy, or unhealthy with its cool-down already served
    pub fn is_available(&self, policy: &HealthPolicy) -> bool {
        if self.is_marked_available() {
            return true;
        }
        match self.since_last_failure() {
            Some(age) => age >= policy.cooldown_for(self.consecutive_failures()),
            None => true,
        }
    }

    /// Failures since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Time since the most recent failure, if there was one
    pub fn since_last_failure(&self) -> Option<Duration> {
        match self.last_failure.load(Ordering::Relaxed) {
            0 => None,
            stamp => {
                let at = Duration::from_millis(stamp - 1);
                Some(self.epoch.elapsed().saturating_sub(at))
            }
        }
    }

    /// Health snapshot for status reports; carries no credentials
    pub fn status(&self, policy: &HealthPolicy) -> InstanceStatus {
        InstanceStatus {
            id: self.id.clone(),
            provider: self.provider_kind(),
            model: self.config.vendor_model().to_string(),
            label: self.config.label(),
            available: self.is_available(policy),
            marked_available: self.is_marked_available(),
            consecutive_failures: self.consecutive_failures(),
            seconds_since_failure: self.since_last_failure().map(|d| d.as_secs_f64()),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ProviderInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderInstance")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("available", &self.is_marked_available())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

/// Snapshot of one instance for status reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    /// Stable instance id
    pub id: String,
    pub provider: ProviderKind,
    pub model: String,
    /// Short label used in logs
    pub label: String,
    /// Eligible for selection right now
    pub available: bool,
    /// Last recorded outcome was a success
    pub marked_available: bool,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// `None` if it never failed
    pub seconds_since_failure: Option<f64>,
    pub successes: u64,
    pub failures: u64,
}
