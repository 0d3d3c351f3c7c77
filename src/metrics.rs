//! In-process request metrics, aggregated per provider.
//!
//! The dispatcher records one [`RequestRecord`] per attempt outcome that
//! reached a vendor. Aggregates are kept as running totals so memory
//! stays constant no matter how long the process runs.
//!
//! ```rust
//! use std::time::Duration;
//! use switchboard::llm::traits::ProviderKind;
//! use switchboard::metrics::{MetricsCollector, RequestRecord};
//!
//! let metrics = MetricsCollector::new();
//! metrics.record(RequestRecord::success(ProviderKind::Qwen, "qwen-turbo", Duration::from_millis(120), None));
//! metrics.record(RequestRecord::failure(ProviderKind::Qwen, "qwen-turbo", Duration::from_millis(40), "timeout"));
//!
//! let summary = metrics.summary(ProviderKind::Qwen);
//! assert_eq!(summary.total_requests, 2);
//! assert_eq!(summary.success_rate, 0.5);
//! ```

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use crate::llm::traits::ProviderKind;
use crate::types::Usage;

/// Outcome of one call against one instance
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub provider: ProviderKind,
    /// Vendor model id that served (or failed) the call
    pub model: String,
    pub success: bool,
    pub latency: Duration,
    pub usage: Option<Usage>,
    /// Error kind tag for failures
    pub error: Option<String>,
}

impl RequestRecord {
    /// Record of a served call
    pub fn success<S: Into<String>>(provider: ProviderKind, model: S, latency: Duration, usage: Option<Usage>) -> Self {
        Self {
            provider,
            model: model.into(),
            success: true,
            latency,
            usage,
            error: None,
        }
    }

    /// Record of a failed call, tagged with the error kind
    pub fn failure<S: Into<String>, E: Into<String>>(provider: ProviderKind, model: S, latency: Duration, error: E) -> Self {
        Self {
            provider,
            model: model.into(),
            success: false,
            latency,
            usage: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ProviderTotals {
    total_requests: u64,
    successful_requests: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    /// Sum of vendor-reported cost; `None` until some vendor reports one
    total_cost: Option<f64>,
    total_latency: Duration,
    error_counts: BTreeMap<String, u64>,
}

/// Aggregated view of one provider's traffic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSummary {
    pub provider: ProviderKind,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Fraction of requests that succeeded, 0.0 with no traffic
    pub success_rate: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    /// Mean over every recorded request
    pub average_latency_ms: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, u64>,
}

/// Thread-safe metrics sink shared by a dispatcher and its streams
#[derive(Debug, Default)]
pub struct MetricsCollector {
    totals: Mutex<HashMap<ProviderKind, ProviderTotals>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one outcome into the running totals
    pub fn record(&self, record: RequestRecord) {
        tracing::trace!(
            provider = %record.provider,
            model = %record.model,
            success = record.success,
            elapsed_ms = record.latency.as_millis() as u64,
            "Recorded request metric"
        );

        let mut totals = match self.totals.lock() {
            Ok(guard) => guard,
            // a panicking recorder cannot leave totals half-written
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = totals.entry(record.provider).or_default();
        entry.total_requests += 1;
        entry.total_latency += record.latency;
        if record.success {
            entry.successful_requests += 1;
        }
        if let Some(usage) = &record.usage {
            entry.prompt_tokens += u64::from(usage.prompt_tokens);
            entry.completion_tokens += u64::from(usage.completion_tokens);
            if let Some(cost) = usage.cost {
                *entry.total_cost.get_or_insert(0.0) += cost;
            }
        }
        if let Some(error) = record.error {
            *entry.error_counts.entry(error).or_insert(0) += 1;
        }
    }

    /// Summary for one provider; all zeros when it has no traffic yet
    pub fn summary(&self, provider: ProviderKind) -> ProviderSummary {
        let totals = self.snapshot();
        summarize(provider, totals.get(&provider).cloned().unwrap_or_default())
    }

    /// Summaries for every provider that has seen traffic
    pub fn provider_breakdown(&self) -> Vec<ProviderSummary> {
        let totals = self.snapshot();
        ProviderKind::ALL
            .into_iter()
            .filter_map(|kind| totals.get(&kind).map(|t| summarize(kind, t.clone())))
            .collect()
    }

    /// Requests recorded across all providers
    pub fn total_requests(&self) -> u64 {
        self.snapshot().values().map(|t| t.total_requests).sum()
    }

    /// Reset every total
    pub fn clear(&self) {
        match self.totals.lock() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        tracing::info!("Cleared all metrics");
    }

    fn snapshot(&self) -> HashMap<ProviderKind, ProviderTotals> {
        match self.totals.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn summarize(provider: ProviderKind, totals: ProviderTotals) -> ProviderSummary {
    let success_rate = if totals.total_requests == 0 {
        0.0
    } else {
        totals.successful_requests as f64 / totals.total_requests as f64
    };
    let average_latency_ms = if totals.total_requests == 0 {
        0.0
    } else {
        totals.total_latency.as_secs_f64() * 1000.0 / totals.total_requests as f64
    };

    ProviderSummary {
        provider,
        total_requests: totals.total_requests,
        successful_requests: totals.successful_requests,
        failed_requests: totals.total_requests - totals.successful_requests,
        success_rate,
        prompt_tokens: totals.prompt_tokens,
        completion_tokens: totals.completion_tokens,
        total_tokens: totals.prompt_tokens + totals.completion_tokens,
        total_cost: totals.total_cost,
        average_latency_ms,
        errors: totals.error_counts,
    }
}
