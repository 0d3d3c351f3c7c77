//! Interchangeable instances behind one logical model name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ConfigError;
use crate::llm::instance::ProviderInstance;

/// Order in which a pool's instances are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Rotate the starting instance on every dispatch
    #[default]
    RoundRobin,
    /// Fresh uniform permutation on every dispatch
    Random,
    /// Registration order
    FirstAvailable,
}

impl LoadBalanceStrategy {
    /// Config and wire name of the strategy
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::RoundRobin => "round_robin",
            LoadBalanceStrategy::Random => "random",
            LoadBalanceStrategy::FirstAvailable => "first_available",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(LoadBalanceStrategy::RoundRobin),
            "random" => Ok(LoadBalanceStrategy::Random),
            "first_available" => Ok(LoadBalanceStrategy::FirstAvailable),
            other => Err(ConfigError::Validation(format!(
                "unknown load balancing strategy '{}'",
                other
            ))),
        }
    }
}

/// Ordered instances sharing one logical model name, plus the rotation
/// cursor used by round-robin selection.
pub struct ProviderPool {
    model: String,
    instances: Vec<Arc<ProviderInstance>>,
    cursor: AtomicUsize,
}

impl ProviderPool {
    /// Fails when `instances` is empty
    pub fn new<S: Into<String>>(model: S, instances: Vec<Arc<ProviderInstance>>) -> Result<Self, ConfigError> {
        let model = model.into();
        if instances.is_empty() {
            return Err(ConfigError::Validation(format!(
                "pool for model '{}' has no instances",
                model
            )));
        }
        Ok(Self {
            model,
            instances,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Logical model name shared by every instance
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Instances in registration order
    pub fn instances(&self) -> &[Arc<ProviderInstance>] {
        &self.instances
    }

    /// Number of instances; never zero
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Full ranking of the pool for one dispatch. Every instance appears
    /// exactly once; health is not considered here.
    pub fn select(&self, strategy: LoadBalanceStrategy) -> Vec<Arc<ProviderInstance>> {
        self.ranking(strategy)
            .into_iter()
            .map(|i| Arc::clone(&self.instances[i]))
            .collect()
    }

    fn ranking(&self, strategy: LoadBalanceStrategy) -> Vec<usize> {
        let n = self.instances.len();
        match strategy {
            LoadBalanceStrategy::RoundRobin => {
                let start = self.advance_cursor();
                (0..n).map(|offset| (start + offset) % n).collect()
            }
            LoadBalanceStrategy::Random => {
                let mut order: Vec<usize> = (0..n).collect();
                fastrand::shuffle(&mut order);
                order
            }
            LoadBalanceStrategy::FirstAvailable => (0..n).collect(),
        }
    }

    /// Returns the start index for this dispatch and moves the cursor one
    /// step, as a single atomic update.
    fn advance_cursor(&self) -> usize {
        let n = self.instances.len();
        match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % n))
        {
            Ok(previous) | Err(previous) => previous % n,
        }
    }
}

impl fmt::Debug for ProviderPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderPool")
            .field("model", &self.model)
            .field(
                "instances",
                &self.instances.iter().map(|i| i.id()).collect::<Vec<_>>(),
            )
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish()
    }
}
