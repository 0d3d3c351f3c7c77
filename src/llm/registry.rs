//! Pool registry: groups configured instances by logical model name.
//!
//! Built once from the full list of backend configurations and owned by
//! a [`Dispatcher`](crate::llm::dispatcher::Dispatcher). There is no
//! process-wide registry; every dispatcher carries its own.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ConfigError;
use crate::llm::instance::ProviderInstance;
use crate::llm::pool::ProviderPool;
use crate::llm::providers::build_provider;
use crate::llm::traits::{ChatProvider, ModelConfig};

/// Provider pools keyed by logical model name.
///
/// Built once at startup and never modified afterwards.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: HashMap<String, Arc<ProviderPool>>,
    /// Model names in first-registration order
    order: Vec<String>,
}

impl PoolRegistry {
    /// Group already-built adapters into pools. Instance ids are
    /// `{model_name}#{position}` within their pool.
    pub fn from_providers(
        bindings: Vec<(ModelConfig, Arc<dyn ChatProvider>)>,
    ) -> Result<Self, ConfigError> {
        let mut grouped: HashMap<String, Vec<Arc<ProviderInstance>>> = HashMap::new();
        let mut order = Vec::new();

        for (config, provider) in bindings {
            let name = config.model_name.clone();
            let members = grouped.entry(name.clone()).or_insert_with(|| {
                order.push(name.clone());
                Vec::new()
            });
            let id = format!("{}#{}", name, members.len());
            tracing::debug!(instance = %id, backend = %config.label(), "Registered provider instance");
            members.push(Arc::new(ProviderInstance::new(id, config, provider)));
        }

        let mut pools = HashMap::with_capacity(grouped.len());
        for (name, instances) in grouped {
            let pool = ProviderPool::new(name.clone(), instances)?;
            pools.insert(name, Arc::new(pool));
        }

        Ok(Self { pools, order })
    }

    /// Validate each configuration, build its adapter and group the results
    pub async fn from_configs(configs: Vec<ModelConfig>) -> Result<Self, ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::Validation(
                "at least one provider configuration is required".to_string(),
            ));
        }

        let mut bindings = Vec::with_capacity(configs.len());
        for config in configs {
            config.validate()?;
            let provider = build_provider(&config).await.map_err(|e| {
                ConfigError::Validation(format!("{}: {}", config.label(), e))
            })?;
            bindings.push((config, provider));
        }

        let registry = Self::from_providers(bindings)?;
        tracing::info!(
            models = registry.order.len(),
            instances = registry.instance_count(),
            "Provider pools ready"
        );
        Ok(registry)
    }

    /// Look up the pool for a logical model name
    pub fn get(&self, model: &str) -> Option<&Arc<ProviderPool>> {
        self.pools.get(model)
    }

    /// Logical model names in registration order
    pub fn models(&self) -> &[String] {
        &self.order
    }

    /// Pools in registration order
    pub fn pools(&self) -> impl Iterator<Item = &Arc<ProviderPool>> {
        self.order.iter().filter_map(|name| self.pools.get(name))
    }

    /// Total instances across all pools
    pub fn instance_count(&self) -> usize {
        self.pools.values().map(|p| p.len()).sum()
    }
}
