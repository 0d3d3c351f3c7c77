//! Gateway configuration
//!
//! Backend lists come from a TOML, YAML or JSON file, or from the
//! vendor environment variables. String fields in a file may carry
//! `${VAR}` placeholders that are resolved against the environment, and
//! one entry with several API keys expands into one backend per key.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};
use thiserror::Error;

use crate::llm::instance::HealthPolicy;
use crate::llm::pool::LoadBalanceStrategy;
use crate::llm::providers::retry::RetryConfig;
use crate::llm::traits::{ModelConfig, ProviderKind, ProxyConfig};
use crate::telemetry::logging::LoggingConfig;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable parsing error: {0}")]
    EnvVarParse(String),
    #[error("File parsing error: {0}")]
    FileParse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Blocking construction attempted from inside an async runtime,
    /// reported the same way as [`DispatchError::ConcurrencyMisuse`](crate::error::DispatchError::ConcurrencyMisuse)
    #[error("Blocking dispatch called from inside an async runtime; use the async API instead")]
    ConcurrencyMisuse,
}

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Backend entries; each may expand into several instances
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Failover engine tuning
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Strategy used when a request does not name one
    #[serde(default)]
    pub default_strategy: LoadBalanceStrategy,
    /// Backoff between retries on the same instance
    #[serde(default)]
    pub retry: RetryConfig,
    /// Cool-down before an unavailable instance is tried again
    #[serde(default)]
    pub health: HealthPolicy,
}

impl DispatcherConfig {
    /// Check the retry and health settings for values that would stall or spin
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::Validation(
                "retry.initial_delay cannot exceed retry.max_delay".to_string(),
            ));
        }
        if self.health.cooldown_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "health.cooldown_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.health.cooldown > self.health.max_cooldown {
            return Err(ConfigError::Validation(
                "health.cooldown cannot exceed health.max_cooldown".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP front-end binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port to bind
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    /// Listen address as `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// One backend entry as written in a config file.
///
/// `provider` stays a string so that unknown vendors can be skipped with
/// a warning instead of failing the whole document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Vendor name, matched case-insensitively
    pub provider: String,
    /// Logical name callers address
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Expands into one instance per key
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    /// Expands into one instance per endpoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_bases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Request timeout in seconds
    #[serde(with = "duration_seconds", default = "default_timeout")]
    pub timeout: Duration,
    /// Retries after the first attempt on the same instance
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Optional HTTP(S) proxy
    #[serde(default, alias = "proxy_config", skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
}

impl ProviderEntry {
    /// Create an entry with no credentials and default tuning
    pub fn new<P: Into<String>, M: Into<String>>(provider: P, model_name: M) -> Self {
        Self {
            provider: provider.into(),
            model_name: model_name.into(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            ..Default::default()
        }
    }

    /// Replace `${VAR}` placeholders in every string field. A key or base
    /// that resolves to a comma-separated value becomes a list.
    pub fn resolve_placeholders<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolve = |value: &mut Option<String>| {
            if let Some(v) = value.as_mut() {
                *v = substitute_placeholders(v, lookup);
            }
        };

        self.provider = substitute_placeholders(&self.provider, lookup);
        self.model_name = substitute_placeholders(&self.model_name, lookup);
        resolve(&mut self.model_id);
        resolve(&mut self.api_key);
        resolve(&mut self.api_secret);
        resolve(&mut self.api_base);
        resolve(&mut self.api_version);
        resolve(&mut self.region);
        resolve(&mut self.project_id);
        if let Some(proxy) = self.proxy.as_mut() {
            resolve(&mut proxy.http);
            resolve(&mut proxy.https);
        }

        self.api_keys = expand_list(std::mem::take(&mut self.api_keys), lookup);
        self.api_bases = expand_list(std::mem::take(&mut self.api_bases), lookup);

        if let Some(key) = self.api_key.take() {
            match split_list(&key) {
                list if list.len() > 1 => self.api_keys.extend(list),
                _ => self.api_key = Some(key),
            }
        }
        if let Some(base) = self.api_base.take() {
            match split_list(&base) {
                list if list.len() > 1 => self.api_bases.extend(list),
                _ => self.api_base = Some(base),
            }
        }
    }

    /// One [`ModelConfig`] per API key. Unknown providers yield nothing.
    pub fn expand(&self) -> Result<Vec<ModelConfig>, ConfigError> {
        let kind = match self.provider.parse::<ProviderKind>() {
            Ok(kind) => kind,
            Err(_) => {
                tracing::warn!(provider = %self.provider, model = %self.model_name, "Skipping invalid provider type");
                return Ok(Vec::new());
            }
        };

        let mut keys: Vec<Option<String>> = if self.api_keys.is_empty() {
            vec![self.api_key.clone()]
        } else {
            self.api_keys.iter().cloned().map(Some).collect()
        };
        let mut bases: Vec<Option<String>> = if self.api_bases.is_empty() {
            vec![self.api_base.clone()]
        } else {
            self.api_bases.iter().cloned().map(Some).collect()
        };

        if bases.len() == 1 && keys.len() > 1 {
            bases = vec![bases[0].clone(); keys.len()];
        } else if keys.len() == 1 && bases.len() > 1 {
            keys = vec![keys[0].clone(); bases.len()];
        } else if keys.len() != bases.len() {
            return Err(ConfigError::Validation(format!(
                "{} '{}': {} api keys but {} api bases",
                self.provider,
                self.model_name,
                keys.len(),
                bases.len()
            )));
        }

        let mut configs = Vec::with_capacity(keys.len());
        for (key, base) in keys.into_iter().zip(bases) {
            let key = match key.filter(|k| !k.trim().is_empty()) {
                Some(key) => key,
                None => continue,
            };
            configs.push(ModelConfig {
                provider: kind,
                model_name: self.model_name.clone(),
                model_id: self.model_id.clone(),
                api_key: Some(key),
                api_secret: self.api_secret.clone().filter(|s| !s.is_empty()),
                api_base: base.filter(|b| !b.trim().is_empty()),
                api_version: self.api_version.clone().filter(|v| !v.is_empty()),
                region: self.region.clone().filter(|r| !r.is_empty()),
                project_id: self.project_id.clone().filter(|p| !p.is_empty()),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                top_p: self.top_p,
                timeout: self.timeout,
                max_retries: self.max_retries,
                proxy: self.proxy.clone().filter(|p| !p.is_empty()),
            });
        }

        if configs.is_empty() {
            tracing::warn!(provider = %self.provider, model = %self.model_name, "Provider entry has no usable api key");
        }
        Ok(configs)
    }
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Pick the format from the file extension; unknown extensions are an error
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Ok(ConfigFormat::Toml),
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("json") => Ok(ConfigFormat::Json),
            _ => Err(ConfigError::FileParse(
                "Unsupported file format. Use .toml, .yaml, .yml, or .json".to_string(),
            )),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a file (supports TOML, YAML, JSON)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let format = ConfigFormat::from_path(path)?;
        let mut config = Self::parse(&content, format)?;
        config.resolve_placeholders(&|name: &str| env::var(name).ok());
        tracing::debug!(path = %path.display(), entries = config.providers.len(), "Loaded configuration file");
        Ok(config)
    }

    /// Parse a document without touching the environment
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        match format {
            ConfigFormat::Toml => {
                toml::from_str(content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            ConfigFormat::Yaml => {
                serde_yaml::from_str(content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
        }
    }

    /// Substitute `${VAR}` placeholders in every provider entry
    pub fn resolve_placeholders<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for entry in &mut self.providers {
            entry.resolve_placeholders(lookup);
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let lookup = |name: &str| env::var(name).ok();
        let mut config = Self {
            providers: providers_from_lookup(&lookup),
            logging: LoggingConfig::from_env(),
            ..Default::default()
        };
        config.apply_overrides(&lookup)?;
        Ok(config)
    }

    /// Use `path` when given, otherwise the environment. Gateway-level
    /// environment overrides apply either way.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path)?.merge_with_env(),
            None => Self::from_env(),
        }
    }

    /// Merge configuration with environment variable overrides
    pub fn merge_with_env(mut self) -> Result<Self, ConfigError> {
        self.apply_overrides(&|name: &str| env::var(name).ok())?;
        if env::var("SWITCHBOARD_LOG_LEVEL").is_ok()
            || env::var("SWITCHBOARD_LOG_JSON").is_ok()
            || env::var("SWITCHBOARD_LOG_DIR").is_ok()
        {
            self.logging = self.logging.merge_with_env();
        }
        Ok(self)
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(strategy) = lookup("SWITCHBOARD_STRATEGY") {
            self.dispatcher.default_strategy = strategy
                .parse()
                .map_err(|e| ConfigError::EnvVarParse(format!("SWITCHBOARD_STRATEGY: {}", e)))?;
        }
        if let Some(host) = lookup("SWITCHBOARD_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("SWITCHBOARD_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| ConfigError::EnvVarParse(format!("SWITCHBOARD_PORT: {}", e)))?;
        }
        Ok(())
    }

    /// Every backend described by this configuration, in file order
    pub fn model_configs(&self) -> Result<Vec<ModelConfig>, ConfigError> {
        let mut configs = Vec::new();
        for entry in &self.providers {
            configs.extend(entry.expand()?);
        }
        if configs.is_empty() {
            return Err(ConfigError::Validation(
                "No valid provider configurations found".to_string(),
            ));
        }
        Ok(configs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatcher.validate()?;
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Validation("server.host cannot be empty".to_string()));
        }
        for config in self.model_configs()? {
            config.validate()?;
        }
        Ok(())
    }
}

/// Backend entries described by the vendor environment variables.
///
/// Lists (`*_API_KEYS`) win over the single-key form (`*_API_KEY`).
pub fn providers_from_lookup<F>(lookup: &F) -> Vec<ProviderEntry>
where
    F: Fn(&str) -> Option<String>,
{
    let keys = |plural: &str, single: &str| -> Vec<String> {
        let list = lookup(plural).map(|v| split_list(&v)).unwrap_or_default();
        if !list.is_empty() {
            return list;
        }
        lookup(single)
            .filter(|v| !v.trim().is_empty())
            .map(|v| vec![v.trim().to_string()])
            .unwrap_or_default()
    };
    let model = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

    let mut entries = Vec::new();

    let openai_keys = keys("OPENAI_API_KEYS", "OPENAI_API_KEY");
    if !openai_keys.is_empty() {
        let mut entry = ProviderEntry::new("openai", model("OPENAI_MODEL", "gpt-4o"));
        entry.api_keys = openai_keys;
        entry.api_bases = keys("OPENAI_API_BASES", "OPENAI_API_BASE");
        entry.api_version = Some(model("OPENAI_API_VERSION", DEFAULT_ENV_OPENAI_API_VERSION));
        entries.push(entry);
    }

    let qwen_keys = keys("QWEN_API_KEYS", "QWEN_API_KEY");
    if !qwen_keys.is_empty() {
        let mut entry = ProviderEntry::new("qwen", model("QWEN_MODEL", "qwen-turbo"));
        entry.api_keys = qwen_keys;
        entry.api_base = lookup("QWEN_API_BASE");
        entries.push(entry);
    }

    let deepseek_keys = keys("DEEPSEEK_API_KEYS", "DEEPSEEK_API_KEY");
    if !deepseek_keys.is_empty() {
        let mut entry = ProviderEntry::new("deepseek", model("DEEPSEEK_MODEL", "deepseek-chat"));
        entry.api_keys = deepseek_keys;
        entry.api_base = lookup("DEEPSEEK_API_BASE");
        entries.push(entry);
    }

    let claude_keys = keys("CLAUDE_ACCESS_KEYS", "CLAUDE_ACCESS_KEY");
    if !claude_keys.is_empty() {
        let mut entry = ProviderEntry::new(
            "claude",
            model("CLAUDE_MODEL", "anthropic.claude-3-5-sonnet-20241022-v2:0"),
        );
        entry.api_keys = claude_keys;
        entry.api_secret = lookup("CLAUDE_SECRET_KEY");
        entry.region = Some(model("CLAUDE_REGION", "us-east-1"));
        entries.push(entry);
    }

    let gemini_keys = keys("GEMINI_API_KEYS", "GEMINI_API_KEY");
    if !gemini_keys.is_empty() {
        let mut entry = ProviderEntry::new("gemini", model("GEMINI_MODEL", "gemini-2.0-flash-exp"));
        entry.api_keys = gemini_keys;
        entry.project_id = lookup("GEMINI_PROJECT_ID");
        entry.region = lookup("GEMINI_REGION");
        entries.push(entry);
    }

    entries
}

/// Azure API version used when the environment does not name one
pub const DEFAULT_ENV_OPENAI_API_VERSION: &str = "2024-02-15-preview";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

/// Replace every `${VAR}` in `value`. Unset variables become empty.
pub fn substitute_placeholders<F>(value: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    PLACEHOLDER
        .replace_all(value, |caps: &regex::Captures<'_>| match lookup(&caps[1]) {
            Some(resolved) => resolved,
            None => {
                tracing::warn!(variable = &caps[1], "Environment variable not found");
                String::new()
            }
        })
        .into_owned()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn expand_list<F>(values: Vec<String>, lookup: &F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    values
        .iter()
        .flat_map(|v| split_list(&substitute_placeholders(v, lookup)))
        .collect()
}

/// Custom serialization for Duration as seconds
pub(crate) mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Duration as whole milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_timeout() -> Duration {
    ModelConfig::DEFAULT_TIMEOUT
}

fn default_max_retries() -> u32 {
    ModelConfig::DEFAULT_MAX_RETRIES
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert!(config.providers.is_empty());
        assert_eq!(config.dispatcher.default_strategy, LoadBalanceStrategy::RoundRobin);
        assert_eq!(config.dispatcher.health.cooldown, Duration::from_secs(30));
        assert_eq!(config.dispatcher.retry.initial_delay, Duration::from_millis(500));
        assert_eq!(config.server.addr(), "0.0.0.0:8000");
        assert!(config.validate().is_err(), "no providers configured");
    }

    #[test]
    fn test_yaml_config_loading() {
        let yaml = r#"
providers:
  - provider: deepseek
    model_name: deepseek-chat
    api_keys: [sk-a, sk-b]
    timeout: 30
    max_retries: 1
  - provider: openai
    model_name: gpt-4o
    model_id: gpt4o-deployment
    api_key: azure-key
    api_base: https://example.openai.azure.com
    api_version: "2024-02-01"
    proxy_config:
      http_proxy: http://proxy.local:3128
dispatcher:
  default_strategy: first_available
  retry:
    initial_delay: 100
    max_delay: 1000
  health:
    cooldown: 5
"#;
        let temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        std::fs::write(temp_file.path(), yaml).unwrap();

        let config = GatewayConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.dispatcher.default_strategy, LoadBalanceStrategy::FirstAvailable);
        assert_eq!(config.dispatcher.retry.initial_delay, Duration::from_millis(100));
        assert_eq!(config.dispatcher.health.cooldown, Duration::from_secs(5));
        assert_eq!(config.dispatcher.health.max_cooldown, Duration::from_secs(300));
        config.validate().unwrap();

        let models = config.model_configs().unwrap();
        assert_eq!(models.len(), 3);
        assert_eq!(models[0].api_key.as_deref(), Some("sk-a"));
        assert_eq!(models[1].api_key.as_deref(), Some("sk-b"));
        assert_eq!(models[0].timeout, Duration::from_secs(30));
        assert_eq!(models[0].max_retries, 1);
        assert_eq!(models[2].vendor_model(), "gpt4o-deployment");
        assert_eq!(
            models[2].proxy.as_ref().and_then(|p| p.http.as_deref()),
            Some("http://proxy.local:3128")
        );
        assert_eq!(models[2].timeout, ModelConfig::DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_toml_config_loading() {
        let toml_content = r#"
[[providers]]
provider = "claude"
model_name = "claude-sonnet"
model_id = "anthropic.claude-3-5-sonnet-20241022-v2:0"
api_key = "AKIAEXAMPLE"
api_secret = "secret"
region = "us-west-2"

[server]
port = 9000
"#;
        let temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        std::fs::write(temp_file.path(), toml_content).unwrap();

        let config = GatewayConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        let models = config.model_configs().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].provider, ProviderKind::Claude);
        assert_eq!(models[0].region.as_deref(), Some("us-west-2"));
    }

    #[test]
    fn test_unsupported_extension() {
        let temp_file = NamedTempFile::with_suffix(".ini").unwrap();
        std::fs::write(temp_file.path(), "x=1").unwrap();
        assert!(matches!(
            GatewayConfig::from_file(temp_file.path()),
            Err(ConfigError::FileParse(_))
        ));
    }

    #[test]
    fn test_placeholder_substitution_and_list_expansion() {
        let lookup = lookup_from(&[("DS_KEYS", "k1, k2,,k3"), ("DS_BASE", "https://api.example.com")]);
        let mut entry = ProviderEntry::new("deepseek", "chat");
        entry.api_key = Some("${DS_KEYS}".to_string());
        entry.api_base = Some("${DS_BASE}/v1".to_string());
        entry.region = Some("${UNSET_REGION}".to_string());
        entry.resolve_placeholders(&lookup);

        assert_eq!(entry.api_key, None);
        assert_eq!(entry.api_keys, ["k1", "k2", "k3"]);
        assert_eq!(entry.api_base.as_deref(), Some("https://api.example.com/v1"));
        assert_eq!(entry.region.as_deref(), Some(""));

        let configs = entry.expand().unwrap();
        assert_eq!(configs.len(), 3);
        assert!(configs
            .iter()
            .all(|c| c.api_base.as_deref() == Some("https://api.example.com/v1")));
        assert!(configs.iter().all(|c| c.region.is_none()));
    }

    #[test]
    fn test_key_and_base_broadcast() {
        let mut entry = ProviderEntry::new("openai", "gpt-4o");
        entry.api_key = Some("shared".to_string());
        entry.api_bases = vec!["https://a.example.com".to_string(), "https://b.example.com".to_string()];
        let configs = entry.expand().unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].api_key.as_deref(), Some("shared"));
        assert_eq!(configs[1].api_base.as_deref(), Some("https://b.example.com"));

        entry.api_keys = vec!["a".into(), "b".into(), "c".into()];
        assert!(entry.expand().is_err(), "3 keys against 2 bases");
    }

    #[test]
    fn test_unknown_provider_and_empty_keys_skipped() {
        let unknown = ProviderEntry::new("mistral", "m");
        assert!(unknown.expand().unwrap().is_empty());

        let mut blank = ProviderEntry::new("qwen", "qwen-turbo");
        blank.api_keys = vec!["".into(), "real".into()];
        let configs = blank.expand().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].api_key.as_deref(), Some("real"));
    }

    #[test]
    fn test_providers_from_environment() {
        let lookup = lookup_from(&[
            ("OPENAI_API_KEYS", "o1,o2"),
            ("OPENAI_API_BASES", "https://one.example.com,https://two.example.com"),
            ("DEEPSEEK_API_KEY", "ds"),
            ("CLAUDE_ACCESS_KEY", "AKIA1"),
            ("CLAUDE_SECRET_KEY", "secret"),
        ]);
        let entries = providers_from_lookup(&lookup);
        assert_eq!(entries.len(), 3);

        let config = GatewayConfig {
            providers: entries,
            ..Default::default()
        };
        let models = config.model_configs().unwrap();
        assert_eq!(models.len(), 4);
        assert_eq!(models[0].model_name, "gpt-4o");
        assert_eq!(models[0].api_version.as_deref(), Some(DEFAULT_ENV_OPENAI_API_VERSION));
        assert_eq!(models[1].api_base.as_deref(), Some("https://two.example.com"));
        assert_eq!(models[2].model_name, "deepseek-chat");
        assert_eq!(models[3].api_secret.as_deref(), Some("secret"));
        assert_eq!(models[3].region.as_deref(), Some("us-east-1"));
        config.validate().unwrap();
    }

    #[test]
    fn test_gateway_overrides() {
        let mut config = GatewayConfig::default();
        config
            .apply_overrides(&lookup_from(&[("SWITCHBOARD_STRATEGY", "random"), ("SWITCHBOARD_PORT", "8080")]))
            .unwrap();
        assert_eq!(config.dispatcher.default_strategy, LoadBalanceStrategy::Random);
        assert_eq!(config.server.port, 8080);

        assert!(config
            .apply_overrides(&lookup_from(&[("SWITCHBOARD_PORT", "not-a-port")]))
            .is_err());
    }

    #[test]
    fn test_dispatcher_validation() {
        let mut dispatcher = DispatcherConfig::default();
        assert!(dispatcher.validate().is_ok());
        dispatcher.health.cooldown = Duration::from_secs(600);
        assert!(dispatcher.validate().is_err());
    }
}
