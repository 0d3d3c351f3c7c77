//! Process-wide tracing subscriber setup
//!
//! Console output goes to stderr, either human-readable or JSON. When a
//! log directory is configured, a daily-rolling JSON file is written
//! through a non-blocking appender as well.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ConfigError;

/// Dependency crates that are too chatty at the application's level
const NOISE_DIRECTIVES: &[&str] = &[
    "hyper=warn",
    "h2=warn",
    "reqwest=warn",
    "rustls=warn",
    "aws_smithy_runtime=warn",
    "aws_smithy_http=warn",
    "aws_config=warn",
    "aws_credential_types=warn",
    "tower_http=info",
];

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base level or full `EnvFilter` directive string
    #[serde(default = "default_level")]
    pub level: String,
    /// JSON lines on the console instead of the pretty format
    #[serde(default)]
    pub json: bool,
    /// Colored console output (ignored for JSON)
    #[serde(default = "default_ansi")]
    pub ansi: bool,
    /// Directory for the rolling log file; no file output when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// File name prefix for the rolling log
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            ansi: default_ansi(),
            log_dir: None,
            file_prefix: default_file_prefix(),
        }
    }
}

impl LoggingConfig {
    /// Create logging configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().merge_with_env()
    }

    /// Override fields from `SWITCHBOARD_LOG_*` variables that are set
    pub fn merge_with_env(mut self) -> Self {
        if let Ok(level) = std::env::var("SWITCHBOARD_LOG_LEVEL") {
            self.level = level;
        }

        if let Ok(json) = std::env::var("SWITCHBOARD_LOG_JSON") {
            self.json = parse_flag(&json).unwrap_or(self.json);
        }

        if let Ok(dir) = std::env::var("SWITCHBOARD_LOG_DIR") {
            self.log_dir = (!dir.trim().is_empty()).then(|| PathBuf::from(dir));
        }

        self
    }

    /// Filter directives: the configured level followed by the noise caps
    pub fn filter_directives(&self) -> String {
        let level = if self.level.trim().is_empty() {
            default_level()
        } else {
            self.level.trim().to_string()
        };
        std::iter::once(level.as_str())
            .chain(NOISE_DIRECTIVES.iter().copied())
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

fn default_file_prefix() -> String {
    "switchboard.log".to_string()
}

/// Guard that must be kept alive for the duration of the application
/// to ensure proper log flushing
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

impl LoggingGuard {
    /// Whether a log file is being written
    pub fn has_file_output(&self) -> bool {
        self._file_guard.is_some()
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<LoggingGuard, ConfigError> {
    let filter = EnvFilter::try_new(config.filter_directives()).map_err(|e| {
        ConfigError::Validation(format!("invalid log level '{}': {}", config.level, e))
    })?;

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::new(
                    "%Y-%m-%d %H:%M:%S%.3f UTC".to_string(),
                ))
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .json()
                .with_current_span(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_json = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .json()
    });
    let console_text = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(config.ansi)
            .with_target(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_json)
        .with(console_text)
        .with(file_layer)
        .try_init()
        .map_err(|e| ConfigError::Validation(format!("logging already initialized: {}", e)))?;

    info!(
        level = %config.level,
        json = config.json,
        log_dir = ?config.log_dir,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let config = LoggingConfig {
            level: "debug,switchboard::llm=trace".to_string(),
            ..Default::default()
        };
        let directives = config.filter_directives();
        assert!(directives.starts_with("debug,switchboard::llm=trace,"));
        assert!(directives.contains("hyper=warn"));
        assert!(EnvFilter::try_new(&directives).is_ok());

        let blank = LoggingConfig {
            level: "  ".to_string(),
            ..Default::default()
        };
        assert!(blank.filter_directives().starts_with("info,"));
    }

    #[test]
    fn test_flag_parsing() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: LoggingConfig = serde_json::from_str(r#"{"json": true}"#).unwrap();
        assert!(config.json);
        assert_eq!(config.level, "info");
        assert_eq!(config.file_prefix, "switchboard.log");
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_init_creates_log_dir() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("logs");
        let guard = init_logging(LoggingConfig {
            log_dir: Some(dir.clone()),
            ansi: false,
            ..Default::default()
        })
        .unwrap();
        assert!(guard.has_file_output());
        assert!(dir.is_dir());

        // A second global subscriber is refused
        assert!(init_logging(LoggingConfig::default()).is_err());
    }
}
