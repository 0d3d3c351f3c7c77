//! Caller-facing error taxonomy for dispatch.
//!
//! Adapters report [`ProviderError`]s that are already classified as
//! transient or request-caused. The dispatcher turns those into a
//! [`DispatchError`], which is what every caller sees:
//!
//! - **UnknownModel** - no pool is registered under the requested name
//! - **Request** - the request itself was rejected (bad input, auth, content policy);
//!   never retried, the vendor's detail is preserved
//! - **Exhausted** - every instance in the pool failed; carries each attempt
//! - **Interrupted** - a stream failed after its first chunk was delivered; no failover
//! - **ConcurrencyMisuse** - a blocking entry point was called from inside an async runtime
//! - **Cancelled** / **DeadlineExceeded** - the caller aborted the dispatch
//!
//! # Error envelope
//!
//! ```rust
//! use switchboard::error::{DispatchError, ErrorEnvelope};
//!
//! let error = DispatchError::UnknownModel {
//!     model: "gpt-5".to_string(),
//!     available: vec!["gpt-4o".to_string()],
//! };
//! assert_eq!(error.kind(), "unknown_model");
//! assert_eq!(error.code(), 404);
//!
//! let envelope = ErrorEnvelope::from(&error);
//! let json = serde_json::to_value(&envelope).unwrap();
//! assert_eq!(json["error"]["type"], "unknown_model");
//! ```

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::llm::traits::{ProviderError, ProviderKind};

/// Terminal failure of one instance during a dispatch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptFailure {
    /// Instance identifier, e.g. `gpt-4o#1`
    pub instance: String,
    /// Vendor of the failing instance
    pub provider: ProviderKind,
    /// Number of calls made against this instance
    pub attempts: u32,
    /// Last error seen on that instance
    #[serde(serialize_with = "serialize_display")]
    pub cause: ProviderError,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} attempt{}): {}",
            self.instance,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" },
            self.cause
        )
    }
}

/// Terminal failure of a dispatch, as seen by the caller
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown model '{model}' (available: {})", .available.join(", "))]
    UnknownModel { model: String, available: Vec<String> },

    #[error("Request rejected by {instance} after {attempts} attempt(s): {source}")]
    Request {
        instance: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("All {} instance(s) for model '{model}' failed: {}", .attempts.len(), summarize(.attempts))]
    Exhausted {
        model: String,
        attempts: Vec<AttemptFailure>,
    },

    #[error("Stream from {instance} failed mid-response: {source}")]
    Interrupted {
        instance: String,
        #[source]
        source: ProviderError,
    },

    #[error("Blocking dispatch called from inside an async runtime; use the async API instead")]
    ConcurrencyMisuse,

    #[error("Dispatch for model '{model}' was cancelled")]
    Cancelled { model: String },

    #[error("Dispatch for model '{model}' exceeded its {timeout:?} deadline")]
    DeadlineExceeded { model: String, timeout: Duration },

    #[error("Dispatcher runtime unavailable: {message}")]
    Runtime { message: String },
}

impl DispatchError {
    /// Stable tag naming the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownModel { .. } => "unknown_model",
            Self::Request { .. } => "request_error",
            Self::Exhausted { .. } => "exhausted",
            Self::Interrupted { .. } => "stream_interrupted",
            Self::ConcurrencyMisuse => "concurrency_misuse",
            Self::Cancelled { .. } => "cancelled",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Runtime { .. } => "runtime",
        }
    }

    /// Numeric code for the error kind. Request errors keep the vendor's
    /// 4xx status when there was one.
    pub fn code(&self) -> u16 {
        match self {
            Self::UnknownModel { .. } => 404,
            Self::Request { source, .. } => match source.status() {
                Some(status) if (400..500).contains(&status) => status,
                _ => 400,
            },
            Self::Exhausted { .. } => 503,
            Self::Interrupted { .. } => 502,
            Self::ConcurrencyMisuse | Self::Runtime { .. } => 500,
            Self::Cancelled { .. } => 499,
            Self::DeadlineExceeded { .. } => 504,
        }
    }

    /// Underlying vendor error that ended the dispatch, if any
    pub fn last_cause(&self) -> Option<&ProviderError> {
        match self {
            Self::Request { source, .. } | Self::Interrupted { source, .. } => Some(source),
            Self::Exhausted { attempts, .. } => attempts.last().map(|a| &a.cause),
            _ => None,
        }
    }

    /// Number of instances that were tried before giving up
    pub fn instances_tried(&self) -> usize {
        match self {
            Self::Exhausted { attempts, .. } => attempts.len(),
            Self::Request { .. } | Self::Interrupted { .. } => 1,
            _ => 0,
        }
    }
}

/// Wire representation of a [`DispatchError`]
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    /// OpenAI-style error payload
    pub error: ErrorBody,
}

/// Body of an [`ErrorEnvelope`]
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// HTTP status sent with the envelope
    pub code: u16,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptFailure>,
}

impl From<&DispatchError> for ErrorEnvelope {
    fn from(error: &DispatchError) -> Self {
        let attempts = match error {
            DispatchError::Exhausted { attempts, .. } => attempts.clone(),
            _ => Vec::new(),
        };
        Self {
            error: ErrorBody {
                message: crate::utils::logging::sanitize_for_logging(&error.to_string()),
                kind: error.kind(),
                code: error.code(),
                attempts,
            },
        }
    }
}

/// Result alias for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

fn summarize(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn serialize_display<T: fmt::Display, S: serde::Serializer>(value: &T, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(instance: &str, cause: ProviderError) -> AttemptFailure {
        AttemptFailure {
            instance: instance.to_string(),
            provider: cause.provider(),
            attempts: 1,
            cause,
        }
    }

    #[test]
    fn test_exhausted_reports_every_attempt() {
        let error = DispatchError::Exhausted {
            model: "chat".to_string(),
            attempts: vec![
                failure("chat#0", ProviderError::timeout(ProviderKind::Qwen, "read timed out")),
                failure(
                    "chat#1",
                    ProviderError::from_status(ProviderKind::DeepSeek, 502, "bad gateway", None),
                ),
            ],
        };

        let message = error.to_string();
        assert!(message.contains("All 2 instance(s)"));
        assert!(message.contains("chat#0 (1 attempt): qwen request timed out"));
        assert!(message.contains("chat#1"));
        assert_eq!(error.instances_tried(), 2);
        assert_eq!(error.code(), 503);
        assert!(matches!(error.last_cause(), Some(ProviderError::Server { status: 502, .. })));
    }

    #[test]
    fn test_request_error_keeps_vendor_status() {
        let error = DispatchError::Request {
            instance: "gpt#0".to_string(),
            attempts: 1,
            source: ProviderError::from_status(ProviderKind::OpenAi, 401, "invalid api key", None),
        };
        assert_eq!(error.kind(), "request_error");
        assert_eq!(error.code(), 401);

        let policy = DispatchError::Request {
            instance: "gpt#0".to_string(),
            attempts: 1,
            source: ProviderError::ContentPolicy {
                provider: ProviderKind::OpenAi,
                message: "filtered".to_string(),
            },
        };
        assert_eq!(policy.code(), 400);
    }

    #[test]
    fn test_envelope_shape() {
        let error = DispatchError::Exhausted {
            model: "m".to_string(),
            attempts: vec![failure("m#0", ProviderError::connection(ProviderKind::Gemini, "refused"))],
        };
        let json = serde_json::to_value(ErrorEnvelope::from(&error)).unwrap();
        assert_eq!(json["error"]["type"], "exhausted");
        assert_eq!(json["error"]["code"], 503);
        assert_eq!(json["error"]["attempts"][0]["instance"], "m#0");
        assert_eq!(json["error"]["attempts"][0]["cause"], "gemini connection failed: refused");

        let misuse = serde_json::to_value(ErrorEnvelope::from(&DispatchError::ConcurrencyMisuse)).unwrap();
        assert!(misuse["error"].get("attempts").is_none());
        assert_eq!(misuse["error"]["code"], 500);
    }
}
