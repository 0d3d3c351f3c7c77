//! Route chat completions across OpenAI, Qwen, DeepSeek, Claude and Gemini.
//!
//! Switchboard puts several LLM vendors behind one OpenAI-shaped request
//! and response format. Backends that serve the same logical model are
//! pooled; every dispatch picks an instance by strategy, retries transient
//! failures with backoff, and fails over to the next instance until one
//! answers or the pool is exhausted.
//!
//! # Quick Start
//!
//! ```no_run
//! use switchboard::config::GatewayConfig;
//! use switchboard::llm::Dispatcher;
//! use switchboard::types::{ChatMessage, ChatRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // DEEPSEEK_API_KEYS=sk-a,sk-b gives a two-instance "deepseek-chat" pool
//!     let config = GatewayConfig::from_env()?;
//!     let dispatcher = Dispatcher::from_gateway_config(&config).await?;
//!
//!     let request = ChatRequest::new("deepseek-chat", vec![ChatMessage::user("Hello")]);
//!     let response = dispatcher.complete(&request).await?;
//!     println!("{}", response.content());
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`llm`] - adapters, instances, pools and the dispatcher
//! - [`types`] - the canonical request, response and stream chunk shapes
//! - [`error`] - caller-facing dispatch errors and the JSON error envelope
//! - [`config`] - configuration files, environment variables and validation
//! - [`metrics`] - per-provider request counters
//! - [`telemetry`] - logging subscriber setup
//! - `server` - OpenAI-compatible HTTP front end (feature `http`)
//!
//! # Feature Flags
//!
//! - `http` (default) - the axum server and the `switchboard` binary

pub mod config;
pub mod error;
pub mod llm;
pub mod metrics;
#[cfg(feature = "http")]
pub mod server;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use error::DispatchError;
pub use llm::Dispatcher;
pub use types::*;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, DispatchError>;
