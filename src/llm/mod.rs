//! Multi-provider chat completion with failover.
//!
//! Five vendors sit behind one request/response shape. Each backend
//! binding becomes a [`ProviderInstance`]; instances that serve the same
//! logical model form a [`ProviderPool`]; the [`Dispatcher`] picks
//! instances from a pool, retries, fails over and hands back a
//! normalized [`ChatResponse`](crate::types::ChatResponse) or stream.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher → PoolRegistry → ProviderPool → ProviderInstance → ChatProvider
//!     ↓                            ↓                ↓                 ↓
//! retry/failover          strategy ordering   health state    OpenAI | Qwen | DeepSeek
//! cancel/deadline                                              | Claude | Gemini
//! ```
//!
//! # Key Types
//!
//! - [`ChatProvider`] - one vendor adapter, one network call per invocation
//! - [`ModelConfig`] - immutable description of one backend binding
//! - [`ProviderError`] - vendor failure classified as transient or request-caused
//! - [`Dispatcher`] - the single entry point for completions and streams

pub mod dispatcher;
pub mod instance;
pub mod normalize;
pub mod pool;
pub mod providers;
pub mod registry;
pub mod sse;
pub mod traits;

pub use dispatcher::{BlockingStream, DispatchOptions, DispatchStream, Dispatched, Dispatcher, PoolStatus};
pub use instance::{HealthPolicy, InstanceStatus, ProviderInstance};
pub use pool::{LoadBalanceStrategy, ProviderPool};
pub use registry::PoolRegistry;
pub use traits::{ChatProvider, ChatStream, ErrorClass, ModelConfig, ProviderError, ProviderKind, ProxyConfig};
