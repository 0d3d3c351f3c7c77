//! Observability setup.
//!
//! Everything in the crate logs through `tracing`; this module only
//! installs the subscriber that decides where those events go.

pub mod logging;

pub use logging::{init_logging, LoggingConfig, LoggingGuard};
