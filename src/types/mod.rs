//! Canonical data types shared by every provider.
//!
//! Nothing in this module carries a vendor-specific structure. Adapters
//! translate to and from these shapes at the edge.

pub mod messages;
pub mod response;
pub mod tools;

pub use messages::*;
pub use response::*;
pub use tools::*;
