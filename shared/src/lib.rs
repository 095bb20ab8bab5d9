//! # Shared Module for the Uplink Bridge
//!
//! Common types, errors and configuration used by the bridge service
//! and the operator CLI.
//!
//! ## Data Flow
//!
//! inbound message → validate → resolve identity (cache hit, or derive
//! key + provision) → forward telemetry → synchronize twin → outcome

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use config::*;
pub use constants::*;
pub use error::*;
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
