//! Configuration Module
//!
//! Environment-driven configuration for the relay service.

mod settings;

pub use settings::{ConfigError, RelayConfig, ServerSettings};
