//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the stream broker and the port interfaces it uses
//! to drive tailers.

/// Port interfaces for tailers.
pub mod ports;

/// Application services.
pub mod services;
