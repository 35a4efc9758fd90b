//! Domain Layer - Core log streaming types.
//!
//! Source identification, wire messages, history buffering and
//! subscription bookkeeping. Nothing here performs I/O.

/// Source identifiers and their resolution to files and units.
pub mod source;

/// Wire messages, tailer events and the history buffer.
pub mod streaming;

/// Subscription tracking.
pub mod subscription;
