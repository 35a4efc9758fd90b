//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the HTTP surfaces.

/// Log followers (file watch, `tail`, `journalctl`) and their fallback chain.
pub mod tailer;

/// Client-facing WebSocket, SSE and diagnostics endpoints.
pub mod relay;

/// WebSocket client used by the terminal viewer.
pub mod client;

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
