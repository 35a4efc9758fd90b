#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Log Relay - Log Stream Multiplexer
//!
//! Follows per-instance service logs (files or systemd journals) and
//! republishes their lines to any number of WebSocket and SSE clients.
//! Each source is tailed at most once, no matter how many clients watch it.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Source ids, wire messages, history, subscriptions
//! - **Application**: The stream broker and the tailer port it drives
//! - **Infrastructure**: Tailers, HTTP surfaces, viewer client, config,
//!   health, metrics and telemetry
//!
//! # Data Flow
//!
//! ```text
//! log file / journal ──► Tailer ──► Broker ──┬──► WebSocket client 1
//!                          ▲          │      ├──► WebSocket client 2
//!        fallback chain ───┘       history   └──► SSE client N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::source::{ResolvedSource, SourceError, SourceId, SourceLayout};
pub use domain::streaming::{ClientMessage, Delivery, HistoryBuffer, ServerMessage, TailEvent};
pub use domain::subscription::{ClientId, SubscriptionTable};

// Broker
pub use application::ports::{TailerControl, TailerError, TailerFactory};
pub use application::services::{Broker, BrokerConfig, BrokerError, BrokerStats};

// Infrastructure config
pub use infrastructure::config::{ConfigError, RelayConfig, ServerSettings};

// Tailers
pub use infrastructure::tailer::{Backend, SystemTailerFactory, TailerSettings};

// Relay and health servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::relay::{RelayServer, RelayServerError, RelayState};

// Metrics
pub use infrastructure::metrics::{Transport as MetricsTransport, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
