//! Relay HTTP Server
//!
//! Client-facing endpoints on the relay port.
//!
//! # Endpoints
//!
//! - `GET /ws` - WebSocket; clients send `subscribe` messages
//! - `GET /stream/{source_id}` - Server-Sent Events for one source
//! - `GET /api/sources` - Log files present in the log directory

mod sources;
mod sse;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::application::services::Broker;
use crate::domain::source::{SourceId, SourceLayout};
use crate::infrastructure::tailer::Backend;

pub use sources::{LogFileInfo, SourcesResponse, list_sources};

// =============================================================================
// State
// =============================================================================

/// Shared state for relay handlers.
pub struct RelayState {
    broker: Arc<Broker>,
    layout: SourceLayout,
    backend: Backend,
}

impl RelayState {
    /// Create relay state.
    #[must_use]
    pub const fn new(broker: Arc<Broker>, layout: SourceLayout, backend: Backend) -> Self {
        Self {
            broker,
            layout,
            backend,
        }
    }

    /// What a source is read from: its unit on the journal backend, its log
    /// file name otherwise.
    #[must_use]
    pub fn stream_name(&self, source: &SourceId) -> String {
        let resolved = self.layout.resolve(source);
        match self.backend {
            Backend::Journal => resolved.unit,
            Backend::File => resolved.file_path.file_name().map_or_else(
                || resolved.file_path.display().to_string(),
                |name| name.to_string_lossy().into_owned(),
            ),
        }
    }

    /// The broker clients are attached to.
    #[must_use]
    pub const fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

/// Build the relay router.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/stream/{source_id}", get(sse::sse_handler))
        .route("/api/sources", get(sources::sources_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// Relay HTTP server.
pub struct RelayServer {
    addr: SocketAddr,
    state: Arc<RelayState>,
    cancel: CancellationToken,
    ready: Arc<AtomicBool>,
}

impl RelayServer {
    /// Create a relay server. `ready` is raised once the listener is bound.
    #[must_use]
    pub const fn new(
        addr: SocketAddr,
        state: Arc<RelayState>,
        cancel: CancellationToken,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            addr,
            state,
            cancel,
            ready,
        }
    }

    /// Run the relay server until cancelled and every connection has closed.
    ///
    /// # Errors
    ///
    /// Returns `RelayServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), RelayServerError> {
        let app = router(self.state);

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| RelayServerError::BindFailed(self.addr, e.to_string()))?;

        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(addr = %self.addr, "Relay server listening");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| RelayServerError::ServerFailed(e.to_string()));

        self.ready.store(false, Ordering::SeqCst);
        result?;

        tracing::info!("Relay server stopped");
        Ok(())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
