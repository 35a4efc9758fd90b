//! Relay WebSocket Client
//!
//! Connects to the relay, subscribes to one source and reports messages
//! and connection status transitions. Reconnection is owned by a single
//! loop, so there is never more than one attempt in flight.
//!
//! ```text
//! Connecting ──► Connected ──► Disconnected ─┐
//!      │                                     │
//!      └────────► Error ─────────────────────┤
//!                                            ▼
//!                              wait (fixed delay) ──► Connecting
//! ```

mod reconnect;

use std::fmt;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::{ClientMessage, RawIndex, ServerMessage};

pub use reconnect::{DEFAULT_RECONNECT_DELAY, ReconnectConfig, ReconnectPolicy};

// =============================================================================
// Events
// =============================================================================

/// Connection status as seen by the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Opening the socket.
    Connecting,
    /// Socket open and subscribed.
    Connected,
    /// The attempt or session failed.
    Error,
    /// The server closed the session.
    Disconnected,
}

impl ConnectionStatus {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection status changed.
    Status(ConnectionStatus),
    /// A message from the relay.
    Message(ServerMessage),
    /// Why the last session failed.
    Failure(String),
}

// =============================================================================
// Client
// =============================================================================

/// Configuration for the relay client.
#[derive(Debug, Clone)]
pub struct LogStreamClientConfig {
    /// Relay WebSocket URL.
    pub url: String,
    /// Source identifier to subscribe to.
    pub index: String,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
}

/// WebSocket client for one relay subscription.
pub struct LogStreamClient {
    config: LogStreamClientConfig,
    event_tx: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
}

impl LogStreamClient {
    /// Create a new client.
    #[must_use]
    pub const fn new(
        config: LogStreamClientConfig,
        event_tx: mpsc::Sender<ClientEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            event_tx,
            cancel,
        }
    }

    /// Run the connect/retry loop until cancelled or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::MaxAttemptsExceeded` when the reconnection
    /// policy gives up.
    pub async fn run(self) -> Result<(), ClientError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if !self.emit(ClientEvent::Status(ConnectionStatus::Connecting)).await {
                return Ok(());
            }

            let session = tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Client cancelled");
                    return Ok(());
                }
                session = self.connect_and_run(&mut policy) => session,
            };

            let delivered = match session {
                Ok(()) => {
                    tracing::info!(url = %self.config.url, "Relay closed the connection");
                    self.emit(ClientEvent::Status(ConnectionStatus::Disconnected)).await
                }
                Err(e) => {
                    tracing::warn!(url = %self.config.url, error = %e, "Relay connection failed");
                    self.emit(ClientEvent::Status(ConnectionStatus::Error)).await
                        && self.emit(ClientEvent::Failure(e.to_string())).await
                }
            };
            if !delivered {
                return Ok(());
            }

            let Some(delay) = policy.next_delay() else {
                return Err(ClientError::MaxAttemptsExceeded(policy.attempt_count()));
            };
            tracing::info!(
                attempt = policy.attempt_count(),
                delay_ms = delay.as_millis(),
                "Reconnecting to relay"
            );

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Client cancelled during reconnect delay");
                    return Ok(());
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One session: connect, subscribe, forward messages until closed.
    async fn connect_and_run(&self, policy: &mut ReconnectPolicy) -> Result<(), ClientError> {
        tracing::debug!(url = %self.config.url, "Connecting to relay");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::to_string(&ClientMessage::Subscribe {
            index: RawIndex::Text(self.config.index.clone()),
        })?;
        write
            .send(Message::Text(subscribe.into()))
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        policy.reset();
        self.emit(ClientEvent::Status(ConnectionStatus::Connected))
            .await;

        while let Some(frame) = read.next().await {
            match frame.map_err(|e| ClientError::ConnectionFailed(e.to_string()))? {
                Message::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => {
                        if !self.emit(ClientEvent::Message(message)).await {
                            return Ok(());
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Unrecognised relay message"),
                },
                Message::Ping(data) => {
                    write
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        Ok(())
    }

    /// Forward an event; `false` once nobody is listening.
    async fn emit(&self, event: ClientEvent) -> bool {
        self.event_tx.send(event).await.is_ok()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Relay client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Could not connect or the connection broke.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The subscribe request could not be encoded.
    #[error("failed to encode subscribe request: {0}")]
    Encode(#[from] serde_json::Error),

    /// The reconnection policy gave up.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn status_names() {
        assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
        assert_eq!(ConnectionStatus::Error.to_string(), "error");
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "disconnected");
    }

    #[tokio::test]
    async fn unreachable_relay_retries_then_gives_up() {
        // nothing listens on port 1
        let (tx, mut rx) = mpsc::channel(32);
        let client = LogStreamClient::new(
            LogStreamClientConfig {
                url: "ws://127.0.0.1:1/ws".to_string(),
                index: "1".to_string(),
                reconnect: ReconnectConfig::fixed(Duration::from_millis(10), 2),
            },
            tx,
            CancellationToken::new(),
        );

        let result = client.run().await;

        assert!(matches!(result, Err(ClientError::MaxAttemptsExceeded(2))));
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ClientEvent::Status(status) = event {
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            [
                ConnectionStatus::Connecting,
                ConnectionStatus::Error,
                ConnectionStatus::Connecting,
                ConnectionStatus::Error,
                ConnectionStatus::Connecting,
                ConnectionStatus::Error,
            ]
        );
    }

    #[tokio::test]
    async fn cancel_stops_retrying() {
        let (tx, _rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let client = LogStreamClient::new(
            LogStreamClientConfig {
                url: "ws://127.0.0.1:1/ws".to_string(),
                index: "1".to_string(),
                reconnect: ReconnectConfig::fixed(Duration::from_secs(60), 0),
            },
            tx,
            cancel.clone(),
        );

        let handle = tokio::spawn(client.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
