//! WebSocket transport.
//!
//! Each socket is one broker client. A writer task drains the client's
//! queue into the socket; the reader loop turns frames into subscribes.
//! Whichever side finishes first ends the connection.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use crate::application::services::Broker;
use crate::domain::streaming::{ClientMessage, Delivery, ServerMessage};
use crate::domain::subscription::ClientId;
use crate::infrastructure::metrics::Transport;

use super::RelayState;

pub(super) async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let broker = Arc::clone(&state.broker);
    ws.on_upgrade(move |socket| handle_socket(socket, broker))
}

async fn handle_socket(socket: WebSocket, broker: Arc<Broker>) {
    let (client, mut outbound) = broker.handle_connect(Transport::WebSocket);
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(delivery) = outbound.recv().await {
            let message = match delivery {
                Delivery::Message(message) => message,
                Delivery::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };

            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(client, error = %e, "Failed to serialize message");
                    continue;
                }
            };

            if let Err(e) = sink.send(Message::Text(text.into())).await {
                tracing::debug!(client, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    let reader_broker = Arc::clone(&broker);
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => handle_text(&reader_broker, client, text.as_str()).await,
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => handle_text(&reader_broker, client, text).await,
                    Err(_) => reject(&reader_broker, client),
                },
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Err(e) => {
                    tracing::debug!(client, error = %e, "WebSocket receive failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    broker.handle_disconnect(client).await;
}

async fn handle_text(broker: &Arc<Broker>, client: ClientId, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { index }) => {
            if let Err(e) = broker.handle_subscribe(client, &index.to_string()).await {
                tracing::debug!(client, error = %e, "Subscribe rejected");
            }
        }
        Err(e) => {
            tracing::debug!(client, error = %e, "Unparseable client message");
            reject(broker, client);
        }
    }
}

fn reject(broker: &Broker, client: ClientId) {
    broker.notify(client, ServerMessage::error("Invalid message format"));
}
