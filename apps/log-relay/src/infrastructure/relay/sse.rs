//! Server-Sent Events transport.
//!
//! `GET /stream/{source_id}` subscribes on connect. Every event is a single
//! `data:` line; notices carry an `[INFO]`/`[ERROR]` prefix.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, StreamExt};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::application::services::Broker;
use crate::domain::source::SourceId;
use crate::domain::streaming::{Delivery, ServerMessage};
use crate::domain::subscription::ClientId;
use crate::infrastructure::metrics::Transport;

use super::RelayState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub(super) async fn sse_handler(
    State(state): State<Arc<RelayState>>,
    Path(raw): Path<String>,
) -> Response {
    let Ok(source) = SourceId::parse(&raw) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid index parameter" })),
        )
            .into_response();
    };

    let broker = Arc::clone(&state.broker);
    let (client, outbound) = broker.handle_connect(Transport::Sse);
    let guard = DisconnectGuard {
        broker: Arc::clone(&broker),
        client,
    };

    if let Err(e) = broker.handle_subscribe(client, source.as_str()).await {
        tracing::debug!(client, error = %e, "SSE subscribe failed");
        // drop the queue's sender so the stream ends after the error
        broker.handle_disconnect(client).await;
    }

    let greeting = format!("Connected to {} log stream", state.stream_name(&source));

    let events = ReceiverStream::new(outbound)
        .take_while(|delivery| std::future::ready(!matches!(delivery, Delivery::Close)))
        .flat_map(move |delivery| {
            let _guard = &guard;
            stream::iter(render(delivery))
        });

    let body = stream::once(std::future::ready(Event::default().data(greeting)))
        .chain(events)
        .map(Ok::<_, Infallible>);

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(body).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)),
    )
        .into_response()
}

/// Turn one delivery into zero or more SSE events.
fn render(delivery: Delivery) -> Vec<Event> {
    let Delivery::Message(message) = delivery else {
        return Vec::new();
    };

    match message {
        ServerMessage::History { lines } => {
            lines.into_iter().map(|line| Event::default().data(line)).collect()
        }
        ServerMessage::Log { line } => vec![Event::default().data(line)],
        ServerMessage::Info { message } => vec![Event::default().data(format!("[INFO] {message}"))],
        ServerMessage::Error { message } => {
            vec![Event::default().data(format!("[ERROR] {message}"))]
        }
        ServerMessage::Subscribed { .. } => Vec::new(),
    }
}

/// Detaches the client from the broker when the response stream is dropped.
struct DisconnectGuard {
    broker: Arc<Broker>,
    client: ClientId,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let broker = Arc::clone(&self.broker);
        let client = self.client;
        runtime.spawn(async move {
            broker.handle_disconnect(client).await;
        });
    }
}
