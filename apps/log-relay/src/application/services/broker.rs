//! Stream Broker
//!
//! Owns the mapping from source identifier to running tailer, routes client
//! subscriptions to tailers and fans out every tailer event to the
//! subscribers of its source.
//!
//! # Locking
//!
//! - `state` (sync) guards clients, tailers and subscriptions. It is never
//!   held across an await, so a line is appended to the history buffer and
//!   queued for every subscriber atomically with respect to subscribes.
//! - `lifecycle` (async) serializes tailer start and stop. A subscribe that
//!   needs a tailer for a source waits until any previous tailer for that
//!   source has fully exited.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::application::ports::{StartedTailer, TailerControl, TailerError, TailerFactory};
use crate::domain::source::{SourceError, SourceId};
use crate::domain::streaming::{
    Delivery, HistoryBuffer, ServerMessage, StreamEnd, TailEvent, DEFAULT_HISTORY_LINES,
};
use crate::domain::subscription::{ClientId, SubscriptionTable};
use crate::infrastructure::metrics::{self, Transport};

/// Notice sent once a subscription is live.
const LIVE_NOTICE: &str = "Live log stream started";

// =============================================================================
// Configuration
// =============================================================================

/// Broker configuration.
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    /// Outbound queue capacity per client.
    pub client_buffer: usize,
    /// History lines retained per source.
    pub history_lines: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_buffer: 1024,
            history_lines: DEFAULT_HISTORY_LINES,
        }
    }
}

// =============================================================================
// State
// =============================================================================

struct ClientEntry {
    tx: mpsc::Sender<Delivery>,
    transport: Transport,
}

struct TailerEntry {
    control: Arc<dyn TailerControl>,
    history: HistoryBuffer,
    notice: Option<String>,
    strategy: String,
    generation: u64,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<ClientId, ClientEntry>,
    tailers: HashMap<SourceId, TailerEntry>,
    subscriptions: SubscriptionTable,
    next_generation: u64,
}

impl BrokerState {
    /// Queue a message for a client. Never fails the caller.
    fn deliver(&self, client: ClientId, delivery: Delivery) -> bool {
        let Some(entry) = self.clients.get(&client) else {
            return false;
        };

        match entry.tx.try_send(delivery) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(client, "Client queue full, dropping message");
                metrics::record_lines_dropped(entry.transport, 1);
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(client, "Client queue closed");
                false
            }
        }
    }

    fn broadcast(&self, source: &SourceId, message: &ServerMessage) -> usize {
        self.subscriptions
            .subscribers(source)
            .into_iter()
            .filter(|client| self.deliver(*client, Delivery::Message(message.clone())))
            .count()
    }
}

// =============================================================================
// Broker
// =============================================================================

/// Routes subscriptions to tailers and fans out their lines.
pub struct Broker {
    factory: Arc<dyn TailerFactory>,
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Broker {
    /// Create a broker that starts tailers through `factory`.
    #[must_use]
    pub fn new(factory: Arc<dyn TailerFactory>, config: BrokerConfig) -> Self {
        Self {
            factory,
            config,
            state: Mutex::new(BrokerState::default()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Register a new client with no subscription.
    ///
    /// Returns the client's id and the queue its transport drains.
    pub fn handle_connect(&self, transport: Transport) -> (ClientId, mpsc::Receiver<Delivery>) {
        let client = uuid::Uuid::new_v4().as_u64_pair().0;
        let (tx, rx) = mpsc::channel(self.config.client_buffer.max(8));

        let mut state = self.state.lock();
        state.clients.insert(client, ClientEntry { tx, transport });
        let count = state
            .clients
            .values()
            .filter(|c| c.transport == transport)
            .count();
        drop(state);

        metrics::set_clients(transport, count);
        tracing::info!(client, transport = transport.as_str(), "Client connected");

        (client, rx)
    }

    /// Subscribe `client` to the source named by `raw_source`.
    ///
    /// Replaces any previous subscription of the client. On success the
    /// client has been sent the source's history followed by a
    /// `subscribed` acknowledgement; on failure it has been sent an error
    /// message. The broker itself is unaffected either way.
    ///
    /// # Errors
    ///
    /// - `BrokerError::InvalidSource` if `raw_source` is not `^\d+$`
    /// - `BrokerError::UnknownClient` if the client is not connected
    /// - `BrokerError::Tailer` if the tailer could not be started
    /// - `BrokerError::Ended` if the source's stream ended before the client
    ///   was attached; the client has also been sent `Close`
    pub async fn handle_subscribe(
        self: &Arc<Self>,
        client: ClientId,
        raw_source: &str,
    ) -> Result<SourceId, BrokerError> {
        let source = match SourceId::parse(raw_source) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(client, raw_source, "Rejected invalid source identifier");
                metrics::record_stream_error("invalid_source");
                let rejection = ServerMessage::error("Invalid index parameter");
                self.state
                    .lock()
                    .deliver(client, Delivery::Message(rejection));
                return Err(e.into());
            }
        };

        if !self.state.lock().clients.contains_key(&client) {
            return Err(BrokerError::UnknownClient(client));
        }

        let _lifecycle = self.lifecycle.lock().await;

        let already_subscribed = self.state.lock().subscriptions.source_of(client) == Some(&source);
        if !already_subscribed && let Some(control) = self.detach(client) {
            control.stop().await;
        }

        let running = self.state.lock().tailers.contains_key(&source);
        let fresh = if running {
            None
        } else {
            match self.factory.start(&source).await {
                Ok(started) => Some(self.register(&source, started)),
                Err(e) => {
                    tracing::warn!(client, source = %source, error = %e, "Failed to start tailer");
                    metrics::record_stream_error(error_kind(&e));
                    self.state
                        .lock()
                        .deliver(client, Delivery::Message(ServerMessage::error(e.to_string())));
                    return Err(e.into());
                }
            }
        };

        // a fresh tailer's events are not pumped until the client is attached
        match self.attach(client, &source) {
            Attach::Subscribed => {
                if let Some((generation, events)) = fresh {
                    self.spawn_pump(&source, generation, events);
                }
            }
            Attach::Orphaned(orphan) => {
                if let Some(control) = orphan {
                    control.stop().await;
                    self.refresh_tailer_gauge();
                }
                return Err(BrokerError::UnknownClient(client));
            }
            Attach::Ended => {
                tracing::info!(client, source = %source, "Log stream ended before subscribe");
                return Err(BrokerError::Ended(source));
            }
        }

        tracing::info!(client, source = %source, "Client subscribed");
        Ok(source)
    }

    /// Send a message to one client.
    pub fn notify(&self, client: ClientId, message: ServerMessage) {
        self.state.lock().deliver(client, Delivery::Message(message));
    }

    /// Forward a line to every client subscribed to `source`.
    ///
    /// Delivery to each client is independent; a full or closed queue only
    /// affects that client.
    pub fn on_tailer_line(&self, source: &SourceId, line: String) {
        let generation = self.state.lock().tailers.get(source).map(|e| e.generation);
        if let Some(generation) = generation {
            self.dispatch(source, generation, TailEvent::Line(line));
        }
    }

    /// Remove a client, stopping its source's tailer if it was the last
    /// subscriber.
    pub async fn handle_disconnect(&self, client: ClientId) {
        let removed = {
            let mut state = self.state.lock();
            state.clients.remove(&client).map(|entry| {
                let count = state
                    .clients
                    .values()
                    .filter(|c| c.transport == entry.transport)
                    .count();
                (entry.transport, count)
            })
        };

        let Some((transport, count)) = removed else {
            return;
        };
        metrics::set_clients(transport, count);
        tracing::info!(client, transport = transport.as_str(), "Client disconnected");

        let _lifecycle = self.lifecycle.lock().await;
        if let Some(control) = self.detach(client) {
            control.stop().await;
        }
    }

    /// Stop every tailer and close every client stream.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let controls: Vec<_> = {
            let mut state = self.state.lock();
            for client in state.clients.keys() {
                state.deliver(*client, Delivery::Close);
            }
            let sources: Vec<_> = state.tailers.keys().cloned().collect();
            for source in &sources {
                state.subscriptions.remove_source(source);
            }
            state.tailers.drain().map(|(_, entry)| entry.control).collect()
        };

        tracing::info!(tailers = controls.len(), "Stopping all tailers");
        for control in controls {
            control.stop().await;
        }
        self.refresh_tailer_gauge();
    }

    /// Whether a tailer is running for `source`.
    #[must_use]
    pub fn is_tailing(&self, source: &SourceId) -> bool {
        self.state.lock().tailers.contains_key(source)
    }

    /// Snapshot of broker state.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let state = self.state.lock();
        let mut tailers: Vec<_> = state
            .tailers
            .iter()
            .map(|(source, entry)| TailerStatus {
                source: source.clone(),
                subscribers: state.subscriptions.subscriber_count(source),
                strategy: entry
                    .control
                    .strategy()
                    .unwrap_or_else(|| entry.strategy.clone()),
                history_lines: entry.history.len(),
                running: entry.control.is_running(),
            })
            .collect();
        tailers.sort_by(|a, b| a.source.cmp(&b.source));

        BrokerStats {
            clients: state.clients.len(),
            tailers,
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Register a started tailer; returns its generation and event stream.
    fn register(
        &self,
        source: &SourceId,
        started: StartedTailer,
    ) -> (u64, mpsc::Receiver<TailEvent>) {
        let StartedTailer {
            control,
            history,
            events,
            strategy,
        } = started;

        let generation = {
            let mut state = self.state.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.tailers.insert(
                source.clone(),
                TailerEntry {
                    control: Arc::from(control),
                    history: HistoryBuffer::seeded(self.config.history_lines, history.lines),
                    notice: history.notice,
                    strategy: strategy.clone(),
                    generation,
                },
            );
            generation
        };

        tracing::info!(source = %source, strategy = %strategy, "Tailer started");
        metrics::record_tailer_start(&strategy);
        self.refresh_tailer_gauge();

        (generation, events)
    }

    fn spawn_pump(
        self: &Arc<Self>,
        source: &SourceId,
        generation: u64,
        events: mpsc::Receiver<TailEvent>,
    ) {
        let broker = Arc::clone(self);
        let source = source.clone();
        tokio::spawn(async move {
            broker.pump(source, generation, events).await;
        });
    }

    /// Subscribe `client` to the running tailer of `source` and queue its
    /// history and acknowledgement, atomically with respect to dispatch.
    fn attach(&self, client: ClientId, source: &SourceId) -> Attach {
        let mut state = self.state.lock();

        if !state.clients.contains_key(&client) {
            let orphan = if state.subscriptions.subscriber_count(source) == 0 {
                state.tailers.remove(source).map(|entry| entry.control)
            } else {
                None
            };
            return Attach::Orphaned(orphan);
        }

        let Some(entry) = state.tailers.get(source) else {
            let message = ServerMessage::error(BrokerError::Ended(source.clone()).to_string());
            state.deliver(client, Delivery::Message(message));
            state.deliver(client, Delivery::Close);
            return Attach::Ended;
        };
        let history = entry.history.snapshot();
        let notice = entry.notice.clone();

        state.subscriptions.subscribe(client, source.clone());
        state.deliver(client, Delivery::Message(ServerMessage::History { lines: history }));
        if let Some(notice) = notice {
            state.deliver(client, Delivery::Message(ServerMessage::info(notice)));
        }
        state.deliver(client, Delivery::Message(ServerMessage::info(LIVE_NOTICE)));
        state.deliver(
            client,
            Delivery::Message(ServerMessage::Subscribed {
                index: source.to_string(),
            }),
        );
        Attach::Subscribed
    }

    async fn pump(&self, source: SourceId, generation: u64, mut events: mpsc::Receiver<TailEvent>) {
        let mut ended = false;

        while let Some(event) = events.recv().await {
            ended = matches!(event, TailEvent::Ended(_));
            if let Some(control) = self.dispatch(&source, generation, event) {
                control.stop().await;
                self.refresh_tailer_gauge();
            }
            if ended {
                break;
            }
        }

        if !ended
            && let Some(control) = self.dispatch(
                &source,
                generation,
                TailEvent::Ended(StreamEnd::Failed("tailer stopped unexpectedly".to_string())),
            )
        {
            control.stop().await;
            self.refresh_tailer_gauge();
        }

        tracing::debug!(source = %source, generation, "Tailer event pump finished");
    }

    /// Apply one tailer event. Returns the tailer's control when the event
    /// ended the stream, so the caller can reap it outside the lock.
    fn dispatch(
        &self,
        source: &SourceId,
        generation: u64,
        event: TailEvent,
    ) -> Option<Arc<dyn TailerControl>> {
        let mut state = self.state.lock();
        if state.tailers.get(source).map(|e| e.generation) != Some(generation) {
            return None;
        }

        match event {
            TailEvent::Line(line) => {
                metrics::record_line_received(source.as_str());
                if let Some(entry) = state.tailers.get_mut(source) {
                    entry.history.push(line.clone());
                }
                let sent = state.broadcast(source, &ServerMessage::Log { line });
                metrics::record_lines_sent(sent);
                None
            }
            TailEvent::Info(message) => {
                state.broadcast(source, &ServerMessage::info(message));
                None
            }
            TailEvent::Error(message) => {
                state.broadcast(source, &ServerMessage::error(message));
                None
            }
            TailEvent::Ended(end) => {
                tracing::info!(source = %source, reason = %end, "Log stream ended");
                let message = match &end {
                    StreamEnd::Exited { .. } => ServerMessage::info(end.to_string()),
                    StreamEnd::Failed(_) | StreamEnd::Exhausted { .. } => {
                        metrics::record_stream_error("stream_ended");
                        ServerMessage::error(end.to_string())
                    }
                };

                let entry = state.tailers.remove(source);
                for client in state.subscriptions.remove_source(source) {
                    state.deliver(client, Delivery::Message(message.clone()));
                    state.deliver(client, Delivery::Close);
                }
                entry.map(|e| e.control)
            }
        }
    }

    /// Drop `client`'s subscription; returns the tailer to stop if the
    /// client was its last subscriber.
    fn detach(&self, client: ClientId) -> Option<Arc<dyn TailerControl>> {
        let control = {
            let mut state = self.state.lock();
            let source = state.subscriptions.unsubscribe(client)?;
            tracing::info!(source = %source, "Last subscriber left, stopping tailer");
            state.tailers.remove(&source).map(|entry| entry.control)
        };
        self.refresh_tailer_gauge();
        control
    }

    fn refresh_tailer_gauge(&self) {
        metrics::set_active_tailers(self.state.lock().tailers.len());
    }
}

/// Result of attaching a client to a tailer.
enum Attach {
    Subscribed,
    /// The client left meanwhile; holds the tailer to stop if it has no
    /// other subscribers.
    Orphaned(Option<Arc<dyn TailerControl>>),
    /// The tailer's stream ended before the client was attached.
    Ended,
}

fn error_kind(error: &TailerError) -> &'static str {
    match error {
        TailerError::SourceNotFound(_) => "source_not_found",
        TailerError::PermissionDenied(_) => "permission_denied",
        TailerError::Spawn(_) => "spawn_failed",
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Broker statistics.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    /// Connected clients.
    pub clients: usize,
    /// Running tailers, ordered by source.
    pub tailers: Vec<TailerStatus>,
}

/// Status of one running tailer.
#[derive(Debug, Clone)]
pub struct TailerStatus {
    /// Source being followed.
    pub source: SourceId,
    /// Number of subscribed clients.
    pub subscribers: usize,
    /// Follow strategy in use when the tailer started.
    pub strategy: String,
    /// Lines currently held in the history buffer.
    pub history_lines: usize,
    /// Whether the follower is still running.
    pub running: bool,
}

// =============================================================================
// Errors
// =============================================================================

/// Broker errors. Each has already been reported to the client.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The source identifier failed validation.
    #[error(transparent)]
    InvalidSource(#[from] SourceError),

    /// The client is not (or no longer) connected.
    #[error("unknown client: {0}")]
    UnknownClient(ClientId),

    /// The tailer could not be started.
    #[error(transparent)]
    Tailer(#[from] TailerError),

    /// The source's log stream ended before the client was attached.
    #[error("log stream for source {0} has ended")]
    Ended(SourceId),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::application::ports::{History, MockTailerFactory};

    type Feeds = Arc<Mutex<HashMap<SourceId, mpsc::Sender<TailEvent>>>>;

    struct FakeControl {
        source: SourceId,
        feeds: Feeds,
        running: AtomicBool,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TailerControl for FakeControl {
        async fn stop(&self) {
            if self.running.swap(false, Ordering::SeqCst) {
                self.stops.fetch_add(1, Ordering::SeqCst);
            }
            self.feeds.lock().remove(&self.source);
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    /// Starts fake tailers whose events the test injects by source.
    #[derive(Default)]
    struct FakeFactory {
        feeds: Feeds,
        history: Vec<String>,
        /// Events already queued when the tailer starts.
        opening: Vec<TailEvent>,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl FakeFactory {
        fn with_history(lines: &[&str]) -> Self {
            Self {
                history: lines.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }

        async fn emit(&self, source: &str, event: TailEvent) {
            let tx = self
                .feeds
                .lock()
                .get(&SourceId::parse(source).unwrap())
                .cloned()
                .expect("no tailer running for source");
            tx.send(event).await.unwrap();
        }
    }

    #[async_trait]
    impl TailerFactory for Arc<FakeFactory> {
        async fn start(&self, source: &SourceId) -> Result<StartedTailer, TailerError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(64);
            for event in &self.opening {
                tx.try_send(event.clone()).unwrap();
            }
            self.feeds.lock().insert(source.clone(), tx);
            Ok(StartedTailer {
                control: Box::new(FakeControl {
                    source: source.clone(),
                    feeds: Arc::clone(&self.feeds),
                    running: AtomicBool::new(true),
                    stops: Arc::clone(&self.stops),
                }),
                history: History {
                    lines: self.history.clone(),
                    notice: None,
                },
                events: rx,
                strategy: "fake".to_string(),
            })
        }
    }

    fn broker_with(factory: &Arc<FakeFactory>) -> Arc<Broker> {
        Arc::new(Broker::new(
            Arc::new(Arc::clone(factory)),
            BrokerConfig::default(),
        ))
    }

    async fn next_message(rx: &mut mpsc::Receiver<Delivery>) -> ServerMessage {
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Delivery::Message(message))) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    /// Consume history, live notice and acknowledgement; return history.
    async fn expect_subscribed(rx: &mut mpsc::Receiver<Delivery>, index: &str) -> Vec<String> {
        let ServerMessage::History { lines } = next_message(rx).await else {
            panic!("history must come first");
        };
        assert_eq!(next_message(rx).await, ServerMessage::info(LIVE_NOTICE));
        assert_eq!(
            next_message(rx).await,
            ServerMessage::Subscribed {
                index: index.to_string()
            }
        );
        lines
    }

    #[tokio::test]
    async fn subscribe_sends_history_then_ack() {
        let factory = Arc::new(FakeFactory::with_history(&["one", "two"]));
        let broker = broker_with(&factory);
        let (client, mut rx) = broker.handle_connect(Transport::WebSocket);

        let source = broker.handle_subscribe(client, "3").await.unwrap();

        assert_eq!(source.as_str(), "3");
        assert_eq!(
            expect_subscribed(&mut rx, "3").await,
            vec!["one".to_string(), "two".to_string()]
        );
        assert!(broker.is_tailing(&source));
    }

    #[tokio::test]
    async fn invalid_source_is_rejected_without_starting_a_tailer() {
        let factory = Arc::new(FakeFactory::default());
        let broker = broker_with(&factory);
        let (client, mut rx) = broker.handle_connect(Transport::WebSocket);

        for raw in ["../etc/passwd", "abc", "12;rm", ""] {
            let result = broker.handle_subscribe(client, raw).await;
            assert!(matches!(result, Err(BrokerError::InvalidSource(_))));
            assert_eq!(
                next_message(&mut rx).await,
                ServerMessage::error("Invalid index parameter")
            );
        }

        assert_eq!(factory.starts.load(Ordering::SeqCst), 0);
        assert!(broker.stats().tailers.is_empty());
    }

    #[tokio::test]
    async fn tailer_is_shared_between_subscribers() {
        let factory = Arc::new(FakeFactory::default());
        let broker = broker_with(&factory);
        let (a, mut rx_a) = broker.handle_connect(Transport::WebSocket);
        let (b, mut rx_b) = broker.handle_connect(Transport::Sse);

        broker.handle_subscribe(a, "1").await.unwrap();
        broker.handle_subscribe(b, "1").await.unwrap();
        expect_subscribed(&mut rx_a, "1").await;
        expect_subscribed(&mut rx_b, "1").await;

        assert_eq!(factory.starts.load(Ordering::SeqCst), 1);
        assert_eq!(broker.stats().tailers[0].subscribers, 2);
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_line_in_order() {
        let factory = Arc::new(FakeFactory::default());
        let broker = broker_with(&factory);
        let (a, mut rx_a) = broker.handle_connect(Transport::WebSocket);
        let (b, mut rx_b) = broker.handle_connect(Transport::WebSocket);
        broker.handle_subscribe(a, "1").await.unwrap();
        broker.handle_subscribe(b, "1").await.unwrap();
        expect_subscribed(&mut rx_a, "1").await;
        expect_subscribed(&mut rx_b, "1").await;

        for i in 0..50 {
            factory.emit("1", TailEvent::Line(format!("line {i}"))).await;
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for i in 0..50 {
                assert_eq!(
                    next_message(rx).await,
                    ServerMessage::Log {
                        line: format!("line {i}")
                    }
                );
            }
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_recent_lines_as_history() {
        let factory = Arc::new(FakeFactory::default());
        let broker = broker_with(&factory);
        let (a, mut rx_a) = broker.handle_connect(Transport::WebSocket);
        broker.handle_subscribe(a, "1").await.unwrap();
        expect_subscribed(&mut rx_a, "1").await;

        for i in 0..25 {
            factory.emit("1", TailEvent::Line(format!("line {i}"))).await;
        }
        for _ in 0..25 {
            next_message(&mut rx_a).await;
        }

        let (b, mut rx_b) = broker.handle_connect(Transport::WebSocket);
        broker.handle_subscribe(b, "1").await.unwrap();
        let history = expect_subscribed(&mut rx_b, "1").await;

        let expected: Vec<_> = (5..25).map(|i| format!("line {i}")).collect();
        assert_eq!(history, expected);
    }

    #[tokio::test]
    async fn full_client_queue_does_not_block_others() {
        let factory = Arc::new(FakeFactory::default());
        let broker = Arc::new(Broker::new(
            Arc::new(Arc::clone(&factory)),
            BrokerConfig {
                client_buffer: 8,
                history_lines: 20,
            },
        ));
        let (slow, _slow_rx) = broker.handle_connect(Transport::WebSocket);
        let (fast, mut fast_rx) = broker.handle_connect(Transport::WebSocket);
        broker.handle_subscribe(slow, "1").await.unwrap();
        broker.handle_subscribe(fast, "1").await.unwrap();
        expect_subscribed(&mut fast_rx, "1").await;

        for i in 0..20 {
            broker.on_tailer_line(&SourceId::parse("1").unwrap(), format!("line {i}"));
            assert_eq!(
                next_message(&mut fast_rx).await,
                ServerMessage::Log {
                    line: format!("line {i}")
                }
            );
        }
    }

    #[tokio::test]
    async fn last_disconnect_stops_tailer() {
        let factory = Arc::new(FakeFactory::default());
        let broker = broker_with(&factory);
        let (a, _rx_a) = broker.handle_connect(Transport::WebSocket);
        let (b, _rx_b) = broker.handle_connect(Transport::WebSocket);
        broker.handle_subscribe(a, "1").await.unwrap();
        broker.handle_subscribe(b, "1").await.unwrap();
        let source = SourceId::parse("1").unwrap();

        broker.handle_disconnect(a).await;
        assert!(broker.is_tailing(&source));
        assert_eq!(factory.stops.load(Ordering::SeqCst), 0);

        broker.handle_disconnect(b).await;
        assert!(!broker.is_tailing(&source));
        assert_eq!(factory.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resubscribe_moves_client_and_stops_abandoned_tailer() {
        let factory = Arc::new(FakeFactory::default());
        let broker = broker_with(&factory);
        let (client, mut rx) = broker.handle_connect(Transport::WebSocket);

        broker.handle_subscribe(client, "1").await.unwrap();
        expect_subscribed(&mut rx, "1").await;
        broker.handle_subscribe(client, "2").await.unwrap();
        expect_subscribed(&mut rx, "2").await;

        assert!(!broker.is_tailing(&SourceId::parse("1").unwrap()));
        assert!(broker.is_tailing(&SourceId::parse("2").unwrap()));
        assert_eq!(factory.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_after_teardown_starts_fresh_tailer() {
        let factory = Arc::new(FakeFactory::default());
        let broker = broker_with(&factory);
        let (a, _rx_a) = broker.handle_connect(Transport::WebSocket);
        broker.handle_subscribe(a, "1").await.unwrap();
        broker.handle_disconnect(a).await;

        let (b, mut rx_b) = broker.handle_connect(Transport::WebSocket);
        broker.handle_subscribe(b, "1").await.unwrap();
        expect_subscribed(&mut rx_b, "1").await;

        assert_eq!(factory.starts.load(Ordering::SeqCst), 2);
        assert_eq!(factory.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_end_notifies_and_closes_subscribers() {
        let factory = Arc::new(FakeFactory::default());
        let broker = broker_with(&factory);
        let (client, mut rx) = broker.handle_connect(Transport::Sse);
        broker.handle_subscribe(client, "4").await.unwrap();
        expect_subscribed(&mut rx, "4").await;

        factory
            .emit("4", TailEvent::Ended(StreamEnd::Exited { code: Some(1) }))
            .await;

        assert_eq!(
            next_message(&mut rx).await,
            ServerMessage::info("Log stream ended with code 1")
        );
        assert_eq!(
            timeout(Duration::from_secs(1), rx.recv()).await.unwrap(),
            Some(Delivery::Close)
        );
        assert!(!broker.is_tailing(&SourceId::parse("4").unwrap()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stream_ending_at_start_still_reaches_subscriber() {
        for _ in 0..200 {
            let factory = Arc::new(FakeFactory {
                opening: vec![TailEvent::Ended(StreamEnd::Exited { code: Some(0) })],
                ..FakeFactory::default()
            });
            let broker = broker_with(&factory);
            let (client, mut rx) = broker.handle_connect(Transport::WebSocket);

            broker.handle_subscribe(client, "1").await.unwrap();

            let mut deliveries = Vec::new();
            while let Ok(Some(delivery)) = timeout(Duration::from_secs(1), rx.recv()).await {
                let closed = delivery == Delivery::Close;
                deliveries.push(delivery);
                if closed {
                    break;
                }
            }

            assert_eq!(deliveries.last(), Some(&Delivery::Close), "{deliveries:?}");
            assert!(deliveries.iter().any(|d| matches!(
                d,
                Delivery::Message(ServerMessage::Subscribed { .. })
            )));
            assert!(broker.stats().tailers.is_empty());
            assert!(broker.state.lock().subscriptions.source_of(client).is_none());
        }
    }

    #[tokio::test]
    async fn subscribe_to_ended_tailer_is_closed_not_attached() {
        let factory = Arc::new(FakeFactory::default());
        let broker = broker_with(&factory);
        let source = SourceId::parse("6").unwrap();
        let (client, mut rx) = broker.handle_connect(Transport::WebSocket);

        assert!(matches!(broker.attach(client, &source), Attach::Ended));

        assert_eq!(
            next_message(&mut rx).await,
            ServerMessage::error("log stream for source 6 has ended")
        );
        assert_eq!(
            timeout(Duration::from_secs(1), rx.recv()).await.unwrap(),
            Some(Delivery::Close)
        );
        assert!(broker.state.lock().subscriptions.source_of(client).is_none());
    }

    #[tokio::test]
    async fn missing_source_reports_error_and_keeps_broker_usable() {
        let mut factory = MockTailerFactory::new();
        factory
            .expect_start()
            .returning(|source| Err(TailerError::SourceNotFound(format!("/logs/{source}.log"))));
        let broker = Arc::new(Broker::new(Arc::new(factory), BrokerConfig::default()));
        let (client, mut rx) = broker.handle_connect(Transport::WebSocket);

        let result = broker.handle_subscribe(client, "7").await;

        assert!(matches!(
            result,
            Err(BrokerError::Tailer(TailerError::SourceNotFound(_)))
        ));
        assert_eq!(
            next_message(&mut rx).await,
            ServerMessage::error("log source not found: /logs/7.log")
        );
        assert!(broker.stats().tailers.is_empty());
        assert_eq!(broker.stats().clients, 1);
    }

    #[tokio::test]
    async fn subscribe_from_unknown_client_fails() {
        let factory = Arc::new(FakeFactory::default());
        let broker = broker_with(&factory);

        let result = broker.handle_subscribe(42, "1").await;

        assert!(matches!(result, Err(BrokerError::UnknownClient(42))));
        assert_eq!(factory.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let factory = Arc::new(FakeFactory::default());
        let broker = broker_with(&factory);
        let (a, mut rx_a) = broker.handle_connect(Transport::WebSocket);
        let (b, _rx_b) = broker.handle_connect(Transport::WebSocket);
        broker.handle_subscribe(a, "1").await.unwrap();
        broker.handle_subscribe(b, "2").await.unwrap();
        expect_subscribed(&mut rx_a, "1").await;

        broker.shutdown().await;

        assert_eq!(
            timeout(Duration::from_secs(1), rx_a.recv()).await.unwrap(),
            Some(Delivery::Close)
        );
        assert!(broker.stats().tailers.is_empty());
        assert_eq!(factory.stops.load(Ordering::SeqCst), 2);
    }
}
