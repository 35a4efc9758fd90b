//! Log Streaming Types
//!
//! Wire messages exchanged with WebSocket clients, the events a tailer
//! produces, and the bounded history buffer replayed at subscribe time.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default number of history lines replayed to a new subscriber.
pub const DEFAULT_HISTORY_LINES: usize = 20;

// =============================================================================
// Wire Messages
// =============================================================================

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Recent lines, sent once per subscription before any live line.
    History {
        /// Lines in source order, oldest first.
        lines: Vec<String>,
    },
    /// One live line.
    Log {
        /// The line, verbatim.
        line: String,
    },
    /// Informational notice.
    Info {
        /// Human-readable notice.
        message: String,
    },
    /// Error notice.
    Error {
        /// Human-readable error.
        message: String,
    },
    /// Subscription acknowledgement.
    Subscribed {
        /// The source identifier subscribed to.
        index: String,
    },
}

impl ServerMessage {
    /// Build an info message.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::Info {
            message: message.into(),
        }
    }

    /// Build an error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Subscribe to one source, replacing any previous subscription.
    Subscribe {
        /// Raw (unvalidated) source identifier.
        index: RawIndex,
    },
}

/// A source identifier as sent by clients: a string or a bare number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawIndex {
    /// `"index": "7"`
    Text(String),
    /// `"index": 7`
    Number(u64),
}

impl fmt::Display for RawIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// What a client's outbound queue carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A message to forward.
    Message(ServerMessage),
    /// The server is ending this client's stream.
    Close,
}

// =============================================================================
// Tailer Events
// =============================================================================

/// Events produced by a running tailer, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEvent {
    /// A new non-empty line.
    Line(String),
    /// Informational notice (fallbacks, rotation, missing file).
    Info(String),
    /// Diagnostic output from the follower (e.g. follower stderr).
    Error(String),
    /// The stream is over; no further events follow.
    Ended(StreamEnd),
}

/// Why a tailer's stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The follower process exited on its own.
    Exited {
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
    },
    /// Following failed with a non-permission error.
    Failed(String),
    /// Every follow strategy was denied access.
    Exhausted {
        /// What an operator can do to restore access.
        remediation: String,
    },
}

impl fmt::Display for StreamEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code: Some(code) } => write!(f, "Log stream ended with code {code}"),
            Self::Exited { code: None } => f.write_str("Log stream ended by signal"),
            Self::Failed(reason) => write!(f, "Log stream failed: {reason}"),
            Self::Exhausted { remediation } => {
                write!(f, "Permission denied for every log source. {remediation}")
            }
        }
    }
}

// =============================================================================
// History Buffer
// =============================================================================

/// Bounded buffer of the most recent non-empty lines.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Create an empty buffer holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Create a buffer seeded with `lines`, keeping only the newest ones.
    #[must_use]
    pub fn seeded(capacity: usize, lines: impl IntoIterator<Item = String>) -> Self {
        let mut buffer = Self::new(capacity);
        for line in lines {
            buffer.push(line);
        }
        buffer
    }

    /// Append a line, evicting the oldest when full. Blank lines are ignored.
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 || line.trim().is_empty() {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Copy out the buffered lines, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Number of buffered lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn server_messages_use_type_tag() {
        let cases = [
            (
                ServerMessage::History {
                    lines: vec!["a".to_string(), "b".to_string()],
                },
                json!({"type": "history", "lines": ["a", "b"]}),
            ),
            (
                ServerMessage::Log {
                    line: "hello".to_string(),
                },
                json!({"type": "log", "line": "hello"}),
            ),
            (
                ServerMessage::info("Live log stream started"),
                json!({"type": "info", "message": "Live log stream started"}),
            ),
            (
                ServerMessage::error("boom"),
                json!({"type": "error", "message": "boom"}),
            ),
            (
                ServerMessage::Subscribed {
                    index: "4".to_string(),
                },
                json!({"type": "subscribed", "index": "4"}),
            ),
        ];

        for (message, expected) in cases {
            assert_eq!(serde_json::to_value(&message).unwrap(), expected);
        }
    }

    #[test]
    fn subscribe_accepts_string_or_number_index() {
        let text: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","index":"12"}"#).unwrap();
        let number: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","index":12}"#).unwrap();

        let ClientMessage::Subscribe { index: a } = text;
        let ClientMessage::Subscribe { index: b } = number;
        assert_eq!(a.to_string(), "12");
        assert_eq!(b.to_string(), "12");
    }

    #[test]
    fn unknown_client_message_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"unsubscribe"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn history_keeps_newest_lines_in_order() {
        let lines = (1..=25).map(|i| format!("line {i}"));
        let buffer = HistoryBuffer::seeded(20, lines);

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 20);
        assert_eq!(snapshot.first().unwrap(), "line 6");
        assert_eq!(snapshot.last().unwrap(), "line 25");
    }

    #[test]
    fn history_ignores_blank_lines() {
        let mut buffer = HistoryBuffer::new(3);
        buffer.push(String::new());
        buffer.push("   ".to_string());
        buffer.push("x".to_string());

        assert_eq!(buffer.snapshot(), vec!["x".to_string()]);
    }

    #[test]
    fn zero_capacity_history_stays_empty() {
        let buffer = HistoryBuffer::seeded(0, vec!["a".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn stream_end_messages() {
        assert_eq!(
            StreamEnd::Exited { code: Some(1) }.to_string(),
            "Log stream ended with code 1"
        );
        assert!(
            StreamEnd::Exhausted {
                remediation: "Add the relay user to systemd-journal.".to_string()
            }
            .to_string()
            .ends_with("systemd-journal.")
        );
    }
}
