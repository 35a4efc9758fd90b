//! Terminal viewer for the log relay.
//!
//! Subscribes to one source and prints its lines until Ctrl+C.
//!
//! ```bash
//! cargo run --bin log-tail -- 3 --url ws://127.0.0.1:3005/ws
//! ```

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log_relay::ServerMessage;
use log_relay::infrastructure::client::{
    ClientEvent, ConnectionStatus, LogStreamClient, LogStreamClientConfig, ReconnectConfig,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

#[derive(Parser, Debug)]
#[command(author, version, about = "Follow a service log through the log relay", long_about = None)]
struct Args {
    /// Instance index to follow
    index: String,

    /// Relay WebSocket URL
    #[arg(long, env = "LOG_RELAY_URL", default_value = "ws://127.0.0.1:3005/ws")]
    url: String,

    /// Delay between reconnection attempts, in milliseconds
    #[arg(long, env = "LOG_RELAY_RECONNECT_MS", default_value_t = 3000)]
    reconnect_ms: u64,

    /// Give up after this many failed attempts (0 = never)
    #[arg(long, default_value_t = 0)]
    max_attempts: u32,

    /// Disable ANSI colors
    #[arg(long)]
    no_color: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let (event_tx, mut event_rx) = mpsc::channel(256);

    let client = LogStreamClient::new(
        LogStreamClientConfig {
            url: args.url.clone(),
            index: args.index.clone(),
            reconnect: ReconnectConfig::fixed(
                Duration::from_millis(args.reconnect_ms),
                args.max_attempts,
            ),
        },
        event_tx,
        cancel.clone(),
    );
    let mut client_task = tokio::spawn(client.run());

    let painter = Painter {
        color: !args.no_color,
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                break;
            }
            event = event_rx.recv() => match event {
                Some(event) => painter.print(&event),
                None => break,
            },
            joined = &mut client_task => {
                while let Ok(event) = event_rx.try_recv() {
                    painter.print(&event);
                }
                return joined
                    .context("viewer task panicked")?
                    .context("gave up on the relay");
            }
        }
    }

    client_task
        .await
        .context("viewer task panicked")?
        .context("gave up on the relay")
}

struct Painter {
    color: bool,
}

impl Painter {
    fn print(&self, event: &ClientEvent) {
        match event {
            ClientEvent::Status(status) => self.status(*status),
            ClientEvent::Failure(reason) => eprintln!("{}", self.paint(DIM, reason)),
            ClientEvent::Message(message) => self.message(message),
        }
    }

    fn status(&self, status: ConnectionStatus) {
        let code = match status {
            ConnectionStatus::Error => RED,
            ConnectionStatus::Connected => CYAN,
            ConnectionStatus::Connecting | ConnectionStatus::Disconnected => DIM,
        };
        eprintln!("{}", self.paint(code, &format!("-- {status} --")));
    }

    fn message(&self, message: &ServerMessage) {
        match message {
            ServerMessage::History { lines } => {
                for line in lines {
                    println!("{line}");
                }
            }
            ServerMessage::Log { line } => println!("{line}"),
            ServerMessage::Info { message } => {
                println!("{}", self.paint(CYAN, &format!("[INFO] {message}")));
            }
            ServerMessage::Error { message } => {
                println!("{}", self.paint(RED, &format!("[ERROR] {message}")));
            }
            ServerMessage::Subscribed { index } => {
                eprintln!("{}", self.paint(DIM, &format!("-- following {index} --")));
            }
        }
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.color {
            format!("{code}{text}{RESET}")
        } else {
            text.to_string()
        }
    }
}
