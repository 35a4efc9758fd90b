//! Log Relay Binary
//!
//! Starts the log relay and its health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin log-relay
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_RELAY_HOST`: Relay bind address (default: 127.0.0.1)
//! - `PORT`: Relay HTTP/WebSocket/SSE port (default: 3005)
//! - `LOG_RELAY_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `LOG_RELAY_BACKEND`: file | journal (default: file)
//! - `LOG_RELAY_LOG_DIR`: Log file directory (default: /var/log/threshold-ecdsa-web)
//! - `LOG_RELAY_USE_SUDO`: Try `sudo -n journalctl` first (default: false)
//! - `LOG_RELAY_SHUTDOWN_GRACE_SECS`: Forced exit bound (default: 10)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use log_relay::infrastructure::health::{HealthServer, HealthServerState};
use log_relay::infrastructure::relay::{RelayServer, RelayState};
use log_relay::infrastructure::telemetry;
use log_relay::{Broker, RelayConfig, SystemTailerFactory, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv_from_ancestors();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting log relay");

    let _metrics_handle = init_metrics();

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    let factory = Arc::new(SystemTailerFactory::new(config.tailer.clone()));
    let broker = Arc::new(Broker::new(factory, config.broker));

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&broker),
        Arc::clone(&ready),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    let relay_state = Arc::new(RelayState::new(
        Arc::clone(&broker),
        config.tailer.layout.clone(),
        config.tailer.backend,
    ));
    let relay_server = RelayServer::new(
        config.server.relay_addr(),
        relay_state,
        shutdown_token.clone(),
        ready,
    );

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let mut relay_task = tokio::spawn(relay_server.run());

    tokio::select! {
        () = await_shutdown_signal() => {}
        joined = &mut relay_task => {
            // the relay stopped on its own, so there is nothing to drain
            shutdown_token.cancel();
            broker.shutdown().await;
            return joined
                .context("relay server task panicked")?
                .context("relay server failed");
        }
    }

    tracing::info!(
        grace_secs = config.shutdown_grace.as_secs(),
        "Graceful shutdown started"
    );

    let drain = async {
        broker.shutdown().await;
        shutdown_token.cancel();
        relay_task.await
    };

    match tokio::time::timeout(config.shutdown_grace, drain).await {
        Ok(Ok(Ok(()))) => {
            tracing::info!("Log relay stopped");
            Ok(())
        }
        Ok(Ok(Err(e))) => Err(e).context("relay server failed"),
        Ok(Err(e)) => Err(e).context("relay server task panicked"),
        Err(_) => {
            tracing::error!("Connections did not close within the grace period, forcing exit");
            std::process::exit(1);
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        addr = %config.server.relay_addr(),
        health_port = config.server.health_port,
        backend = config.tailer.backend.as_str(),
        log_dir = %config.tailer.layout.log_dir.display(),
        use_sudo = config.tailer.use_sudo,
        "Configuration loaded"
    );
    tracing::debug!(
        history_lines = config.broker.history_lines,
        client_buffer = config.broker.client_buffer,
        poll_interval_ms = config.tailer.poll_interval.as_millis(),
        "Relay tuning"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGTERM or SIGINT.
#[allow(clippy::expect_used)]
async fn await_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
