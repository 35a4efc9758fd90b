//! Relay Configuration Settings
//!
//! Configuration types for the log relay, loaded from environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::application::services::BrokerConfig;
use crate::domain::source::SourceLayout;
use crate::domain::streaming::DEFAULT_HISTORY_LINES;
use crate::infrastructure::tailer::{Backend, TailerSettings};

/// Server address settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Relay bind address.
    pub host: IpAddr,
    /// Relay HTTP/WebSocket/SSE port.
    pub port: u16,
    /// Health check and metrics port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 3005,
            health_port: 8083,
        }
    }
}

impl ServerSettings {
    /// Relay listen address.
    #[must_use]
    pub const fn relay_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen addresses.
    pub server: ServerSettings,
    /// Tailer settings.
    pub tailer: TailerSettings,
    /// Broker settings.
    pub broker: BrokerConfig,
    /// How long shutdown waits for connections to close.
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            tailer: TailerSettings::default(),
            broker: BrokerConfig::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unusable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// Unset or unparseable numeric values fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address, or a path
    /// setting is empty or escapes the log directory.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let env = EnvReader { lookup: &lookup };

        let host = match env.string("LOG_RELAY_HOST") {
            None => defaults.server.host,
            Some(host) if host.eq_ignore_ascii_case("localhost") => defaults.server.host,
            Some(host) => host
                .parse()
                .map_err(|_| ConfigError::InvalidValue("LOG_RELAY_HOST".to_string(), host))?,
        };

        let server = ServerSettings {
            host,
            port: env.parse("PORT", defaults.server.port),
            health_port: env.parse("LOG_RELAY_HEALTH_PORT", defaults.server.health_port),
        };

        let default_layout = SourceLayout::default();
        let log_dir = match env.string("LOG_RELAY_LOG_DIR") {
            Some(dir) if dir.trim().is_empty() => {
                return Err(ConfigError::EmptyValue("LOG_RELAY_LOG_DIR".to_string()));
            }
            Some(dir) => PathBuf::from(dir),
            None => default_layout.log_dir,
        };

        let file_prefix = env
            .string("LOG_RELAY_FILE_PREFIX")
            .unwrap_or(default_layout.file_prefix);
        if file_prefix.contains('/') || file_prefix.contains("..") {
            return Err(ConfigError::InvalidValue(
                "LOG_RELAY_FILE_PREFIX".to_string(),
                file_prefix,
            ));
        }

        let unit_prefix = env
            .string("LOG_RELAY_UNIT_PREFIX")
            .unwrap_or(default_layout.unit_prefix);
        if unit_prefix.is_empty() {
            return Err(ConfigError::EmptyValue("LOG_RELAY_UNIT_PREFIX".to_string()));
        }

        let history_lines = env.parse("LOG_RELAY_HISTORY_LINES", DEFAULT_HISTORY_LINES);

        let tailer = TailerSettings {
            backend: env
                .string("LOG_RELAY_BACKEND")
                .map(|s| Backend::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            layout: SourceLayout {
                log_dir,
                file_prefix,
                unit_prefix,
            },
            use_sudo: env.flag("LOG_RELAY_USE_SUDO", defaults.tailer.use_sudo),
            history_lines,
            poll_interval: env.millis("LOG_RELAY_POLL_INTERVAL_MS", defaults.tailer.poll_interval),
            stop_timeout: env.millis("LOG_RELAY_STOP_TIMEOUT_MS", defaults.tailer.stop_timeout),
        };

        let broker = BrokerConfig {
            client_buffer: env.parse("LOG_RELAY_CLIENT_BUFFER", defaults.broker.client_buffer),
            history_lines,
        };

        Ok(Self {
            server,
            tailer,
            broker,
            shutdown_grace: Duration::from_secs(env.parse(
                "LOG_RELAY_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )),
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {0} has invalid value {1:?}")]
    InvalidValue(String, String),
}

// =============================================================================
// Variable Parsing
// =============================================================================

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.string(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.string(key).map_or(default, |v| {
            matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<RelayConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        RelayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config(&[]).unwrap();

        assert_eq!(
            config.server.relay_addr(),
            "127.0.0.1:3005".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.server.health_port, 8083);
        assert_eq!(config.tailer.backend, Backend::File);
        assert_eq!(
            config.tailer.layout.log_dir,
            PathBuf::from("/var/log/threshold-ecdsa-web")
        );
        assert!(!config.tailer.use_sudo);
        assert_eq!(config.tailer.history_lines, 20);
        assert_eq!(config.broker.client_buffer, 1024);
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn overrides_are_applied() {
        let config = config(&[
            ("LOG_RELAY_HOST", "0.0.0.0"),
            ("PORT", "4000"),
            ("LOG_RELAY_BACKEND", "journal"),
            ("LOG_RELAY_USE_SUDO", "true"),
            ("LOG_RELAY_HISTORY_LINES", "50"),
            ("LOG_RELAY_POLL_INTERVAL_MS", "100"),
            ("LOG_RELAY_LOG_DIR", "/tmp/logs"),
        ])
        .unwrap();

        assert_eq!(config.server.relay_addr().to_string(), "0.0.0.0:4000");
        assert_eq!(config.tailer.backend, Backend::Journal);
        assert!(config.tailer.use_sudo);
        assert_eq!(config.tailer.history_lines, 50);
        assert_eq!(config.broker.history_lines, 50);
        assert_eq!(config.tailer.poll_interval, Duration::from_millis(100));
        assert_eq!(config.tailer.layout.log_dir, PathBuf::from("/tmp/logs"));
    }

    #[test]
    fn unparseable_numbers_fall_back() {
        let config = config(&[("PORT", "not-a-port"), ("LOG_RELAY_CLIENT_BUFFER", "-1")]).unwrap();
        assert_eq!(config.server.port, 3005);
        assert_eq!(config.broker.client_buffer, 1024);
    }

    #[test]
    fn localhost_is_accepted() {
        let config = config(&[("LOG_RELAY_HOST", "localhost")]).unwrap();
        assert!(config.server.host.is_loopback());
    }

    #[test_case("LOG_RELAY_HOST", "not an ip" ; "bad host")]
    #[test_case("LOG_RELAY_FILE_PREFIX", "../etc/" ; "prefix escapes dir")]
    #[test_case("LOG_RELAY_LOG_DIR", " " ; "blank log dir")]
    #[test_case("LOG_RELAY_UNIT_PREFIX", "" ; "empty unit prefix")]
    fn rejects_unusable_values(key: &str, value: &str) {
        assert!(config(&[(key, value)]).is_err());
    }
}
