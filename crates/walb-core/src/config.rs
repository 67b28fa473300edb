//! Configuration for the storage host.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration for the storage daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Identifier of this node, sent in every protocol negotiation.
    pub node_id: String,
    /// Address the control server binds to.
    pub listen: SocketAddr,
    /// Directory holding per-volume persistent state.
    pub base_dir: PathBuf,
    /// Archive host address (full/hash backup destination).
    pub archive: SocketAddr,
    /// Proxy host addresses, in preference order.
    pub proxies: Vec<SocketAddr>,
    /// Upper bound of log data shipped per wlog-transfer round [MiB].
    pub max_wlog_send_mb: u64,
    /// Delay before re-scheduling a failed volume task [sec].
    pub delay_sec_for_retry: u64,
    /// Maximum concurrent foreground tasks (backup protocols).
    pub max_foreground_tasks: usize,
    /// Number of dispatcher workers draining the task queue.
    pub dispatch_workers: usize,
    /// Per-socket timeout [sec].
    pub socket_timeout_secs: u64,
    /// Interval between proxy availability checks [sec].
    pub proxy_heartbeat_interval_secs: u64,
    /// Socket timeout used by the proxy heartbeat [sec].
    pub proxy_heartbeat_socket_timeout_secs: u64,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            node_id: "storage0".to_string(),
            listen: "127.0.0.1:10000".parse().expect("valid default address"),
            base_dir: PathBuf::from("/var/walb/storage"),
            archive: "127.0.0.1:10200".parse().expect("valid default address"),
            proxies: Vec::new(),
            max_wlog_send_mb: 128,
            delay_sec_for_retry: 20,
            max_foreground_tasks: 2,
            dispatch_workers: 4,
            socket_timeout_secs: 100,
            proxy_heartbeat_interval_secs: 60,
            proxy_heartbeat_socket_timeout_secs: 10,
            logging: LoggingConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Per-socket timeout as a `Duration`.
    #[must_use]
    pub const fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    /// Proxy heartbeat interval as a `Duration`.
    #[must_use]
    pub const fn proxy_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.proxy_heartbeat_interval_secs)
    }

    /// Proxy heartbeat socket timeout as a `Duration`.
    #[must_use]
    pub const fn proxy_heartbeat_socket_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_heartbeat_socket_timeout_secs)
    }

    /// Retry delay as a `Duration`.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.delay_sec_for_retry)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log filter (overridden by `RUST_LOG`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// JSON lines.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.max_wlog_send_mb, 128);
        assert_eq!(config.socket_timeout(), Duration::from_secs(100));
        assert!(config.proxies.is_empty());
    }

    #[test]
    fn test_parse_partial() {
        let config = StorageConfig::parse(
            r#"
            node_id = "s1"
            base_dir = "/tmp/walb"
            proxies = ["10.0.0.1:10100", "10.0.0.2:10100"]

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.node_id, "s1");
        assert_eq!(config.proxies.len(), 2);
        assert_eq!(config.logging.format, LogFormat::Json);
        // Unspecified fields keep their defaults.
        assert_eq!(config.delay_sec_for_retry, 20);
    }

    #[test]
    fn test_parse_bad_toml() {
        assert!(StorageConfig::parse("node_id = [").is_err());
    }
}
