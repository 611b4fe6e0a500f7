//! # Server configuration.
//!
//! Provides [`ServerConfig`], the settings shared by the master and every
//! worker process it spawns.
//!
//! Config can be built in code (`ServerConfig::default()` plus field updates)
//! or loaded from TOML, with durations written in humantime form:
//!
//! ```toml
//! name = "billing"
//! restart_delay = "1s"
//! stop_timeout = "10s"
//! blocked_threshold = "5s"
//! ```
//!
//! ## Sentinel values
//! - `socket_path = None` → `<temp dir>/<name>.sock`
//! - `stop_timeout = 0s` → no graceful wait, survivors are killed at once
//! - `blocked_persistence = 0s` → a heartbeat clears `blocked` immediately

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Settings of one supervised server.
///
/// ## Field semantics
/// - `name`: server identity; names the socket file and appears in status output
/// - `restart_delay`: wait between a worker exit and its replacement
/// - `stop_timeout`: graceful stop window before survivors are killed
/// - `heartbeat_interval`: period of worker heartbeats
/// - `monitor_interval`: period of the master's liveness scan
/// - `blocked_threshold`: heartbeat age that marks a process blocked
/// - `blocked_persistence`: minimum time a process stays marked blocked
/// - `max_frame_len`: largest bus frame accepted, in bytes
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server identity.
    pub name: String,

    /// Explicit bus socket path (derived from `name` when `None`).
    pub socket_path: Option<PathBuf>,

    /// Delay before a replacement is spawned for an exited worker.
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,

    /// Maximum time `stop()` waits before force-killing survivors.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Heartbeat period of worker processes.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Period of the supervisor's liveness scan.
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Heartbeat age after which a process is reported blocked.
    #[serde(with = "humantime_serde")]
    pub blocked_threshold: Duration,

    /// How long a blocked mark stays visible regardless of later heartbeats.
    #[serde(with = "humantime_serde")]
    pub blocked_persistence: Duration,

    /// Largest accepted bus frame in bytes.
    pub max_frame_len: usize,
}

impl ServerConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }

    /// Socket path of the bus.
    pub fn socket_path(&self) -> PathBuf {
        match &self.socket_path {
            Some(path) => path.clone(),
            None => std::env::temp_dir().join(format!("{}.sock", self.name)),
        }
    }

    /// Restart delay, never below one millisecond.
    #[inline]
    pub fn restart_delay(&self) -> Duration {
        self.restart_delay.max(Duration::from_millis(1))
    }

    /// Heartbeat period, never zero.
    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.max(Duration::from_millis(10))
    }

    /// Monitor period, never zero.
    #[inline]
    pub fn monitor_interval(&self) -> Duration {
        self.monitor_interval.max(Duration::from_millis(10))
    }

    /// Blocked persistence window as an `Option`.
    ///
    /// - `None` → heartbeats clear `blocked` immediately
    /// - `Some(d)` → `blocked` stays set for at least `d`
    #[inline]
    pub fn blocked_window(&self) -> Option<Duration> {
        if self.blocked_persistence.is_zero() {
            None
        } else {
            Some(self.blocked_persistence)
        }
    }
}

impl Default for ServerConfig {
    /// Default configuration:
    ///
    /// - `name = "procvisor"`, socket derived from the name
    /// - `restart_delay = 1s`, `stop_timeout = 10s`
    /// - `heartbeat_interval = 1s`, `monitor_interval = 1s`
    /// - `blocked_threshold = 5s`, `blocked_persistence = 10s`
    /// - `max_frame_len = 16 MiB`
    fn default() -> Self {
        Self {
            name: "procvisor".to_string(),
            socket_path: None,
            restart_delay: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(1),
            blocked_threshold: Duration::from_secs(5),
            blocked_persistence: Duration::from_secs(10),
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_only_given_keys() {
        let cfg = ServerConfig::from_toml_str(
            r#"
            name = "billing"
            restart_delay = "250ms"
            stop_timeout = "3s"
            blocked_persistence = "0s"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.name, "billing");
        assert_eq!(cfg.restart_delay, Duration::from_millis(250));
        assert_eq!(cfg.stop_timeout, Duration::from_secs(3));
        assert_eq!(cfg.blocked_window(), None);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(cfg.max_frame_len, 16 * 1024 * 1024);
    }

    #[test]
    fn socket_path_is_derived_from_the_name() {
        let mut cfg = ServerConfig::default();
        cfg.name = "orders".into();
        assert_eq!(cfg.socket_path(), std::env::temp_dir().join("orders.sock"));

        cfg.socket_path = Some(PathBuf::from("/run/orders/bus.sock"));
        assert_eq!(cfg.socket_path(), PathBuf::from("/run/orders/bus.sock"));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(ServerConfig::from_toml_str("stop_timeout = \"soon\"").is_err());
    }
}
