//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sigrelay_settings::{MalformedPolicy, ServerSettings};

/// Configuration for the signaling server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket sessions.
    pub max_connections: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat timeout in seconds (close after this much silence).
    pub heartbeat_timeout_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound queue capacity per peer.
    pub send_queue_capacity: usize,
    /// Dropped messages tolerated before a slow peer is evicted.
    pub max_dropped_messages: u64,
    /// What to do with an unparseable inbound message.
    pub malformed_policy: MalformedPolicy,
}

impl ServerConfig {
    /// Heartbeat interval as a `Duration`, never shorter than one second.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Heartbeat timeout as a `Duration`, never shorter than the interval.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs).max(self.heartbeat_interval())
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_connections: s.max_connections,
            heartbeat_interval_secs: s.heartbeat_interval_secs,
            heartbeat_timeout_secs: s.heartbeat_timeout_secs,
            max_message_size: s.max_message_size,
            send_queue_capacity: s.send_queue_capacity,
            max_dropped_messages: s.max_dropped_messages,
            malformed_policy: s.malformed_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_settings_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.send_queue_capacity, 256);
        assert_eq!(cfg.malformed_policy, MalformedPolicy::Close);
    }

    #[test]
    fn durations() {
        let cfg = ServerConfig {
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn zero_heartbeat_clamped() {
        let cfg = ServerConfig {
            heartbeat_interval_secs: 0,
            heartbeat_timeout_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(1));

        let cfg = ServerConfig {
            heartbeat_interval_secs: 20,
            heartbeat_timeout_secs: 5,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let cfg = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn from_settings_copies_every_field() {
        let settings = ServerSettings {
            host: "10.0.0.1".into(),
            port: 3000,
            max_connections: 5,
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
            max_message_size: 512,
            send_queue_capacity: 8,
            max_dropped_messages: 2,
            malformed_policy: MalformedPolicy::Ignore,
        };
        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.host, "10.0.0.1");
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.max_connections, 5);
        assert_eq!(cfg.max_message_size, 512);
        assert_eq!(cfg.send_queue_capacity, 8);
        assert_eq!(cfg.max_dropped_messages, 2);
        assert_eq!(cfg.malformed_policy, MalformedPolicy::Ignore);
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.malformed_policy, cfg.malformed_policy);
    }
}
