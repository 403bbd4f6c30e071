//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` for the JSON file
//! format and `#[serde(default)]`, so a partial file only overrides the keys
//! it names.

use serde::{Deserialize, Serialize};

/// Root settings type for the signaling relay.
///
/// ```json
/// {
///   "server": { "port": 4000, "heartbeatIntervalSecs": 15 },
///   "logging": { "level": "debug", "format": "json" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalSettings {
    /// Listener and session settings.
    pub server: ServerSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

/// What a session does with an inbound message it cannot parse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Close the session and unregister the peer.
    #[default]
    Close,
    /// Drop the message and keep reading.
    Ignore,
}

/// Listener and per-session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent WebSocket sessions.
    pub max_connections: usize,
    /// Interval between transport-level pings, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Silence after which a peer is considered dead, in seconds.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
    /// Capacity of each peer's outbound queue.
    pub send_queue_capacity: usize,
    /// Dropped messages tolerated before a slow peer is evicted.
    pub max_dropped_messages: u64,
    /// Handling of unparseable inbound messages.
    pub malformed_policy: MalformedPolicy,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            max_connections: 10_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024,
            send_queue_capacity: 256,
            max_dropped_messages: 64,
            malformed_policy: MalformedPolicy::Close,
        }
    }
}

/// Log verbosity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level (most verbose).
    Trace,
    /// Debug-level.
    Debug,
    /// Info-level (default).
    #[default]
    Info,
    /// Warning-level.
    Warn,
    /// Error-level.
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Log line format written to stderr.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let s = ServerSettings::default();
        assert_eq!(s.host, "0.0.0.0");
        assert_eq!(s.port, 4000);
        assert_eq!(s.heartbeat_interval_secs, 30);
        assert_eq!(s.heartbeat_timeout_secs, 90);
        assert_eq!(s.send_queue_capacity, 256);
        assert_eq!(s.malformed_policy, MalformedPolicy::Close);
    }

    #[test]
    fn server_serde_camel_case() {
        let json = serde_json::to_value(ServerSettings::default()).unwrap();
        assert!(json.get("maxConnections").is_some());
        assert!(json.get("heartbeatIntervalSecs").is_some());
        assert!(json.get("sendQueueCapacity").is_some());
        assert_eq!(json["malformedPolicy"], "close");
    }

    #[test]
    fn partial_server_json_keeps_defaults() {
        let s: ServerSettings = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(s.port, 9000);
        assert_eq!(s.host, "0.0.0.0");
        assert_eq!(s.max_dropped_messages, 64);
    }

    #[test]
    fn malformed_policy_parses_lowercase() {
        let p: MalformedPolicy = serde_json::from_str(r#""ignore""#).unwrap();
        assert_eq!(p, MalformedPolicy::Ignore);
        assert!(serde_json::from_str::<MalformedPolicy>(r#""Drop""#).is_err());
    }

    #[test]
    fn log_level_filter_strings() {
        assert_eq!(LogLevel::Trace.as_filter_str(), "trace");
        assert_eq!(LogLevel::Info.as_filter_str(), "info");
        assert_eq!(LogLevel::Error.as_filter_str(), "error");
    }

    #[test]
    fn logging_defaults() {
        let l = LoggingSettings::default();
        assert_eq!(l.level, LogLevel::Info);
        assert_eq!(l.format, LogFormat::Pretty);
    }
}
