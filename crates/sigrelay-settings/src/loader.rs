//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SignalSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `SIGRELAY_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::SignalSettings;

/// Resolve the default settings file path (`~/.sigrelay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".sigrelay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SignalSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SignalSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn read_settings_file(path: &Path) -> Result<SignalSettings> {
    let defaults = serde_json::to_value(SignalSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Reject combinations the server cannot run with.
pub fn validate(settings: &SignalSettings) -> Result<()> {
    let server = &settings.server;
    if server.heartbeat_interval_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "heartbeatIntervalSecs must be at least 1".into(),
        ));
    }
    if server.heartbeat_timeout_secs < server.heartbeat_interval_secs {
        return Err(SettingsError::InvalidValue(format!(
            "heartbeatTimeoutSecs ({}) is shorter than heartbeatIntervalSecs ({})",
            server.heartbeat_timeout_secs, server.heartbeat_interval_secs
        )));
    }
    if server.send_queue_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "sendQueueCapacity must be at least 1".into(),
        ));
    }
    if server.max_connections == 0 {
        return Err(SettingsError::InvalidValue(
            "maxConnections must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut SignalSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply `SIGRELAY_*` overrides resolved through `lookup`.
pub fn apply_overrides(settings: &mut SignalSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("SIGRELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("SIGRELAY_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("SIGRELAY_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.u64("SIGRELAY_HEARTBEAT_INTERVAL_SECS", 1, 3600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.u64("SIGRELAY_HEARTBEAT_TIMEOUT_SECS", 1, 86_400) {
        settings.server.heartbeat_timeout_secs = v;
    }
    if let Some(v) = env.usize("SIGRELAY_MAX_MESSAGE_SIZE", 1024, 64 * 1024 * 1024) {
        settings.server.max_message_size = v;
    }
    if let Some(v) = env.usize("SIGRELAY_SEND_QUEUE_CAPACITY", 1, 65_536) {
        settings.server.send_queue_capacity = v;
    }
    if let Some(v) = env.u64("SIGRELAY_MAX_DROPPED_MESSAGES", 1, 1_000_000) {
        settings.server.max_dropped_messages = v;
    }
    if let Some(v) = env.enumeration("SIGRELAY_MALFORMED_POLICY") {
        settings.server.malformed_policy = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.enumeration("SIGRELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.enumeration("SIGRELAY_LOG_FORMAT") {
        settings.logging.format = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a lowercase enum name through its serde representation.
pub fn parse_enum<T: DeserializeOwned>(val: &str) -> Option<T> {
    serde_json::from_value(Value::String(val.to_lowercase())).ok()
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }

    fn enumeration<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse_enum(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "unrecognized env var value, ignoring");
        }
        result
    }
}
