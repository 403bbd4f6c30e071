//! # sigrelay-settings
//!
//! Layered configuration for the signaling relay.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SignalSettings::default()`]
//! 2. **Settings file**: `~/.sigrelay/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `SIGRELAY_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
