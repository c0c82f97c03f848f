//! # banter-settings
//!
//! Layered configuration for the Banter realtime layer.
//!
//! Loading flow: compiled defaults → deep-merged `~/.banter/settings.json`
//! (or `$BANTER_SETTINGS_PATH`) → `BANTER_*` environment overrides with
//! range validation. All field names are camelCase to match the operator
//! tooling; partial files are fine — missing fields keep their defaults.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{
    AuthSettings, BanterSettings, ChannelSettings, ClusterSettings, LoggingSettings,
    PresenceSettings, RetrySettings, ServerSettings, StaticTokenEntry,
};
