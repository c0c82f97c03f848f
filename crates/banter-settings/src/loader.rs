//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BanterSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `BANTER_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::BanterSettings;

/// Resolve the settings file path: `$BANTER_SETTINGS_PATH` if set, else
/// `~/.banter/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Ok(path) = std::env::var("BANTER_SETTINGS_PATH") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".banter").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BanterSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<BanterSettings> {
    let defaults = serde_json::to_value(BanterSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: BanterSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Apply environment variable overrides to loaded settings.
///
/// Strict parsing: integers must be in range, booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`; invalid values are
/// ignored with a warning.
pub fn apply_env_overrides(settings: &mut BanterSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("BANTER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("BANTER_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_usize("BANTER_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = read_env_u64("BANTER_HEARTBEAT_INTERVAL_SECS", 1, 600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = read_env_u64("BANTER_HEARTBEAT_TIMEOUT_SECS", 1, 3600) {
        settings.server.heartbeat_timeout_secs = v;
    }
    if let Some(v) = read_env_usize("BANTER_OUTBOUND_QUEUE_DEPTH", 8, 65_536) {
        settings.server.outbound_queue_depth = v;
    }

    // ── Channels ────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("BANTER_WINDOW_SIZE", 1, 1_000_000) {
        settings.channels.window_size = v;
    }
    if let Some(v) = read_env_u64("BANTER_REORDER_TIMEOUT_MS", 10, 60_000) {
        settings.channels.reorder_timeout_ms = v;
    }

    // ── Presence ────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("BANTER_SESSION_TTL_SECS", 5, 86_400) {
        settings.presence.session_ttl_secs = v;
    }
    if let Some(v) = read_env_u64("BANTER_SWEEP_INTERVAL_SECS", 1, 3600) {
        settings.presence.sweep_interval_secs = v;
    }

    // ── Cluster ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("BANTER_INSTANCE_ID") {
        settings.cluster.instance_id = Some(v);
    }
    if let Some(v) = read_env_string("BANTER_BROKER_ADDR") {
        settings.cluster.broker_addr = Some(v);
    }
    if let Some(v) = read_env_bool("BANTER_EMBEDDED_BROKER") {
        settings.cluster.embedded_broker = v;
    }
    if let Some(v) = read_env_u64("BANTER_LEASE_TTL_MS", 500, 600_000) {
        settings.cluster.lease_ttl_ms = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = read_env_string("BANTER_JWT_SECRET") {
        settings.auth.jwt_secret = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("BANTER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("BANTER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

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

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use serde_json::json;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_simple_override() {
        let target = json!({"a": 1, "b": 2});
        let source = json!({"b": 3});
        assert_eq!(deep_merge(target, source), json!({"a": 1, "b": 3}));
    }

    #[test]
    fn merge_nested_objects() {
        let target = json!({"server": {"host": "127.0.0.1", "port": 9870}});
        let source = json!({"server": {"port": 8000}});
        assert_eq!(
            deep_merge(target, source),
            json!({"server": {"host": "127.0.0.1", "port": 8000}})
        );
    }

    #[test]
    fn merge_skips_nulls() {
        let target = json!({"a": 1});
        let source = json!({"a": null, "b": 2});
        assert_eq!(deep_merge(target, source), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_replaces_arrays_entirely() {
        let target = json!({"roles": ["a", "b"]});
        let source = json!({"roles": ["c"]});
        assert_eq!(deep_merge(target, source), json!({"roles": ["c"]}));
    }

    #[test]
    fn merge_adds_new_keys() {
        let target = json!({});
        let source = json!({"cluster": {"brokerAddr": "localhost:9871"}});
        assert_eq!(
            deep_merge(target, source),
            json!({"cluster": {"brokerAddr": "localhost:9871"}})
        );
    }

    // ── parsing helpers ─────────────────────────────────────────────

    #[test]
    fn parse_bool_accepted_forms() {
        for v in ["true", "1", "yes", "on", "TRUE", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "off", "False"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn parse_u16_respects_range() {
        assert_eq!(parse_u16_range("9870", 1, 65535), Some(9870));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("junk", 1, 65535), None);
    }

    #[test]
    fn parse_u64_respects_range() {
        assert_eq!(parse_u64_range("500", 10, 60_000), Some(500));
        assert_eq!(parse_u64_range("5", 10, 60_000), None);
        assert_eq!(parse_u64_range("100000", 10, 60_000), None);
    }

    #[test]
    fn parse_usize_respects_range() {
        assert_eq!(parse_usize_range("512", 1, 1_000_000), Some(512));
        assert_eq!(parse_usize_range("-1", 1, 1_000_000), None);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.server.port, 9870);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"channels": {"windowSize": 50}, "cluster": {"brokerAddr": "10.0.0.5:9871"}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.channels.window_size, 50);
        assert_eq!(settings.channels.reorder_timeout_ms, 500);
        assert_eq!(settings.cluster.broker_addr.as_deref(), Some("10.0.0.5:9871"));
        assert_eq!(settings.server.port, 9870);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"futureSection": {"x": 1}, "server": {"port": 9999}}"#).unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.port, 9999);
    }
}
