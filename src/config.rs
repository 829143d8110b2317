// =============================================================================
// Scanner configuration — JSON file with per-field defaults
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_port() -> u16 {
    6045
}

fn default_cache_name() -> String {
    "binance-cache".to_string()
}

fn default_cache_ttl_secs() -> i64 {
    3600 * 2
}

fn default_ticker_restore_secs() -> i64 {
    3600
}

fn default_trade_restore_secs() -> i64 {
    3600 * 2
}

// =============================================================================
// Config
// =============================================================================

/// Top-level configuration for the scanner process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP port the HTTP/WebSocket server binds to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Logical name of the disk cache; the backing file is `./{name}.sqlite`.
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    /// How long raw frames are kept in the disk cache.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: i64,

    /// How far back ticker frames are replayed at startup.
    #[serde(default = "default_ticker_restore_secs")]
    pub ticker_restore_secs: i64,

    /// How far back trade frames are replayed at startup.
    #[serde(default = "default_trade_restore_secs")]
    pub trade_restore_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            cache_name: default_cache_name(),
            cache_ttl_secs: default_cache_ttl_secs(),
            ticker_restore_secs: default_ticker_restore_secs(),
            trade_restore_secs: default_trade_restore_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), port = config.port, "config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        Ok(())
    }

    /// Apply environment overrides (`SCANNER_PORT`, `SCANNER_CACHE_NAME`).
    pub fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("SCANNER_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(name) = std::env::var("SCANNER_CACHE_NAME") {
            if !name.is_empty() {
                self.cache_name = name;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 6045);
        assert_eq!(cfg.cache_name, "binance-cache");
        assert_eq!(cfg.cache_ttl_secs, 7200);
        assert_eq!(cfg.ticker_restore_secs, 3600);
        assert_eq!(cfg.trade_restore_secs, 7200);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.port, 6045);
        assert_eq!(cfg.cache_ttl_secs, 7200);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "port": 8080 }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.cache_name, "binance-cache");
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.port, cfg2.port);
        assert_eq!(cfg.cache_name, cfg2.cache_name);
    }
}
