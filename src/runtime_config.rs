// =============================================================================
// Runtime Configuration - feed, default selection, storage, reconnect
// =============================================================================
//
// Loaded from a JSON file at start-up; every field carries a serde default so
// a missing or partial file still yields a usable config. Environment
// variables (optionally from `.env`) override the file.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::market_data::ReconnectPolicy;
use crate::types::{Resolution, SeriesKey};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_feed_base_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_symbol() -> String {
    "ethusdt".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("series")
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_max_recent_errors() -> usize {
    50
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    // --- Feed ----------------------------------------------------------------

    /// Base WebSocket address; the stream name is appended as a path segment.
    #[serde(default = "default_feed_base_url")]
    pub feed_base_url: String,

    // --- Initial selection ----------------------------------------------------

    /// Instrument subscribed at start-up.
    #[serde(default = "default_symbol")]
    pub default_symbol: String,

    /// Resolution subscribed at start-up.
    #[serde(default)]
    pub default_interval: Resolution,

    // --- Storage ---------------------------------------------------------------

    /// Directory holding one JSON record per series key.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Keep series in memory only; nothing is written to `data_dir`.
    #[serde(default)]
    pub ephemeral: bool,

    // --- Reconnect -------------------------------------------------------------

    #[serde(default = "default_true")]
    pub reconnect_enabled: bool,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    // --- Diagnostics -----------------------------------------------------------

    /// Size of the in-memory error log.
    #[serde(default = "default_max_recent_errors")]
    pub max_recent_errors: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            feed_base_url: default_feed_base_url(),
            default_symbol: default_symbol(),
            default_interval: Resolution::default(),
            data_dir: default_data_dir(),
            ephemeral: false,
            reconnect_enabled: true,
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_recent_errors: default_max_recent_errors(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.default_symbol,
            interval = %config.default_interval,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply `KLINE_*` overrides from the given lookup (normally
    /// `std::env::var`). Invalid values are logged and ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("KLINE_FEED_URL") {
            self.feed_base_url = url;
        }
        if let Some(symbol) = lookup("KLINE_SYMBOL") {
            self.default_symbol = symbol;
        }
        if let Some(interval) = lookup("KLINE_INTERVAL") {
            match interval.parse() {
                Ok(resolution) => self.default_interval = resolution,
                Err(e) => warn!(error = %e, "ignoring KLINE_INTERVAL"),
            }
        }
        if let Some(dir) = lookup("KLINE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("KLINE_EPHEMERAL") {
            self.ephemeral = matches!(flag.trim(), "1" | "true" | "yes");
        }
    }

    /// The key subscribed at start-up. Falls back to `ethusdt@1m` when the
    /// configured symbol does not normalize.
    pub fn default_key(&self) -> SeriesKey {
        SeriesKey::new(&self.default_symbol, self.default_interval).unwrap_or_else(|e| {
            warn!(error = %e, "invalid default symbol, using ethusdt");
            SeriesKey::default().with_resolution(self.default_interval)
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        if !self.reconnect_enabled {
            return ReconnectPolicy::disabled();
        }
        ReconnectPolicy::new(
            true,
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
        )
    }
}
