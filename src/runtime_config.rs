// =============================================================================
// Runtime Configuration — relay settings loaded from JSON plus env overrides
// =============================================================================
//
// Every field carries `#[serde(default)]` so a partial (or missing) config
// file still yields a usable configuration.  Credentials and endpoints can be
// overridden from the environment, which is how hosted deployments supply
// them.
//
// =============================================================================

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::IngestError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "R_150_1S".to_string()
}

fn default_max_ticks() -> usize {
    950
}

fn default_feed_url() -> String {
    "wss://ws.derivws.com/websockets/v3".to_string()
}

fn default_app_id() -> String {
    "1089".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    3
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_store_timeout_secs() -> u64 {
    5
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_candle_intervals() -> Vec<CandleIntervalConfig> {
    vec![
        CandleIntervalConfig {
            interval_secs: 60,
            retain: 100,
        },
        CandleIntervalConfig {
            interval_secs: 300,
            retain: 50,
        },
    ]
}

// =============================================================================
// CandleIntervalConfig
// =============================================================================

/// One candle series to derive and publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleIntervalConfig {
    /// Bucket length in seconds.
    pub interval_secs: i64,
    /// Number of most recent candles written to the store.
    pub retain: usize,
}

impl CandleIntervalConfig {
    /// Store collection name, e.g. `candles_60`.
    pub fn collection(&self) -> String {
        format!("candles_{}", self.interval_secs)
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Instrument & window -------------------------------------------------

    /// Instrument the feed subscription is opened for.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Tick window capacity.
    #[serde(default = "default_max_ticks")]
    pub max_ticks: usize,

    /// Ticks written to the store per publish. `None` publishes the whole
    /// window.
    #[serde(default)]
    pub publish_ticks: Option<usize>,

    /// Candle series derived on every publish.
    #[serde(default = "default_candle_intervals")]
    pub candle_intervals: Vec<CandleIntervalConfig>,

    // --- Feed -----------------------------------------------------------------

    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Deriv application id appended to the feed URL.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Fixed delay between reconnect attempts.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Upper bound on connect + subscribe for one session.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// A session that delivers no frame for this long is treated as dropped.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    // --- Store ----------------------------------------------------------------

    /// Firebase Realtime Database root URL. Empty keeps publishes in memory.
    #[serde(default)]
    pub store_url: String,

    /// Optional database secret or ID token passed as `?auth=`.
    /// Never serialised back to disk.
    #[serde(default, skip_serializing)]
    pub store_auth_token: Option<String>,

    /// Upper bound on a single store request.
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,

    // --- Status API -----------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            max_ticks: default_max_ticks(),
            publish_ticks: None,
            candle_intervals: default_candle_intervals(),
            feed_url: default_feed_url(),
            app_id: default_app_id(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            store_url: String::new(),
            store_auth_token: None,
            store_timeout_secs: default_store_timeout_secs(),
            bind_addr: default_bind_addr(),
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
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            max_ticks = config.max_ticks,
            "config loaded"
        );

        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// Takes the lookup as a closure so tests don't touch process env.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(symbol) = non_empty("TICK_RELAY_SYMBOL") {
            self.symbol = symbol;
        }
        if let Some(url) = non_empty("FIREBASE_URL") {
            self.store_url = url;
        }
        if let Some(token) = non_empty("FIREBASE_AUTH_TOKEN") {
            self.store_auth_token = Some(token);
        }
        if let Some(app_id) = non_empty("DERIV_APP_ID") {
            self.app_id = app_id;
        }
        if let Some(addr) = non_empty("TICK_RELAY_BIND_ADDR") {
            self.bind_addr = addr;
        }
    }

    /// Reject settings the ingestion core cannot run with.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.symbol.trim().is_empty() {
            return Err(IngestError::Config("symbol must not be empty".into()));
        }
        if self.max_ticks == 0 {
            return Err(IngestError::Config("max_ticks must be at least 1".into()));
        }
        if self.publish_ticks == Some(0) {
            return Err(IngestError::Config("publish_ticks must be at least 1".into()));
        }
        if self.connect_timeout_secs == 0 || self.idle_timeout_secs == 0 {
            return Err(IngestError::Config("feed timeouts must be at least 1s".into()));
        }
        let mut seen = HashSet::new();
        for iv in &self.candle_intervals {
            if iv.interval_secs <= 0 {
                return Err(IngestError::Config(format!(
                    "candle interval must be positive, got {}",
                    iv.interval_secs
                )));
            }
            if !seen.insert(iv.interval_secs) {
                return Err(IngestError::Config(format!(
                    "duplicate candle interval {}",
                    iv.interval_secs
                )));
            }
        }
        Ok(())
    }

    /// Number of ticks written per publish.
    pub fn publish_window(&self) -> usize {
        self.publish_ticks.unwrap_or(self.max_ticks).min(self.max_ticks)
    }

    /// Full feed URL including the application id.
    pub fn feed_endpoint(&self) -> String {
        format!("{}?app_id={}", self.feed_url, self.app_id)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbol, "R_150_1S");
        assert_eq!(cfg.max_ticks, 950);
        assert_eq!(cfg.reconnect_delay_secs, 3);
        assert_eq!(cfg.store_timeout_secs, 5);
        assert_eq!(cfg.connect_timeout_secs, 10);
        assert_eq!(cfg.idle_timeout_secs, 30);
        assert!(cfg.store_url.is_empty());
        assert_eq!(cfg.publish_window(), 950);
        assert_eq!(cfg.candle_intervals.len(), 2);
        assert_eq!(cfg.candle_intervals[0].collection(), "candles_60");
        assert_eq!(cfg.candle_intervals[1].retain, 50);
        assert_eq!(
            cfg.feed_endpoint(),
            "wss://ws.derivws.com/websockets/v3?app_id=1089"
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "R_150_1S");
        assert_eq!(cfg.max_ticks, 950);
        assert_eq!(cfg.candle_intervals, default_candle_intervals());
        assert!(cfg.store_url.is_empty());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "R_100", "publish_ticks": 200,
                        "candle_intervals": [{ "interval_secs": 900, "retain": 10 }] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "R_100");
        assert_eq!(cfg.publish_window(), 200);
        assert_eq!(cfg.candle_intervals.len(), 1);
        assert_eq!(cfg.candle_intervals[0].collection(), "candles_900");
        assert_eq!(cfg.max_ticks, 950);
    }

    #[test]
    fn auth_token_is_not_serialised() {
        let mut cfg = RuntimeConfig::default();
        cfg.store_auth_token = Some("secret".into());
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("TICK_RELAY_SYMBOL", "R_75"),
            ("FIREBASE_URL", "https://example.firebaseio.com"),
            ("FIREBASE_AUTH_TOKEN", "tok"),
            ("DERIV_APP_ID", "  "),
        ]
        .into_iter()
        .collect();

        let mut cfg = RuntimeConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.symbol, "R_75");
        assert_eq!(cfg.store_url, "https://example.firebaseio.com");
        assert_eq!(cfg.store_auth_token.as_deref(), Some("tok"));
        // Blank values are ignored.
        assert_eq!(cfg.app_id, "1089");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = RuntimeConfig::default();
        cfg.max_ticks = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.candle_intervals.push(CandleIntervalConfig {
            interval_secs: 60,
            retain: 5,
        });
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.candle_intervals[0].interval_secs = 0;
        assert!(matches!(cfg.validate(), Err(IngestError::Config(_))));

        let mut cfg = RuntimeConfig::default();
        cfg.idle_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn publish_window_never_exceeds_capacity() {
        let mut cfg = RuntimeConfig::default();
        cfg.publish_ticks = Some(5000);
        assert_eq!(cfg.publish_window(), 950);
    }
}
