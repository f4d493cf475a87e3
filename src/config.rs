//! Collector configuration and `GAPWATCH_*` environment loading.

use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gap::MS_PER_HOUR;
use crate::indicators::SignalMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Expected spacing between points of one series.
    pub cadence_hours: f64,
    /// Hard cap on any backfill scope.
    pub max_backfill_days: u32,
    /// Points required before full recompute emits a record.
    pub min_window: usize,
    /// Symbols handled per tick; the rest wait for later ticks.
    pub batch_cap: usize,
    /// Trailing points fetched for a latest-only computation.
    pub history_limit: usize,
    pub tick_interval_ms: u64,
    pub signal_mode: SignalMode,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            cadence_hours: 1.0,
            max_backfill_days: 30,
            min_window: 20,
            batch_cap: 50,
            history_limit: 200,
            tick_interval_ms: 300_000,
            signal_mode: SignalMode::Approximate,
        }
    }
}

impl CollectorConfig {
    pub fn cadence_ms(&self) -> i64 {
        (self.cadence_hours * MS_PER_HOUR as f64).round() as i64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cadence_hours.is_finite() || self.cadence_hours <= 0.0 {
            return Err(ConfigError::Invalid(
                "cadence_hours must be a positive number".to_string(),
            ));
        }
        if self.max_backfill_days == 0 {
            return Err(ConfigError::Invalid(
                "max_backfill_days must be >= 1".to_string(),
            ));
        }
        if self.min_window == 0 {
            return Err(ConfigError::Invalid("min_window must be >= 1".to_string()));
        }
        if self.batch_cap == 0 {
            return Err(ConfigError::Invalid("batch_cap must be >= 1".to_string()));
        }
        if self.history_limit < self.min_window {
            return Err(ConfigError::Invalid(format!(
                "history_limit ({}) must be >= min_window ({})",
                self.history_limit, self.min_window
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "tick_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid collector config: {0}")]
    Invalid(String),
}

/// Where the binaries keep state and serve status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub store_path: PathBuf,
    pub csv_path: PathBuf,
    pub status_addr: SocketAddr,
}

impl Default for AppPaths {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("gapwatch.sqlite3"),
            csv_path: PathBuf::from("prices.csv"),
            status_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8090)),
        }
    }
}

pub fn app_paths_from_env() -> AppPaths {
    let mut paths = AppPaths::default();

    if let Some(path) = env_text("GAPWATCH_STORE_PATH") {
        paths.store_path = PathBuf::from(path);
    }
    if let Some(path) = env_text("GAPWATCH_CSV_PATH") {
        paths.csv_path = PathBuf::from(path);
    }
    if let Some(addr) = env_parse::<SocketAddr>("GAPWATCH_STATUS_ADDR") {
        paths.status_addr = addr;
    }

    paths
}

/// Unset, blank or unparsable variables keep their defaults.
pub fn collector_config_from_env() -> CollectorConfig {
    let mut config = CollectorConfig::default();

    if let Some(value) = env_parse::<f64>("GAPWATCH_CADENCE_HOURS") {
        config.cadence_hours = value;
    }
    if let Some(value) = env_parse::<u32>("GAPWATCH_MAX_BACKFILL_DAYS") {
        config.max_backfill_days = value;
    }
    if let Some(value) = env_parse::<usize>("GAPWATCH_MIN_WINDOW") {
        config.min_window = value;
    }
    if let Some(value) = env_parse::<usize>("GAPWATCH_BATCH_CAP") {
        config.batch_cap = value;
    }
    if let Some(value) = env_parse::<usize>("GAPWATCH_HISTORY_LIMIT") {
        config.history_limit = value;
    }
    if let Some(value) = env_parse::<u64>("GAPWATCH_TICK_INTERVAL_MS") {
        config.tick_interval_ms = value;
    }
    if let Ok(raw) = env::var("GAPWATCH_SIGNAL_MODE") {
        if let Some(mode) = SignalMode::parse(&raw) {
            config.signal_mode = mode;
        }
    }

    config
}

/// Trimmed value of `key`; blank counts as unset.
pub(crate) fn env_text(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_text(key)?.parse().ok()
}

pub(crate) fn env_flag(key: &str) -> Option<bool> {
    match env_text(key)?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
