//! Subscriber setup from `GAPWATCH_LOG_*` and the lifecycle events shared by
//! both binaries and the scheduler.

use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::collector::RunStats;
use crate::config::{env_flag, env_parse, env_text, AppPaths, CollectorConfig};
use crate::scheduler::StartupAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers.
    Json,
    Pretty,
    /// Single-line human output.
    Compact,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
            LogFormat::Compact => "compact",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown log format {0:?}")]
pub struct UnknownLogFormat(String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(UnknownLogFormat(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info,gapwatch=debug`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    /// `None` colours the human formats and leaves JSON plain.
    pub ansi: Option<bool>,
}

impl LoggingConfig {
    pub fn use_ansi(&self) -> bool {
        self.ansi.unwrap_or(self.format != LogFormat::Json)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
            ansi: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Unset, blank or unparsable variables keep their defaults.
pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = env_text("GAPWATCH_LOG_LEVEL") {
        config.level = level;
    }
    if let Some(format) = env_parse::<LogFormat>("GAPWATCH_LOG_FORMAT") {
        config.format = format;
    }
    if let Some(include_target) = env_flag("GAPWATCH_LOG_TARGET") {
        config.include_target = include_target;
    }
    config.ansi = env_flag("GAPWATCH_LOG_ANSI");

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(config.use_ansi());

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
        LogFormat::Compact => tracing::subscriber::set_global_default(builder.compact().finish())?,
    }

    Ok(())
}

pub fn log_app_start(app: &str, config: &LoggingConfig) {
    info!(
        component = app,
        event = "app.start",
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        log_format = config.format.as_str(),
        include_target = config.include_target,
        ansi = config.use_ansi()
    );
}

pub fn log_app_config(app: &str, collector: &CollectorConfig, paths: &AppPaths) {
    info!(
        component = app,
        event = "app.config",
        cadence_hours = collector.cadence_hours,
        max_backfill_days = collector.max_backfill_days,
        min_window = collector.min_window,
        batch_cap = collector.batch_cap,
        history_limit = collector.history_limit,
        tick_interval_ms = collector.tick_interval_ms,
        signal_mode = collector.signal_mode.as_str(),
        store_path = %paths.store_path.display(),
        csv_path = %paths.csv_path.display()
    );
}

pub fn log_app_bind(app: &str, bound_addr: SocketAddr) {
    info!(
        component = app,
        event = "app.bind",
        bind_addr = %bound_addr,
        routes = "/status,/health"
    );
}

/// What the startup gap check decided and how much it wrote.
pub fn log_startup_action(component: &str, action: &StartupAction) {
    match action {
        StartupAction::FirstCollection(stats) => info!(
            component,
            event = "startup.first_collection",
            symbols_attempted = stats.symbols_attempted,
            records_written = stats.records_written
        ),
        StartupAction::Backfilled { plan, stats } => info!(
            component,
            event = "startup.backfilled",
            days = plan.days,
            start_ts_ms_utc = plan.start_ts_ms_utc,
            end_ts_ms_utc = plan.end_ts_ms_utc,
            symbols_attempted = stats.symbols_attempted,
            symbols_failed = stats.symbols_failed,
            records_written = stats.records_written,
            cancelled = stats.cancelled
        ),
        StartupAction::UpToDate { gap } => info!(
            component,
            event = "startup.up_to_date",
            gap_hours = ?gap.hours()
        ),
    }
}

/// One-line outcome of a one-shot run. Warns when nothing succeeded or the
/// run stopped early.
pub fn log_run_summary(app: &str, stats: &RunStats) {
    if stats.all_failed() || stats.cancelled {
        warn!(
            component = app,
            event = "app.run_summary",
            mode = ?stats.mode,
            symbols_attempted = stats.symbols_attempted,
            symbols_failed = stats.symbols_failed,
            records_written = stats.records_written,
            cancelled = stats.cancelled
        );
        return;
    }
    info!(
        component = app,
        event = "app.run_summary",
        mode = ?stats.mode,
        symbols_attempted = stats.symbols_attempted,
        symbols_succeeded = stats.symbols_succeeded,
        symbols_caught_up = stats.symbols_caught_up,
        records_written = stats.records_written,
        digest = %stats.digest
    );
}

pub fn log_app_stop(app: &str, reason: &str) {
    info!(component = app, event = "app.stop", reason);
}
