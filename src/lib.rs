//! Gap-aware technical indicator collector.
//!
//! - price series sources and the indicator engine
//! - gap detection, backfill planning and health scoring
//! - an idempotent sqlite record store
//! - the collector, its scheduler and read-only status routes

mod backfill;
mod collector;
mod config;
mod gap;
mod health;
mod indicators;
mod observability;
mod price;
mod scheduler;
mod server;
mod store;

pub use backfill::{plan_backfill, plan_backfill_days, BackfillDecision, BackfillPlan};
pub use collector::{
    CollectorError, CollectorState, GapAwareCollector, IndicatorComputation, RunMode, RunStats,
    StatusReader, StatusReport,
};
pub use config::{
    app_paths_from_env, collector_config_from_env, AppPaths, CollectorConfig, ConfigError,
};
pub use gap::{detect_gap, scan_series_gaps, Gap, SeriesCoverage, MS_PER_HOUR};
pub use health::{error_penalty, gap_penalty, health_score, HealthLabel};
pub use indicators::{
    atr, bollinger, ema, ema_series, rsi, rsi_series, sma, stochastic_k, volatility,
    ComputeCancelled, IndicatorEngine, IndicatorRecord, IndicatorValues, SignalMode,
};
pub use observability::{
    init_logging, log_app_bind, log_app_config, log_app_start, log_app_stop, log_run_summary,
    log_startup_action, logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
    UnknownLogFormat,
};
pub use price::{
    load_csv_points, CsvPointSource, InMemoryPointSource, PointSource, PricePoint, SeriesPoint,
    SourceError,
};
pub use scheduler::{
    Clock, ManualClock, Scheduler, SchedulerError, SchedulerPhase, StartupAction, SystemClock,
};
pub use server::{status_router, CollectorStatusSource, StatusSource};
pub use store::{RecordStore, SqliteIndicatorStore, StoreError, UpsertOutcome};

/// The collector this crate ships: technical indicators over price points,
/// persisted to sqlite.
pub type IndicatorCollector<S> = GapAwareCollector<IndicatorEngine, S, SqliteIndicatorStore>;
