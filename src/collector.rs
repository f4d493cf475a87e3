//! Generic gap-aware collector: one implementation of collection, backfill and
//! status, specialized per data domain through [`IndicatorComputation`].

use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backfill::{plan_backfill, BackfillDecision, BackfillPlan};
use crate::config::{CollectorConfig, ConfigError};
use crate::gap::{detect_gap, scan_series_gaps, Gap};
use crate::health::{health_score, HealthLabel};
use crate::indicators::{ComputeCancelled, IndicatorEngine, IndicatorRecord};
use crate::price::{PointSource, PricePoint, SeriesPoint, SourceError};
use crate::store::{RecordStore, StoreError};

/// The per-domain part of a collector: what a point is, what a derived record
/// is, and how records are computed from an ascending window.
pub trait IndicatorComputation: Send + Sync + 'static {
    type Point: SeriesPoint + Clone + Send + Sync;
    type Record: SeriesPoint + Send;

    fn name(&self) -> &'static str;

    fn latest(
        &self,
        symbol: &str,
        window: &[Self::Point],
        computed_at_ms_utc: i64,
    ) -> Option<Self::Record>;

    fn history(
        &self,
        symbol: &str,
        points: &[Self::Point],
        min_window: usize,
        computed_at_ms_utc: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Self::Record>, ComputeCancelled>;
}

impl IndicatorComputation for IndicatorEngine {
    type Point = PricePoint;
    type Record = IndicatorRecord;

    fn name(&self) -> &'static str {
        "technical_indicators"
    }

    fn latest(
        &self,
        symbol: &str,
        window: &[PricePoint],
        computed_at_ms_utc: i64,
    ) -> Option<IndicatorRecord> {
        self.compute_latest(symbol, window, computed_at_ms_utc)
    }

    fn history(
        &self,
        symbol: &str,
        points: &[PricePoint],
        min_window: usize,
        computed_at_ms_utc: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndicatorRecord>, ComputeCancelled> {
        self.compute_history(symbol, points, min_window, computed_at_ms_utc, cancel)
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("price source error: {0}")]
    Source(#[from] SourceError),
    #[error("indicator store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("backfill days must be within [1, {max}], got {requested}")]
    InvalidBackfillDays { requested: u32, max: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Collection,
    Backfill { days: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub mode: RunMode,
    pub started_at_ms_utc: i64,
    pub symbols_total: u64,
    pub symbols_attempted: u64,
    pub symbols_succeeded: u64,
    pub symbols_failed: u64,
    pub symbols_up_to_date: u64,
    pub symbols_insufficient: u64,
    /// Symbols whose latest-only pass found more than one cadence of missing
    /// records and recomputed the missed stretch instead.
    pub symbols_caught_up: u64,
    pub records_written: u64,
    pub internal_gaps: u64,
    pub cancelled: bool,
    /// Hash over every written row's digest, in processing order.
    pub digest: String,
}

impl RunStats {
    fn new(mode: RunMode, started_at_ms_utc: i64, symbols_total: usize) -> Self {
        Self {
            mode,
            started_at_ms_utc,
            symbols_total: symbols_total as u64,
            symbols_attempted: 0,
            symbols_succeeded: 0,
            symbols_failed: 0,
            symbols_up_to_date: 0,
            symbols_insufficient: 0,
            symbols_caught_up: 0,
            records_written: 0,
            internal_gaps: 0,
            cancelled: false,
            digest: String::new(),
        }
    }

    pub fn all_failed(&self) -> bool {
        self.symbols_attempted > 0 && self.symbols_failed == self.symbols_attempted
    }
}

/// Process-lifetime counters. Never durable: the store is the source of truth
/// for how far each series has progressed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorState {
    pub attempted: u64,
    pub failed: u64,
    pub passes: u64,
    pub last_run: Option<RunStats>,
    pub batch_cursor: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub generated_at_ms_utc: i64,
    pub gap: Gap,
    pub gap_hours: Option<f64>,
    /// Newest record of any symbol; `gap` tracks the stalest one.
    pub freshest_ts_ms_utc: Option<i64>,
    pub health_score: f64,
    pub health_label: HealthLabel,
    pub attempted: u64,
    pub failed: u64,
    pub last_run: Option<RunStats>,
}

/// Read-side handle; safe to query while a pass is running.
pub struct StatusReader<T> {
    store: Arc<T>,
    state: Arc<RwLock<CollectorState>>,
}

impl<T> Clone for StatusReader<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: RecordStore> StatusReader<T> {
    /// The reported gap belongs to the most lagging symbol, so one fresh
    /// series cannot hide a stale one.
    pub fn status(&self, now_ms_utc: i64) -> Result<StatusReport, CollectorError> {
        let gap = detect_gap(self.store.stalest_latest_ts()?, now_ms_utc);
        let freshest_ts_ms_utc = self.store.latest_ts_any()?;
        let state = self
            .state
            .read()
            .expect("collector state lock should not be poisoned")
            .clone();
        let score = health_score(&gap, state.attempted, state.failed);

        Ok(StatusReport {
            generated_at_ms_utc: now_ms_utc,
            gap,
            gap_hours: gap.hours(),
            freshest_ts_ms_utc,
            health_score: score,
            health_label: HealthLabel::from_score(score),
            attempted: state.attempted,
            failed: state.failed,
            last_run: state.last_run,
        })
    }
}

enum SymbolOutcome {
    Written { rows: u64, digest: String },
    CaughtUp { rows: u64, digest: String },
    UpToDate,
    Insufficient,
    Cancelled,
}

pub struct GapAwareCollector<C, S, T> {
    computation: C,
    source: Arc<S>,
    store: Arc<T>,
    cfg: CollectorConfig,
    state: Arc<RwLock<CollectorState>>,
    pass_guard: Mutex<()>,
}

impl<C, S, T> GapAwareCollector<C, S, T>
where
    C: IndicatorComputation,
    S: PointSource<Point = C::Point>,
    T: RecordStore<Record = C::Record>,
{
    pub fn new(
        computation: C,
        source: Arc<S>,
        store: Arc<T>,
        cfg: CollectorConfig,
    ) -> Result<Self, CollectorError> {
        cfg.validate()?;
        Ok(Self {
            computation,
            source,
            store,
            cfg,
            state: Arc::new(RwLock::new(CollectorState::default())),
            pass_guard: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<T> {
        &self.store
    }

    pub fn state(&self) -> CollectorState {
        self.state
            .read()
            .expect("collector state lock should not be poisoned")
            .clone()
    }

    pub fn status_reader(&self) -> StatusReader<T> {
        StatusReader {
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
        }
    }

    pub fn status(&self, now_ms_utc: i64) -> Result<StatusReport, CollectorError> {
        self.status_reader().status(now_ms_utc)
    }

    /// Gap of the most lagging persisted symbol, re-derived from the store on
    /// every call.
    pub fn overall_gap(&self, now_ms_utc: i64) -> Result<Gap, CollectorError> {
        Ok(detect_gap(self.store.stalest_latest_ts()?, now_ms_utc))
    }

    /// Latest-only pass over the next batch of at most `batch_cap` symbols.
    /// A symbol that fell more than one cadence behind its own feed gets a
    /// bounded recompute of the missed stretch instead of a single record.
    pub fn run_collection(
        &self,
        now_ms_utc: i64,
        cancel: &CancellationToken,
    ) -> Result<RunStats, CollectorError> {
        let _pass = self
            .pass_guard
            .lock()
            .expect("collector pass lock should not be poisoned");
        let symbols = self.source.symbols()?;
        let batch = self.next_batch(&symbols);
        let mut stats = RunStats::new(RunMode::Collection, now_ms_utc, symbols.len());

        info!(
            component = "collector",
            event = "collector.pass.start",
            computation = self.computation.name(),
            mode = "collection",
            symbols_total = symbols.len(),
            batch_size = batch.len()
        );

        self.run_symbols(&batch, &mut stats, cancel, |symbol| {
            self.collect_symbol(symbol, now_ms_utc, cancel)
        });
        self.finish_pass(stats)
    }

    /// Full recompute of the trailing `days` for every symbol.
    pub fn run_backfill(
        &self,
        days: u32,
        now_ms_utc: i64,
        cancel: &CancellationToken,
    ) -> Result<RunStats, CollectorError> {
        if days == 0 || days > self.cfg.max_backfill_days {
            return Err(CollectorError::InvalidBackfillDays {
                requested: days,
                max: self.cfg.max_backfill_days,
            });
        }

        let _pass = self
            .pass_guard
            .lock()
            .expect("collector pass lock should not be poisoned");
        let symbols = self.source.symbols()?;
        let plan = BackfillPlan::ending_at(days, now_ms_utc);
        let mut stats = RunStats::new(RunMode::Backfill { days }, now_ms_utc, symbols.len());

        info!(
            component = "collector",
            event = "collector.pass.start",
            computation = self.computation.name(),
            mode = "backfill",
            days,
            start_ts_ms_utc = plan.start_ts_ms_utc,
            end_ts_ms_utc = plan.end_ts_ms_utc,
            symbols_total = symbols.len()
        );

        self.run_symbols(&symbols, &mut stats, cancel, |symbol| {
            self.backfill_symbol(symbol, &plan, cancel)
        });
        self.finish_pass(stats)
    }

    fn run_symbols(
        &self,
        symbols: &[String],
        stats: &mut RunStats,
        cancel: &CancellationToken,
        mut work: impl FnMut(&str) -> Result<(SymbolOutcome, u64), CollectorError>,
    ) {
        let mut pass_hasher = Sha256::new();

        for symbol in symbols {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }

            stats.symbols_attempted += 1;
            match work(symbol) {
                Ok((outcome, internal_gaps)) => {
                    stats.internal_gaps += internal_gaps;
                    match outcome {
                        SymbolOutcome::Written { rows, digest } => {
                            stats.symbols_succeeded += 1;
                            stats.records_written += rows;
                            pass_hasher.update(digest.as_bytes());
                        }
                        SymbolOutcome::CaughtUp { rows, digest } => {
                            stats.symbols_succeeded += 1;
                            stats.symbols_caught_up += 1;
                            stats.records_written += rows;
                            pass_hasher.update(digest.as_bytes());
                        }
                        SymbolOutcome::UpToDate => stats.symbols_up_to_date += 1,
                        SymbolOutcome::Insufficient => stats.symbols_insufficient += 1,
                        SymbolOutcome::Cancelled => {
                            // Nothing was written for this symbol.
                            stats.symbols_attempted -= 1;
                            stats.cancelled = true;
                            break;
                        }
                    }
                }
                Err(err) => {
                    stats.symbols_failed += 1;
                    warn!(
                        component = "collector",
                        event = "collector.symbol.failed",
                        symbol = %symbol,
                        error = %err
                    );
                }
            }
        }

        stats.digest = hex::encode(pass_hasher.finalize());
    }

    fn collect_symbol(
        &self,
        symbol: &str,
        now_ms_utc: i64,
        cancel: &CancellationToken,
    ) -> Result<(SymbolOutcome, u64), CollectorError> {
        let last_persisted = self.store.latest_ts(symbol)?;
        let window = normalize(
            self.source
                .recent_points(symbol, now_ms_utc, self.cfg.history_limit)?,
            now_ms_utc,
        );
        let internal_gaps = self.note_internal_gaps(symbol, &window);

        let Some(newest) = window.last().map(SeriesPoint::ts_ms_utc) else {
            return Err(SourceError::Unavailable(format!("no price points for {symbol}")).into());
        };
        if last_persisted.is_some_and(|last| newest <= last) {
            debug!(
                component = "collector",
                event = "collector.symbol.up_to_date",
                symbol,
                newest_ts_ms_utc = newest
            );
            return Ok((SymbolOutcome::UpToDate, internal_gaps));
        }

        if let Some(plan) = self.catch_up_plan(last_persisted, newest, now_ms_utc) {
            info!(
                component = "collector",
                event = "collector.symbol.catch_up",
                symbol,
                last_ts_ms_utc = ?last_persisted,
                newest_ts_ms_utc = newest,
                days = plan.days
            );
            let outcome = match self.backfill_symbol(symbol, &plan, cancel)?.0 {
                SymbolOutcome::Written { rows, digest } => {
                    SymbolOutcome::CaughtUp { rows, digest }
                }
                other => other,
            };
            return Ok((outcome, internal_gaps));
        }

        let Some(record) = self.computation.latest(symbol, &window, now_ms_utc) else {
            return Ok((SymbolOutcome::Insufficient, internal_gaps));
        };
        let outcome = self.store.upsert(std::slice::from_ref(&record))?;
        Ok((
            SymbolOutcome::Written {
                rows: outcome.rows,
                digest: outcome.digest,
            },
            internal_gaps,
        ))
    }

    /// A bounded recompute for a symbol whose feed moved more than one cadence
    /// past its newest persisted record; `None` when a single record suffices.
    fn catch_up_plan(
        &self,
        last_persisted: Option<i64>,
        newest_ts_ms_utc: i64,
        now_ms_utc: i64,
    ) -> Option<BackfillPlan> {
        let last = last_persisted?;
        if newest_ts_ms_utc - last <= self.cfg.cadence_ms() {
            return None;
        }
        match plan_backfill(&detect_gap(Some(last), now_ms_utc), &self.cfg, now_ms_utc) {
            BackfillDecision::Backfill(plan) => Some(plan),
            BackfillDecision::FirstRun | BackfillDecision::UpToDate => None,
        }
    }

    fn backfill_symbol(
        &self,
        symbol: &str,
        plan: &BackfillPlan,
        cancel: &CancellationToken,
    ) -> Result<(SymbolOutcome, u64), CollectorError> {
        let window = normalize(
            self.source
                .points_between(symbol, plan.start_ts_ms_utc, plan.end_ts_ms_utc)?,
            plan.end_ts_ms_utc,
        );
        if window.is_empty() {
            return Err(SourceError::Unavailable(format!(
                "no price points for {symbol} in the last {} days",
                plan.days
            ))
            .into());
        }

        // Indicators at the start of the window need the points before it.
        let mut points = normalize(
            self.source.recent_points(
                symbol,
                plan.start_ts_ms_utc.saturating_sub(1),
                self.cfg.history_limit,
            )?,
            plan.start_ts_ms_utc.saturating_sub(1),
        );
        let warm_up = points.len();
        points.extend(window);
        let internal_gaps = self.note_internal_gaps(symbol, &points);

        let mut records = match self.computation.history(
            symbol,
            &points,
            self.cfg.min_window,
            plan.end_ts_ms_utc,
            cancel,
        ) {
            Ok(records) => records,
            Err(cancelled) => {
                warn!(
                    component = "collector",
                    event = "collector.symbol.cancelled",
                    symbol,
                    completed_indices = cancelled.completed_indices
                );
                return Ok((SymbolOutcome::Cancelled, internal_gaps));
            }
        };

        records.retain(|record| record.ts_ms_utc() >= plan.start_ts_ms_utc);

        if records.is_empty() {
            debug!(
                component = "collector",
                event = "collector.symbol.insufficient",
                symbol,
                points = points.len(),
                warm_up,
                min_window = self.cfg.min_window
            );
            return Ok((SymbolOutcome::Insufficient, internal_gaps));
        }

        let outcome = self.store.upsert(&records)?;
        Ok((
            SymbolOutcome::Written {
                rows: outcome.rows,
                digest: outcome.digest,
            },
            internal_gaps,
        ))
    }

    fn note_internal_gaps(&self, symbol: &str, points: &[C::Point]) -> u64 {
        let coverage = scan_series_gaps(points, self.cfg.cadence_ms());
        if coverage.total_gap_ranges > 0 {
            info!(
                component = "collector",
                event = "collector.symbol.internal_gaps",
                symbol,
                points = coverage.points,
                total_gap_ranges = coverage.total_gap_ranges,
                first_gap = ?coverage.gap_ranges.first()
            );
        }
        coverage.total_gap_ranges
    }

    fn next_batch(&self, symbols: &[String]) -> Vec<String> {
        let mut state = self
            .state
            .write()
            .expect("collector state lock should not be poisoned");
        if symbols.is_empty() {
            state.batch_cursor = 0;
            return Vec::new();
        }

        let take = self.cfg.batch_cap.min(symbols.len());
        let start = state.batch_cursor % symbols.len();
        let batch = symbols
            .iter()
            .cycle()
            .skip(start)
            .take(take)
            .cloned()
            .collect();
        state.batch_cursor = (start + take) % symbols.len();
        batch
    }

    fn finish_pass(&self, stats: RunStats) -> Result<RunStats, CollectorError> {
        {
            let mut state = self
                .state
                .write()
                .expect("collector state lock should not be poisoned");
            state.attempted += stats.symbols_attempted;
            state.failed += stats.symbols_failed;
            state.passes += 1;
            state.last_run = Some(stats.clone());
        }

        if stats.all_failed() {
            error!(
                component = "collector",
                event = "collector.pass.systemic_failure",
                symbols_attempted = stats.symbols_attempted,
                symbols_failed = stats.symbols_failed
            );
        }
        if stats.cancelled {
            warn!(
                component = "collector",
                event = "collector.pass.cancelled",
                symbols_attempted = stats.symbols_attempted,
                records_written = stats.records_written
            );
        }

        info!(
            component = "collector",
            event = "collector.pass.finish",
            mode = ?stats.mode,
            symbols_attempted = stats.symbols_attempted,
            symbols_succeeded = stats.symbols_succeeded,
            symbols_failed = stats.symbols_failed,
            symbols_up_to_date = stats.symbols_up_to_date,
            symbols_insufficient = stats.symbols_insufficient,
            symbols_caught_up = stats.symbols_caught_up,
            records_written = stats.records_written,
            internal_gaps = stats.internal_gaps,
            digest = %stats.digest
        );
        Ok(stats)
    }
}

/// Ascending, de-duplicated, and nothing newer than the pass clock.
fn normalize<P: SeriesPoint>(mut points: Vec<P>, now_ms_utc: i64) -> Vec<P> {
    points.retain(|p| p.ts_ms_utc() <= now_ms_utc);
    points.sort_by_key(SeriesPoint::ts_ms_utc);
    points.dedup_by_key(|p| p.ts_ms_utc());
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_orders_dedupes_and_drops_future_points() {
        let points = vec![
            PricePoint::new("BTC", 3, 3.0),
            PricePoint::new("BTC", 1, 1.0),
            PricePoint::new("BTC", 1, 9.0),
            PricePoint::new("BTC", 10, 10.0),
        ];
        let out = normalize(points, 5);
        let ts: Vec<i64> = out.iter().map(|p| p.ts_ms_utc).collect();
        assert_eq!(ts, vec![1, 3]);
        assert_eq!(out[0].close, 1.0);
    }

    #[test]
    fn all_failed_requires_attempts() {
        let mut stats = RunStats::new(RunMode::Collection, 0, 0);
        assert!(!stats.all_failed());
        stats.symbols_attempted = 2;
        stats.symbols_failed = 2;
        assert!(stats.all_failed());
    }
}
