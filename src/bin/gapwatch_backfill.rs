use std::sync::Arc;

use gapwatch::{
    app_paths_from_env, collector_config_from_env, init_logging, log_app_config, log_app_start,
    log_run_summary, logging_config_from_env, plan_backfill, BackfillDecision, Clock,
    CsvPointSource, GapAwareCollector, IndicatorCollector, IndicatorEngine, RunStats,
    SqliteIndicatorStore, SystemClock,
};
use tokio_util::sync::CancellationToken;

const APP: &str = "gapwatch_backfill";

/// Usage: `gapwatch_backfill [days]`. Without `days` the scope comes from the
/// store's current gap, exactly as the collector would plan it at startup.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(APP, &logging_cfg);

    let cfg = collector_config_from_env();
    cfg.validate()?;
    let paths = app_paths_from_env();
    log_app_config(APP, &cfg, &paths);

    let requested_days = match std::env::args().nth(1) {
        Some(raw) => Some(
            raw.trim()
                .parse::<u32>()
                .map_err(|err| format!("days must be a positive integer, got {raw:?}: {err}"))?,
        ),
        None => None,
    };

    let store = Arc::new(SqliteIndicatorStore::open(&paths.store_path)?);
    let source = Arc::new(CsvPointSource::open(&paths.csv_path)?);
    let engine = IndicatorEngine::new(cfg.signal_mode);
    let collector: IndicatorCollector<CsvPointSource> =
        GapAwareCollector::new(engine, Arc::clone(&source), store, cfg)?;

    let now = SystemClock.now_ms_utc();
    let cancel = CancellationToken::new();
    let gap = collector.overall_gap(now)?;

    println!(
        "Backfill start | store={} csv={} gap_hours={}",
        paths.store_path.display(),
        source.path().display(),
        gap.hours()
            .map(|hours| format!("{hours:.2}"))
            .unwrap_or_else(|| "none".to_string())
    );

    let stats = match requested_days {
        Some(days) => collector.run_backfill(days, now, &cancel)?,
        None => match plan_backfill(&gap, collector.config(), now) {
            BackfillDecision::FirstRun => collector.run_collection(now, &cancel)?,
            BackfillDecision::UpToDate => {
                println!("Up to date; nothing to backfill.");
                return Ok(());
            }
            BackfillDecision::Backfill(plan) => collector.run_backfill(plan.days, now, &cancel)?,
        },
    };

    log_run_summary(APP, &stats);
    print_summary(&stats)?;
    if stats.all_failed() {
        return Err("every symbol failed; see logs".into());
    }
    Ok(())
}

fn print_summary(stats: &RunStats) -> Result<(), serde_json::Error> {
    println!(
        "Backfill done | mode={:?} attempted={} succeeded={} caught_up={} failed={} up_to_date={} insufficient={} rows={} internal_gaps={}",
        stats.mode,
        stats.symbols_attempted,
        stats.symbols_succeeded,
        stats.symbols_caught_up,
        stats.symbols_failed,
        stats.symbols_up_to_date,
        stats.symbols_insufficient,
        stats.records_written,
        stats.internal_gaps
    );
    println!("{}", serde_json::to_string_pretty(stats)?);
    Ok(())
}
