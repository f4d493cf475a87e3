use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use gapwatch::{
    log_app_bind, log_app_config, log_app_start, log_run_summary, log_startup_action,
    status_router, AppPaths, CollectorConfig, CollectorStatusSource, GapAwareCollector,
    IndicatorEngine, InMemoryPointSource, LogFormat, LoggingConfig, ManualClock, PointSource,
    PricePoint, Scheduler, SourceError, SqliteIndicatorStore, StatusSource, MS_PER_HOUR,
};
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

/// Knows its symbols but every fetch fails.
struct OfflineSource {
    symbols: Vec<String>,
}

impl PointSource for OfflineSource {
    type Point = PricePoint;

    fn symbols(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.symbols.clone())
    }

    fn recent_points(&self, _: &str, _: i64, _: usize) -> Result<Vec<PricePoint>, SourceError> {
        Err(SourceError::Unavailable("feed offline".to_string()))
    }

    fn points_between(&self, _: &str, _: i64, _: i64) -> Result<Vec<PricePoint>, SourceError> {
        Err(SourceError::Unavailable("feed offline".to_string()))
    }
}

fn hourly(symbol: &str, hours: i64) -> Vec<PricePoint> {
    (0..hours)
        .map(|h| PricePoint::new(symbol, h * MS_PER_HOUR, 100.0 + h as f64))
        .collect()
}

#[test]
fn all_symbols_failing_logs_systemic_failure() {
    let source = Arc::new(OfflineSource {
        symbols: vec!["BTC".to_string(), "ETH".to_string()],
    });
    let store = Arc::new(SqliteIndicatorStore::open_in_memory().expect("store should open"));
    let collector = GapAwareCollector::new(
        IndicatorEngine::default(),
        source,
        store,
        CollectorConfig::default(),
    )
    .expect("default config is valid");

    let logs = capture_logs(Level::INFO, || {
        let stats = collector
            .run_collection(10 * MS_PER_HOUR, &CancellationToken::new())
            .expect("per-symbol failures do not fail the pass");
        assert_eq!(stats.symbols_failed, 2);
    });

    assert!(logs.contains("\"event\":\"collector.symbol.failed\""));
    assert!(logs.contains("\"event\":\"collector.pass.systemic_failure\""));
    assert!(logs.contains("\"event\":\"collector.pass.finish\""));
}

#[test]
fn partial_failure_is_not_systemic() {
    let source = Arc::new(InMemoryPointSource::with_points(hourly("BTC", 30)));
    let store = Arc::new(SqliteIndicatorStore::open_in_memory().expect("store should open"));
    let collector = GapAwareCollector::new(
        IndicatorEngine::default(),
        Arc::clone(&source),
        store,
        CollectorConfig::default(),
    )
    .expect("default config is valid");

    let logs = capture_logs(Level::INFO, || {
        // ETH only has data far outside the backfill window.
        source.extend([PricePoint::new("ETH", -400 * MS_PER_HOUR, 1.0)]);
        let stats = collector
            .run_backfill(2, 30 * MS_PER_HOUR, &CancellationToken::new())
            .expect("backfill should run");
        assert_eq!(stats.symbols_failed, 1);
        assert_eq!(stats.symbols_succeeded, 1);
    });

    assert!(logs.contains("\"event\":\"collector.symbol.failed\""));
    assert!(!logs.contains("collector.pass.systemic_failure"));
}

#[test]
fn internal_holes_are_reported() {
    let mut points = hourly("BTC", 10);
    points.extend((15..30).map(|h| PricePoint::new("BTC", h * MS_PER_HOUR, 100.0)));
    let source = Arc::new(InMemoryPointSource::with_points(points));
    let store = Arc::new(SqliteIndicatorStore::open_in_memory().expect("store should open"));
    let collector = GapAwareCollector::new(
        IndicatorEngine::default(),
        source,
        store,
        CollectorConfig::default(),
    )
    .expect("default config is valid");

    let logs = capture_logs(Level::INFO, || {
        let stats = collector
            .run_collection(30 * MS_PER_HOUR, &CancellationToken::new())
            .expect("collection should run");
        assert_eq!(stats.internal_gaps, 1);
    });

    assert!(logs.contains("\"event\":\"collector.symbol.internal_gaps\""));
}

#[test]
fn lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig {
            format: LogFormat::Compact,
            ..LoggingConfig::default()
        };
        log_app_start("gapwatch_collector", &cfg);
        log_app_config(
            "gapwatch_collector",
            &CollectorConfig::default(),
            &AppPaths::default(),
        );
        log_app_bind(
            "gapwatch_collector",
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8090),
        );
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"app.config\""));
    assert!(logs.contains("\"log_format\":\"compact\""));
    assert!(logs.contains("\"signal_mode\":\"approximate\""));
    assert!(logs.contains("\"store_path\":\"gapwatch.sqlite3\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
}

#[test]
fn catch_up_and_startup_decision_are_logged() {
    let source = Arc::new(InMemoryPointSource::with_points(hourly("BTC", 30)));
    let store = Arc::new(SqliteIndicatorStore::open_in_memory().expect("store should open"));
    let collector = Arc::new(
        GapAwareCollector::new(
            IndicatorEngine::default(),
            Arc::clone(&source),
            store,
            CollectorConfig::default(),
        )
        .expect("default config is valid"),
    );
    let cancel = CancellationToken::new();
    collector
        .run_collection(30 * MS_PER_HOUR, &cancel)
        .expect("seed pass");

    let logs = capture_logs(Level::INFO, || {
        source.extend((30..40).map(|h| PricePoint::new("BTC", h * MS_PER_HOUR, 100.0)));
        let stats = collector
            .run_collection(40 * MS_PER_HOUR, &cancel)
            .expect("catch-up pass");
        assert_eq!(stats.symbols_caught_up, 1);
        log_run_summary("gapwatch_backfill", &stats);

        let scheduler = Scheduler::new(
            Arc::clone(&collector),
            Arc::new(ManualClock::new(40 * MS_PER_HOUR)),
        );
        let action = scheduler.startup(&cancel).expect("startup");
        log_startup_action("scheduler", &action);
    });

    assert!(logs.contains("\"event\":\"collector.symbol.catch_up\""));
    assert!(logs.contains("\"event\":\"app.run_summary\""));
    assert!(logs.contains("\"symbols_caught_up\":1"));
    assert!(logs.contains("\"event\":\"startup.up_to_date\""));
}

#[test]
fn failed_run_summary_warns() {
    let collector = GapAwareCollector::new(
        IndicatorEngine::default(),
        Arc::new(OfflineSource {
            symbols: vec!["BTC".to_string()],
        }),
        Arc::new(SqliteIndicatorStore::open_in_memory().expect("store should open")),
        CollectorConfig::default(),
    )
    .expect("default config is valid");

    let logs = capture_logs(Level::WARN, || {
        let stats = collector
            .run_collection(MS_PER_HOUR, &CancellationToken::new())
            .expect("per-symbol failures do not fail the pass");
        log_run_summary("gapwatch_backfill", &stats);
    });

    assert!(logs.contains("\"event\":\"app.run_summary\""));
    assert!(logs.contains("\"level\":\"WARN\""));
}

#[test]
fn failed_status_read_is_logged_and_unavailable() {
    struct BrokenStatus;

    impl StatusSource for BrokenStatus {
        fn status(&self) -> Result<gapwatch::StatusReport, String> {
            Err("database is locked".to_string())
        }
    }

    let logs = capture_logs(Level::INFO, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("single-thread runtime should build");

        rt.block_on(async {
            let app = status_router(Arc::new(BrokenStatus));
            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/status")
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("status request should complete");

            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        });
    });

    assert!(logs.contains("\"event\":\"status.read_failed\""));
}

#[test]
fn healthy_status_read_does_not_warn() {
    let store = Arc::new(SqliteIndicatorStore::open_in_memory().expect("store should open"));
    let collector = GapAwareCollector::new(
        IndicatorEngine::default(),
        Arc::new(InMemoryPointSource::new()),
        store,
        CollectorConfig::default(),
    )
    .expect("default config is valid");
    let status =
        CollectorStatusSource::new(collector.status_reader(), Arc::new(ManualClock::new(0)));

    let logs = capture_logs(Level::INFO, || {
        let report = status.status().expect("empty store still reports");
        assert!(report.gap.is_no_data());
    });

    assert!(!logs.contains("status.read_failed"));
}
