use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use gapwatch::{
    status_router, CollectorConfig, CollectorStatusSource, GapAwareCollector, IndicatorEngine,
    InMemoryPointSource, ManualClock, PricePoint, SqliteIndicatorStore, MS_PER_HOUR,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

const START_TS_MS: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

type Collector = GapAwareCollector<IndicatorEngine, InMemoryPointSource, SqliteIndicatorStore>;

fn at_hour(h: i64) -> i64 {
    START_TS_MS + h * MS_PER_HOUR
}

fn setup(hours: i64) -> (Arc<InMemoryPointSource>, Collector) {
    let source = Arc::new(InMemoryPointSource::with_points(
        (0..hours).map(|h| PricePoint::new("BTC", at_hour(h), 100.0 + h as f64)),
    ));
    let store = Arc::new(SqliteIndicatorStore::open_in_memory().expect("store"));
    let collector = GapAwareCollector::new(
        IndicatorEngine::default(),
        Arc::clone(&source),
        store,
        CollectorConfig::default(),
    )
    .expect("collector");
    (source, collector)
}

fn app(collector: &Collector, clock: &Arc<ManualClock>) -> Router {
    status_router(Arc::new(CollectorStatusSource::new(
        collector.status_reader(),
        Arc::clone(clock),
    )))
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn empty_store_reports_no_data_as_degraded() {
    let (_source, collector) = setup(30);
    let clock = Arc::new(ManualClock::new(at_hour(30)));

    let (status, body) = get_json(app(&collector, &clock), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["health_score"], 50.0);
    assert!(body["gap_hours"].is_null());

    let (status, body) = get_json(app(&collector, &clock), "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["gap"]["kind"], "no_data");
    assert!(body["last_run"].is_null());
}

#[tokio::test]
async fn status_after_a_pass_is_healthy_and_carries_run_stats() {
    let (_source, collector) = setup(30);
    collector
        .run_collection(at_hour(30), &CancellationToken::new())
        .expect("pass");
    let clock = Arc::new(ManualClock::new(at_hour(30)));

    let (status, body) = get_json(app(&collector, &clock), "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["gap"]["kind"], "stale");
    assert_eq!(body["gap"]["last_ts_ms_utc"], at_hour(29));
    assert_eq!(body["gap_hours"], 1.0);
    assert_eq!(body["freshest_ts_ms_utc"], at_hour(29));
    assert_eq!(body["health_label"], "healthy");
    assert_eq!(body["attempted"], 1);
    assert_eq!(body["failed"], 0);
    assert_eq!(body["last_run"]["mode"], "collection");
    assert_eq!(body["last_run"]["records_written"], 1);
}

#[tokio::test]
async fn stale_and_failing_collector_is_critical() {
    let (source, collector) = setup(30);
    let cancel = CancellationToken::new();
    collector.run_collection(at_hour(30), &cancel).expect("pass");

    // only has a point after the pass clock, so its window is empty
    source.extend([PricePoint::new("ZZZ", at_hour(1_000), 1.0)]);
    let stats = collector.run_collection(at_hour(100), &cancel).expect("pass");
    assert_eq!(stats.symbols_failed, 1);

    let clock = Arc::new(ManualClock::new(at_hour(100)));
    let (status, body) = get_json(app(&collector, &clock), "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "critical");
    // gap penalty capped at 50, one failure in three attempts costs 20
    let score = body["health_score"].as_f64().unwrap();
    assert!((score - 30.0).abs() < 1e-9, "score {score}");
}
