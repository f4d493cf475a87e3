//! Read-only status routes.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing::warn;

use crate::collector::{StatusReader, StatusReport};
use crate::health::HealthLabel;
use crate::scheduler::Clock;
use crate::store::RecordStore;

pub trait StatusSource: Send + Sync + 'static {
    fn status(&self) -> Result<StatusReport, String>;
}

/// A collector's status reader paired with the clock it reports against.
pub struct CollectorStatusSource<T, K> {
    reader: StatusReader<T>,
    clock: Arc<K>,
}

impl<T, K> CollectorStatusSource<T, K> {
    pub fn new(reader: StatusReader<T>, clock: Arc<K>) -> Self {
        Self { reader, clock }
    }
}

impl<T: RecordStore, K: Clock> StatusSource for CollectorStatusSource<T, K> {
    fn status(&self) -> Result<StatusReport, String> {
        self.reader
            .status(self.clock.now_ms_utc())
            .map_err(|err| err.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthBody {
    status: &'static str,
    health_score: f64,
    gap_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Clone)]
struct StatusAppState {
    source: Arc<dyn StatusSource>,
}

pub fn status_router(source: Arc<dyn StatusSource>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .with_state(StatusAppState { source })
}

async fn get_status(State(state): State<StatusAppState>) -> Response {
    match state.source.status() {
        Ok(report) => Json(report).into_response(),
        Err(error) => unavailable(error),
    }
}

/// 200 unless the collector is critical.
async fn get_health(State(state): State<StatusAppState>) -> Response {
    match state.source.status() {
        Ok(report) => {
            let code = match report.health_label {
                HealthLabel::Critical => StatusCode::SERVICE_UNAVAILABLE,
                HealthLabel::Healthy | HealthLabel::Degraded => StatusCode::OK,
            };
            let body = HealthBody {
                status: report.health_label.as_str(),
                health_score: report.health_score,
                gap_hours: report.gap_hours,
            };
            (code, Json(body)).into_response()
        }
        Err(error) => unavailable(error),
    }
}

fn unavailable(error: String) -> Response {
    warn!(
        component = "status_server",
        event = "status.read_failed",
        error = %error
    );
    (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorBody { error })).into_response()
}
