//! Price point feed: the ordered, append-only observations indicators are derived from.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use chrono::DateTime;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const CSV_COLUMNS: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub symbol: String,
    pub ts_ms_utc: i64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
}

impl PricePoint {
    pub fn new(symbol: impl Into<String>, ts_ms_utc: i64, close: f64) -> Self {
        Self {
            symbol: symbol.into(),
            ts_ms_utc,
            close,
            high: close,
            low: close,
            volume: 0.0,
        }
    }

    pub fn with_range(mut self, high: f64, low: f64) -> Self {
        self.high = high;
        self.low = low;
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }
}

/// Anything carrying a UTC millisecond timestamp can flow through a collector.
pub trait SeriesPoint {
    fn ts_ms_utc(&self) -> i64;
}

impl SeriesPoint for PricePoint {
    fn ts_ms_utc(&self) -> i64 {
        self.ts_ms_utc
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("price record has {found} columns, expected at least {expected}")]
    InvalidRecordColumns { found: usize, expected: usize },
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
}

/// Ordered per-symbol feed. Returned points are ascending by timestamp.
pub trait PointSource: Send + Sync + 'static {
    type Point: SeriesPoint + Clone + Send + Sync;

    fn symbols(&self) -> Result<Vec<String>, SourceError>;

    /// Up to `limit` most recent points with `ts <= end_ts_ms_utc`.
    fn recent_points(
        &self,
        symbol: &str,
        end_ts_ms_utc: i64,
        limit: usize,
    ) -> Result<Vec<Self::Point>, SourceError>;

    /// Points with `start_ts_ms_utc <= ts <= end_ts_ms_utc`.
    fn points_between(
        &self,
        symbol: &str,
        start_ts_ms_utc: i64,
        end_ts_ms_utc: i64,
    ) -> Result<Vec<Self::Point>, SourceError>;
}

#[derive(Clone, Default)]
pub struct InMemoryPointSource {
    inner: Arc<RwLock<BTreeMap<String, BTreeMap<i64, PricePoint>>>>,
}

impl InMemoryPointSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_points(points: impl IntoIterator<Item = PricePoint>) -> Self {
        let source = Self::new();
        source.extend(points);
        source
    }

    /// Duplicate timestamps keep the first observation; the feed is append-only.
    pub fn extend(&self, points: impl IntoIterator<Item = PricePoint>) {
        let mut guard = self
            .inner
            .write()
            .expect("in-memory source lock should not be poisoned");
        for point in points {
            guard
                .entry(point.symbol.clone())
                .or_default()
                .entry(point.ts_ms_utc)
                .or_insert(point);
        }
    }

    /// Distinct timestamps held for `symbol`.
    pub fn point_count(&self, symbol: &str) -> usize {
        self.inner
            .read()
            .expect("in-memory source lock should not be poisoned")
            .get(symbol)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

impl PointSource for InMemoryPointSource {
    type Point = PricePoint;

    fn symbols(&self) -> Result<Vec<String>, SourceError> {
        Ok(self
            .inner
            .read()
            .expect("in-memory source lock should not be poisoned")
            .keys()
            .cloned()
            .collect())
    }

    fn recent_points(
        &self,
        symbol: &str,
        end_ts_ms_utc: i64,
        limit: usize,
    ) -> Result<Vec<PricePoint>, SourceError> {
        let guard = self
            .inner
            .read()
            .expect("in-memory source lock should not be poisoned");
        let series = guard
            .get(symbol)
            .ok_or_else(|| SourceError::UnknownSymbol(symbol.to_string()))?;

        let mut out: Vec<PricePoint> = series
            .range(..=end_ts_ms_utc)
            .rev()
            .take(limit)
            .map(|(_, point)| point.clone())
            .collect();
        out.reverse();
        Ok(out)
    }

    fn points_between(
        &self,
        symbol: &str,
        start_ts_ms_utc: i64,
        end_ts_ms_utc: i64,
    ) -> Result<Vec<PricePoint>, SourceError> {
        if end_ts_ms_utc < start_ts_ms_utc {
            return Ok(Vec::new());
        }
        let guard = self
            .inner
            .read()
            .expect("in-memory source lock should not be poisoned");
        let series = guard
            .get(symbol)
            .ok_or_else(|| SourceError::UnknownSymbol(symbol.to_string()))?;

        Ok(series
            .range(start_ts_ms_utc..=end_ts_ms_utc)
            .map(|(_, point)| point.clone())
            .collect())
    }
}

/// CSV-backed feed with columns `symbol,timestamp,close,high,low,volume`.
///
/// `timestamp` is either epoch milliseconds or RFC 3339. The file is re-read
/// whenever its modification time changes, so an upstream writer can keep
/// appending between passes.
pub struct CsvPointSource {
    path: PathBuf,
    cache: RwLock<CsvCache>,
}

#[derive(Default)]
struct CsvCache {
    modified: Option<SystemTime>,
    points: InMemoryPointSource,
}

impl CsvPointSource {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let source = Self {
            path: path.into(),
            cache: RwLock::new(CsvCache::default()),
        };
        source.refresh()?;
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn refresh(&self) -> Result<InMemoryPointSource, SourceError> {
        let modified = fs::metadata(&self.path)?.modified().ok();
        {
            let cache = self
                .cache
                .read()
                .expect("csv cache lock should not be poisoned");
            if cache.modified.is_some() && cache.modified == modified {
                return Ok(cache.points.clone());
            }
        }

        let points = load_csv_points(&self.path)?;
        let count = points.len();
        let fresh = InMemoryPointSource::with_points(points);
        let mut cache = self
            .cache
            .write()
            .expect("csv cache lock should not be poisoned");
        cache.modified = modified;
        cache.points = fresh.clone();

        info!(
            component = "price_source",
            event = "price_source.csv.loaded",
            path = %self.path.display(),
            points = count
        );
        Ok(fresh)
    }
}

impl PointSource for CsvPointSource {
    type Point = PricePoint;

    fn symbols(&self) -> Result<Vec<String>, SourceError> {
        self.refresh()?.symbols()
    }

    fn recent_points(
        &self,
        symbol: &str,
        end_ts_ms_utc: i64,
        limit: usize,
    ) -> Result<Vec<PricePoint>, SourceError> {
        self.refresh()?.recent_points(symbol, end_ts_ms_utc, limit)
    }

    fn points_between(
        &self,
        symbol: &str,
        start_ts_ms_utc: i64,
        end_ts_ms_utc: i64,
    ) -> Result<Vec<PricePoint>, SourceError> {
        self.refresh()?
            .points_between(symbol, start_ts_ms_utc, end_ts_ms_utc)
    }
}

pub fn load_csv_points(path: &Path) -> Result<Vec<PricePoint>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut rows = Vec::new();
    let mut per_symbol: HashMap<String, usize> = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let point = parse_price_record(&record)?;
        *per_symbol.entry(point.symbol.clone()).or_insert(0) += 1;
        rows.push(point);
    }

    debug!(
        component = "price_source",
        event = "price_source.csv.parsed",
        path = %path.display(),
        symbols = per_symbol.len(),
        rows = rows.len()
    );
    Ok(rows)
}

fn parse_price_record(record: &StringRecord) -> Result<PricePoint, SourceError> {
    if record.len() < CSV_COLUMNS {
        return Err(SourceError::InvalidRecordColumns {
            found: record.len(),
            expected: CSV_COLUMNS,
        });
    }

    let symbol = record.get(0).unwrap_or_default();
    if symbol.is_empty() {
        return Err(SourceError::ParseField {
            field: "symbol",
            value: String::new(),
        });
    }

    Ok(PricePoint {
        symbol: symbol.to_string(),
        ts_ms_utc: parse_timestamp(record.get(1).unwrap_or_default())?,
        close: parse_f64(record, 2, "close")?,
        high: parse_f64(record, 3, "high")?,
        low: parse_f64(record, 4, "low")?,
        volume: parse_f64(record, 5, "volume")?,
    })
}

fn parse_timestamp(raw: &str) -> Result<i64, SourceError> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| SourceError::ParseField {
            field: "timestamp",
            value: raw.to_string(),
        })
}

fn parse_f64(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<f64, SourceError> {
    let raw = record.get(idx).unwrap_or_default();
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(SourceError::ParseField {
            field,
            value: raw.to_string(),
        }),
    }
}
