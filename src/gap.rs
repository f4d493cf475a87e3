//! Staleness of a persisted series and hole detection inside a fetched window.

use serde::{Deserialize, Serialize};

use crate::price::SeriesPoint;

pub const MS_PER_HOUR: i64 = 3_600_000;
const MAX_REPORTED_GAP_RANGES: usize = 256;
/// Spacing beyond `cadence * 1.5` counts as a hole.
const HOLE_TOLERANCE: f64 = 1.5;

/// Elapsed time since the newest persisted point, or the explicit first-run sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Gap {
    NoData,
    Stale { last_ts_ms_utc: i64, hours: f64 },
}

impl Gap {
    pub fn hours(&self) -> Option<f64> {
        match self {
            Self::NoData => None,
            Self::Stale { hours, .. } => Some(*hours),
        }
    }

    pub fn last_ts_ms_utc(&self) -> Option<i64> {
        match self {
            Self::NoData => None,
            Self::Stale { last_ts_ms_utc, .. } => Some(*last_ts_ms_utc),
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData)
    }
}

/// `now - last`, clamped at zero for clocks that run behind the feed.
pub fn detect_gap(last_ts_ms_utc: Option<i64>, now_ms_utc: i64) -> Gap {
    match last_ts_ms_utc {
        None => Gap::NoData,
        Some(last) => {
            let elapsed_ms = now_ms_utc.saturating_sub(last).max(0);
            Gap::Stale {
                last_ts_ms_utc: last,
                hours: elapsed_ms as f64 / MS_PER_HOUR as f64,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SeriesCoverage {
    pub points: u64,
    pub total_gap_ranges: u64,
    /// `(last_seen_ts, next_seen_ts)` pairs around each hole, capped.
    pub gap_ranges: Vec<(i64, i64)>,
    pub out_of_order: u64,
}

/// Holes in an already-fetched window relative to the expected cadence.
pub fn scan_series_gaps<P: SeriesPoint>(points: &[P], cadence_ms: i64) -> SeriesCoverage {
    let mut coverage = SeriesCoverage {
        points: points.len() as u64,
        ..SeriesCoverage::default()
    };
    if cadence_ms <= 0 {
        return coverage;
    }

    let threshold = cadence_ms as f64 * HOLE_TOLERANCE;
    for pair in points.windows(2) {
        let prev = pair[0].ts_ms_utc();
        let next = pair[1].ts_ms_utc();
        if next <= prev {
            coverage.out_of_order += 1;
            continue;
        }
        if (next - prev) as f64 > threshold {
            coverage.total_gap_ranges += 1;
            if coverage.gap_ranges.len() < MAX_REPORTED_GAP_RANGES {
                coverage.gap_ranges.push((prev, next));
            }
        }
    }

    coverage
}
