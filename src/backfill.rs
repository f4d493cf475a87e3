//! Turns a staleness measurement into a bounded recompute scope.

use serde::{Deserialize, Serialize};

use crate::config::CollectorConfig;
use crate::gap::Gap;

const MS_PER_DAY: i64 = 86_400_000;
const HOURS_PER_DAY: f64 = 24.0;
const SAFETY_BUFFER_DAYS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillPlan {
    pub days: u32,
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc: i64,
}

impl BackfillPlan {
    /// Window of `days` ending at `now`, inclusive on both ends.
    pub fn ending_at(days: u32, now_ms_utc: i64) -> Self {
        Self {
            days,
            start_ts_ms_utc: now_ms_utc.saturating_sub(i64::from(days) * MS_PER_DAY),
            end_ts_ms_utc: now_ms_utc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum BackfillDecision {
    /// Nothing persisted yet; a first collection replaces any plan.
    FirstRun,
    UpToDate,
    Backfill(BackfillPlan),
}

/// `ceil(gap / 24h) + 1` days clamped to `[1, max_backfill_days]`; 0 when the gap
/// is within one cadence.
pub fn plan_backfill_days(gap_hours: f64, cadence_hours: f64, max_backfill_days: u32) -> u32 {
    if !gap_hours.is_finite() || gap_hours <= cadence_hours {
        return 0;
    }
    let cap = max_backfill_days.max(1);
    let whole_days = (gap_hours / HOURS_PER_DAY).ceil();
    if whole_days >= f64::from(cap) {
        return cap;
    }
    (whole_days as u32)
        .saturating_add(SAFETY_BUFFER_DAYS)
        .clamp(1, cap)
}

pub fn plan_backfill(gap: &Gap, cfg: &CollectorConfig, now_ms_utc: i64) -> BackfillDecision {
    match gap {
        Gap::NoData => BackfillDecision::FirstRun,
        Gap::Stale { hours, .. } => {
            match plan_backfill_days(*hours, cfg.cadence_hours, cfg.max_backfill_days) {
                0 => BackfillDecision::UpToDate,
                days => BackfillDecision::Backfill(BackfillPlan::ending_at(days, now_ms_utc)),
            }
        }
    }
}
