//! Read-only rollup of freshness and reliability into a 0-100 score.

use serde::{Deserialize, Serialize};

use crate::gap::Gap;

pub const GAP_PENALTY_PER_HOUR: f64 = 2.0;
pub const MAX_GAP_PENALTY: f64 = 50.0;
pub const ERROR_PENALTY_SCALE: f64 = 60.0;
pub const MAX_ERROR_PENALTY: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLabel {
    Healthy,
    Degraded,
    Critical,
}

impl HealthLabel {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Healthy
        } else if score >= 50.0 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

/// Penalty for staleness; a series with no data takes the full penalty.
pub fn gap_penalty(gap: &Gap) -> f64 {
    match gap.hours() {
        None => MAX_GAP_PENALTY,
        Some(hours) if hours.is_nan() => MAX_GAP_PENALTY,
        Some(hours) => (hours.max(0.0) * GAP_PENALTY_PER_HOUR).min(MAX_GAP_PENALTY),
    }
}

pub fn error_penalty(attempted: u64, failed: u64) -> f64 {
    if attempted == 0 {
        return 0.0;
    }
    let ratio = (failed.min(attempted)) as f64 / attempted as f64;
    (ratio * ERROR_PENALTY_SCALE).min(MAX_ERROR_PENALTY)
}

/// `100 - gap_penalty - error_penalty`, clamped to `[0, 100]`.
pub fn health_score(gap: &Gap, attempted: u64, failed: u64) -> f64 {
    (100.0 - gap_penalty(gap) - error_penalty(attempted, failed)).clamp(0.0, 100.0)
}
