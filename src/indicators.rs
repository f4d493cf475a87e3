//! Windowed technical indicators over an ascending price series.
//!
//! Every value at index `i` is a function of `points[..=i]` only. The recursive
//! indicators (EMA, MACD, RSI) are evaluated as prefix series so a full
//! historical recompute costs one pass plus a bounded trailing window per index,
//! and yields exactly the values a latest-only computation over the same prefix
//! would produce.
//!
//! Sparse input never fails: each indicator resolves to a documented neutral or
//! degraded value instead.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::price::{PricePoint, SeriesPoint};

pub const SMA_SHORT_PERIOD: usize = 20;
pub const SMA_LONG_PERIOD: usize = 50;
pub const EMA_FAST_PERIOD: usize = 12;
pub const EMA_SLOW_PERIOD: usize = 26;
pub const MACD_SIGNAL_PERIOD: usize = 9;
pub const RSI_PERIOD: usize = 14;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_STD_MULT: f64 = 2.0;
/// Band half-width as a fraction of the mean when fewer than 20 points exist.
pub const BOLLINGER_FALLBACK_PCT: f64 = 0.02;
pub const STOCH_K_PERIOD: usize = 14;
pub const STOCH_D_PERIOD: usize = 3;
pub const ATR_PERIOD: usize = 14;
pub const VOLATILITY_PERIOD: usize = 20;
/// Fixed fraction used for the approximate MACD signal and stochastic %D.
pub const APPROX_SIGNAL_FRACTION: f64 = 0.9;

pub const RSI_NEUTRAL: f64 = 50.0;
pub const STOCH_NEUTRAL: f64 = 50.0;

/// How MACD signal and stochastic %D are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalMode {
    /// Fixed fraction of the primary value (`0.9 x macd`, `0.9 x %K`).
    #[default]
    Approximate,
    /// EMA(9) of the MACD series and SMA(3) of the %K series.
    Smoothed,
}

impl SignalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approximate => "approximate",
            Self::Smoothed => "smoothed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approximate" | "approx" => Some(Self::Approximate),
            "smoothed" | "ema" => Some(Self::Smoothed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IndicatorValues {
    pub sma_20: f64,
    pub sma_50: f64,
    pub ema_12: f64,
    pub ema_26: f64,
    pub rsi_14: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub atr_14: f64,
    pub volatility_20: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub symbol: String,
    pub ts_ms_utc: i64,
    /// Points consulted, i.e. the length of the causal prefix.
    pub sample_count: u32,
    #[serde(flatten)]
    pub values: IndicatorValues,
    pub computed_at_ms_utc: i64,
}

impl SeriesPoint for IndicatorRecord {
    fn ts_ms_utc(&self) -> i64 {
        self.ts_ms_utc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeCancelled {
    pub completed_indices: usize,
}

/// Mean of the last `n` values, or of all values if fewer exist.
pub fn sma(values: &[f64], n: usize) -> f64 {
    let window = trailing(values, n);
    if window.is_empty() {
        return 0.0;
    }
    window.iter().sum::<f64>() / window.len() as f64
}

/// Entry `j` equals `ema(&values[..=j], n)`.
///
/// Until `n` values exist the entry is the plain average of what is available;
/// at `n` it is the SMA seed, then `k = 2 / (n + 1)` smoothing.
pub fn ema_series(values: &[f64], n: usize) -> Vec<f64> {
    let n = n.max(1);
    let k = 2.0 / (n as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut running_sum = 0.0;

    for (idx, value) in values.iter().copied().enumerate() {
        if idx < n {
            running_sum += value;
            out.push(running_sum / (idx + 1) as f64);
        } else {
            let prev = out[idx - 1];
            out.push(value * k + prev * (1.0 - k));
        }
    }

    out
}

pub fn ema(values: &[f64], n: usize) -> f64 {
    ema_series(values, n).last().copied().unwrap_or(0.0)
}

/// Entry `j` equals `rsi(&closes[..=j], period)`.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    let period = period.max(1);
    let mut out = Vec::with_capacity(closes.len());
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for idx in 0..closes.len() {
        if idx < period {
            out.push(RSI_NEUTRAL);
            continue;
        }

        if idx == period {
            let (gain_sum, loss_sum) = closes[..=period]
                .windows(2)
                .map(|pair| pair[1] - pair[0])
                .fold((0.0, 0.0), |(gains, losses), change| {
                    if change > 0.0 {
                        (gains + change, losses)
                    } else {
                        (gains, losses - change)
                    }
                });
            avg_gain = gain_sum / period as f64;
            avg_loss = loss_sum / period as f64;
        } else {
            let change = closes[idx] - closes[idx - 1];
            let (gain, loss) = if change > 0.0 {
                (change, 0.0)
            } else {
                (0.0, -change)
            };
            avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
            avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        }

        out.push(rsi_from_averages(avg_gain, avg_loss));
    }

    out
}

/// Wilder RSI; 50 with fewer than `period + 1` closes, 100 when average loss is zero.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    rsi_series(closes, period)
        .last()
        .copied()
        .unwrap_or(RSI_NEUTRAL)
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// `(upper, middle, lower)`; `middle ± 2%` when fewer than `period` closes exist.
pub fn bollinger(closes: &[f64], period: usize, std_mult: f64) -> (f64, f64, f64) {
    let middle = sma(closes, period);
    if closes.len() < period || period == 0 {
        let half_width = middle.abs() * BOLLINGER_FALLBACK_PCT;
        return (middle + half_width, middle, middle - half_width);
    }

    let std_dev = population_std(trailing(closes, period), middle);
    (middle + std_mult * std_dev, middle, middle - std_mult * std_dev)
}

/// `%K` over the trailing `period` points; 50 on a zero high-low range.
pub fn stochastic_k(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> f64 {
    let Some(close) = closes.last().copied() else {
        return STOCH_NEUTRAL;
    };
    let highest = trailing(highs, period)
        .iter()
        .copied()
        .fold(f64::MIN, f64::max);
    let lowest = trailing(lows, period)
        .iter()
        .copied()
        .fold(f64::MAX, f64::min);
    let range = highest - lowest;
    if range.is_nan() || range <= 0.0 {
        return STOCH_NEUTRAL;
    }
    (close - lowest) / range * 100.0
}

/// Mean true range over up to `period` trailing periods.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> f64 {
    let n = closes.len().min(highs.len()).min(lows.len());
    match n {
        0 => 0.0,
        1 => highs[0] - lows[0],
        _ => {
            let periods = period.max(1).min(n - 1);
            let start = n - periods;
            let total: f64 = (start..n)
                .map(|i| {
                    let prev_close = closes[i - 1];
                    let high_low = highs[i] - lows[i];
                    let high_close = (highs[i] - prev_close).abs();
                    let low_close = (lows[i] - prev_close).abs();
                    high_low.max(high_close).max(low_close)
                })
                .sum();
            total / periods as f64
        }
    }
}

/// Population stddev of simple returns over the trailing `period` returns.
pub fn volatility(closes: &[f64], period: usize) -> f64 {
    if closes.len() < 3 {
        return 0.0;
    }
    let window = trailing(closes, period.saturating_add(1));
    let returns: Vec<f64> = window
        .windows(2)
        .map(|pair| {
            if pair[0] == 0.0 {
                0.0
            } else {
                pair[1] / pair[0] - 1.0
            }
        })
        .collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    population_std(&returns, mean)
}

fn population_std(window: &[f64], mean: f64) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let variance = window
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / window.len() as f64;
    variance.sqrt()
}

fn trailing(values: &[f64], n: usize) -> &[f64] {
    &values[values.len().saturating_sub(n)..]
}

/// Column views plus the prefix series needed by the recursive indicators.
struct PreparedSeries {
    closes: Vec<f64>,
    highs: Vec<f64>,
    lows: Vec<f64>,
    ema_fast: Vec<f64>,
    ema_slow: Vec<f64>,
    macd: Vec<f64>,
    macd_signal: Vec<f64>,
    rsi: Vec<f64>,
}

impl PreparedSeries {
    fn new(points: &[PricePoint]) -> Self {
        let closes: Vec<f64> = points.iter().map(|p| p.close).collect();
        let highs: Vec<f64> = points.iter().map(|p| p.high).collect();
        let lows: Vec<f64> = points.iter().map(|p| p.low).collect();
        let ema_fast = ema_series(&closes, EMA_FAST_PERIOD);
        let ema_slow = ema_series(&closes, EMA_SLOW_PERIOD);
        let macd: Vec<f64> = ema_fast
            .iter()
            .zip(&ema_slow)
            .map(|(fast, slow)| fast - slow)
            .collect();
        let macd_signal = ema_series(&macd, MACD_SIGNAL_PERIOD);
        let rsi = rsi_series(&closes, RSI_PERIOD);

        Self {
            closes,
            highs,
            lows,
            ema_fast,
            ema_slow,
            macd,
            macd_signal,
            rsi,
        }
    }

    fn values_at(&self, idx: usize, mode: SignalMode) -> IndicatorValues {
        let end = idx + 1;
        let closes = &self.closes[..end];
        let highs = &self.highs[..end];
        let lows = &self.lows[..end];

        let macd_line = self.macd[idx];
        let macd_signal = match mode {
            SignalMode::Approximate => macd_line * APPROX_SIGNAL_FRACTION,
            SignalMode::Smoothed => self.macd_signal[idx],
        };

        let stoch_k = stochastic_k(highs, lows, closes, STOCH_K_PERIOD);
        let stoch_d = match mode {
            SignalMode::Approximate => stoch_k * APPROX_SIGNAL_FRACTION,
            SignalMode::Smoothed => {
                let first = end.saturating_sub(STOCH_D_PERIOD);
                let k_values: Vec<f64> = (first..end)
                    .map(|j| {
                        stochastic_k(
                            &self.highs[..=j],
                            &self.lows[..=j],
                            &self.closes[..=j],
                            STOCH_K_PERIOD,
                        )
                    })
                    .collect();
                sma(&k_values, STOCH_D_PERIOD)
            }
        };

        let (bb_upper, bb_middle, bb_lower) =
            bollinger(closes, BOLLINGER_PERIOD, BOLLINGER_STD_MULT);

        IndicatorValues {
            sma_20: sma(closes, SMA_SHORT_PERIOD),
            sma_50: sma(closes, SMA_LONG_PERIOD),
            ema_12: self.ema_fast[idx],
            ema_26: self.ema_slow[idx],
            rsi_14: self.rsi[idx],
            macd_line,
            macd_signal,
            macd_histogram: macd_line - macd_signal,
            bb_upper,
            bb_middle,
            bb_lower,
            stoch_k,
            stoch_d,
            atr_14: atr(highs, lows, closes, ATR_PERIOD),
            volatility_20: volatility(closes, VOLATILITY_PERIOD),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndicatorEngine {
    mode: SignalMode,
}

impl IndicatorEngine {
    pub fn new(mode: SignalMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> SignalMode {
        self.mode
    }

    /// One record at the newest point. `None` only for an empty window; short
    /// windows yield degraded values.
    pub fn compute_latest(
        &self,
        symbol: &str,
        points: &[PricePoint],
        computed_at_ms_utc: i64,
    ) -> Option<IndicatorRecord> {
        let last = points.last()?;
        if points.len() < SMA_SHORT_PERIOD {
            debug!(
                component = "indicators",
                event = "indicators.degraded",
                symbol,
                sample_count = points.len(),
                required = SMA_SHORT_PERIOD
            );
        }

        let series = PreparedSeries::new(points);
        Some(IndicatorRecord {
            symbol: symbol.to_string(),
            ts_ms_utc: last.ts_ms_utc,
            sample_count: points.len() as u32,
            values: series.values_at(points.len() - 1, self.mode),
            computed_at_ms_utc,
        })
    }

    /// One record per index from `min_window - 1` onward, each using only
    /// `points[..=i]`. Stops at the first index boundary after cancellation.
    pub fn compute_history(
        &self,
        symbol: &str,
        points: &[PricePoint],
        min_window: usize,
        computed_at_ms_utc: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndicatorRecord>, ComputeCancelled> {
        let first = min_window.max(1) - 1;
        if points.len() <= first {
            debug!(
                component = "indicators",
                event = "indicators.history.insufficient",
                symbol,
                sample_count = points.len(),
                min_window
            );
            return Ok(Vec::new());
        }

        let series = PreparedSeries::new(points);
        let mut out = Vec::with_capacity(points.len() - first);
        for idx in first..points.len() {
            if cancel.is_cancelled() {
                return Err(ComputeCancelled {
                    completed_indices: out.len(),
                });
            }
            out.push(IndicatorRecord {
                symbol: symbol.to_string(),
                ts_ms_utc: points[idx].ts_ms_utc,
                sample_count: (idx + 1) as u32,
                values: series.values_at(idx, self.mode),
                computed_at_ms_utc,
            });
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closes(values: &[f64]) -> Vec<PricePoint> {
        values
            .iter()
            .enumerate()
            .map(|(idx, close)| PricePoint::new("BTC", idx as i64 * 3_600_000, *close))
            .collect()
    }

    fn wave(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.1)
            .collect()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn sma_uses_all_values_when_short() {
        assert_close(sma(&[1.0, 2.0, 3.0], 20), 2.0);
        assert_close(sma(&[1.0, 2.0, 3.0, 4.0], 2), 3.5);
        assert_eq!(sma(&[], 5), 0.0);
    }

    #[test]
    fn ema_is_seeded_with_sma_then_smoothed() {
        let values = [2.0, 4.0, 6.0, 8.0];
        let series = ema_series(&values, 3);
        assert_close(series[0], 2.0);
        assert_close(series[1], 3.0);
        assert_close(series[2], 4.0);
        // k = 0.5
        assert_close(series[3], 8.0 * 0.5 + 4.0 * 0.5);
        assert_close(ema(&values, 3), 6.0);
    }

    #[test]
    fn rsi_edges() {
        let short: Vec<f64> = (0..14).map(|i| i as f64).collect();
        assert_eq!(rsi(&short, 14), RSI_NEUTRAL);

        let rising: Vec<f64> = (0..15).map(|i| i as f64).collect();
        assert_eq!(rsi(&rising, 14), 100.0);

        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        assert_close(rsi(&falling, 14), 0.0);
    }

    #[test]
    fn rsi_matches_wilder_reference() {
        let values = wave(40);
        let changes: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
        let mut gain = changes[..14].iter().map(|c| c.max(0.0)).sum::<f64>() / 14.0;
        let mut loss = changes[..14].iter().map(|c| (-c).max(0.0)).sum::<f64>() / 14.0;
        for c in &changes[14..] {
            gain = (gain * 13.0 + c.max(0.0)) / 14.0;
            loss = (loss * 13.0 + (-c).max(0.0)) / 14.0;
        }
        let expected = 100.0 - 100.0 / (1.0 + gain / loss);
        assert_close(rsi(&values, 14), expected);
    }

    #[test]
    fn bollinger_falls_back_to_two_percent() {
        let (upper, middle, lower) = bollinger(&[100.0, 100.0], 20, 2.0);
        assert_close(middle, 100.0);
        assert_close(upper, 102.0);
        assert_close(lower, 98.0);
    }

    #[test]
    fn bollinger_uses_population_stddev() {
        let values: Vec<f64> = (1..=20).map(f64::from).collect();
        let (upper, middle, lower) = bollinger(&values, 20, 2.0);
        let variance = values.iter().map(|v| (v - 10.5).powi(2)).sum::<f64>() / 20.0;
        assert_close(middle, 10.5);
        assert_close(upper, 10.5 + 2.0 * variance.sqrt());
        assert_close(lower, 10.5 - 2.0 * variance.sqrt());
    }

    #[test]
    fn stochastic_is_neutral_on_flat_range() {
        assert_eq!(stochastic_k(&[5.0; 3], &[5.0; 3], &[5.0; 3], 14), STOCH_NEUTRAL);
        assert_eq!(stochastic_k(&[], &[], &[], 14), STOCH_NEUTRAL);
        assert_close(stochastic_k(&[10.0, 12.0], &[8.0, 9.0], &[9.0, 11.0], 14), 75.0);
    }

    #[test]
    fn atr_uses_true_range_with_previous_close() {
        assert_eq!(atr(&[], &[], &[], 14), 0.0);
        assert_close(atr(&[11.0], &[9.0], &[10.0], 14), 2.0);
        // gap up: |high - prev_close| dominates
        assert_close(atr(&[11.0, 20.0], &[9.0, 19.0], &[10.0, 19.5], 14), 10.0);
    }

    #[test]
    fn volatility_is_zero_without_enough_returns() {
        assert_eq!(volatility(&[100.0, 101.0], 20), 0.0);
        assert_eq!(volatility(&[100.0; 30], 20), 0.0);
        assert!(volatility(&wave(30), 20) > 0.0);
    }

    #[test]
    fn approximate_mode_uses_fixed_fractions() {
        let engine = IndicatorEngine::new(SignalMode::Approximate);
        let record = engine.compute_latest("BTC", &closes(&wave(60)), 0).unwrap();
        let v = record.values;
        assert_close(v.macd_line, v.ema_12 - v.ema_26);
        assert_close(v.macd_signal, v.macd_line * APPROX_SIGNAL_FRACTION);
        assert_close(v.macd_histogram, v.macd_line - v.macd_signal);
        assert_close(v.stoch_d, v.stoch_k * APPROX_SIGNAL_FRACTION);
    }

    #[test]
    fn smoothed_mode_uses_signal_series() {
        let values = wave(60);
        let points = closes(&values);
        let engine = IndicatorEngine::new(SignalMode::Smoothed);
        let record = engine.compute_latest("BTC", &points, 0).unwrap();

        let fast = ema_series(&values, 12);
        let slow = ema_series(&values, 26);
        let macd: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
        assert_close(record.values.macd_signal, ema(&macd, 9));

        let k: Vec<f64> = (57..60)
            .map(|j| stochastic_k(&values[..=j], &values[..=j], &values[..=j], 14))
            .collect();
        assert_close(record.values.stoch_d, k.iter().sum::<f64>() / 3.0);
        assert_ne!(
            record.values.macd_signal,
            record.values.macd_line * APPROX_SIGNAL_FRACTION
        );
    }

    #[test]
    fn latest_on_short_window_is_degraded_not_missing() {
        let engine = IndicatorEngine::default();
        let record = engine.compute_latest("BTC", &closes(&[10.0]), 7).unwrap();
        assert_eq!(record.sample_count, 1);
        assert_eq!(record.values.rsi_14, RSI_NEUTRAL);
        assert_close(record.values.sma_20, 10.0);
        assert_close(record.values.bb_upper, 10.2);
        assert_eq!(record.computed_at_ms_utc, 7);

        assert!(engine.compute_latest("BTC", &[], 7).is_none());
    }

    #[test]
    fn history_starts_at_min_window_and_honors_cancellation() {
        let engine = IndicatorEngine::default();
        let points = closes(&wave(30));
        let cancel = CancellationToken::new();

        let records = engine
            .compute_history("BTC", &points, 20, 0, &cancel)
            .unwrap();
        assert_eq!(records.len(), 11);
        assert_eq!(records[0].ts_ms_utc, points[19].ts_ms_utc);
        assert_eq!(records[0].sample_count, 20);

        cancel.cancel();
        let err = engine
            .compute_history("BTC", &points, 20, 0, &cancel)
            .unwrap_err();
        assert_eq!(err.completed_indices, 0);
    }

    #[test]
    fn signal_mode_parses_known_names() {
        assert_eq!(SignalMode::parse(" Smoothed "), Some(SignalMode::Smoothed));
        assert_eq!(SignalMode::parse("approx"), Some(SignalMode::Approximate));
        assert_eq!(SignalMode::parse("textbook"), None);
        assert_eq!(SignalMode::default().as_str(), "approximate");
    }
}
