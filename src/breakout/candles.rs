//! Candle aggregation over the sliding bar buffer
//!
//! The decision logic reasons in candles of `bars_per_candle` consecutive
//! bars so the same code drives both native resolutions. Candle boundaries
//! come from pure absolute-index arithmetic: the candle containing bar
//! `abs` starts at `(abs / bars_per_candle) * bars_per_candle` and closes
//! on its last bar. Aggregation never invents data: if any required bar
//! was evicted or has not arrived, the candle is simply unavailable.
//!
//! This module also owns the single candle strength classifier (volume
//! ratio vs trailing average + body size) used everywhere a momentum-grade
//! candle is required.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};

use super::bars::BarBuffer;

/// First absolute index of the candle containing `abs`
pub fn candle_start(abs: u64, bars_per_candle: u64) -> u64 {
    (abs / bars_per_candle) * bars_per_candle
}

/// Absolute index of the bar that closes the candle containing `abs`
pub fn candle_close_index(abs: u64, bars_per_candle: u64) -> u64 {
    candle_start(abs, bars_per_candle) + bars_per_candle - 1
}

/// True when `abs` is the last bar of its candle
pub fn is_candle_close(abs: u64, bars_per_candle: u64) -> bool {
    abs == candle_close_index(abs, bars_per_candle)
}

/// A fully-formed decision-granularity candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Absolute index of the candle's first bar
    pub start_abs: u64,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Body size as a percentage of the open
    pub fn body_pct(&self) -> f64 {
        if self.open == 0.0 {
            return 0.0;
        }
        (self.close - self.open).abs() / self.open * 100.0
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

/// Aggregate the candle containing `abs`, or `None` when the candle is not
/// fully closed yet or part of it has been evicted
pub fn candle_at(buffer: &BarBuffer, abs: u64, bars_per_candle: u64) -> Option<Candle> {
    let start = candle_start(abs, bars_per_candle);
    let bars = buffer.slice(start, start + bars_per_candle);
    if bars.is_empty() {
        return None;
    }

    let first = bars.first().copied()?;
    let last = bars.last().copied()?;
    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut volume = 0.0;
    for bar in &bars {
        high = high.max(bar.high);
        low = low.min(bar.low);
        volume += bar.volume;
    }

    Some(Candle {
        start_abs: start,
        open_time: first.timestamp,
        close_time: last.timestamp,
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
    })
}

/// Aggregate the candle immediately before the one containing `abs`
pub fn previous_candle(buffer: &BarBuffer, abs: u64, bars_per_candle: u64) -> Option<Candle> {
    let start = candle_start(abs, bars_per_candle);
    if start == 0 {
        return None;
    }
    candle_at(buffer, start - 1, bars_per_candle)
}

/// Average volume per candle over the whole candles preceding the one
/// containing `abs`, up to `lookback_candles` of them.
///
/// The window is defined in absolute indices, `max(0, start - k * bpc)`,
/// so it shortens only at session start, never because the buffer happens
/// to hold less history. A window that reaches into evicted bars is
/// unavailable (`None`), as is a window with no preceding whole candle.
pub fn trailing_volume_avg(
    buffer: &BarBuffer,
    abs: u64,
    bars_per_candle: u64,
    lookback_candles: u64,
) -> Option<f64> {
    let start = candle_start(abs, bars_per_candle);
    let from = start.saturating_sub(lookback_candles * bars_per_candle);
    if from == start {
        return None;
    }

    let bars = buffer.slice(from, start);
    if bars.is_empty() {
        return None;
    }

    let candle_count = ((start - from) / bars_per_candle) as f64;
    let total: f64 = bars.iter().map(|b| b.volume).sum();
    Some(total / candle_count)
}

/// Strength measurement for one closed candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandleStrength {
    /// Candle volume relative to the trailing per-candle average
    pub volume_ratio: f64,
    /// Body size as a percentage of the open
    pub body_pct: f64,
    /// True when both thresholds are met and the late-session rule did not
    /// downgrade the candle
    pub momentum: bool,
}

/// Classify a closed candle as momentum-grade or weak.
///
/// Momentum requires volume at or above `min_volume_ratio` times the
/// trailing average AND a body of at least `min_body_pct`. When
/// `late_session_cutoff_mins` is set (minutes after midnight Eastern),
/// candles closing at or after the cutoff are downgraded to weak
/// regardless of strength; late-day breakouts get no momentum credit.
pub fn classify(
    candle: &Candle,
    avg_volume: f64,
    min_volume_ratio: f64,
    min_body_pct: f64,
    late_session_cutoff_mins: Option<u32>,
) -> CandleStrength {
    let volume_ratio = if avg_volume > 0.0 {
        candle.volume / avg_volume
    } else {
        0.0
    };
    let body_pct = candle.body_pct();

    let mut momentum = volume_ratio >= min_volume_ratio && body_pct >= min_body_pct;

    if momentum {
        if let Some(cutoff) = late_session_cutoff_mins {
            let et = candle.close_time.with_timezone(&New_York);
            let mins = et.hour() * 60 + et.minute();
            if mins >= cutoff {
                momentum = false;
            }
        }
    }

    CandleStrength {
        volume_ratio,
        body_pct,
        momentum,
    }
}
