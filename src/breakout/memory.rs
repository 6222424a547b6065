//! Per-symbol breakout memory
//!
//! Exactly one breakout attempt is remembered per symbol. The record keeps
//! the machine state plus grouped fact records, each written by the phase
//! that owns it: detection facts, the confirming candle close, pullback
//! tracking, and sustained-hold bookkeeping. Reset wipes everything, so a
//! later attempt can never read facts left behind by an earlier one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::bars::Bar;
use super::levels::Direction;

/// State of the breakout confirmation machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakoutState {
    /// Watching for a close through the pivot
    Monitoring,
    /// Pivot crossed, waiting for the enclosing candle to close
    BreakoutDetected,
    /// Enclosing candle closed and classified (transient)
    CandleClosed,
    /// Weak breakout being tracked candle by candle
    WeakTracking,
    /// Price pulled back near the pivot, waiting for the bounce
    PullbackRetest,
    /// Matured hold broke the next reference level (transient)
    SustainedBreak,
    /// Entry decision emitted (transient)
    ReadyToEnter,
    /// Attempt abandoned; resets to Monitoring on the next evaluation
    Failed,
}

impl std::fmt::Display for BreakoutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakoutState::Monitoring => write!(f, "MONITORING"),
            BreakoutState::BreakoutDetected => write!(f, "BREAKOUT"),
            BreakoutState::CandleClosed => write!(f, "CANDLE_CLOSED"),
            BreakoutState::WeakTracking => write!(f, "WEAK_TRACKING"),
            BreakoutState::PullbackRetest => write!(f, "PULLBACK_RETEST"),
            BreakoutState::SustainedBreak => write!(f, "SUSTAINED_BREAK"),
            BreakoutState::ReadyToEnter => write!(f, "READY"),
            BreakoutState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Strength classification, derived once per confirming candle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakoutClass {
    Momentum,
    Weak,
}

impl std::fmt::Display for BreakoutClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakoutClass::Momentum => write!(f, "MOMENTUM"),
            BreakoutClass::Weak => write!(f, "WEAK"),
        }
    }
}

/// Facts captured the moment a close crosses the pivot
#[derive(Debug, Clone, Serialize)]
pub struct BreakoutFacts {
    pub attempt_id: Uuid,
    pub abs_index: u64,
    pub time: DateTime<Utc>,
    /// Bar close that crossed the pivot
    pub price: f64,
    /// Pivot as supplied at detection time
    pub pivot: f64,
    /// Target as supplied at detection time
    pub target: f64,
}

/// Facts from the enclosing candle's close
#[derive(Debug, Clone, Serialize)]
pub struct CandleCloseFacts {
    pub abs_index: u64,
    pub time: DateTime<Utc>,
    pub close: f64,
    pub volume_ratio: f64,
    pub body_pct: f64,
    pub class: BreakoutClass,
}

/// Pullback tracking while in PullbackRetest
#[derive(Debug, Clone, Serialize)]
pub struct PullbackFacts {
    pub detected_at: DateTime<Utc>,
    /// Closest the price has come to the pivot during the pullback
    pub closest_price: f64,
    /// Deepest point reached: lowest low for Long, highest high for Short.
    /// Becomes the adjusted stop if the retest confirms.
    pub extreme: f64,
    /// Realized breakout extreme frozen when the pullback began; the
    /// bounce must clear this, not the original pivot
    pub breakout_extreme: f64,
}

/// Sustained-hold bookkeeping while in WeakTracking
#[derive(Debug, Clone, Serialize)]
pub struct HoldFacts {
    pub start_abs: u64,
    pub start_time: DateTime<Utc>,
    /// Consecutive candle closes held beyond the pivot since the hold began
    pub candles_held: u32,
}

/// The one-per-symbol memory record
#[derive(Debug, Clone, Serialize)]
pub struct BreakoutMemory {
    pub state: BreakoutState,
    pub side: Option<Direction>,
    pub breakout: Option<BreakoutFacts>,
    pub candle_close: Option<CandleCloseFacts>,
    pub pullback: Option<PullbackFacts>,
    pub hold: Option<HoldFacts>,
    /// Highest high seen since the breakout bar
    pub high_watermark: Option<f64>,
    /// Lowest low seen since the breakout bar
    pub low_watermark: Option<f64>,
    pub last_eval_abs: Option<u64>,
    pub last_eval_time: Option<DateTime<Utc>>,
    pub entry_reason: Option<String>,
    /// Free-form observability payload; never read by the decision logic
    pub diagnostics: BTreeMap<String, Value>,
}

impl Default for BreakoutMemory {
    fn default() -> Self {
        Self {
            state: BreakoutState::Monitoring,
            side: None,
            breakout: None,
            candle_close: None,
            pullback: None,
            hold: None,
            high_watermark: None,
            low_watermark: None,
            last_eval_abs: None,
            last_eval_time: None,
            entry_reason: None,
            diagnostics: BTreeMap::new(),
        }
    }
}

impl BreakoutMemory {
    /// Wipe the record back to Monitoring with no facts
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Bars elapsed since the breakout, if an attempt is active
    pub fn age_bars(&self, current_abs: u64) -> Option<u64> {
        self.breakout
            .as_ref()
            .map(|b| current_abs.saturating_sub(b.abs_index))
    }

    /// Extend the running extremes with a new bar (active attempts only)
    pub fn update_watermarks(&mut self, bar: &Bar) {
        if self.breakout.is_none() {
            return;
        }
        self.high_watermark = Some(match self.high_watermark {
            Some(h) => h.max(bar.high),
            None => bar.high,
        });
        self.low_watermark = Some(match self.low_watermark {
            Some(l) => l.min(bar.low),
            None => bar.low,
        });
    }

    /// The realized breakout extreme in the trade direction: the high
    /// watermark for Long, the low watermark for Short
    pub fn realized_extreme(&self, side: Direction) -> Option<f64> {
        match side {
            Direction::Long => self.high_watermark,
            Direction::Short => self.low_watermark,
        }
    }

    /// Serialize the whole record as a diagnostic map
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }
}
