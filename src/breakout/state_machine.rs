//! Breakout confirmation state machine.
//!
//! A close through a pivot is not a trade. Most breakouts fail, so the
//! machine refuses to hand out an entry until the break proves itself one
//! of four ways:
//!
//! - the breakout candle itself closes momentum-grade (volume and body),
//! - a later candle upgrades a weak break with a momentum close beyond
//!   the pivot (delayed momentum),
//! - price pulls back to the pivot and bounces back through the realized
//!   breakout extreme on momentum (pullback retest),
//! - a weak break holds beyond the pivot long enough and then takes out
//!   the next reference level on momentum (sustained break).
//!
//! One evaluation per pushed bar, per symbol. Every evaluation returns a
//! [`Decision`] carrying the full memory snapshot; positive decisions add
//! an [`EntrySignal`]. The caller owns order placement.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::bars::{Bar, BarBuffer};
use super::candles;
use super::filters::{FilterChain, FilterContext};
use super::levels::{self, Direction, EvalInputs};
use super::memory::{
    BreakoutClass, BreakoutFacts, BreakoutMemory, BreakoutState, CandleCloseFacts, HoldFacts,
    PullbackFacts,
};

/// Tunables for the confirmation machine. All percentages are in percent
/// units (0.3 means 0.3%), all windows are explicit about bars vs candles
/// vs minutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakoutConfig {
    /// Bars aggregated into one decision candle (default: 12)
    pub bars_per_candle: u64,
    /// Whole candles behind the trailing volume average (default: 20)
    pub volume_lookback_candles: u64,
    /// Candle volume vs trailing average needed for momentum (default: 2.0)
    pub momentum_volume_ratio: f64,
    /// Candle body as % of open needed for momentum (default: 0.3)
    pub momentum_body_pct: f64,
    /// Downgrade momentum candles that close late in the session (default: true)
    pub late_session_downgrade: bool,
    /// Late-session cutoff hour, Eastern (default: 15)
    pub late_session_hour: u32,
    /// Late-session cutoff minute (default: 30)
    pub late_session_minute: u32,
    /// Closes within this % of the pivot start a pullback retest (default: 0.3)
    pub pullback_tolerance_pct: f64,
    /// Bounce must clear the realized extreme by this % (default: 0.05)
    pub retest_break_pct: f64,
    /// Minutes after the breakout during which a retest can still confirm
    /// (default: 45)
    pub max_retest_minutes: i64,
    /// Entries further than this % beyond the pivot are chasing (default: 1.0)
    pub max_entry_extension_pct: f64,
    /// Minutes a weak break must hold before the sustained check (default: 20)
    pub sustained_break_minutes: i64,
    /// Consecutive held candles the sustained check requires (default: 3)
    pub sustained_min_candles: u32,
    /// Closes back through the pivot by more than this % fail the hold
    /// (default: 0.2)
    pub sustained_tolerance_pct: f64,
    /// Minimum remaining % room to target for a sustained entry (default: 0.5)
    pub min_room_to_target_pct: f64,
    /// Attempts older than this many bars are expired (default: 600)
    pub max_breakout_age_bars: u64,
}

impl Default for BreakoutConfig {
    fn default() -> Self {
        Self {
            bars_per_candle: 12, // 12 x 5s bars = one-minute candles
            volume_lookback_candles: 20,
            momentum_volume_ratio: 2.0,
            momentum_body_pct: 0.3,
            late_session_downgrade: true,
            late_session_hour: 15, // 15:30 ET, last half hour gets no momentum credit
            late_session_minute: 30,
            pullback_tolerance_pct: 0.3,
            retest_break_pct: 0.05,
            max_retest_minutes: 45,
            max_entry_extension_pct: 1.0,
            sustained_break_minutes: 20,
            sustained_min_candles: 3,
            sustained_tolerance_pct: 0.2,
            min_room_to_target_pct: 0.5,
            max_breakout_age_bars: 600, // 50 minutes of 5s bars
        }
    }
}

impl BreakoutConfig {
    /// Late-session cutoff as minutes after midnight Eastern, when enabled
    pub fn late_session_cutoff(&self) -> Option<u32> {
        self.late_session_downgrade
            .then(|| self.late_session_hour * 60 + self.late_session_minute)
    }
}

/// Which confirmation path produced the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPath {
    Momentum,
    DelayedMomentum,
    PullbackRetest,
    SustainedBreak,
}

impl std::fmt::Display for EntryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryPath::Momentum => "MOMENTUM",
            EntryPath::DelayedMomentum => "DELAYED MOMENTUM",
            EntryPath::PullbackRetest => "PULLBACK RETEST",
            EntryPath::SustainedBreak => "SUSTAINED BREAK",
        };
        write!(f, "{}", s)
    }
}

/// Everything execution needs to act on a confirmed breakout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySignal {
    pub symbol: String,
    pub side: Direction,
    /// Price whose break the entry order should key off. The captured
    /// pivot, except on the retest path where it is the re-break level.
    pub trigger_price: f64,
    /// Tighter stop from the pullback extreme, retest path only
    pub adjusted_stop: Option<f64>,
    pub path: EntryPath,
    pub attempt_id: Uuid,
}

/// What one evaluation concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionKind {
    /// Nothing actionable on this bar
    Waiting,
    /// A required candle or lookback window is not available (yet, or evicted)
    NotReady,
    /// New breakout recorded, awaiting its candle close
    BreakoutDetected,
    /// Breakout candle closed weak; tracking continues
    WeakBreakout,
    /// Price pulled back near the pivot; waiting for the bounce
    PullbackStarted,
    /// Entry confirmed
    Entry,
    /// A confirmation filter vetoed the entry
    FilterVeto,
    /// Breakout candle closed back through the pivot
    FailedBreakout,
    /// A tracked close violated the pivot hold
    PivotViolation,
    /// Retest went stale or price ran too far to chase
    RetestRejected,
    /// Attempt aged out before confirming
    Expired,
}

/// Outcome of one evaluation. `diagnostics` is the serialized memory
/// record at decision time, for audit trails.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub should_enter: bool,
    pub kind: DecisionKind,
    pub reason: String,
    pub entry: Option<EntrySignal>,
    pub diagnostics: BTreeMap<String, Value>,
}

impl Decision {
    pub fn negative(
        kind: DecisionKind,
        reason: impl Into<String>,
        memory: &BreakoutMemory,
    ) -> Self {
        Self {
            should_enter: false,
            kind,
            reason: reason.into(),
            entry: None,
            diagnostics: memory.snapshot(),
        }
    }
}

/// The confirmation machine itself. Holds config and the filter chain;
/// all per-symbol state lives in the caller's [`BreakoutMemory`], so one
/// machine serves any number of symbols.
pub struct BreakoutStateMachine {
    config: BreakoutConfig,
    filters: FilterChain,
}

impl BreakoutStateMachine {
    pub fn new(config: BreakoutConfig) -> Self {
        Self {
            config,
            filters: FilterChain::empty(),
        }
    }

    pub fn with_filters(config: BreakoutConfig, filters: FilterChain) -> Self {
        Self { config, filters }
    }

    /// Evaluate one bar for one symbol. `current_abs` must be the index
    /// `buffer.push` assigned to `bar`. The buffer is never mutated here;
    /// only the memory record is.
    pub fn evaluate(
        &self,
        symbol: &str,
        buffer: &BarBuffer,
        memory: &mut BreakoutMemory,
        current_abs: u64,
        bar: &Bar,
        inputs: &EvalInputs<'_>,
    ) -> Decision {
        // A failed attempt resets before anything else so stale facts can
        // never wedge the symbol.
        if memory.state == BreakoutState::Failed {
            debug!(%symbol, "clearing failed attempt");
            memory.reset();
        }

        // Freshness guard: an attempt that has aged out dies here, before
        // any state handler can act on it.
        if let Some(age) = memory.age_bars(current_abs) {
            if age > self.config.max_breakout_age_bars {
                info!(%symbol, age, max = self.config.max_breakout_age_bars, "breakout expired");
                memory.state = BreakoutState::Failed;
                return Decision::negative(
                    DecisionKind::Expired,
                    format!(
                        "STALE: breakout aged {} bars, max {}",
                        age, self.config.max_breakout_age_bars
                    ),
                    memory,
                );
            }
        }

        memory.update_watermarks(bar);
        memory.last_eval_abs = Some(current_abs);
        memory.last_eval_time = Some(bar.timestamp);

        match memory.state {
            BreakoutState::Monitoring => self.monitor(symbol, memory, current_abs, bar, inputs),
            BreakoutState::BreakoutDetected => {
                self.await_candle_close(symbol, buffer, memory, current_abs, bar)
            }
            BreakoutState::WeakTracking => {
                self.track_weak(symbol, buffer, memory, current_abs, inputs)
            }
            BreakoutState::PullbackRetest => {
                self.track_retest(symbol, buffer, memory, current_abs, bar)
            }
            BreakoutState::CandleClosed
            | BreakoutState::SustainedBreak
            | BreakoutState::ReadyToEnter => unreachable!(
                "transient state {} persisted across evaluations",
                memory.state
            ),
            BreakoutState::Failed => unreachable!("failed state survived its reset"),
        }
    }

    /// Monitoring: watch for a close through the pivot. Detection only
    /// records the attempt; confirmation starts next evaluation.
    fn monitor(
        &self,
        symbol: &str,
        memory: &mut BreakoutMemory,
        current_abs: u64,
        bar: &Bar,
        inputs: &EvalInputs<'_>,
    ) -> Decision {
        if !inputs.side.is_beyond(bar.close, inputs.pivot) {
            return Decision::negative(
                DecisionKind::Waiting,
                format!("monitoring pivot {:.2}", inputs.pivot),
                memory,
            );
        }

        let attempt_id = Uuid::new_v4();
        memory.state = BreakoutState::BreakoutDetected;
        memory.side = Some(inputs.side);
        memory.breakout = Some(BreakoutFacts {
            attempt_id,
            abs_index: current_abs,
            time: bar.timestamp,
            price: bar.close,
            pivot: inputs.pivot,
            target: inputs.target,
        });
        memory.high_watermark = Some(bar.high);
        memory.low_watermark = Some(bar.low);

        info!(
            %symbol, side = %inputs.side, price = bar.close, pivot = inputs.pivot,
            %attempt_id, "breakout detected"
        );
        Decision::negative(
            DecisionKind::BreakoutDetected,
            format!(
                "{} break of pivot {:.2} at {:.2}, awaiting candle close",
                inputs.side, inputs.pivot, bar.close
            ),
            memory,
        )
    }

    /// BreakoutDetected: wait for the breakout's enclosing candle to close,
    /// then classify it. Processing requires at least one evaluation after
    /// detection, so a breakout on a candle's last bar is handled on the
    /// next bar.
    fn await_candle_close(
        &self,
        symbol: &str,
        buffer: &BarBuffer,
        memory: &mut BreakoutMemory,
        current_abs: u64,
        bar: &Bar,
    ) -> Decision {
        let Some(facts) = memory.breakout.clone() else {
            unreachable!("no breakout facts in BreakoutDetected")
        };
        let Some(side) = memory.side else {
            unreachable!("no side in BreakoutDetected")
        };

        let bpc = self.config.bars_per_candle;
        let close_abs = candles::candle_close_index(facts.abs_index, bpc);
        if current_abs < close_abs || current_abs <= facts.abs_index {
            return Decision::negative(
                DecisionKind::Waiting,
                format!("awaiting candle close at bar {}", close_abs),
                memory,
            );
        }

        let Some(candle) = candles::candle_at(buffer, facts.abs_index, bpc) else {
            return Decision::negative(
                DecisionKind::NotReady,
                "breakout candle unavailable",
                memory,
            );
        };
        let Some(avg_volume) = candles::trailing_volume_avg(
            buffer,
            facts.abs_index,
            bpc,
            self.config.volume_lookback_candles,
        ) else {
            return Decision::negative(
                DecisionKind::NotReady,
                "volume lookback unavailable",
                memory,
            );
        };

        // Candle closed back through the pivot: the break never held.
        if !side.is_beyond(candle.close, facts.pivot) {
            info!(%symbol, close = candle.close, pivot = facts.pivot, "breakout candle failed");
            memory.state = BreakoutState::Failed;
            return Decision::negative(
                DecisionKind::FailedBreakout,
                format!(
                    "FAILED: candle closed {:.2} back through pivot {:.2}",
                    candle.close, facts.pivot
                ),
                memory,
            );
        }

        let strength = candles::classify(
            &candle,
            avg_volume,
            self.config.momentum_volume_ratio,
            self.config.momentum_body_pct,
            self.config.late_session_cutoff(),
        );
        let class = if strength.momentum {
            BreakoutClass::Momentum
        } else {
            BreakoutClass::Weak
        };
        memory.state = BreakoutState::CandleClosed;
        memory.candle_close = Some(CandleCloseFacts {
            abs_index: close_abs,
            time: candle.close_time,
            close: candle.close,
            volume_ratio: strength.volume_ratio,
            body_pct: strength.body_pct,
            class,
        });
        info!(
            %symbol, %class, volume_ratio = strength.volume_ratio,
            body_pct = strength.body_pct, "breakout candle closed"
        );

        match class {
            BreakoutClass::Momentum => self.confirm_entry(
                symbol,
                buffer,
                memory,
                current_abs,
                EntryPath::Momentum,
                facts.pivot,
                None,
                bar.close,
                format!(
                    "MOMENTUM breakout: {:.1}x volume, {:.2}% body",
                    strength.volume_ratio, strength.body_pct
                ),
            ),
            BreakoutClass::Weak => {
                memory.state = BreakoutState::WeakTracking;
                memory.hold = Some(HoldFacts {
                    start_abs: close_abs,
                    start_time: candle.close_time,
                    candles_held: 0,
                });
                Decision::negative(
                    DecisionKind::WeakBreakout,
                    format!(
                        "WEAK breakout: {:.1}x volume, {:.2}% body, tracking",
                        strength.volume_ratio, strength.body_pct
                    ),
                    memory,
                )
            }
        }
    }

    /// WeakTracking: once per candle close, look for a delayed momentum
    /// upgrade, then a pullback toward the pivot, then a pivot violation,
    /// then (after the hold matures) the sustained-break check.
    fn track_weak(
        &self,
        symbol: &str,
        buffer: &BarBuffer,
        memory: &mut BreakoutMemory,
        current_abs: u64,
        inputs: &EvalInputs<'_>,
    ) -> Decision {
        let bpc = self.config.bars_per_candle;
        if !candles::is_candle_close(current_abs, bpc) {
            return Decision::negative(DecisionKind::Waiting, "tracking weak breakout", memory);
        }

        let Some(facts) = memory.breakout.clone() else {
            unreachable!("no breakout facts in WeakTracking")
        };
        let Some(side) = memory.side else {
            unreachable!("no side in WeakTracking")
        };

        let Some(candle) = candles::candle_at(buffer, current_abs, bpc) else {
            return Decision::negative(
                DecisionKind::NotReady,
                "tracking candle unavailable",
                memory,
            );
        };
        let Some(avg_volume) = candles::trailing_volume_avg(
            buffer,
            current_abs,
            bpc,
            self.config.volume_lookback_candles,
        ) else {
            return Decision::negative(
                DecisionKind::NotReady,
                "volume lookback unavailable",
                memory,
            );
        };
        let strength = candles::classify(
            &candle,
            avg_volume,
            self.config.momentum_volume_ratio,
            self.config.momentum_body_pct,
            self.config.late_session_cutoff(),
        );

        // Delayed momentum: a momentum-grade candle in the trade direction
        // closing beyond the pivot upgrades the weak break.
        let directional = match side {
            Direction::Long => candle.is_bullish(),
            Direction::Short => candle.close < candle.open,
        };
        if strength.momentum && directional && side.is_beyond(candle.close, facts.pivot) {
            info!(%symbol, volume_ratio = strength.volume_ratio, "delayed momentum upgrade");
            return self.confirm_entry(
                symbol,
                buffer,
                memory,
                current_abs,
                EntryPath::DelayedMomentum,
                facts.pivot,
                None,
                candle.close,
                format!(
                    "DELAYED MOMENTUM: {:.1}x volume, {:.2}% body beyond pivot {:.2}",
                    strength.volume_ratio, strength.body_pct, facts.pivot
                ),
            );
        }

        // Pullback: price re-approaching the pivot (from either side)
        // within tolerance starts the retest watch.
        let pivot_dist_pct = (candle.close - facts.pivot).abs() / facts.pivot * 100.0;
        if pivot_dist_pct <= self.config.pullback_tolerance_pct {
            let breakout_extreme = memory.realized_extreme(side).unwrap_or(facts.price);
            memory.state = BreakoutState::PullbackRetest;
            memory.pullback = Some(PullbackFacts {
                detected_at: candle.close_time,
                closest_price: candle.close,
                extreme: match side {
                    Direction::Long => candle.low,
                    Direction::Short => candle.high,
                },
                breakout_extreme,
            });
            info!(%symbol, close = candle.close, pivot = facts.pivot, "pullback started");
            return Decision::negative(
                DecisionKind::PullbackStarted,
                format!(
                    "pullback to {:.2}, within {:.2}% of pivot {:.2}",
                    candle.close, pivot_dist_pct, facts.pivot
                ),
                memory,
            );
        }

        // Any close back through the pivot beyond tolerance fails the hold
        // immediately.
        let deficit_pct = -side.distance_beyond(candle.close, facts.pivot) / facts.pivot * 100.0;
        if deficit_pct > self.config.sustained_tolerance_pct {
            info!(%symbol, close = candle.close, pivot = facts.pivot, "pivot hold violated");
            memory.state = BreakoutState::Failed;
            return Decision::negative(
                DecisionKind::PivotViolation,
                format!(
                    "FAILED: close {:.2} is {:.2}% back through pivot {:.2}",
                    candle.close, deficit_pct, facts.pivot
                ),
                memory,
            );
        }

        let Some(hold) = memory.hold.as_mut() else {
            unreachable!("no hold facts in WeakTracking")
        };
        hold.candles_held += 1;
        let candles_held = hold.candles_held;
        let elapsed_mins = (candle.close_time - hold.start_time).num_minutes();

        if elapsed_mins < self.config.sustained_break_minutes {
            return Decision::negative(
                DecisionKind::Waiting,
                format!(
                    "holding: {} candles, {}m of {}m",
                    candles_held, elapsed_mins, self.config.sustained_break_minutes
                ),
                memory,
            );
        }
        if candles_held < self.config.sustained_min_candles {
            return Decision::negative(
                DecisionKind::Waiting,
                format!(
                    "holding: {} of {} candles",
                    candles_held, self.config.sustained_min_candles
                ),
                memory,
            );
        }

        // Hold is mature. A sustained entry needs the next reference level
        // broken on momentum, with room left to the target.
        let Some(next_level) =
            levels::next_level_beyond(inputs.levels, facts.target, facts.pivot, side)
        else {
            return Decision::negative(
                DecisionKind::Waiting,
                "NO LEVEL: nothing beyond the pivot to confirm a sustained break against",
                memory,
            );
        };
        if !side.is_beyond(candle.close, next_level.price) {
            return Decision::negative(
                DecisionKind::Waiting,
                format!(
                    "held {} candles, next level {} {:.2} not broken",
                    candles_held, next_level.name, next_level.price
                ),
                memory,
            );
        }
        if !strength.momentum {
            return Decision::negative(
                DecisionKind::Waiting,
                format!(
                    "level {} broken without momentum ({:.1}x volume, {:.2}% body)",
                    next_level.name, strength.volume_ratio, strength.body_pct
                ),
                memory,
            );
        }
        let room_pct = side.distance_beyond(facts.target, candle.close) / candle.close * 100.0;
        if room_pct < self.config.min_room_to_target_pct {
            return Decision::negative(
                DecisionKind::Waiting,
                format!(
                    "sustained break but only {:.2}% room to target {:.2}",
                    room_pct, facts.target
                ),
                memory,
            );
        }

        memory.state = BreakoutState::SustainedBreak;
        info!(%symbol, level = %next_level.name, candles_held, "sustained break confirmed");
        self.confirm_entry(
            symbol,
            buffer,
            memory,
            current_abs,
            EntryPath::SustainedBreak,
            facts.pivot,
            None,
            candle.close,
            format!(
                "SUSTAINED: held {} candles {}m, broke {} {:.2} on {:.1}x volume",
                candles_held, elapsed_mins, next_level.name, next_level.price, strength.volume_ratio
            ),
        )
    }

    /// PullbackRetest: track the pullback extreme bar by bar; on each
    /// candle close, look for a momentum bounce back through the realized
    /// breakout extreme. A confirmed bounce still has to pass the
    /// staleness and anti-chasing gates.
    fn track_retest(
        &self,
        symbol: &str,
        buffer: &BarBuffer,
        memory: &mut BreakoutMemory,
        current_abs: u64,
        bar: &Bar,
    ) -> Decision {
        let Some(facts) = memory.breakout.clone() else {
            unreachable!("no breakout facts in PullbackRetest")
        };
        let Some(side) = memory.side else {
            unreachable!("no side in PullbackRetest")
        };

        {
            let Some(pullback) = memory.pullback.as_mut() else {
                unreachable!("no pullback facts in PullbackRetest")
            };
            match side {
                Direction::Long => pullback.extreme = pullback.extreme.min(bar.low),
                Direction::Short => pullback.extreme = pullback.extreme.max(bar.high),
            }
            if (bar.close - facts.pivot).abs() < (pullback.closest_price - facts.pivot).abs() {
                pullback.closest_price = bar.close;
            }
        }

        let bpc = self.config.bars_per_candle;
        if !candles::is_candle_close(current_abs, bpc) {
            return Decision::negative(DecisionKind::Waiting, "awaiting retest candle close", memory);
        }

        let Some(candle) = candles::candle_at(buffer, current_abs, bpc) else {
            return Decision::negative(DecisionKind::NotReady, "retest candle unavailable", memory);
        };
        let Some(avg_volume) = candles::trailing_volume_avg(
            buffer,
            current_abs,
            bpc,
            self.config.volume_lookback_candles,
        ) else {
            return Decision::negative(
                DecisionKind::NotReady,
                "volume lookback unavailable",
                memory,
            );
        };
        let Some(prev_candle) = candles::previous_candle(buffer, current_abs, bpc) else {
            return Decision::negative(
                DecisionKind::NotReady,
                "previous candle unavailable",
                memory,
            );
        };
        let Some(pullback) = memory.pullback.clone() else {
            unreachable!("no pullback facts in PullbackRetest")
        };

        let strength = candles::classify(
            &candle,
            avg_volume,
            self.config.momentum_volume_ratio,
            self.config.momentum_body_pct,
            self.config.late_session_cutoff(),
        );

        // The bounce must take out the extreme the breakout actually
        // reached, not just the pivot.
        let rebreak_level = match side {
            Direction::Long => pullback.breakout_extreme * (1.0 + self.config.retest_break_pct / 100.0),
            Direction::Short => pullback.breakout_extreme * (1.0 - self.config.retest_break_pct / 100.0),
        };
        let beyond_extreme = side.is_beyond(candle.close, rebreak_level);
        let directional = side.is_beyond(candle.close, prev_candle.close);
        if !(beyond_extreme && strength.momentum && directional) {
            return Decision::negative(
                DecisionKind::Waiting,
                format!(
                    "bounce unconfirmed: close {:.2} vs re-break {:.2}, {:.1}x volume",
                    candle.close, rebreak_level, strength.volume_ratio
                ),
                memory,
            );
        }

        let retest_mins = (candle.close_time - facts.time).num_minutes();
        if retest_mins > self.config.max_retest_minutes {
            info!(%symbol, retest_mins, "retest stale");
            let decision = Decision::negative(
                DecisionKind::RetestRejected,
                format!(
                    "STALE RETEST: {}m since breakout, max {}m",
                    retest_mins, self.config.max_retest_minutes
                ),
                memory,
            );
            memory.reset();
            return decision;
        }

        let extension_pct = side.distance_beyond(candle.close, facts.pivot) / facts.pivot * 100.0;
        if extension_pct > self.config.max_entry_extension_pct {
            info!(%symbol, extension_pct, "retest entry too extended");
            let decision = Decision::negative(
                DecisionKind::RetestRejected,
                format!(
                    "CHASING: close {:.2} is {:.2}% beyond pivot {:.2}, max {:.2}%",
                    candle.close, extension_pct, facts.pivot, self.config.max_entry_extension_pct
                ),
                memory,
            );
            memory.reset();
            return decision;
        }

        info!(%symbol, close = candle.close, stop = pullback.extreme, "retest bounce confirmed");
        self.confirm_entry(
            symbol,
            buffer,
            memory,
            current_abs,
            EntryPath::PullbackRetest,
            rebreak_level,
            Some(pullback.extreme),
            candle.close,
            format!(
                "PULLBACK RETEST: bounce to {:.2} through extreme {:.2} on {:.1}x volume",
                candle.close, pullback.breakout_extreme, strength.volume_ratio
            ),
        )
    }

    /// Run the filter chain and emit the entry (or the veto). Either way
    /// the attempt is consumed and the memory resets to Monitoring.
    #[allow(clippy::too_many_arguments)]
    fn confirm_entry(
        &self,
        symbol: &str,
        buffer: &BarBuffer,
        memory: &mut BreakoutMemory,
        current_abs: u64,
        path: EntryPath,
        trigger_price: f64,
        adjusted_stop: Option<f64>,
        price: f64,
        reason: String,
    ) -> Decision {
        let Some(facts) = memory.breakout.clone() else {
            unreachable!("no breakout facts at entry confirmation")
        };
        let Some(side) = memory.side else {
            unreachable!("no side at entry confirmation")
        };

        let ctx = FilterContext {
            symbol,
            side,
            buffer,
            current_abs,
            bars_per_candle: self.config.bars_per_candle,
            pivot: facts.pivot,
            target: facts.target,
            price,
        };
        if let Some(veto) = self.filters.check(&ctx) {
            info!(%symbol, filter = veto.filter, reason = %veto.reason, "entry vetoed");
            let decision = Decision::negative(
                DecisionKind::FilterVeto,
                format!("VETO {}: {}", veto.filter, veto.reason),
                memory,
            );
            memory.reset();
            return decision;
        }

        memory.state = BreakoutState::ReadyToEnter;
        memory.entry_reason = Some(reason.clone());
        info!(%symbol, %path, trigger = trigger_price, ?adjusted_stop, "entry confirmed");

        let decision = Decision {
            should_enter: true,
            kind: DecisionKind::Entry,
            reason,
            entry: Some(EntrySignal {
                symbol: symbol.to_string(),
                side,
                trigger_price,
                adjusted_stop,
                path,
                attempt_id: facts.attempt_id,
            }),
            diagnostics: memory.snapshot(),
        };
        memory.reset();
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakout::filters::{ConfirmationFilter, FilterVerdict};
    use crate::breakout::levels::ReferenceLevel;
    use chrono::{Duration, TimeZone, Utc};

    // One bar per minute so retest staleness windows are easy to reason
    // about. March 2025 is EDT: 14:30 UTC = 10:30 ET, well before the
    // late-session cutoff.
    fn bar_at(minute: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        let base = Utc.with_ymd_and_hms(2025, 3, 10, 14, 30, 0).unwrap();
        Bar {
            timestamp: base + Duration::minutes(minute),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    fn flat_bar(minute: i64, close: f64, volume: f64) -> Bar {
        bar_at(minute, close, close + 0.02, close - 0.02, close, volume)
    }

    fn test_config() -> BreakoutConfig {
        BreakoutConfig {
            bars_per_candle: 4,
            volume_lookback_candles: 2,
            sustained_break_minutes: 8,
            sustained_min_candles: 2,
            ..BreakoutConfig::default()
        }
    }

    fn drive(
        machine: &BreakoutStateMachine,
        buffer: &mut BarBuffer,
        memory: &mut BreakoutMemory,
        bar: Bar,
        inputs: &EvalInputs<'_>,
    ) -> Decision {
        let abs = buffer.push(bar);
        machine.evaluate("NQ", buffer, memory, abs, &bar, inputs)
    }

    /// Two quiet candles below the pivot: establishes the volume baseline
    /// (10.0/bar, 40.0/candle) without triggering a breakout.
    fn warmup(
        machine: &BreakoutStateMachine,
        buffer: &mut BarBuffer,
        memory: &mut BreakoutMemory,
        inputs: &EvalInputs<'_>,
    ) {
        for minute in 0..8 {
            let d = drive(machine, buffer, memory, flat_bar(minute, 99.5, 10.0), inputs);
            assert_eq!(d.kind, DecisionKind::Waiting);
        }
    }

    fn long_inputs(levels: &[ReferenceLevel]) -> EvalInputs<'_> {
        EvalInputs {
            side: Direction::Long,
            pivot: 100.0,
            target: 103.0,
            levels,
        }
    }

    #[test]
    fn test_momentum_breakout_enters_at_candle_close() {
        let machine = BreakoutStateMachine::new(test_config());
        let mut buffer = BarBuffer::new(240);
        let mut memory = BreakoutMemory::default();
        let inputs = long_inputs(&[]);
        warmup(&machine, &mut buffer, &mut memory, &inputs);

        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(8, 99.9, 100.2, 99.8, 100.1, 25.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::BreakoutDetected);
        assert_eq!(memory.state, BreakoutState::BreakoutDetected);

        for (minute, close) in [(9, 100.2), (10, 100.3)] {
            let d = drive(
                &machine,
                &mut buffer,
                &mut memory,
                bar_at(minute, close - 0.1, close + 0.1, close - 0.2, close, 25.0),
                &inputs,
            );
            assert_eq!(d.kind, DecisionKind::Waiting);
        }

        // Candle closes: volume 100 vs 40 average (2.5x), body
        // (100.45 - 99.9) / 99.9 = 0.55%. Momentum on both counts.
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(11, 100.3, 100.5, 100.2, 100.45, 25.0),
            &inputs,
        );
        assert!(d.should_enter);
        assert_eq!(d.kind, DecisionKind::Entry);
        assert!(d.reason.contains("MOMENTUM"), "reason: {}", d.reason);

        let entry = d.entry.unwrap();
        assert_eq!(entry.path, EntryPath::Momentum);
        assert_eq!(entry.trigger_price, 100.0);
        assert!(entry.adjusted_stop.is_none());
        // Attempt consumed: memory is armed for the next setup.
        assert_eq!(memory.state, BreakoutState::Monitoring);
        assert!(memory.breakout.is_none());
    }

    #[test]
    fn test_breakout_on_candle_close_bar_processes_next_bar() {
        let machine = BreakoutStateMachine::new(test_config());
        let mut buffer = BarBuffer::new(240);
        let mut memory = BreakoutMemory::default();
        let inputs = long_inputs(&[]);
        warmup(&machine, &mut buffer, &mut memory, &inputs);

        for minute in 8..11 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 99.7, 25.0), &inputs);
        }
        // Break happens on the candle's last bar. Detection only: a single
        // evaluation never goes from Monitoring to an entry.
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(11, 99.7, 100.5, 99.6, 100.4, 25.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::BreakoutDetected);
        assert_eq!(memory.state, BreakoutState::BreakoutDetected);

        // Next bar processes the already-closed candle.
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            flat_bar(12, 100.4, 10.0),
            &inputs,
        );
        assert!(d.should_enter);
        assert_eq!(d.entry.unwrap().path, EntryPath::Momentum);
    }

    #[test]
    fn test_candle_close_back_through_pivot_fails() {
        let machine = BreakoutStateMachine::new(test_config());
        let mut buffer = BarBuffer::new(240);
        let mut memory = BreakoutMemory::default();
        let inputs = long_inputs(&[]);
        warmup(&machine, &mut buffer, &mut memory, &inputs);

        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(8, 99.9, 100.2, 99.8, 100.1, 10.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::BreakoutDetected);

        for minute in 9..11 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 99.6, 10.0), &inputs);
        }
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            flat_bar(11, 99.4, 10.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::FailedBreakout);
        assert!(d.reason.contains("FAILED"), "reason: {}", d.reason);
        assert_eq!(memory.state, BreakoutState::Failed);

        // Next evaluation clears the wreck and goes back to watching.
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            flat_bar(12, 99.4, 10.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::Waiting);
        assert_eq!(memory.state, BreakoutState::Monitoring);
        assert!(memory.breakout.is_none());
    }

    #[test]
    fn test_weak_breakout_pullback_retest_entry() {
        let machine = BreakoutStateMachine::new(test_config());
        let mut buffer = BarBuffer::new(240);
        let mut memory = BreakoutMemory::default();
        let inputs = long_inputs(&[]);
        warmup(&machine, &mut buffer, &mut memory, &inputs);

        // Weak break: closes above the pivot on baseline volume.
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(8, 99.95, 100.04, 99.9, 100.02, 10.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::BreakoutDetected);
        for (minute, close, high) in [(9, 100.04, 100.05), (10, 100.05, 100.06)] {
            drive(
                &machine,
                &mut buffer,
                &mut memory,
                bar_at(minute, close - 0.02, high, close - 0.03, close, 10.0),
                &inputs,
            );
        }
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(11, 100.04, 100.07, 100.02, 100.05, 10.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::WeakBreakout);
        assert_eq!(memory.state, BreakoutState::WeakTracking);
        // Realized extreme so far: the high watermark at 100.07.

        // Drift back to the pivot; the dip to 99.98 must become the stop.
        for (minute, low, close) in [(12, 100.0, 100.04), (13, 100.0, 100.03), (14, 99.98, 100.0)] {
            drive(
                &machine,
                &mut buffer,
                &mut memory,
                bar_at(minute, close + 0.01, close + 0.02, low, close, 10.0),
                &inputs,
            );
        }
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(15, 100.01, 100.03, 100.0, 100.02, 10.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::PullbackStarted);
        assert_eq!(memory.state, BreakoutState::PullbackRetest);
        let pullback = memory.pullback.clone().unwrap();
        assert_eq!(pullback.extreme, 99.98);
        assert_eq!(pullback.breakout_extreme, 100.07);

        // Momentum bounce through the realized extreme: volume 88 vs 40
        // average (2.2x), body (100.5 - 100.05) / 100.05 = 0.45%.
        for (minute, close) in [(16, 100.15), (17, 100.3), (18, 100.4)] {
            let d = drive(
                &machine,
                &mut buffer,
                &mut memory,
                bar_at(minute, close - 0.1, close + 0.02, close - 0.12, close, 22.0),
                &inputs,
            );
            assert_eq!(d.kind, DecisionKind::Waiting);
        }
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(19, 100.45, 100.55, 100.35, 100.5, 22.0),
            &inputs,
        );
        assert!(d.should_enter, "reason: {}", d.reason);
        assert!(d.reason.contains("RETEST"), "reason: {}", d.reason);

        let entry = d.entry.unwrap();
        assert_eq!(entry.path, EntryPath::PullbackRetest);
        assert_eq!(entry.adjusted_stop, Some(99.98));
        // Trigger is the re-break level above the realized extreme.
        assert!((entry.trigger_price - 100.07 * 1.0005).abs() < 1e-9);
        assert_eq!(memory.state, BreakoutState::Monitoring);
    }

    #[test]
    fn test_delayed_momentum_upgrade() {
        let machine = BreakoutStateMachine::new(test_config());
        let mut buffer = BarBuffer::new(240);
        let mut memory = BreakoutMemory::default();
        let inputs = long_inputs(&[]);
        warmup(&machine, &mut buffer, &mut memory, &inputs);

        drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(8, 99.95, 100.1, 99.9, 100.05, 10.0),
            &inputs,
        );
        for minute in 9..12 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 100.05, 10.0), &inputs);
        }
        assert_eq!(memory.state, BreakoutState::WeakTracking);

        // Next candle is a proper momentum bar: 2.2x volume, 0.55% body.
        for (minute, close) in [(12, 100.2), (13, 100.35), (14, 100.5)] {
            drive(
                &machine,
                &mut buffer,
                &mut memory,
                bar_at(minute, close - 0.1, close + 0.02, close - 0.12, close, 22.0),
                &inputs,
            );
        }
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(15, 100.5, 100.65, 100.45, 100.6, 22.0),
            &inputs,
        );
        assert!(d.should_enter, "reason: {}", d.reason);
        assert!(d.reason.contains("DELAYED"), "reason: {}", d.reason);
        let entry = d.entry.unwrap();
        assert_eq!(entry.path, EntryPath::DelayedMomentum);
        assert_eq!(entry.trigger_price, 100.0);
    }

    #[test]
    fn test_pivot_violation_fails_then_resets() {
        let machine = BreakoutStateMachine::new(test_config());
        let mut buffer = BarBuffer::new(240);
        let mut memory = BreakoutMemory::default();
        let inputs = long_inputs(&[]);
        warmup(&machine, &mut buffer, &mut memory, &inputs);

        drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(8, 99.95, 100.1, 99.9, 100.05, 10.0),
            &inputs,
        );
        for minute in 9..12 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 100.05, 10.0), &inputs);
        }
        assert_eq!(memory.state, BreakoutState::WeakTracking);

        // Close 0.5% below the pivot: too deep for a pullback (0.3%) and
        // beyond the hold tolerance (0.2%).
        for minute in 12..16 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 99.5, 10.0), &inputs);
        }
        assert_eq!(memory.state, BreakoutState::Failed);

        let d = drive(&machine, &mut buffer, &mut memory, flat_bar(16, 99.5, 10.0), &inputs);
        assert_eq!(d.kind, DecisionKind::Waiting);
        assert_eq!(memory.state, BreakoutState::Monitoring);
    }

    #[test]
    fn test_sustained_break_through_next_level() {
        let machine = BreakoutStateMachine::new(test_config());
        let mut buffer = BarBuffer::new(240);
        let mut memory = BreakoutMemory::default();
        let levels = [ReferenceLevel::new("SMA50", 100.8)];
        let inputs = long_inputs(&levels);
        warmup(&machine, &mut buffer, &mut memory, &inputs);

        // Weak break that holds well above the pivot.
        drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(8, 99.95, 100.35, 99.9, 100.3, 10.0),
            &inputs,
        );
        for minute in 9..12 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 100.3, 10.0), &inputs);
        }
        assert_eq!(memory.state, BreakoutState::WeakTracking);

        // First held candle: hold not yet mature (4m of 8m).
        for minute in 12..16 {
            let d = drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 100.4, 10.0), &inputs);
            if minute == 15 {
                assert_eq!(d.kind, DecisionKind::Waiting);
                assert!(d.reason.contains("holding"), "reason: {}", d.reason);
            }
        }
        assert_eq!(memory.hold.as_ref().unwrap().candles_held, 1);

        // Second candle gaps through SMA50 and closes red on heavy volume:
        // 2.5x volume, body (101.4 - 101.0) / 101.4 = 0.39%. Not a bullish
        // candle, so no delayed-momentum upgrade; this is the sustained
        // path confirming on a level break.
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(16, 101.4, 101.5, 101.0, 101.2, 25.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::Waiting);
        for (minute, close) in [(17, 101.1), (18, 101.05)] {
            drive(
                &machine,
                &mut buffer,
                &mut memory,
                bar_at(minute, close + 0.05, close + 0.1, close - 0.05, close, 25.0),
                &inputs,
            );
        }
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(19, 101.05, 101.1, 100.95, 101.0, 25.0),
            &inputs,
        );
        assert!(d.should_enter, "reason: {}", d.reason);
        assert!(d.reason.contains("SUSTAINED"), "reason: {}", d.reason);
        assert!(d.reason.contains("SMA50"), "reason: {}", d.reason);
        let entry = d.entry.unwrap();
        assert_eq!(entry.path, EntryPath::SustainedBreak);
        assert_eq!(entry.trigger_price, 100.0);
    }

    #[test]
    fn test_stale_breakout_expires_then_recovers() {
        let config = test_config();
        let machine = BreakoutStateMachine::new(config);
        let mut buffer = BarBuffer::new(16);
        let mut memory = BreakoutMemory::default();
        let inputs = long_inputs(&[]);

        // Arm an attempt at bar 100 directly; everything since has been
        // evicted, so only the freshness guard can act.
        for minute in 0..701 {
            buffer.push(flat_bar(minute, 99.5, 10.0));
        }
        memory.state = BreakoutState::WeakTracking;
        memory.side = Some(Direction::Long);
        memory.breakout = Some(BreakoutFacts {
            attempt_id: Uuid::new_v4(),
            abs_index: 100,
            time: Utc.with_ymd_and_hms(2025, 3, 10, 14, 30, 0).unwrap(),
            price: 100.05,
            pivot: 100.0,
            target: 103.0,
        });
        memory.hold = Some(HoldFacts {
            start_abs: 103,
            start_time: Utc.with_ymd_and_hms(2025, 3, 10, 14, 33, 0).unwrap(),
            candles_held: 5,
        });

        // Age 600 exactly: still inside the window.
        let bar = flat_bar(700, 99.5, 10.0);
        let d = machine.evaluate("NQ", &buffer, &mut memory, 700, &bar, &inputs);
        assert_eq!(d.kind, DecisionKind::Waiting);

        // Age 601: expired, attempt force-failed.
        let bar = flat_bar(701, 99.5, 10.0);
        let abs = buffer.push(bar);
        let d = machine.evaluate("NQ", &buffer, &mut memory, abs, &bar, &inputs);
        assert_eq!(d.kind, DecisionKind::Expired);
        assert!(d.reason.contains("STALE"), "reason: {}", d.reason);
        assert_eq!(memory.state, BreakoutState::Failed);

        // And the next evaluation is a clean Monitoring pass.
        let bar = flat_bar(702, 99.5, 10.0);
        let abs = buffer.push(bar);
        let d = machine.evaluate("NQ", &buffer, &mut memory, abs, &bar, &inputs);
        assert_eq!(d.kind, DecisionKind::Waiting);
        assert_eq!(memory.state, BreakoutState::Monitoring);
        assert!(memory.breakout.is_none());
    }

    #[test]
    fn test_evicted_windows_refuse_instead_of_shifting() {
        let machine = BreakoutStateMachine::new(test_config());
        // Tiny buffer: the volume lookback is evicted by the time the
        // breakout candle closes, and the candle itself soon after.
        let mut buffer = BarBuffer::new(8);
        let mut memory = BreakoutMemory::default();
        let inputs = long_inputs(&[]);

        for minute in 0..8 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 99.5, 10.0), &inputs);
        }
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(8, 99.9, 100.2, 99.8, 100.1, 25.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::BreakoutDetected);

        for minute in 9..11 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 100.2, 25.0), &inputs);
        }
        // Candle close: bars 8..11 are live but the volume baseline
        // (bars 0..8) is gone. Refuse, keep waiting.
        let d = drive(&machine, &mut buffer, &mut memory, flat_bar(11, 100.3, 25.0), &inputs);
        assert_eq!(d.kind, DecisionKind::NotReady);
        assert!(d.reason.contains("volume"), "reason: {}", d.reason);
        assert_eq!(memory.state, BreakoutState::BreakoutDetected);

        // Push until the breakout candle itself is evicted: still NotReady,
        // never a decision computed from a shifted window.
        for minute in 12..20 {
            let d = drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 100.3, 25.0), &inputs);
            assert_eq!(d.kind, DecisionKind::NotReady);
        }
        assert!(buffer.get(8).is_none());
        let d = drive(&machine, &mut buffer, &mut memory, flat_bar(20, 100.3, 25.0), &inputs);
        assert_eq!(d.kind, DecisionKind::NotReady);
        assert!(d.reason.contains("candle unavailable"), "reason: {}", d.reason);
        assert_eq!(memory.breakout.as_ref().unwrap().abs_index, 8);
    }

    #[test]
    fn test_eviction_never_changes_a_computable_decision() {
        // Same bar sequence through a roomy buffer and through one just
        // deep enough to keep every window an evaluation needs. The tight
        // buffer drops the warmup bars along the way; as long as each
        // decision stays computable it must come out identical.
        let mut bars = Vec::new();
        for minute in 0..8 {
            bars.push(flat_bar(minute, 99.5, 10.0));
        }
        bars.push(bar_at(8, 99.95, 100.04, 99.9, 100.02, 10.0));
        for (minute, close, high) in [(9, 100.04, 100.05), (10, 100.05, 100.06)] {
            bars.push(bar_at(minute, close - 0.02, high, close - 0.03, close, 10.0));
        }
        bars.push(bar_at(11, 100.04, 100.07, 100.02, 100.05, 10.0));
        for (minute, low, close) in [(12, 100.0, 100.04), (13, 100.0, 100.03), (14, 99.98, 100.0)] {
            bars.push(bar_at(minute, close + 0.01, close + 0.02, low, close, 10.0));
        }
        bars.push(bar_at(15, 100.01, 100.03, 100.0, 100.02, 10.0));
        for (minute, close) in [(16, 100.15), (17, 100.3), (18, 100.4)] {
            bars.push(bar_at(minute, close - 0.1, close + 0.02, close - 0.12, close, 22.0));
        }
        bars.push(bar_at(19, 100.45, 100.55, 100.35, 100.5, 22.0));

        let machine = BreakoutStateMachine::new(test_config());
        let inputs = long_inputs(&[]);
        let mut wide = BarBuffer::new(240);
        let mut wide_memory = BreakoutMemory::default();
        // Deepest window below: bounce candle at 16 plus its previous
        // candle and the two-candle volume baseline back to bar 8.
        let mut tight = BarBuffer::new(12);
        let mut tight_memory = BreakoutMemory::default();

        let mut last = None;
        for bar in &bars {
            let a = drive(&machine, &mut wide, &mut wide_memory, *bar, &inputs);
            let b = drive(&machine, &mut tight, &mut tight_memory, *bar, &inputs);
            assert_eq!(b.kind, a.kind, "diverged at {}", bar.timestamp);
            assert_eq!(b.reason, a.reason, "diverged at {}", bar.timestamp);
            last = Some((a, b));
        }

        // The tight buffer really did evict the warmup mid-run.
        assert_eq!(wide.oldest_index(), Some(0));
        assert_eq!(tight.oldest_index(), Some(8));

        let (a, b) = last.unwrap();
        assert!(a.should_enter, "reason: {}", a.reason);
        let (a, b) = (a.entry.unwrap(), b.entry.unwrap());
        assert_eq!(a.path, EntryPath::PullbackRetest);
        assert_eq!(b.path, a.path);
        assert_eq!(b.trigger_price, a.trigger_price);
        assert_eq!(b.adjusted_stop, a.adjusted_stop);
    }

    #[test]
    fn test_stale_retest_rejected() {
        let config = BreakoutConfig {
            max_retest_minutes: 10,
            ..test_config()
        };
        let machine = BreakoutStateMachine::new(config);
        let mut buffer = BarBuffer::new(240);
        let mut memory = BreakoutMemory::default();
        let inputs = long_inputs(&[]);
        warmup(&machine, &mut buffer, &mut memory, &inputs);

        drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(8, 99.95, 100.07, 99.9, 100.02, 10.0),
            &inputs,
        );
        for minute in 9..12 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 100.05, 10.0), &inputs);
        }
        for minute in 12..16 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 100.02, 10.0), &inputs);
        }
        assert_eq!(memory.state, BreakoutState::PullbackRetest);

        // The bounce confirms at minute 19, 11 minutes after the breakout,
        // past the 10 minute retest window.
        for (minute, close) in [(16, 100.15), (17, 100.3), (18, 100.4)] {
            drive(
                &machine,
                &mut buffer,
                &mut memory,
                bar_at(minute, close - 0.1, close + 0.02, close - 0.12, close, 22.0),
                &inputs,
            );
        }
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(19, 100.45, 100.55, 100.35, 100.5, 22.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::RetestRejected);
        assert!(d.reason.contains("STALE RETEST"), "reason: {}", d.reason);
        assert_eq!(memory.state, BreakoutState::Monitoring);
    }

    #[test]
    fn test_overextended_retest_rejected_as_chasing() {
        let machine = BreakoutStateMachine::new(test_config());
        let mut buffer = BarBuffer::new(240);
        let mut memory = BreakoutMemory::default();
        let inputs = long_inputs(&[]);
        warmup(&machine, &mut buffer, &mut memory, &inputs);

        drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(8, 99.95, 100.07, 99.9, 100.02, 10.0),
            &inputs,
        );
        for minute in 9..12 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 100.05, 10.0), &inputs);
        }
        for minute in 12..16 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 100.02, 10.0), &inputs);
        }
        assert_eq!(memory.state, BreakoutState::PullbackRetest);

        // Bounce is real but closes 1.5% above the pivot: too far to chase.
        for (minute, close) in [(16, 100.5), (17, 100.9), (18, 101.2)] {
            drive(
                &machine,
                &mut buffer,
                &mut memory,
                bar_at(minute, close - 0.2, close + 0.05, close - 0.25, close, 22.0),
                &inputs,
            );
        }
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(19, 101.3, 101.55, 101.25, 101.5, 22.0),
            &inputs,
        );
        assert_eq!(d.kind, DecisionKind::RetestRejected);
        assert!(d.reason.contains("CHASING"), "reason: {}", d.reason);
        assert_eq!(memory.state, BreakoutState::Monitoring);
    }

    struct AlwaysBlock;

    impl ConfirmationFilter for AlwaysBlock {
        fn name(&self) -> &'static str {
            "always-block"
        }

        fn evaluate(&self, _ctx: &FilterContext<'_>) -> FilterVerdict {
            FilterVerdict::block("blocked for the test")
        }
    }

    #[test]
    fn test_filter_veto_consumes_the_attempt() {
        let mut chain = FilterChain::empty();
        chain.push(Box::new(AlwaysBlock));
        let machine = BreakoutStateMachine::with_filters(test_config(), chain);
        let mut buffer = BarBuffer::new(240);
        let mut memory = BreakoutMemory::default();
        let inputs = long_inputs(&[]);
        warmup(&machine, &mut buffer, &mut memory, &inputs);

        drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(8, 99.9, 100.2, 99.8, 100.1, 25.0),
            &inputs,
        );
        for minute in 9..11 {
            drive(&machine, &mut buffer, &mut memory, flat_bar(minute, 100.2, 25.0), &inputs);
        }
        let d = drive(
            &machine,
            &mut buffer,
            &mut memory,
            bar_at(11, 100.3, 100.5, 100.2, 100.45, 25.0),
            &inputs,
        );
        assert!(!d.should_enter);
        assert_eq!(d.kind, DecisionKind::FilterVeto);
        assert!(d.reason.contains("always-block"), "reason: {}", d.reason);
        assert!(d.entry.is_none());
        assert_eq!(memory.state, BreakoutState::Monitoring);
        assert!(memory.breakout.is_none());
    }
}
