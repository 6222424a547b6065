//! Confirmation filters
//!
//! Last line of defense before an entry decision goes out. Each filter is
//! a pure yes/no gate over the recent bars/candles; the state machine never
//! knows their internals, it only runs the chain immediately before
//! emitting and reports the first veto's reason. A disabled filter is never
//! consulted.
//!
//! The built-ins are deliberately simple reads of the same OHLCV window the
//! machine already keeps: directional volume flow, stochastic position,
//! rotation counting, and remaining room to the target.

use serde::{Deserialize, Serialize};

use super::bars::{Bar, BarBuffer};
use super::candles::{self, Candle};
use super::levels::Direction;

/// Everything a filter may look at
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    pub symbol: &'a str,
    pub side: Direction,
    pub buffer: &'a BarBuffer,
    pub current_abs: u64,
    pub bars_per_candle: u64,
    pub pivot: f64,
    pub target: f64,
    /// Last traded price at evaluation time
    pub price: f64,
}

impl<'a> FilterContext<'a> {
    /// Most recent whole candles ending at or before the current bar,
    /// oldest first. Shorter than `count` near session start; empty when
    /// the window reaches into evicted bars.
    pub fn recent_candles(&self, count: usize) -> Vec<Candle> {
        let bpc = self.bars_per_candle;
        let mut out = Vec::with_capacity(count);
        let mut anchor = Some(candles::candle_start(self.current_abs, bpc));
        while let Some(start) = anchor {
            if out.len() == count {
                break;
            }
            match candles::candle_at(self.buffer, start, bpc) {
                Some(c) => out.push(c),
                // The current candle may still be forming; anything older
                // that is missing means eviction. No partial windows.
                None if out.is_empty() => {}
                None => return Vec::new(),
            }
            anchor = start.checked_sub(bpc);
        }
        out.reverse();
        out
    }

    /// Last `lookback` bars up to and including the current one, oldest
    /// first. Empty when part of the window has been evicted.
    pub fn recent_bars(&self, lookback: usize) -> Vec<Bar> {
        let end = self.current_abs + 1;
        let start = end.saturating_sub(lookback as u64);
        self.buffer.slice(start, end)
    }
}

/// Outcome of one filter evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterVerdict {
    pub blocks: bool,
    pub reason: String,
}

impl FilterVerdict {
    pub fn pass() -> Self {
        Self {
            blocks: false,
            reason: String::new(),
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            blocks: true,
            reason: reason.into(),
        }
    }
}

/// A pluggable entry gate
pub trait ConfirmationFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, ctx: &FilterContext<'_>) -> FilterVerdict;
}

/// First veto found by the chain
#[derive(Debug, Clone)]
pub struct FilterVeto {
    pub filter: &'static str,
    pub reason: String,
}

/// Ordered set of enabled filters, short-circuiting on the first veto
pub struct FilterChain {
    filters: Vec<Box<dyn ConfirmationFilter>>,
}

impl FilterChain {
    pub fn empty() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    /// Build the chain from config, installing only enabled filters
    pub fn from_config(config: &FiltersConfig) -> Self {
        let mut chain = Self::empty();
        if config.volume_trend.enabled {
            chain.push(Box::new(VolumeTrendFilter {
                lookback_candles: config.volume_trend.lookback_candles,
            }));
        }
        if config.stochastic.enabled {
            chain.push(Box::new(StochasticFilter {
                lookback_bars: config.stochastic.lookback_bars,
                min_percent_k: config.stochastic.min_percent_k,
            }));
        }
        if config.choppiness.enabled {
            chain.push(Box::new(ChoppinessFilter {
                lookback_candles: config.choppiness.lookback_candles,
                max_crosses: config.choppiness.max_crosses,
            }));
        }
        if config.room.enabled {
            chain.push(Box::new(RoomToTargetFilter {
                min_room_pct: config.room.min_room_pct,
            }));
        }
        chain
    }

    pub fn push(&mut self, filter: Box<dyn ConfirmationFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the chain; `None` means every enabled filter passed
    pub fn check(&self, ctx: &FilterContext<'_>) -> Option<FilterVeto> {
        for filter in &self.filters {
            let verdict = filter.evaluate(ctx);
            if verdict.blocks {
                return Some(FilterVeto {
                    filter: filter.name(),
                    reason: verdict.reason,
                });
            }
        }
        None
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.filters.iter().map(|x| x.name()).collect();
        f.debug_struct("FilterChain").field("filters", &names).finish()
    }
}

/// Configuration for the volume trend filter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeTrendConfig {
    pub enabled: bool,
    /// Whole candles to sum directional flow over (default: 5)
    pub lookback_candles: usize,
}

impl Default for VolumeTrendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_candles: 5,
        }
    }
}

/// Configuration for the stochastic momentum filter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StochasticConfig {
    pub enabled: bool,
    /// Bars in the %K window (default: 28)
    pub lookback_bars: usize,
    /// Minimum %K for Long entries; Short requires at most 100 - this
    /// (default: 60.0)
    pub min_percent_k: f64,
}

impl Default for StochasticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_bars: 28,
            min_percent_k: 60.0,
        }
    }
}

/// Configuration for the choppiness filter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChoppinessConfig {
    pub enabled: bool,
    /// Whole candles in the rotation window (default: 10)
    pub lookback_candles: usize,
    /// Mean-crosses above this count block entry (default: 4)
    pub max_crosses: u32,
}

impl Default for ChoppinessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_candles: 10,
            max_crosses: 4,
        }
    }
}

/// Configuration for the room-to-target filter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub enabled: bool,
    /// Minimum remaining distance to the target in percent of current
    /// price (default: 0.5)
    pub min_room_pct: f64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_room_pct: 0.5,
        }
    }
}

/// Configuration for all built-in filters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FiltersConfig {
    pub volume_trend: VolumeTrendConfig,
    pub stochastic: StochasticConfig,
    pub choppiness: ChoppinessConfig,
    pub room: RoomConfig,
}

/// Blocks when directional volume flow disagrees with the trade side.
///
/// Flow per candle is volume weighted by close location within the range
/// (closing on the high = full buying, on the low = full selling), summed
/// over the lookback.
pub struct VolumeTrendFilter {
    pub lookback_candles: usize,
}

impl ConfirmationFilter for VolumeTrendFilter {
    fn name(&self) -> &'static str {
        "volume_trend"
    }

    fn evaluate(&self, ctx: &FilterContext<'_>) -> FilterVerdict {
        let candles = ctx.recent_candles(self.lookback_candles);
        if candles.len() < 2 {
            return FilterVerdict::pass();
        }

        let mut flow = 0.0;
        for c in &candles {
            let range = c.high - c.low;
            if range <= 0.0 {
                continue;
            }
            let clv = ((c.close - c.low) - (c.high - c.close)) / range;
            flow += clv * c.volume;
        }

        let against = match ctx.side {
            Direction::Long => flow < 0.0,
            Direction::Short => flow > 0.0,
        };
        if against {
            FilterVerdict::block(format!(
                "volume flow {:.1} against {} over {} candles",
                flow,
                ctx.side,
                candles.len()
            ))
        } else {
            FilterVerdict::pass()
        }
    }
}

/// Blocks when the stochastic %K says price has no momentum in the trade
/// direction.
pub struct StochasticFilter {
    pub lookback_bars: usize,
    pub min_percent_k: f64,
}

impl ConfirmationFilter for StochasticFilter {
    fn name(&self) -> &'static str {
        "stochastic"
    }

    fn evaluate(&self, ctx: &FilterContext<'_>) -> FilterVerdict {
        let bars = ctx.recent_bars(self.lookback_bars);
        if bars.len() < 2 {
            return FilterVerdict::pass();
        }

        let high = bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        if high <= low {
            return FilterVerdict::pass();
        }
        let percent_k = (ctx.price - low) / (high - low) * 100.0;

        let blocked = match ctx.side {
            Direction::Long => percent_k < self.min_percent_k,
            Direction::Short => percent_k > 100.0 - self.min_percent_k,
        };
        if blocked {
            FilterVerdict::block(format!(
                "%K {:.1} lacks {} momentum (need {} {:.1})",
                percent_k,
                ctx.side,
                match ctx.side {
                    Direction::Long => ">=",
                    Direction::Short => "<=",
                },
                match ctx.side {
                    Direction::Long => self.min_percent_k,
                    Direction::Short => 100.0 - self.min_percent_k,
                }
            ))
        } else {
            FilterVerdict::pass()
        }
    }
}

/// Blocks in rotational markets: too many candle closes crossing the
/// window mean says price is oscillating, not trending.
pub struct ChoppinessFilter {
    pub lookback_candles: usize,
    pub max_crosses: u32,
}

impl ConfirmationFilter for ChoppinessFilter {
    fn name(&self) -> &'static str {
        "choppiness"
    }

    fn evaluate(&self, ctx: &FilterContext<'_>) -> FilterVerdict {
        let candles = ctx.recent_candles(self.lookback_candles);
        if candles.len() < 3 {
            return FilterVerdict::pass();
        }

        let mean = candles.iter().map(|c| c.close).sum::<f64>() / candles.len() as f64;
        let mut crosses = 0u32;
        let mut prev_above = candles[0].close > mean;
        for c in candles.iter().skip(1) {
            let above = c.close > mean;
            if above != prev_above {
                crosses += 1;
            }
            prev_above = above;
        }

        if crosses > self.max_crosses {
            FilterVerdict::block(format!(
                "{} mean-crosses in {} candles, market rotational",
                crosses,
                candles.len()
            ))
        } else {
            FilterVerdict::pass()
        }
    }
}

/// Blocks when too little of the move to the target is left to be worth
/// taking.
pub struct RoomToTargetFilter {
    pub min_room_pct: f64,
}

impl ConfirmationFilter for RoomToTargetFilter {
    fn name(&self) -> &'static str {
        "room_to_target"
    }

    fn evaluate(&self, ctx: &FilterContext<'_>) -> FilterVerdict {
        if ctx.price == 0.0 {
            return FilterVerdict::pass();
        }
        let room_pct = ctx.side.distance_beyond(ctx.target, ctx.price) / ctx.price * 100.0;
        if room_pct < self.min_room_pct {
            FilterVerdict::block(format!(
                "only {:.2}% room left to target {:.2}",
                room_pct, ctx.target
            ))
        } else {
            FilterVerdict::pass()
        }
    }
}
