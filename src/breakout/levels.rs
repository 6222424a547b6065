//! Trade side, reference levels, and per-evaluation inputs
//!
//! The scanner/risk layer hands the engine a pivot, a target and a side for
//! each attempt, plus a small set of named longer-period levels (moving
//! averages, prior highs, ...). The sustained-break check needs the next
//! such level beyond the pivot in the trade direction.

use serde::{Deserialize, Serialize};

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// True when `price` is beyond `level` in the trade direction
    pub fn is_beyond(&self, price: f64, level: f64) -> bool {
        match self {
            Direction::Long => price > level,
            Direction::Short => price < level,
        }
    }

    /// Signed distance of `price` beyond `level`; positive means beyond
    pub fn distance_beyond(&self, price: f64, level: f64) -> f64 {
        match self {
            Direction::Long => price - level,
            Direction::Short => level - price,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "Long"),
            Direction::Short => write!(f, "Short"),
        }
    }
}

/// A named longer-period reference level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLevel {
    pub name: String,
    pub price: f64,
}

impl ReferenceLevel {
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Self {
            name: name.into(),
            price,
        }
    }
}

impl std::str::FromStr for ReferenceLevel {
    type Err = String;

    /// Parse "NAME:PRICE", e.g. "SMA50:101.25"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, price) = s
            .split_once(':')
            .ok_or_else(|| format!("expected NAME:PRICE, got '{}'", s))?;
        let price: f64 = price
            .trim()
            .parse()
            .map_err(|_| format!("invalid price in '{}'", s))?;
        if name.trim().is_empty() {
            return Err(format!("empty level name in '{}'", s));
        }
        Ok(Self::new(name.trim(), price))
    }
}

/// Inputs supplied by the caller on every evaluation
///
/// Pivot, target and side seed a new attempt while the machine is
/// monitoring; once a breakout is recorded the captured values win and
/// later input changes do not disturb the attempt.
#[derive(Debug, Clone, Copy)]
pub struct EvalInputs<'a> {
    pub side: Direction,
    pub pivot: f64,
    pub target: f64,
    pub levels: &'a [ReferenceLevel],
}

/// Nearest candidate level strictly beyond the pivot in the trade
/// direction. Candidates are the supplied reference levels plus the
/// captured target.
pub fn next_level_beyond(
    levels: &[ReferenceLevel],
    target: f64,
    pivot: f64,
    side: Direction,
) -> Option<ReferenceLevel> {
    let mut best: Option<ReferenceLevel> = None;
    let candidates = levels
        .iter()
        .cloned()
        .chain(std::iter::once(ReferenceLevel::new("TARGET", target)));

    for level in candidates {
        if !side.is_beyond(level.price, pivot) {
            continue;
        }
        let closer = match &best {
            Some(b) => side.distance_beyond(level.price, pivot) < side.distance_beyond(b.price, pivot),
            None => true,
        };
        if closer {
            best = Some(level);
        }
    }

    best
}
