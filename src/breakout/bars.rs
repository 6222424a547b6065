//! Bars and the Sliding Bar Buffer
//!
//! Every tracked symbol keeps a bounded window of recent bars. Bars are
//! addressed by an absolute index assigned at arrival (0, 1, 2, ...) that
//! never resets or shifts within a session, so candle boundaries stay
//! stable while the window slides: when the buffer is full the oldest bar
//! is evicted and its index simply becomes unavailable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A single fixed-duration OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Bounded sliding window of bars with monotonic absolute indexing
///
/// After `k` pushes the newest bar has absolute index `k - 1` and the
/// oldest retained one `max(0, k - capacity)`; the buffer holds exactly
/// `min(k, capacity)` bars. Lookups outside the retained range return
/// `None` rather than a wrong bar, which is what lets callers treat
/// "evicted" and "not yet arrived" uniformly as data-unavailable.
#[derive(Debug, Clone)]
pub struct BarBuffer {
    bars: VecDeque<Bar>,
    capacity: usize,
    /// Absolute index the next pushed bar will receive
    next_abs: u64,
}

impl BarBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bar buffer capacity must be positive");
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
            next_abs: 0,
        }
    }

    /// Append a bar, evicting the oldest if full. Returns the absolute
    /// index assigned to the new bar.
    pub fn push(&mut self, bar: Bar) -> u64 {
        if self.bars.len() == self.capacity {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
        let abs = self.next_abs;
        self.next_abs += 1;
        abs
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Absolute index of the newest bar, if any
    pub fn latest_index(&self) -> Option<u64> {
        self.next_abs.checked_sub(1)
    }

    /// Absolute index of the oldest retained bar, if any
    pub fn oldest_index(&self) -> Option<u64> {
        if self.bars.is_empty() {
            None
        } else {
            Some(self.next_abs - self.bars.len() as u64)
        }
    }

    /// Map an absolute index to its live position, or `None` if that bar
    /// was evicted or has not arrived yet
    pub fn index_of(&self, abs: u64) -> Option<usize> {
        let oldest = self.oldest_index()?;
        if abs < oldest || abs >= self.next_abs {
            return None;
        }
        Some((abs - oldest) as usize)
    }

    pub fn get(&self, abs: u64) -> Option<&Bar> {
        self.bars.get(self.index_of(abs)?)
    }

    /// Copy out the bars in `[start_abs, end_abs)`. Empty when either
    /// endpoint is unavailable, never a partial or misaligned slice.
    pub fn slice(&self, start_abs: u64, end_abs: u64) -> Vec<Bar> {
        if start_abs >= end_abs {
            return Vec::new();
        }
        let (Some(start), Some(end_incl)) = (self.index_of(start_abs), self.index_of(end_abs - 1))
        else {
            return Vec::new();
        };
        self.bars.range(start..=end_incl).copied().collect()
    }
}
