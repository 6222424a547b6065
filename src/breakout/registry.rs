//! Per-symbol state ownership.
//!
//! Every symbol the engine has ever seen gets one [`SymbolState`] holding its
//! bar history and breakout memory. Entries are created on first touch and
//! never dropped: a symbol that stops printing keeps its history so a late
//! bar lands in the right place instead of restarting the absolute index.

use std::collections::HashMap;

use tracing::debug;

use super::bars::BarBuffer;
use super::memory::BreakoutMemory;

/// Everything the machine keeps for one symbol between bars.
#[derive(Debug)]
pub struct SymbolState {
    pub buffer: BarBuffer,
    pub memory: BreakoutMemory,
}

impl SymbolState {
    pub fn new(bar_capacity: usize) -> Self {
        Self {
            buffer: BarBuffer::new(bar_capacity),
            memory: BreakoutMemory::default(),
        }
    }
}

/// Owns all per-symbol state. One of these per engine.
#[derive(Debug)]
pub struct SymbolRegistry {
    states: HashMap<String, SymbolState>,
    bar_capacity: usize,
}

impl SymbolRegistry {
    pub fn new(bar_capacity: usize) -> Self {
        Self {
            states: HashMap::new(),
            bar_capacity,
        }
    }

    pub fn get_or_create(&mut self, symbol: &str) -> &mut SymbolState {
        if !self.states.contains_key(symbol) {
            debug!(%symbol, "registering new symbol");
        }
        let capacity = self.bar_capacity;
        self.states
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(capacity))
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolState> {
        self.states.get(symbol)
    }

    /// Drops the breakout attempt but keeps the bar history. Used when an
    /// operator wants to re-arm a symbol without losing its lookbacks.
    pub fn reset_memory(&mut self, symbol: &str) {
        if let Some(state) = self.states.get_mut(symbol) {
            state.memory.reset();
        }
    }

    /// Full wipe for one symbol: fresh buffer, fresh memory, index restarts
    /// at zero. This is the session-boundary reset.
    pub fn reset_session(&mut self, symbol: &str) {
        if let Some(state) = self.states.get_mut(symbol) {
            *state = SymbolState::new(self.bar_capacity);
        }
    }

    /// Session-boundary reset across every registered symbol.
    pub fn reset_all(&mut self) {
        let capacity = self.bar_capacity;
        for state in self.states.values_mut() {
            *state = SymbolState::new(capacity);
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
