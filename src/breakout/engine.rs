//! Engine façade: owns the registry and the machine, pushes bars, returns
//! decisions. Drivers (runner, replay) talk to this, not to the machine
//! directly.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::bars::Bar;
use super::filters::{FilterChain, FiltersConfig};
use super::levels::EvalInputs;
use super::registry::SymbolRegistry;
use super::state_machine::{BreakoutConfig, BreakoutStateMachine, Decision};

/// Bundled engine configuration, deserializable from a JSON file. Every
/// field defaults, so an empty `{}` is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bars retained per symbol (default: 240)
    pub bar_capacity: usize,
    pub breakout: BreakoutConfig,
    pub filters: FiltersConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bar_capacity: 240, // 20 minutes of 5s bars
            breakout: BreakoutConfig::default(),
            filters: FiltersConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path))?;
        let config: Self =
            serde_json::from_str(&raw).with_context(|| format!("parsing engine config {}", path))?;
        Ok(config)
    }
}

/// One engine instance serves any number of symbols sequentially. Each
/// symbol's history and memory are isolated; a bar for one symbol can
/// never move another symbol's state.
pub struct BreakoutEngine {
    machine: BreakoutStateMachine,
    registry: SymbolRegistry,
}

impl BreakoutEngine {
    pub fn new(config: EngineConfig) -> Self {
        let filters = FilterChain::from_config(&config.filters);
        info!(
            bar_capacity = config.bar_capacity,
            filters = filters.len(),
            "breakout engine ready"
        );
        Self {
            machine: BreakoutStateMachine::with_filters(config.breakout, filters),
            registry: SymbolRegistry::new(config.bar_capacity),
        }
    }

    /// Push one bar for `symbol` and evaluate it. One decision per bar,
    /// always.
    pub fn on_bar(&mut self, symbol: &str, bar: Bar, inputs: &EvalInputs<'_>) -> Decision {
        let state = self.registry.get_or_create(symbol);
        let abs = state.buffer.push(bar);
        self.machine
            .evaluate(symbol, &state.buffer, &mut state.memory, abs, &bar, inputs)
    }

    pub fn registry(&self) -> &SymbolRegistry {
        &self.registry
    }

    /// Drop one symbol's active attempt, keeping its bar history.
    pub fn reset_memory(&mut self, symbol: &str) {
        self.registry.reset_memory(symbol);
    }

    /// Session boundary: wipe every symbol's history and memory.
    pub fn reset_session(&mut self) {
        info!(symbols = self.registry.len(), "session reset");
        self.registry.reset_all();
    }
}
