//! Breakout Confirmation Core - per-symbol breakout state machines
//!
//! This module contains everything between a raw bar stream and an entry
//! decision:
//! - Sliding bar buffer with stable absolute indexing
//! - Candle aggregation and momentum classification
//! - Reference levels and trade direction math
//! - Per-attempt breakout memory
//! - Confirmation filter chain
//! - The breakout confirmation state machine
//! - Per-symbol registry and the engine façade

pub mod bars;
pub mod candles;
pub mod levels;
pub mod memory;
pub mod filters;
pub mod registry;
pub mod state_machine;
pub mod engine;

// Re-export commonly used types
pub use bars::{Bar, BarBuffer};
pub use candles::{Candle, CandleStrength};
pub use levels::{Direction, EvalInputs, ReferenceLevel};
pub use memory::{BreakoutClass, BreakoutMemory, BreakoutState};
pub use filters::{ConfirmationFilter, FilterChain, FilterContext, FilterVerdict, FiltersConfig};
pub use registry::{SymbolRegistry, SymbolState};
pub use state_machine::{
    BreakoutConfig, BreakoutStateMachine, Decision, DecisionKind, EntryPath, EntrySignal,
};
pub use engine::{BreakoutEngine, EngineConfig};
