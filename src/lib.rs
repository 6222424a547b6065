// Library crate - exports the breakout confirmation core and its drivers

pub mod breakout;
pub mod replay;
pub mod runner;

// Re-export commonly used types
pub use breakout::{
    Bar, BreakoutConfig, BreakoutEngine, BreakoutMemory, BreakoutState, Decision, DecisionKind,
    Direction, EngineConfig, EntryPath, EntrySignal, EvalInputs, ReferenceLevel,
};
pub use replay::{ReplayPlan, ReplaySummary};
pub use runner::{Runner, SymbolCommand, TaggedDecision, TickAggregator};
