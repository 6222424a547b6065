//! Live runner: one tokio task per symbol.
//!
//! Each symbol task owns its bar history and breakout memory outright, so
//! there is no shared mutable state between symbols: a bar for NQ cannot
//! block or reorder ES. Tasks are fed [`SymbolCommand`]s over bounded
//! channels and publish tagged decisions on a shared channel the caller
//! drains.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::breakout::{
    Bar, BreakoutStateMachine, Decision, Direction, EngineConfig, EvalInputs, FilterChain,
    ReferenceLevel, SymbolState,
};

const CHANNEL_DEPTH: usize = 1000;

/// Commands a symbol task accepts.
#[derive(Debug, Clone)]
pub enum SymbolCommand {
    /// One finished bar to evaluate
    Bar(Bar),
    /// Set or replace the attempt inputs. Bars arriving before the first
    /// attempt are buffered (history warms up) but not evaluated.
    Attempt {
        side: Direction,
        pivot: f64,
        target: f64,
    },
    /// Replace the reference level set
    Levels(Vec<ReferenceLevel>),
    /// Session boundary: wipe history and memory, restart indexing
    ResetSession,
}

/// A decision tagged with the symbol that produced it.
#[derive(Debug, Clone)]
pub struct TaggedDecision {
    pub symbol: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, Copy)]
struct AttemptPlan {
    side: Direction,
    pivot: f64,
    target: f64,
}

struct SymbolTask {
    tx: mpsc::Sender<SymbolCommand>,
    handle: JoinHandle<()>,
}

/// Spawns and feeds the per-symbol tasks. Symbols are registered lazily on
/// first command.
pub struct Runner {
    machine: Arc<BreakoutStateMachine>,
    bar_capacity: usize,
    decisions_tx: mpsc::Sender<TaggedDecision>,
    tasks: HashMap<String, SymbolTask>,
}

impl Runner {
    pub fn new(config: EngineConfig) -> (Self, mpsc::Receiver<TaggedDecision>) {
        let filters = FilterChain::from_config(&config.filters);
        let machine = Arc::new(BreakoutStateMachine::with_filters(config.breakout, filters));
        let (decisions_tx, decisions_rx) = mpsc::channel(CHANNEL_DEPTH);
        let runner = Self {
            machine,
            bar_capacity: config.bar_capacity,
            decisions_tx,
            tasks: HashMap::new(),
        };
        (runner, decisions_rx)
    }

    /// Send a command to one symbol's task, spawning it on first use.
    pub async fn send(&mut self, symbol: &str, command: SymbolCommand) -> anyhow::Result<()> {
        let machine = self.machine.clone();
        let bar_capacity = self.bar_capacity;
        let decisions = self.decisions_tx.clone();
        let task = self.tasks.entry(symbol.to_string()).or_insert_with(|| {
            info!(%symbol, "spawning symbol task");
            let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
            let handle = tokio::spawn(run_symbol(
                symbol.to_string(),
                machine,
                bar_capacity,
                rx,
                decisions,
            ));
            SymbolTask { tx, handle }
        });
        task.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("symbol task {} stopped", symbol))
    }

    /// Send the same command to every running symbol task.
    pub async fn broadcast(&self, command: SymbolCommand) -> anyhow::Result<()> {
        for (symbol, task) in &self.tasks {
            task.tx
                .send(command.clone())
                .await
                .map_err(|_| anyhow!("symbol task {} stopped", symbol))?;
        }
        Ok(())
    }

    pub fn symbol_count(&self) -> usize {
        self.tasks.len()
    }

    /// Close the command channels and wait for every task to drain its
    /// queue and exit.
    pub async fn shutdown(mut self) {
        let tasks: Vec<(String, SymbolTask)> = self.tasks.drain().collect();
        for (symbol, task) in tasks {
            drop(task.tx);
            if let Err(e) = task.handle.await {
                warn!(%symbol, error = %e, "symbol task ended abnormally");
            }
        }
    }
}

async fn run_symbol(
    symbol: String,
    machine: Arc<BreakoutStateMachine>,
    bar_capacity: usize,
    mut rx: mpsc::Receiver<SymbolCommand>,
    decisions: mpsc::Sender<TaggedDecision>,
) {
    let mut state = SymbolState::new(bar_capacity);
    let mut attempt: Option<AttemptPlan> = None;
    let mut levels: Vec<ReferenceLevel> = Vec::new();

    while let Some(command) = rx.recv().await {
        match command {
            SymbolCommand::Bar(bar) => {
                let abs = state.buffer.push(bar);
                let Some(plan) = attempt else {
                    debug!(%symbol, abs, "bar buffered, no attempt configured");
                    continue;
                };
                let inputs = EvalInputs {
                    side: plan.side,
                    pivot: plan.pivot,
                    target: plan.target,
                    levels: &levels,
                };
                let decision =
                    machine.evaluate(&symbol, &state.buffer, &mut state.memory, abs, &bar, &inputs);
                let tagged = TaggedDecision {
                    symbol: symbol.clone(),
                    decision,
                };
                if decisions.send(tagged).await.is_err() {
                    warn!(%symbol, "decision receiver dropped, stopping task");
                    break;
                }
            }
            SymbolCommand::Attempt { side, pivot, target } => {
                info!(%symbol, %side, pivot, target, "attempt inputs set");
                attempt = Some(AttemptPlan { side, pivot, target });
            }
            SymbolCommand::Levels(new_levels) => {
                debug!(%symbol, count = new_levels.len(), "reference levels updated");
                levels = new_levels;
            }
            SymbolCommand::ResetSession => {
                info!(%symbol, "session reset");
                state = SymbolState::new(bar_capacity);
            }
        }
    }
    debug!(%symbol, "symbol task finished");
}

/// Rolls raw trade ticks into fixed-duration bars for feeds whose native
/// unit is the trade print. A bar completes when a tick lands in a later
/// time bucket; call [`TickAggregator::flush`] at session end for the
/// final partial bar.
pub struct TickAggregator {
    bar_seconds: i64,
    current: Option<BarBuilder>,
}

struct BarBuilder {
    bucket: i64,
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl BarBuilder {
    fn new(bucket: i64, timestamp: DateTime<Utc>, price: f64, size: f64) -> Self {
        Self {
            bucket,
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
        }
    }

    fn add_tick(&mut self, price: f64, size: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += size;
    }

    fn to_bar(&self) -> Bar {
        Bar {
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

impl TickAggregator {
    pub fn new(bar_seconds: i64) -> Self {
        Self {
            bar_seconds: bar_seconds.max(1),
            current: None,
        }
    }

    /// Fold one tick in; returns the completed bar when this tick opens a
    /// new bucket.
    pub fn process_tick(
        &mut self,
        timestamp: DateTime<Utc>,
        price: f64,
        size: f64,
    ) -> Option<Bar> {
        let bucket = timestamp.timestamp().div_euclid(self.bar_seconds);
        match &mut self.current {
            Some(builder) => {
                if bucket > builder.bucket {
                    let completed = builder.to_bar();
                    self.current = Some(BarBuilder::new(bucket, timestamp, price, size));
                    Some(completed)
                } else {
                    // Same bucket, or a straggler from an earlier one:
                    // merge rather than rewind.
                    builder.add_tick(price, size);
                    None
                }
            }
            None => {
                self.current = Some(BarBuilder::new(bucket, timestamp, price, size));
                None
            }
        }
    }

    /// Take the open partial bar, if any.
    pub fn flush(&mut self) -> Option<Bar> {
        self.current.take().map(|b| b.to_bar())
    }
}
