//! Offline replay: run recorded bars through the engine and tally what the
//! machine would have decided, with an optional JSONL audit trail of every
//! non-quiet decision.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::breakout::{
    Bar, BreakoutEngine, Decision, DecisionKind, Direction, EngineConfig, EntryPath, EvalInputs,
    ReferenceLevel,
};

/// CSV row structure for recorded bars
#[derive(Debug, Deserialize)]
struct BarRow {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Load bars from a CSV file with the header
/// `timestamp,open,high,low,close,volume`.
pub fn load_bars(path: &Path) -> Result<Vec<Bar>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening bar file {:?}", path))?;

    let mut bars = Vec::new();
    for result in reader.deserialize() {
        let row: BarRow =
            result.with_context(|| format!("parsing bar row in {:?}", path))?;
        bars.push(Bar {
            timestamp: row.timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }
    info!("Loaded {} bars from {:?}", bars.len(), path);
    Ok(bars)
}

/// Fixed attempt inputs for one replay run.
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    pub symbol: String,
    pub side: Direction,
    pub pivot: f64,
    pub target: f64,
    pub levels: Vec<ReferenceLevel>,
}

/// JSONL audit trail: one line per recorded decision, diagnostics included.
/// This is the blocked-trade record an operator reads after the session to
/// see why the machine did not take something.
pub struct AuditLog {
    writer: BufWriter<File>,
    lines: u64,
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    time: DateTime<Utc>,
    symbol: &'a str,
    abs_index: u64,
    #[serde(flatten)]
    decision: &'a Decision,
}

impl AuditLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("creating audit log {:?}", path))?;
        Ok(Self {
            writer: BufWriter::new(file),
            lines: 0,
        })
    }

    pub fn record(
        &mut self,
        time: DateTime<Utc>,
        symbol: &str,
        abs_index: u64,
        decision: &Decision,
    ) -> Result<()> {
        let record = AuditRecord {
            time,
            symbol,
            abs_index,
            decision,
        };
        serde_json::to_writer(&mut self.writer, &record).context("writing audit record")?;
        self.writer.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush().context("flushing audit log")?;
        Ok(self.lines)
    }
}

/// Counters for one replayed symbol.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaySummary {
    pub symbol: String,
    pub bars: u64,
    pub breakouts: u64,
    pub weak_breakouts: u64,
    pub pullbacks: u64,
    pub entries: u64,
    pub momentum_entries: u64,
    pub delayed_entries: u64,
    pub retest_entries: u64,
    pub sustained_entries: u64,
    pub vetoes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub expiries: u64,
    pub not_ready: u64,
}

impl ReplaySummary {
    fn tally(&mut self, decision: &Decision) {
        self.bars += 1;
        match decision.kind {
            DecisionKind::BreakoutDetected => self.breakouts += 1,
            DecisionKind::WeakBreakout => self.weak_breakouts += 1,
            DecisionKind::PullbackStarted => self.pullbacks += 1,
            DecisionKind::Entry => {
                self.entries += 1;
                if let Some(entry) = &decision.entry {
                    match entry.path {
                        EntryPath::Momentum => self.momentum_entries += 1,
                        EntryPath::DelayedMomentum => self.delayed_entries += 1,
                        EntryPath::PullbackRetest => self.retest_entries += 1,
                        EntryPath::SustainedBreak => self.sustained_entries += 1,
                    }
                }
            }
            DecisionKind::FilterVeto => self.vetoes += 1,
            DecisionKind::FailedBreakout | DecisionKind::PivotViolation => self.failures += 1,
            DecisionKind::RetestRejected => self.rejections += 1,
            DecisionKind::Expired => self.expiries += 1,
            DecisionKind::NotReady => self.not_ready += 1,
            DecisionKind::Waiting => {}
        }
    }

    pub fn print(&self) {
        println!();
        println!("═══════════════════════════════════════════════");
        println!("        BREAKOUT REPLAY: {}", self.symbol);
        println!("═══════════════════════════════════════════════");
        println!();
        println!("  Bars evaluated:     {}", self.bars);
        println!("  Breakouts detected: {}", self.breakouts);
        println!("  Weak breakouts:     {}", self.weak_breakouts);
        println!("  Pullbacks started:  {}", self.pullbacks);
        println!();
        println!("  Entries:            {}", self.entries);
        println!("    Momentum:         {}", self.momentum_entries);
        println!("    Delayed momentum: {}", self.delayed_entries);
        println!("    Pullback retest:  {}", self.retest_entries);
        println!("    Sustained break:  {}", self.sustained_entries);
        println!();
        println!("  Filter vetoes:      {}", self.vetoes);
        println!("  Failed breakouts:   {}", self.failures);
        println!("  Retest rejections:  {}", self.rejections);
        println!("  Expired attempts:   {}", self.expiries);
        println!("  Not ready:          {}", self.not_ready);
        println!("═══════════════════════════════════════════════");
    }
}

/// Replay one symbol's bars against a fixed attempt plan. Decisions other
/// than Waiting are written to the audit log when one is given.
pub fn replay_file(
    path: &Path,
    plan: &ReplayPlan,
    config: EngineConfig,
    audit_path: Option<&Path>,
) -> Result<ReplaySummary> {
    let bars = load_bars(path)?;
    let mut engine = BreakoutEngine::new(config);
    let mut audit = audit_path.map(AuditLog::create).transpose()?;
    let mut summary = ReplaySummary {
        symbol: plan.symbol.clone(),
        ..ReplaySummary::default()
    };

    let inputs = EvalInputs {
        side: plan.side,
        pivot: plan.pivot,
        target: plan.target,
        levels: &plan.levels,
    };
    for (i, bar) in bars.into_iter().enumerate() {
        let decision = engine.on_bar(&plan.symbol, bar, &inputs);
        summary.tally(&decision);
        if decision.kind != DecisionKind::Waiting {
            if let Some(audit) = audit.as_mut() {
                audit.record(bar.timestamp, &plan.symbol, i as u64, &decision)?;
            }
        }
    }

    if let Some(audit) = audit {
        let lines = audit.finish()?;
        info!("Wrote {} audit records", lines);
    }
    Ok(summary)
}

/// Replay every `.csv` in a directory in parallel, one engine per file,
/// using each file stem as the symbol.
pub fn replay_directory(
    dir: &Path,
    plan: &ReplayPlan,
    config: &EngineConfig,
) -> Result<Vec<ReplaySummary>> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("reading data directory {:?}", dir))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "csv") {
            files.push(path);
        }
    }
    files.sort();
    info!("Replaying {} bar files", files.len());

    let results: Vec<Result<ReplaySummary>> = files
        .par_iter()
        .map(|path| {
            let symbol = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| plan.symbol.clone());
            let file_plan = ReplayPlan {
                symbol,
                ..plan.clone()
            };
            let summary = replay_file(path, &file_plan, config.clone(), None)?;
            info!(
                "Replayed {}: {} bars, {} entries",
                file_plan.symbol, summary.bars, summary.entries
            );
            Ok(summary)
        })
        .collect();

    let mut summaries = Vec::new();
    for result in results {
        summaries.push(result?);
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakout::{BreakoutConfig, BreakoutMemory};
    use uuid::Uuid;

    fn temp_path(suffix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pivot-breakout-{}-{}", Uuid::new_v4(), suffix))
    }

    /// timestamp minute, open, high, low, close, volume
    fn write_bars_csv(rows: &[(i64, f64, f64, f64, f64, f64)]) -> PathBuf {
        let path = temp_path("bars.csv");
        let mut content = String::from("timestamp,open,high,low,close,volume\n");
        for (minute, open, high, low, close, volume) in rows {
            content.push_str(&format!(
                "2025-03-10T14:{:02}:00Z,{},{},{},{},{}\n",
                30 + minute,
                open,
                high,
                low,
                close,
                volume
            ));
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn momentum_rows() -> Vec<(i64, f64, f64, f64, f64, f64)> {
        let mut rows: Vec<(i64, f64, f64, f64, f64, f64)> = (0..8)
            .map(|m| (m, 99.5, 99.52, 99.48, 99.5, 10.0))
            .collect();
        rows.push((8, 99.9, 100.2, 99.8, 100.1, 25.0));
        rows.push((9, 100.1, 100.3, 100.0, 100.2, 25.0));
        rows.push((10, 100.2, 100.4, 100.1, 100.3, 25.0));
        rows.push((11, 100.3, 100.5, 100.2, 100.45, 25.0));
        rows
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            breakout: BreakoutConfig {
                bars_per_candle: 4,
                volume_lookback_candles: 2,
                ..BreakoutConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn long_plan(symbol: &str) -> ReplayPlan {
        ReplayPlan {
            symbol: symbol.to_string(),
            side: Direction::Long,
            pivot: 100.0,
            target: 103.0,
            levels: Vec::new(),
        }
    }

    #[test]
    fn test_load_bars_parses_csv() {
        let path = write_bars_csv(&[(0, 99.5, 99.6, 99.4, 99.55, 12.5)]);
        let bars = load_bars(&path).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open, 99.5);
        assert_eq!(bars[0].volume, 12.5);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_replay_file_tallies_momentum_entry() {
        let path = write_bars_csv(&momentum_rows());
        let summary = replay_file(&path, &long_plan("NQ"), test_config(), None).unwrap();

        assert_eq!(summary.bars, 12);
        assert_eq!(summary.breakouts, 1);
        assert_eq!(summary.entries, 1);
        assert_eq!(summary.momentum_entries, 1);
        assert_eq!(summary.vetoes, 0);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_audit_log_records_non_quiet_decisions() {
        let path = write_bars_csv(&momentum_rows());
        let audit_path = temp_path("audit.jsonl");
        replay_file(&path, &long_plan("NQ"), test_config(), Some(&audit_path)).unwrap();

        let content = std::fs::read_to_string(&audit_path).unwrap();
        let lines: Vec<&str> = content.trim().lines().collect();
        // Detection plus entry; warmup Waiting bars stay out of the trail.
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["symbol"], "NQ");
        assert_eq!(first["kind"], "BreakoutDetected");
        assert_eq!(first["abs_index"], 8);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["kind"], "Entry");
        assert_eq!(second["entry"]["path"], "Momentum");

        std::fs::remove_file(path).ok();
        std::fs::remove_file(audit_path).ok();
    }

    #[test]
    fn test_replay_directory_runs_each_file() {
        let dir = temp_path("days");
        std::fs::create_dir_all(&dir).unwrap();
        let nq_rows = momentum_rows();
        let es_rows: Vec<(i64, f64, f64, f64, f64, f64)> = (0..6)
            .map(|m| (m, 99.0, 99.02, 98.98, 99.0, 10.0))
            .collect();
        std::fs::rename(write_bars_csv(&nq_rows), dir.join("NQ.csv")).unwrap();
        std::fs::rename(write_bars_csv(&es_rows), dir.join("ES.csv")).unwrap();

        let summaries = replay_directory(&dir, &long_plan("XX"), &test_config()).unwrap();
        assert_eq!(summaries.len(), 2);
        let nq = summaries.iter().find(|s| s.symbol == "NQ").unwrap();
        let es = summaries.iter().find(|s| s.symbol == "ES").unwrap();
        assert_eq!(nq.entries, 1);
        assert_eq!(es.entries, 0);
        assert_eq!(es.bars, 6);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_tally_covers_every_terminal_kind() {
        let memory = BreakoutMemory::default();
        let mut summary = ReplaySummary::default();
        for kind in [
            DecisionKind::BreakoutDetected,
            DecisionKind::WeakBreakout,
            DecisionKind::PullbackStarted,
            DecisionKind::FilterVeto,
            DecisionKind::FailedBreakout,
            DecisionKind::PivotViolation,
            DecisionKind::RetestRejected,
            DecisionKind::Expired,
            DecisionKind::NotReady,
            DecisionKind::Waiting,
        ] {
            summary.tally(&Decision::negative(kind, "test", &memory));
        }
        assert_eq!(summary.bars, 10);
        assert_eq!(summary.breakouts, 1);
        assert_eq!(summary.weak_breakouts, 1);
        assert_eq!(summary.pullbacks, 1);
        assert_eq!(summary.vetoes, 1);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.rejections, 1);
        assert_eq!(summary.expiries, 1);
        assert_eq!(summary.not_ready, 1);
        assert_eq!(summary.entries, 0);
    }
}
