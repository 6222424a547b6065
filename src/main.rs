use anyhow::{bail, Error, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use pivot_breakout::breakout::{Direction, EngineConfig, ReferenceLevel};
use pivot_breakout::replay::{replay_directory, replay_file, ReplayPlan};

#[derive(Parser, Debug)]
#[command(name = "pivot-breakout")]
#[command(about = "Breakout confirmation engine for pivot-level trades")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay recorded bars through the confirmation engine
    Replay {
        /// Bar CSV file, or a directory of per-symbol CSV files
        #[arg(short, long)]
        data: PathBuf,

        /// Symbol name (directory replays use each file stem instead)
        #[arg(short, long, default_value = "NQ")]
        symbol: String,

        /// Trade side: long or short
        #[arg(long, default_value = "long")]
        side: String,

        /// Pivot level whose break is being confirmed
        #[arg(long)]
        pivot: f64,

        /// Profit target for the attempt
        #[arg(long)]
        target: f64,

        /// Reference levels as NAME:PRICE pairs (comma-separated)
        #[arg(short, long)]
        levels: Option<String>,

        /// Engine config JSON file (all fields optional, omit for defaults)
        #[arg(short, long)]
        config: Option<String>,

        /// Write every non-quiet decision to this JSONL audit file
        #[arg(short, long)]
        audit: Option<PathBuf>,

        /// Override: bars aggregated into one confirmation candle
        #[arg(long)]
        bars_per_candle: Option<u64>,

        /// Override: volume ratio needed for a momentum candle
        #[arg(long)]
        momentum_volume_ratio: Option<f64>,

        /// Override: body percent needed for a momentum candle
        #[arg(long)]
        momentum_body_pct: Option<f64>,

        /// Override: minutes before a pullback retest goes stale
        #[arg(long)]
        max_retest_minutes: Option<i64>,

        /// Override: bar age at which an unresolved attempt expires
        #[arg(long)]
        max_breakout_age_bars: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pivot_breakout=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Replay {
            data,
            symbol,
            side,
            pivot,
            target,
            levels,
            config,
            audit,
            bars_per_candle,
            momentum_volume_ratio,
            momentum_body_pct,
            max_retest_minutes,
            max_breakout_age_bars,
        } => {
            let side = parse_side(&side)?;
            let levels = parse_levels(levels.as_deref())?;

            let mut engine_config = match config {
                Some(path) => EngineConfig::load(&path)?,
                None => EngineConfig::default(),
            };
            if let Some(v) = bars_per_candle {
                engine_config.breakout.bars_per_candle = v;
            }
            if let Some(v) = momentum_volume_ratio {
                engine_config.breakout.momentum_volume_ratio = v;
            }
            if let Some(v) = momentum_body_pct {
                engine_config.breakout.momentum_body_pct = v;
            }
            if let Some(v) = max_retest_minutes {
                engine_config.breakout.max_retest_minutes = v;
            }
            if let Some(v) = max_breakout_age_bars {
                engine_config.breakout.max_breakout_age_bars = v;
            }

            let plan = ReplayPlan {
                symbol,
                side,
                pivot,
                target,
                levels,
            };

            info!("=== REPLAY MODE ===");
            info!("Data: {:?}", data);
            info!(
                "Attempt: {} through pivot {} toward target {}",
                plan.side, plan.pivot, plan.target
            );

            if data.is_dir() {
                if audit.is_some() {
                    warn!("--audit applies to single-file replays only, ignoring");
                }
                let summaries = replay_directory(&data, &plan, &engine_config)?;
                for summary in &summaries {
                    summary.print();
                }
            } else {
                let summary = replay_file(&data, &plan, engine_config, audit.as_deref())?;
                summary.print();
            }
        }
    }

    Ok(())
}

fn parse_side(side: &str) -> Result<Direction> {
    match side.to_ascii_lowercase().as_str() {
        "long" | "buy" => Ok(Direction::Long),
        "short" | "sell" => Ok(Direction::Short),
        other => bail!("unknown side '{}', expected long or short", other),
    }
}

fn parse_levels(raw: Option<&str>) -> Result<Vec<ReferenceLevel>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.trim().parse::<ReferenceLevel>().map_err(Error::msg))
        .collect()
}
