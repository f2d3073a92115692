use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use updown_paper_sim::backtest::{BacktestRunner, CancellationFlag};
use updown_paper_sim::config::{LoggingConfig, SimConfig};
use updown_paper_sim::error::SimError;
use updown_paper_sim::market_data::{
    self, BarGenerator, BinanceBarSource, SyntheticBarGenerator,
};
use updown_paper_sim::models::PriceBar;
use updown_paper_sim::output;
use updown_paper_sim::persistence::StateStore;
use updown_paper_sim::session::LiveSession;
use updown_paper_sim::strategies::{StrategyId, StrategySet};

#[derive(Parser)]
#[command(name = "paper-sim")]
#[command(about = "Paper-trade and backtest UP/DOWN binary strategies on 15-minute bars")]
struct Cli {
    /// Config file (defaults to SIM_CONFIG_PATH or config/sim_config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest strategies over historical bars
    Backtest {
        /// Days of history ending now
        #[arg(short, long)]
        days: Option<u32>,

        /// Use the seeded synthetic walk instead of Binance
        #[arg(long)]
        synthetic: bool,

        /// JSON file with an array of bars (overrides --days/--synthetic)
        #[arg(long)]
        bars: Option<PathBuf>,

        /// Comma-separated strategy ids (default: all)
        #[arg(short, long, value_delimiter = ',')]
        strategies: Vec<String>,

        /// Output directory for report files
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,
    },

    /// Paper-trade live bars until Ctrl+C
    Live {
        /// Use the seeded synthetic walk instead of Binance
        #[arg(long)]
        synthetic: bool,
    },

    /// Show persisted balances and positions
    Status {
        /// Write the recorded daily performance rows to this CSV file
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Reset one strategy, or all of them
    Reset {
        #[arg(short, long)]
        strategy: Option<String>,
    },

    /// List available strategies
    Strategies,
}

fn init_logging(config: &LoggingConfig) {
    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("{},updown_paper_sim={}", config.level, config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&log_filter))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<SimError>() {
            Some(sim) => {
                error!("{}", sim);
                match serde_json::to_string(&sim.report()) {
                    Ok(json) => eprintln!("{}", json),
                    Err(_) => eprintln!("Error: {}", sim),
                }
            }
            None => {
                error!("{:#}", e);
                eprintln!("Error: {:#}", e);
            }
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(SimConfig::default_path);
    let config = SimConfig::load_with_env(&config_path)?;
    init_logging(&config.logging);

    // Ctrl+C flips the shared flag; backtests and the live loop poll it
    let cancel = CancellationFlag::new();
    let c = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping...");
        c.cancel();
    });

    match cli.command {
        Commands::Backtest {
            days,
            synthetic,
            bars,
            strategies,
            output_dir,
        } => {
            run_backtest(&config, days, synthetic, bars, &strategies, &output_dir, cancel).await?;
        }
        Commands::Live { synthetic } => {
            run_live(&config, synthetic, cancel).await?;
        }
        Commands::Status { export } => {
            show_status(&config, export.as_deref()).await?;
        }
        Commands::Reset { strategy } => {
            reset_state(&config, strategy.as_deref()).await?;
        }
        Commands::Strategies => {
            println!("Available strategies:\n");
            print!("{}", output::generate_strategy_list());
        }
    }

    Ok(())
}

fn parse_strategy_ids(names: &[String]) -> Result<Vec<StrategyId>> {
    if names.is_empty() {
        return Ok(StrategyId::ALL.to_vec());
    }
    let ids = names
        .iter()
        .map(|n| n.trim().parse::<StrategyId>())
        .collect::<Result<Vec<_>, SimError>>()?;
    Ok(ids)
}

async fn fetch_backtest_bars(
    config: &SimConfig,
    days: Option<u32>,
    synthetic: bool,
    bars_file: Option<PathBuf>,
) -> Result<Vec<PriceBar>> {
    if let Some(path) = bars_file {
        return market_data::load_bars_file(&path);
    }

    let days = days.unwrap_or(config.backtest.default_days);
    let end = market_data::align_to_interval(Utc::now(), config.market_data.bar_interval_minutes);
    let start = end - Duration::days(days as i64);
    let mut generator = SyntheticBarGenerator::new(&config.market_data, config.simulation.seed)?;

    if synthetic {
        info!("Generating {} days of synthetic bars", days);
        return Ok(generator.generate(start, end)?);
    }

    let source = BinanceBarSource::new(&config.market_data)?;
    Ok(market_data::load_history(&source, &mut generator, start, end).await?)
}

async fn run_backtest(
    config: &SimConfig,
    days: Option<u32>,
    synthetic: bool,
    bars_file: Option<PathBuf>,
    strategies: &[String],
    output_dir: &Path,
    cancel: CancellationFlag,
) -> Result<()> {
    let ids = parse_strategy_ids(strategies)?;
    let bars = Arc::new(fetch_backtest_bars(config, days, synthetic, bars_file).await?);
    let runner = Arc::new(BacktestRunner::new(
        config.simulation.initial_balance,
        config.backtest.clone(),
    ));
    runner.ensure_enough_bars(&bars)?;

    info!("Backtesting {} strategies over {} bars", ids.len(), bars.len());

    // One blocking worker per strategy, each with its own engine
    let seed = config.simulation.seed;
    let handles: Vec<_> = ids
        .iter()
        .map(|&id| {
            let runner = runner.clone();
            let bars = bars.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                runner.run_strategy(&bars, StrategySet::build(id, seed), Some(&cancel))
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.context("Backtest worker panicked")??);
    }

    let report = runner.build_report(&bars, results);
    output::print_report(&report);

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;
    output::export_report_json(&report, &output_dir.join("backtest_report.json"))?;
    output::export_results_csv(&report, &output_dir.join("backtest_results.csv"))?;
    output::export_balance_history_csv(&report, &output_dir.join("balance_history.csv"))?;
    info!("Report files written to {}", output_dir.display());

    Ok(())
}

async fn open_session(config: &SimConfig) -> Result<(StateStore, LiveSession)> {
    let store = StateStore::open(
        &config.persistence.state_path,
        config.persistence.database_url.as_deref(),
    )
    .await?;
    let persisted = store.load().await?;
    let session = LiveSession::restore(
        persisted,
        config.simulation.initial_balance,
        config.simulation.seed,
    )?;
    Ok((store, session))
}

async fn run_live(config: &SimConfig, synthetic: bool, cancel: CancellationFlag) -> Result<()> {
    let (store, mut session) = open_session(config).await?;
    let mut generator = SyntheticBarGenerator::new(&config.market_data, config.simulation.seed)?;
    let source = if synthetic {
        None
    } else {
        Some(BinanceBarSource::new(&config.market_data)?)
    };
    let interval = Duration::minutes(config.market_data.bar_interval_minutes as i64);
    let poll = std::time::Duration::from_secs(config.live.poll_interval_secs);

    info!("Live paper trading started ({} strategies)", session.engine().strategy_ids().len());
    info!("Press Ctrl+C to stop");

    while !cancel.is_cancelled() {
        // last fully closed bar
        let target = market_data::align_to_interval(Utc::now(), config.market_data.bar_interval_minutes)
            - interval;
        let is_new = session.last_bar().map_or(true, |b| b.timestamp < target);

        if is_new {
            let bar = match &source {
                Some(source) => market_data::load_latest(source, &mut generator, target).await,
                None => generator.next_bar(target),
            };

            match bar {
                Ok(bar) => {
                    let ts = bar.timestamp;
                    if let Some(report) = session.step(bar) {
                        info!(
                            "Bar {}: {} trades, {} failures{}",
                            ts,
                            report.cycle.executed(),
                            report.cycle.failures(),
                            if report.rolled_over.is_empty() { "" } else { ", daily rollover" }
                        );
                        if let Err(e) = store.save(&session.to_persisted()).await {
                            error!("Failed to persist state: {:#}", e);
                        }
                    }
                }
                Err(e) => warn!("No bar for {}: {}", target, e),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = cancel.cancelled() => break,
        }
    }

    store.save(&session.to_persisted()).await?;
    info!("State saved, live session stopped");
    Ok(())
}

async fn show_status(config: &SimConfig, export: Option<&Path>) -> Result<()> {
    let (_store, session) = open_session(config).await?;
    print!("{}", output::generate_status(session.engine(), session.last_reset_date()));
    println!("Performance records: {}", session.history().len());

    if let Some(path) = export {
        output::export_performance_csv(session.history(), path)?;
        info!("Performance history written to {}", path.display());
    }
    Ok(())
}

async fn reset_state(config: &SimConfig, strategy: Option<&str>) -> Result<()> {
    let (store, mut session) = open_session(config).await?;
    match strategy {
        Some(id) => session.engine_mut().reset(id)?,
        None => session.engine_mut().reset_all(),
    }
    store.save(&session.to_persisted()).await?;
    println!("Reset {}", strategy.unwrap_or("all strategies"));
    Ok(())
}
