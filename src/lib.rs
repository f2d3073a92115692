//! Paper trading for binary UP/DOWN markets
//!
//! A set of decision functions trade simulated YES/NO contracts on 15-minute
//! price bars. Each strategy keeps its own balance and positions, positions
//! settle at 100 or 0, and the same engine drives both live paper trading and
//! historical backtests.

pub mod backtest;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod market_data;
pub mod models;
pub mod output;
pub mod persistence;
pub mod session;
pub mod stats;
pub mod strategies;

pub use backtest::{BacktestReport, BacktestResult, BacktestRunner, CancellationFlag};
pub use config::SimConfig;
pub use engine::SimulationEngine;
pub use error::{SimError, SimResult, StrategyError};
pub use models::{Decision, Direction, PriceBar};
pub use strategies::{Strategy, StrategyId, StrategySet};
