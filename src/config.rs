use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SimError, SimResult};
use crate::models::INITIAL_BALANCE;
use crate::stats;

pub const DEFAULT_CONFIG_PATH: &str = "config/sim_config.yaml";

/// Simulator configuration loaded from YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub simulation: SimulationConfig,
    pub backtest: BacktestConfig,
    pub market_data: MarketDataConfig,
    pub live: LiveConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Starting balance per strategy
    pub initial_balance: f64,
    /// Seed for the random strategy and synthetic bars (entropy when absent)
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_balance: INITIAL_BALANCE,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Bars of history handed to each decision
    pub lookback_bars: usize,
    /// Max distance between a trade and its matched bar
    pub match_tolerance_minutes: i64,
    /// Moves within +/- this percent count as noise
    pub noise_threshold_pct: f64,
    pub annualization_days: f64,
    pub bars_per_day: usize,
    /// Default span for `backtest` when --days is not given
    pub default_days: u32,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            lookback_bars: 20,
            match_tolerance_minutes: 15,
            noise_threshold_pct: 0.01,
            annualization_days: stats::ANNUALIZATION_DAYS,
            bars_per_day: 96,
            default_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub symbol: String,
    pub bar_interval_minutes: u32,
    /// Fetch 1-minute closes for each bar
    pub include_sub_bars: bool,
    pub request_timeout_ms: u64,
    /// Cents of yes price per percent of intrabar move
    pub price_sensitivity: f64,
    /// Per-minute volatility of the synthetic fallback walk
    pub fallback_volatility: f64,
    pub fallback_start_price: f64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.binance.com".to_string(),
            symbol: "BTCUSDT".to_string(),
            bar_interval_minutes: 15,
            include_sub_bars: true,
            request_timeout_ms: 10_000,
            price_sensitivity: 10.0,
            fallback_volatility: 0.0008,
            fallback_start_price: 60_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// How often to poll for a new bar (seconds)
    pub poll_interval_secs: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub state_path: PathBuf,
    /// Postgres is used instead of the state file when set
    pub database_url: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("data/paper_state.json"),
            database_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, RUST_LOG wins when set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl SimConfig {
    /// Load configuration from YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: SimConfig = serde_yaml::from_str(&contents)
            .with_context(|| "Failed to parse YAML configuration")?;

        Ok(config)
    }

    /// Load with environment variable overrides; a missing file means defaults
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Path from SIM_CONFIG_PATH, falling back to the default location
    pub fn default_path() -> PathBuf {
        std::env::var("SIM_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("SIM_INITIAL_BALANCE") {
            self.simulation.initial_balance = val.parse().unwrap_or(self.simulation.initial_balance);
        }
        if let Ok(val) = std::env::var("SIM_SEED") {
            self.simulation.seed = val.parse().ok().or(self.simulation.seed);
        }
        if let Ok(val) = std::env::var("SIM_LOOKBACK_BARS") {
            self.backtest.lookback_bars = val.parse().unwrap_or(self.backtest.lookback_bars);
        }
        if let Ok(val) = std::env::var("SIM_STATE_PATH") {
            self.persistence.state_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("DATABASE_URL") {
            if !val.is_empty() {
                self.persistence.database_url = Some(val);
            }
        }
        if let Ok(val) = std::env::var("BINANCE_API_URL") {
            self.market_data.base_url = val;
        }
        if let Ok(val) = std::env::var("SIM_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        let fail = |msg: &str| Err(SimError::Config(msg.to_string()));

        if !(self.simulation.initial_balance.is_finite() && self.simulation.initial_balance > 0.0) {
            return fail("simulation.initial_balance must be positive");
        }
        if self.backtest.lookback_bars < 1 {
            return fail("backtest.lookback_bars must be at least 1");
        }
        if self.backtest.match_tolerance_minutes < 0 {
            return fail("backtest.match_tolerance_minutes must not be negative");
        }
        if self.backtest.noise_threshold_pct < 0.0 {
            return fail("backtest.noise_threshold_pct must not be negative");
        }
        if self.backtest.annualization_days <= 0.0 {
            return fail("backtest.annualization_days must be positive");
        }
        if self.backtest.bars_per_day == 0 {
            return fail("backtest.bars_per_day must be positive");
        }
        if self.market_data.bar_interval_minutes == 0 {
            return fail("market_data.bar_interval_minutes must be positive");
        }
        if self.market_data.fallback_start_price <= 0.0 {
            return fail("market_data.fallback_start_price must be positive");
        }
        if self.market_data.fallback_volatility < 0.0 {
            return fail("market_data.fallback_volatility must not be negative");
        }
        if self.live.poll_interval_secs == 0 {
            return fail("live.poll_interval_secs must be positive");
        }
        Ok(())
    }
}
