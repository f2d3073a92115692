//! The fixed set of decision functions
//!
//! Every strategy maps the current bar plus its history window to a `Decision`.
//! Apart from the Random strategy's RNG they carry no state between calls, so
//! identical inputs give identical decisions.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;

use crate::error::{SimError, StrategyError};
use crate::models::{Decision, PriceBar};
use crate::stats;

/// Contracts bought by the indicator strategies
pub const DEFAULT_QUANTITY: u32 = 5;

pub trait Strategy: Send {
    /// Stable id used as the engine key and for re-attaching after reload
    fn id(&self) -> &str;

    fn decide(&mut self, current: &PriceBar, history: &[PriceBar]) -> Result<Decision, StrategyError>;
}

/// Ids of the registered strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyId {
    Random,
    Momentum,
    MeanReversion,
    Rsi,
    Volatility,
}

impl StrategyId {
    pub const ALL: [StrategyId; 5] = [
        StrategyId::Random,
        StrategyId::Momentum,
        StrategyId::MeanReversion,
        StrategyId::Rsi,
        StrategyId::Volatility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyId::Random => "random",
            StrategyId::Momentum => "momentum",
            StrategyId::MeanReversion => "mean_reversion",
            StrategyId::Rsi => "rsi",
            StrategyId::Volatility => "volatility",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            StrategyId::Random => "Random",
            StrategyId::Momentum => "Momentum",
            StrategyId::MeanReversion => "Mean Reversion",
            StrategyId::Rsi => "RSI",
            StrategyId::Volatility => "Volatility Breakout",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StrategyId::Random => "Bets a random side with 30% probability, 1-10 contracts",
            StrategyId::Momentum => "Follows the recent price trend when it exceeds a threshold",
            StrategyId::MeanReversion => "Bets against deviations of more than 2% from the average price",
            StrategyId::Rsi => "Buys NO above RSI 70 and YES below RSI 30 (14 periods)",
            StrategyId::Volatility => "Follows the last move when short-term volatility spikes",
        }
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyId {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| SimError::UnknownStrategy(s.to_string()))
    }
}

/// Registry resolving strategy ids to decision functions
pub struct StrategySet;

impl StrategySet {
    /// Build the decision function for `id`. `seed` only affects Random.
    pub fn build(id: StrategyId, seed: Option<u64>) -> Box<dyn Strategy> {
        match id {
            StrategyId::Random => Box::new(RandomStrategy::new(seed)),
            StrategyId::Momentum => Box::new(MomentumStrategy),
            StrategyId::MeanReversion => Box::new(MeanReversionStrategy),
            StrategyId::Rsi => Box::new(RsiStrategy),
            StrategyId::Volatility => Box::new(VolatilityStrategy),
        }
    }

    pub fn build_by_name(name: &str, seed: Option<u64>) -> Result<Box<dyn Strategy>, SimError> {
        Ok(Self::build(name.parse()?, seed))
    }

    pub fn all(seed: Option<u64>) -> Vec<Box<dyn Strategy>> {
        StrategyId::ALL.into_iter().map(|id| Self::build(id, seed)).collect()
    }
}

fn check_prices(prices: &[f64], context: &'static str) -> Result<(), StrategyError> {
    match prices.iter().find(|p| !p.is_finite() || **p <= 0.0) {
        Some(&price) => Err(StrategyError::InvalidPrice { price, context }),
        None => Ok(()),
    }
}

/// Sub-bar aware price series: the last `max_bars` history bars (sub-bar closes
/// when present, else the bar price) followed by the current bar.
pub fn assemble_points(current: &PriceBar, history: &[PriceBar], max_bars: usize) -> Vec<f64> {
    let start = history.len().saturating_sub(max_bars);
    let mut points = Vec::new();
    for bar in history[start..].iter().chain(std::iter::once(current)) {
        if bar.sub_bars.is_empty() {
            points.push(bar.price);
        } else {
            points.extend_from_slice(&bar.sub_bars);
        }
    }
    points
}

// =============================================================================
// Random
// =============================================================================

pub struct RandomStrategy {
    rng: StdRng,
}

impl RandomStrategy {
    const TRADE_PROBABILITY: f64 = 0.3;

    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl Strategy for RandomStrategy {
    fn id(&self) -> &str {
        StrategyId::Random.as_str()
    }

    fn decide(&mut self, _current: &PriceBar, _history: &[PriceBar]) -> Result<Decision, StrategyError> {
        if !self.rng.gen_bool(Self::TRADE_PROBABILITY) {
            return Ok(Decision::Hold);
        }
        let quantity = self.rng.gen_range(1..=10);
        if self.rng.gen_bool(0.5) {
            Ok(Decision::BuyYes(quantity))
        } else {
            Ok(Decision::BuyNo(quantity))
        }
    }
}

// =============================================================================
// Momentum
// =============================================================================

pub struct MomentumStrategy;

impl MomentumStrategy {
    const RECENT_BARS: usize = 5;
    const MIN_POINTS: usize = 5;
    const MIN_HISTORY_BARS: usize = 3;
    const MAX_LOOKBACK: usize = 10;
    const FINE_THRESHOLD: f64 = 0.002;
    const COARSE_THRESHOLD: f64 = 0.01;
}

impl Strategy for MomentumStrategy {
    fn id(&self) -> &str {
        StrategyId::Momentum.as_str()
    }

    fn decide(&mut self, current: &PriceBar, history: &[PriceBar]) -> Result<Decision, StrategyError> {
        let mut points = assemble_points(current, history, Self::RECENT_BARS);
        let threshold = if points.len() >= Self::MIN_POINTS {
            if points.len() > 15 {
                Self::FINE_THRESHOLD
            } else {
                Self::COARSE_THRESHOLD
            }
        } else {
            // bar-level fallback
            if history.len() < Self::MIN_HISTORY_BARS {
                return Ok(Decision::Hold);
            }
            points = history.iter().map(|b| b.price).chain(std::iter::once(current.price)).collect();
            Self::COARSE_THRESHOLD
        };
        check_prices(&points, "momentum points")?;

        let lookback = Self::MAX_LOOKBACK.min(points.len() / 2);
        if lookback == 0 {
            return Ok(Decision::Hold);
        }
        let first = points[points.len() - lookback];
        let last = points[points.len() - 1];
        let momentum = (last - first) / first;

        if momentum.abs() > threshold {
            if momentum > 0.0 {
                Ok(Decision::BuyYes(DEFAULT_QUANTITY))
            } else {
                Ok(Decision::BuyNo(DEFAULT_QUANTITY))
            }
        } else {
            Ok(Decision::Hold)
        }
    }
}

// =============================================================================
// Mean reversion
// =============================================================================

pub struct MeanReversionStrategy;

impl MeanReversionStrategy {
    const MIN_HISTORY_BARS: usize = 10;
    const DEVIATION_THRESHOLD: f64 = 0.02;
}

impl Strategy for MeanReversionStrategy {
    fn id(&self) -> &str {
        StrategyId::MeanReversion.as_str()
    }

    fn decide(&mut self, current: &PriceBar, history: &[PriceBar]) -> Result<Decision, StrategyError> {
        if history.len() < Self::MIN_HISTORY_BARS {
            return Ok(Decision::Hold);
        }
        let prices: Vec<f64> = history.iter().map(|b| b.price).collect();
        check_prices(&prices, "mean reversion history")?;
        check_prices(&[current.price], "mean reversion current bar")?;

        let avg = stats::mean(&prices);
        let deviation = (current.price - avg) / avg;

        if deviation > Self::DEVIATION_THRESHOLD {
            Ok(Decision::BuyNo(DEFAULT_QUANTITY))
        } else if deviation < -Self::DEVIATION_THRESHOLD {
            Ok(Decision::BuyYes(DEFAULT_QUANTITY))
        } else {
            Ok(Decision::Hold)
        }
    }
}

// =============================================================================
// RSI
// =============================================================================

pub struct RsiStrategy;

impl RsiStrategy {
    const PERIOD: usize = 14;
    const OVERBOUGHT: f64 = 70.0;
    const OVERSOLD: f64 = 30.0;
}

impl Strategy for RsiStrategy {
    fn id(&self) -> &str {
        StrategyId::Rsi.as_str()
    }

    fn decide(&mut self, current: &PriceBar, history: &[PriceBar]) -> Result<Decision, StrategyError> {
        let points = assemble_points(current, history, history.len());
        if points.len() < Self::PERIOD + 1 {
            return Ok(Decision::Hold);
        }
        let window = &points[points.len() - (Self::PERIOD + 1)..];
        check_prices(window, "rsi points")?;

        let rsi = stats::rsi(window);
        if rsi > Self::OVERBOUGHT {
            Ok(Decision::BuyNo(DEFAULT_QUANTITY))
        } else if rsi < Self::OVERSOLD {
            Ok(Decision::BuyYes(DEFAULT_QUANTITY))
        } else {
            Ok(Decision::Hold)
        }
    }
}

// =============================================================================
// Volatility breakout
// =============================================================================

pub struct VolatilityStrategy;

impl VolatilityStrategy {
    const MIN_HISTORY_BARS: usize = 10;
    const RECENT_RETURNS: usize = 5;
    const SPIKE_RATIO: f64 = 1.5;
}

impl Strategy for VolatilityStrategy {
    fn id(&self) -> &str {
        StrategyId::Volatility.as_str()
    }

    fn decide(&mut self, current: &PriceBar, history: &[PriceBar]) -> Result<Decision, StrategyError> {
        if history.len() < Self::MIN_HISTORY_BARS {
            return Ok(Decision::Hold);
        }
        let prices: Vec<f64> = history.iter().map(|b| b.price).collect();
        check_prices(&prices, "volatility history")?;
        check_prices(&[current.price], "volatility current bar")?;

        let returns = stats::simple_returns(&prices);
        let recent = &returns[returns.len().saturating_sub(Self::RECENT_RETURNS)..];
        let recent_vol = stats::std_dev(recent);
        let long_vol = stats::std_dev(&returns);

        if recent_vol <= Self::SPIKE_RATIO * long_vol {
            return Ok(Decision::Hold);
        }

        let last_change = current.price - prices[prices.len() - 1];
        if last_change > 0.0 {
            Ok(Decision::BuyYes(DEFAULT_QUANTITY))
        } else if last_change < 0.0 {
            Ok(Decision::BuyNo(DEFAULT_QUANTITY))
        } else {
            Ok(Decision::Hold)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars(prices: &[f64]) -> Vec<PriceBar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| PriceBar::new(start + Duration::minutes(15 * i as i64), *p, 50.0, 50.0))
            .collect()
    }

    fn split(prices: &[f64]) -> (PriceBar, Vec<PriceBar>) {
        let mut all = bars(prices);
        let current = all.pop().unwrap();
        (current, all)
    }

    #[test]
    fn test_strategy_id_round_trip() {
        for id in StrategyId::ALL {
            assert_eq!(id.as_str().parse::<StrategyId>().unwrap(), id);
        }
        assert!(matches!("nope".parse::<StrategyId>(), Err(SimError::UnknownStrategy(_))));
    }

    #[test]
    fn test_assemble_points_prefers_sub_bars() {
        let mut history = bars(&[100.0, 101.0, 102.0]);
        history[2].sub_bars = vec![101.5, 101.8, 102.0];
        let current = bars(&[103.0])[0].clone().with_sub_bars(vec![102.5, 103.0]);

        let points = assemble_points(&current, &history, 2);
        assert_eq!(points, vec![101.0, 101.5, 101.8, 102.0, 102.5, 103.0]);
    }

    #[test]
    fn test_momentum_rising_buys_yes() {
        let prices: Vec<f64> = (0..7).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let (current, history) = split(&prices);
        let decision = MomentumStrategy.decide(&current, &history).unwrap();
        assert_eq!(decision, Decision::BuyYes(5));
    }

    #[test]
    fn test_momentum_falling_buys_no() {
        let prices: Vec<f64> = (0..7).map(|i| 100.0 * 0.99f64.powi(i)).collect();
        let (current, history) = split(&prices);
        assert_eq!(MomentumStrategy.decide(&current, &history).unwrap(), Decision::BuyNo(5));
    }

    #[test]
    fn test_momentum_needs_history() {
        let (current, history) = split(&[100.0, 102.0, 104.0]);
        assert_eq!(MomentumStrategy.decide(&current, &history).unwrap(), Decision::Hold);
    }

    #[test]
    fn test_momentum_bar_level_fallback() {
        // 3 history bars + current = 4 points, below 5, falls back to bar-level
        let (current, history) = split(&[100.0, 101.0, 103.0, 105.0]);
        // lookback = min(10, 4/2) = 2 -> (105 - 103) / 103 ~ 1.9%
        assert_eq!(MomentumStrategy.decide(&current, &history).unwrap(), Decision::BuyYes(5));
    }

    #[test]
    fn test_momentum_sub_bar_threshold() {
        // 20 sub-bar points rising 0.05% each: over 10 points ~0.45% > 0.2%
        let closes: Vec<f64> = (0..20).map(|i| 100.0 * 1.0005f64.powi(i)).collect();
        let mut history = bars(&[100.0, 100.0, 100.0, 100.0]);
        for (i, bar) in history.iter_mut().enumerate() {
            bar.sub_bars = closes[i * 4..i * 4 + 4].to_vec();
        }
        let current = bars(&[101.0])[0].clone().with_sub_bars(closes[16..].to_vec());
        assert_eq!(MomentumStrategy.decide(&current, &history).unwrap(), Decision::BuyYes(5));
    }

    #[test]
    fn test_mean_reversion() {
        let mut prices = vec![100.0; 10];
        prices.push(103.0);
        let (current, history) = split(&prices);
        assert_eq!(MeanReversionStrategy.decide(&current, &history).unwrap(), Decision::BuyNo(5));

        let mut prices = vec![100.0; 10];
        prices.push(97.0);
        let (current, history) = split(&prices);
        assert_eq!(MeanReversionStrategy.decide(&current, &history).unwrap(), Decision::BuyYes(5));

        let mut prices = vec![100.0; 10];
        prices.push(101.0);
        let (current, history) = split(&prices);
        assert_eq!(MeanReversionStrategy.decide(&current, &history).unwrap(), Decision::Hold);
    }

    #[test]
    fn test_mean_reversion_short_history_holds() {
        let (current, history) = split(&[100.0, 100.0, 150.0]);
        assert_eq!(MeanReversionStrategy.decide(&current, &history).unwrap(), Decision::Hold);
    }

    #[test]
    fn test_rsi_decreasing_buys_yes() {
        let prices: Vec<f64> = (0..16).map(|i| 200.0 - 2.0 * i as f64).collect();
        let (current, history) = split(&prices);
        assert_eq!(RsiStrategy.decide(&current, &history).unwrap(), Decision::BuyYes(5));
    }

    #[test]
    fn test_rsi_increasing_buys_no() {
        let prices: Vec<f64> = (0..16).map(|i| 100.0 + i as f64).collect();
        let (current, history) = split(&prices);
        assert_eq!(RsiStrategy.decide(&current, &history).unwrap(), Decision::BuyNo(5));
    }

    #[test]
    fn test_rsi_insufficient_points_holds() {
        let prices: Vec<f64> = (0..10).map(|i| 100.0 - i as f64).collect();
        let (current, history) = split(&prices);
        assert_eq!(RsiStrategy.decide(&current, &history).unwrap(), Decision::Hold);
    }

    #[test]
    fn test_volatility_spike_follows_last_move() {
        // calm history then a sharp swing in the last bars
        let mut prices: Vec<f64> = (0..21).map(|i| 100.0 + (i % 2) as f64 * 0.1).collect();
        prices.extend([103.0, 99.0, 104.0]);
        prices.push(106.0);
        let (current, history) = split(&prices);
        assert_eq!(VolatilityStrategy.decide(&current, &history).unwrap(), Decision::BuyYes(5));

        let last = prices.len() - 1;
        prices[last] = 101.0;
        let (current, history) = split(&prices);
        assert_eq!(VolatilityStrategy.decide(&current, &history).unwrap(), Decision::BuyNo(5));
    }

    #[test]
    fn test_volatility_calm_holds() {
        let prices: Vec<f64> = (0..12).map(|i| 100.0 + (i % 2) as f64 * 0.1).collect();
        let (current, history) = split(&prices);
        assert_eq!(VolatilityStrategy.decide(&current, &history).unwrap(), Decision::Hold);
    }

    #[test]
    fn test_invalid_price_is_an_error() {
        let mut prices = vec![100.0; 10];
        prices[3] = 0.0;
        prices.push(100.0);
        let (current, history) = split(&prices);
        assert!(MeanReversionStrategy.decide(&current, &history).is_err());
    }

    #[test]
    fn test_random_is_reproducible_with_seed() {
        let (current, history) = split(&[100.0, 101.0]);
        let mut a = RandomStrategy::new(Some(7));
        let mut b = RandomStrategy::new(Some(7));
        for _ in 0..50 {
            let da = a.decide(&current, &history).unwrap();
            let db = b.decide(&current, &history).unwrap();
            assert_eq!(da, db);
            if let Some((_, qty)) = da.as_buy() {
                assert!((1..=10).contains(&qty));
            }
        }
    }
}
