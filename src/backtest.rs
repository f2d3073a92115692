//! Backtest runner
//!
//! Replays a historical bar series through a fresh `SimulationEngine` per
//! strategy, settling every cycle against the next bar's realized move.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::BacktestConfig;
use crate::engine::SimulationEngine;
use crate::error::{SimError, SimResult};
use crate::models::{Direction, PriceBar, Trade, SETTLEMENT_PAYOUT};
use crate::stats::{self, DrawdownTracker};
use crate::strategies::{Strategy, StrategyId, StrategySet};

/// Cooperative cancellation checked between bars, or awaited by async loops
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called, immediately if it already was
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // register before checking the flag so a concurrent cancel is not missed
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancePoint {
    pub timestamp: DateTime<Utc>,
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReturn {
    pub date: NaiveDate,
    pub return_pct: f64,
}

/// Post-hoc win/loss verdict for one trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedTrade {
    pub trade: Trade,
    pub won: bool,
    /// Move of the matched bar to the next one, None when no bar matched
    pub price_change_pct: Option<f64>,
    /// Win profit if won, else the trade cost
    pub amount: f64,
}

/// Summary of one strategy over a backtest; read-only once built
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy_id: String,
    pub strategy_name: String,
    pub initial_balance: f64,
    pub final_balance: f64,
    pub total_return_pct: f64,
    /// Settlement-based pnl tracked by the engine
    pub engine_pnl: f64,
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub total_win_profit: f64,
    pub total_loss_amount: f64,
    /// Classification-based net (wins minus losses); not reconciled with `engine_pnl`
    pub classified_net_pnl: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub balance_history: Vec<BalancePoint>,
    pub daily_returns: Vec<DailyReturn>,
    pub classified_trades: Vec<ClassifiedTrade>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bars: usize,
    pub days: usize,
}

/// Everything a presentation layer needs from one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub period: BacktestPeriod,
    pub results: Vec<BacktestResult>,
    pub best_strategy: Option<String>,
    pub worst_strategy: Option<String>,
    pub average_return_pct: f64,
    pub average_win_rate: f64,
}

impl BacktestReport {
    pub fn result(&self, strategy_id: &str) -> Option<&BacktestResult> {
        self.results.iter().find(|r| r.strategy_id == strategy_id)
    }
}

pub struct BacktestRunner {
    initial_balance: f64,
    config: BacktestConfig,
}

impl BacktestRunner {
    pub fn new(initial_balance: f64, config: BacktestConfig) -> Self {
        Self {
            initial_balance,
            config,
        }
    }

    /// Fail fast when the series cannot fill one lookback window; at least one bar is always required
    pub fn ensure_enough_bars(&self, bars: &[PriceBar]) -> SimResult<()> {
        let required = self.config.lookback_bars.max(1);
        if bars.len() < required {
            return Err(SimError::InsufficientData {
                required,
                actual: bars.len(),
            });
        }
        Ok(())
    }

    /// Backtest registered strategies by id
    pub fn run(
        &self,
        bars: &[PriceBar],
        ids: &[StrategyId],
        seed: Option<u64>,
        cancel: Option<&CancellationFlag>,
    ) -> SimResult<BacktestReport> {
        let strategies = ids.iter().map(|id| StrategySet::build(*id, seed)).collect();
        self.run_with(bars, strategies, cancel)
    }

    /// Backtest arbitrary decision functions, each in isolation
    pub fn run_with(
        &self,
        bars: &[PriceBar],
        strategies: Vec<Box<dyn Strategy>>,
        cancel: Option<&CancellationFlag>,
    ) -> SimResult<BacktestReport> {
        self.ensure_enough_bars(bars)?;
        info!(
            "Backtesting {} strategies over {} bars",
            strategies.len(),
            bars.len()
        );

        let mut results = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            results.push(self.run_strategy(bars, strategy, cancel)?);
        }
        Ok(self.build_report(bars, results))
    }

    /// Run one strategy through its own engine
    pub fn run_strategy(
        &self,
        bars: &[PriceBar],
        strategy: Box<dyn Strategy>,
        cancel: Option<&CancellationFlag>,
    ) -> SimResult<BacktestResult> {
        self.ensure_enough_bars(bars)?;

        let strategy_id = strategy.id().to_string();
        let mut engine = SimulationEngine::with_strategies(self.initial_balance, vec![strategy]);
        let lookback = self.config.lookback_bars;
        let Some(last) = bars.len().checked_sub(1) else {
            return Err(SimError::InsufficientData { required: 1, actual: 0 });
        };

        let mut balance_history = Vec::with_capacity(bars.len().saturating_sub(lookback));
        let mut drawdown = DrawdownTracker::new(self.initial_balance);

        for i in lookback..bars.len() {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                info!("Backtest of {} cancelled at bar {}", strategy_id, i);
                return Err(SimError::Cancelled);
            }

            let current = &bars[i];
            engine.execute_cycle(current, &bars[i - lookback..i]);
            engine.settle_positions(&settlement_bar(bars, i, last));

            let balance = engine
                .state(&strategy_id)
                .map(|s| s.balance)
                .unwrap_or(self.initial_balance);
            balance_history.push(BalancePoint {
                timestamp: current.timestamp,
                balance,
            });
            drawdown.update(balance);
        }

        let state = engine
            .state(&strategy_id)
            .cloned()
            .ok_or_else(|| SimError::UnknownStrategy(strategy_id.clone()))?;

        let result = self.summarize(&strategy_id, bars, &state.trades, state.balance, state.total_pnl, balance_history, drawdown);
        info!(
            "{}: final {:.2} ({:+.2}%), {} trades, win rate {:.1}%, sharpe {:.2}",
            result.strategy_id,
            result.final_balance,
            result.total_return_pct,
            result.total_trades,
            result.win_rate,
            result.sharpe_ratio
        );
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn summarize(
        &self,
        strategy_id: &str,
        bars: &[PriceBar],
        trades: &[Trade],
        final_balance: f64,
        engine_pnl: f64,
        balance_history: Vec<BalancePoint>,
        drawdown: DrawdownTracker,
    ) -> BacktestResult {
        let classified: Vec<ClassifiedTrade> = trades
            .iter()
            .map(|t| self.classify_trade(t, bars))
            .collect();

        let wins = classified.iter().filter(|c| c.won).count();
        let losses = classified.len() - wins;
        let total_win_profit: f64 = classified.iter().filter(|c| c.won).map(|c| c.amount).sum();
        let total_loss_amount: f64 = classified.iter().filter(|c| !c.won).map(|c| c.amount).sum();

        let curve: Vec<(DateTime<Utc>, f64)> =
            balance_history.iter().map(|p| (p.timestamp, p.balance)).collect();
        let daily: Vec<DailyReturn> = stats::daily_returns(&curve)
            .into_iter()
            .map(|(date, return_pct)| DailyReturn { date, return_pct })
            .collect();
        let periodic: Vec<f64> = daily.iter().map(|d| d.return_pct).collect();

        let strategy_name = strategy_id
            .parse::<StrategyId>()
            .map(|id| id.display_name().to_string())
            .unwrap_or_else(|_| strategy_id.to_string());

        BacktestResult {
            strategy_id: strategy_id.to_string(),
            strategy_name,
            initial_balance: self.initial_balance,
            final_balance,
            total_return_pct: (final_balance - self.initial_balance) / self.initial_balance * 100.0,
            engine_pnl,
            total_trades: classified.len(),
            wins,
            losses,
            win_rate: if classified.is_empty() {
                0.0
            } else {
                wins as f64 / classified.len() as f64 * 100.0
            },
            avg_win: if wins > 0 { total_win_profit / wins as f64 } else { 0.0 },
            avg_loss: if losses > 0 { total_loss_amount / losses as f64 } else { 0.0 },
            total_win_profit,
            total_loss_amount,
            classified_net_pnl: total_win_profit - total_loss_amount,
            profit_factor: stats::profit_factor(total_win_profit, total_loss_amount),
            max_drawdown: drawdown.max_drawdown,
            max_drawdown_pct: drawdown.max_drawdown_pct,
            sharpe_ratio: stats::sharpe_ratio(&periodic, self.config.annualization_days),
            balance_history,
            daily_returns: daily,
            classified_trades: classified,
        }
    }

    /// Judge a trade by the move from its bar to the following one
    pub fn classify_trade(&self, trade: &Trade, bars: &[PriceBar]) -> ClassifiedTrade {
        let tolerance = Duration::minutes(self.config.match_tolerance_minutes);
        let loss = |pct| ClassifiedTrade {
            trade: trade.clone(),
            won: false,
            price_change_pct: pct,
            amount: trade.cost,
        };

        let Some(idx) = nearest_bar(bars, trade.timestamp, tolerance) else {
            debug!("Trade {} has no bar within tolerance", trade.id);
            return loss(None);
        };
        let Some(next) = bars.get(idx + 1) else {
            return loss(None);
        };

        let bar = &bars[idx];
        let change_pct = (next.price - bar.price) / bar.price * 100.0;
        let threshold = self.config.noise_threshold_pct;
        let won = match trade.direction {
            Direction::Up => change_pct > threshold,
            Direction::Down => change_pct < -threshold,
        };

        if won {
            ClassifiedTrade {
                trade: trade.clone(),
                won,
                price_change_pct: Some(change_pct),
                amount: (SETTLEMENT_PAYOUT - trade.price) * trade.quantity,
            }
        } else {
            loss(Some(change_pct))
        }
    }

    /// Combine per-strategy results, keeping their order
    pub fn build_report(&self, bars: &[PriceBar], results: Vec<BacktestResult>) -> BacktestReport {
        let best = results
            .iter()
            .max_by(|a, b| a.total_return_pct.total_cmp(&b.total_return_pct))
            .map(|r| r.strategy_id.clone());
        let worst = results
            .iter()
            .min_by(|a, b| a.total_return_pct.total_cmp(&b.total_return_pct))
            .map(|r| r.strategy_id.clone());

        let count = results.len().max(1) as f64;
        let average_return_pct = results.iter().map(|r| r.total_return_pct).sum::<f64>() / count;
        let average_win_rate = results.iter().map(|r| r.win_rate).sum::<f64>() / count;

        BacktestReport {
            period: period_of(bars, self.config.bars_per_day),
            results,
            best_strategy: best,
            worst_strategy: worst,
            average_return_pct,
            average_win_rate,
        }
    }
}

/// Bar `i` resolved against the next bar's move; the final bar settles as quoted
pub fn settlement_bar(bars: &[PriceBar], i: usize, last: usize) -> PriceBar {
    if i < last {
        bars[i].resolved(Direction::from_move(bars[i].price, bars[i + 1].price))
    } else {
        bars[i].clone()
    }
}

/// Index of the bar closest to `ts` within `tolerance`
fn nearest_bar(bars: &[PriceBar], ts: DateTime<Utc>, tolerance: Duration) -> Option<usize> {
    let split = bars.partition_point(|b| b.timestamp < ts);
    [split.checked_sub(1), Some(split)]
        .into_iter()
        .flatten()
        .filter(|&i| i < bars.len())
        .map(|i| (i, (bars[i].timestamp - ts).abs()))
        .filter(|(_, gap)| *gap <= tolerance)
        .min_by_key(|(_, gap)| *gap)
        .map(|(i, _)| i)
}

pub fn period_of(bars: &[PriceBar], bars_per_day: usize) -> BacktestPeriod {
    let start = bars.first().map(|b| b.timestamp).unwrap_or_default();
    let end = bars.last().map(|b| b.timestamp).unwrap_or_default();
    BacktestPeriod {
        start,
        end,
        bars: bars.len(),
        days: bars.len().div_ceil(bars_per_day.max(1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrategyError;
    use crate::models::{Decision, INITIAL_BALANCE};
    use chrono::TimeZone;

    struct Always(&'static str, Decision);

    impl Strategy for Always {
        fn id(&self) -> &str {
            self.0
        }

        fn decide(&mut self, _: &PriceBar, _: &[PriceBar]) -> Result<Decision, StrategyError> {
            Ok(self.1)
        }
    }

    fn series(prices: &[f64]) -> Vec<PriceBar> {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| PriceBar::new(start + Duration::minutes(15 * i as i64), *p, 50.0, 50.0))
            .collect()
    }

    fn runner() -> BacktestRunner {
        BacktestRunner::new(INITIAL_BALANCE, BacktestConfig::default())
    }

    #[test]
    fn test_short_series_is_insufficient() {
        let bars = series(&[100.0; 15]);
        let err = runner().run(&bars, &StrategyId::ALL, Some(1), None).unwrap_err();
        assert!(matches!(err, SimError::InsufficientData { required: 20, actual: 15 }));
    }

    #[test]
    fn test_settlement_bar_forces_winner() {
        let bars = series(&[100.0, 101.0, 101.0, 100.5]);
        let up = settlement_bar(&bars, 0, 3);
        assert_eq!((up.yes_price, up.no_price), (100.0, 0.0));
        // flat goes to DOWN
        let flat = settlement_bar(&bars, 1, 3);
        assert_eq!((flat.yes_price, flat.no_price), (0.0, 100.0));
        // last bar settles as quoted
        let last = settlement_bar(&bars, 3, 3);
        assert_eq!((last.yes_price, last.no_price), (50.0, 50.0));
    }

    #[test]
    fn test_classify_trade_win_and_noise() {
        let bars = series(&[100.0, 100.5, 100.505]);
        let trade = |i: usize, direction| Trade {
            id: format!("t{}", i),
            timestamp: bars[i].timestamp + Duration::minutes(3),
            direction,
            price: 40.0,
            quantity: 2.0,
            cost: 80.0,
        };
        let r = runner();

        let win = r.classify_trade(&trade(0, Direction::Up), &bars);
        assert!(win.won);
        assert!((win.amount - 120.0).abs() < 1e-9);

        let wrong_side = r.classify_trade(&trade(0, Direction::Down), &bars);
        assert!(!wrong_side.won);
        assert_eq!(wrong_side.amount, 80.0);

        // ~0.005% move is inside the noise band
        let noise = r.classify_trade(&trade(1, Direction::Up), &bars);
        assert!(!noise.won);

        // last bar has no successor
        let dangling = r.classify_trade(&trade(2, Direction::Up), &bars);
        assert!(!dangling.won);
        assert_eq!(dangling.price_change_pct, None);
    }

    #[test]
    fn test_classify_trade_without_matching_bar() {
        let bars = series(&[100.0, 101.0]);
        let trade = Trade {
            id: "far".to_string(),
            timestamp: bars[0].timestamp - Duration::hours(2),
            direction: Direction::Up,
            price: 50.0,
            quantity: 1.0,
            cost: 50.0,
        };
        let c = runner().classify_trade(&trade, &bars);
        assert!(!c.won);
        assert_eq!(c.amount, 50.0);
    }

    #[test]
    fn test_holding_strategy_keeps_balance() {
        let bars = series(&[100.0; 30]);
        let result = runner()
            .run_strategy(&bars, Box::new(Always("hold", Decision::Hold)), None)
            .unwrap();
        assert_eq!(result.final_balance, INITIAL_BALANCE);
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.win_rate, 0.0);
        assert_eq!(result.profit_factor, 0.0);
        assert_eq!(result.balance_history.len(), 10);
        assert_eq!(result.max_drawdown, 0.0);
    }

    #[test]
    fn test_cancelled_run_returns_no_result() {
        let bars = series(&[100.0; 40]);
        let flag = CancellationFlag::new();
        flag.cancel();
        let err = runner()
            .run(&bars, &[StrategyId::Momentum], None, Some(&flag))
            .unwrap_err();
        assert!(matches!(err, SimError::Cancelled));
    }

    #[test]
    fn test_period_descriptor() {
        let bars = series(&[100.0; 200]);
        let period = period_of(&bars, 96);
        assert_eq!(period.bars, 200);
        assert_eq!(period.days, 3);
        assert_eq!(period.start, bars[0].timestamp);
        assert_eq!(period.end, bars[199].timestamp);
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiting_task() {
        let flag = CancellationFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        flag.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_when_already_cancelled() {
        let flag = CancellationFlag::new();
        flag.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(100), flag.cancelled())
            .await
            .expect("already cancelled flag should resolve at once");
    }
}
