//! Live paper-trading session
//!
//! Feeds one bar at a time into the engine: settles the previous bar's
//! positions, rolls the day over when the calendar date changes, then runs a
//! decision cycle.

use chrono::NaiveDate;
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::engine::{CycleReport, SimulationEngine};
use crate::error::SimResult;
use crate::models::{Direction, PerformanceRecord, PriceBar};
use crate::persistence::PersistedState;
use crate::strategies::StrategySet;

/// Bars of history kept for decisions
pub const LIVE_HISTORY_BARS: usize = 20;

/// What one `step` did
#[derive(Debug, Default)]
pub struct StepReport {
    /// Winner the previous bar settled to
    pub settled: Option<Direction>,
    /// Records emitted by a daily rollover
    pub rolled_over: Vec<PerformanceRecord>,
    pub cycle: CycleReport,
}

pub struct LiveSession {
    engine: SimulationEngine,
    last_reset_date: Option<NaiveDate>,
    recent: VecDeque<PriceBar>,
    history: Vec<PerformanceRecord>,
}

impl LiveSession {
    pub fn new(engine: SimulationEngine) -> Self {
        Self {
            engine,
            last_reset_date: None,
            recent: VecDeque::with_capacity(LIVE_HISTORY_BARS + 1),
            history: Vec::new(),
        }
    }

    /// Resume from persisted state; strategies missing from the snapshots start fresh
    pub fn restore(state: PersistedState, initial_balance: f64, seed: Option<u64>) -> SimResult<Self> {
        let mut engine = SimulationEngine::restore(initial_balance, state.snapshots, seed)?;
        let known = engine.strategy_ids();
        for strategy in StrategySet::all(seed) {
            if !known.iter().any(|id| id == strategy.id()) {
                engine.add_strategy(strategy);
            }
        }

        let mut recent: VecDeque<PriceBar> = state.recent_bars.into();
        while recent.len() > LIVE_HISTORY_BARS {
            recent.pop_front();
        }

        Ok(Self {
            engine,
            last_reset_date: state.last_reset_date,
            recent,
            history: state.history,
        })
    }

    pub fn engine(&self) -> &SimulationEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SimulationEngine {
        &mut self.engine
    }

    pub fn last_reset_date(&self) -> Option<NaiveDate> {
        self.last_reset_date
    }

    pub fn history(&self) -> &[PerformanceRecord] {
        &self.history
    }

    pub fn recent_bars(&self) -> impl Iterator<Item = &PriceBar> {
        self.recent.iter()
    }

    /// Last bar processed
    pub fn last_bar(&self) -> Option<&PriceBar> {
        self.recent.back()
    }

    /// Process one new bar; bars not newer than the last one are ignored
    pub fn step(&mut self, bar: PriceBar) -> Option<StepReport> {
        if let Some(last) = self.recent.back() {
            if bar.timestamp <= last.timestamp {
                debug!("Ignoring bar at {}, already processed", bar.timestamp);
                return None;
            }
        }

        let mut report = StepReport::default();

        if let Some(prev) = self.recent.back() {
            let winner = Direction::from_move(prev.price, bar.price);
            let settlement = prev.resolved(winner);
            self.engine.settle_positions(&settlement);
            report.settled = Some(winner);
        }

        let today = bar.timestamp.date_naive();
        match self.last_reset_date {
            Some(last) if today > last => {
                let records = self.engine.roll_over(last);
                info!("Recorded {} performance rows for {}", records.len(), last);
                self.history.extend(records.iter().cloned());
                report.rolled_over = records;
                self.last_reset_date = Some(today);
            }
            Some(_) => {}
            None => self.last_reset_date = Some(today),
        }

        let window: Vec<PriceBar> = self.recent.iter().cloned().collect();
        report.cycle = self.engine.execute_cycle(&bar, &window);

        self.recent.push_back(bar);
        while self.recent.len() > LIVE_HISTORY_BARS {
            self.recent.pop_front();
        }

        Some(report)
    }

    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            snapshots: self.engine.snapshots(),
            last_reset_date: self.last_reset_date,
            history: self.history.clone(),
            recent_bars: self.recent.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrategyError;
    use crate::models::{Decision, INITIAL_BALANCE};
    use crate::strategies::Strategy;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    struct BuyUp;

    impl Strategy for BuyUp {
        fn id(&self) -> &str {
            "buy_up"
        }

        fn decide(&mut self, _: &PriceBar, _: &[PriceBar]) -> Result<Decision, StrategyError> {
            Ok(Decision::BuyYes(1))
        }
    }

    fn bar(ts: DateTime<Utc>, price: f64) -> PriceBar {
        PriceBar::new(ts, price, 40.0, 60.0)
    }

    fn session() -> LiveSession {
        LiveSession::new(SimulationEngine::with_strategies(INITIAL_BALANCE, vec![Box::new(BuyUp)]))
    }

    #[test]
    fn test_step_settles_previous_bar() {
        let t0 = Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).unwrap();
        let mut s = session();

        s.step(bar(t0, 100.0)).unwrap();
        assert_eq!(s.engine().state("buy_up").unwrap().balance, 60.0);

        // price rose, the UP position pays 100
        let report = s.step(bar(t0 + Duration::minutes(15), 101.0)).unwrap();
        assert_eq!(report.settled, Some(Direction::Up));
        let state = s.engine().state("buy_up").unwrap();
        assert_eq!(state.balance, 160.0 - 40.0);
        assert_eq!(state.total_pnl, 60.0);
    }

    #[test]
    fn test_duplicate_bar_is_ignored() {
        let t0 = Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).unwrap();
        let mut s = session();
        s.step(bar(t0, 100.0)).unwrap();
        assert!(s.step(bar(t0, 100.5)).is_none());
        assert_eq!(s.engine().state("buy_up").unwrap().trades.len(), 1);
    }

    #[test]
    fn test_new_day_rolls_over() {
        let late = Utc.with_ymd_and_hms(2024, 8, 1, 23, 45, 0).unwrap();
        let mut s = session();
        s.step(bar(late, 100.0)).unwrap();

        // flat move settles DOWN, the UP stake is lost before the rollover
        let report = s.step(bar(late + Duration::minutes(15), 100.0)).unwrap();
        assert_eq!(report.rolled_over.len(), 1);

        let record = &report.rolled_over[0];
        assert_eq!(record.date, late.date_naive());
        assert_eq!(record.ending_balance, 60.0);
        assert_eq!(record.trade_count, 1);
        assert!((record.return_pct + 40.0).abs() < 1e-9);

        assert_eq!(s.last_reset_date(), NaiveDate::from_ymd_opt(2024, 8, 2));
        assert_eq!(s.history().len(), 1);
        // fresh day, one new trade at 40
        assert_eq!(s.engine().state("buy_up").unwrap().balance, 60.0);
        assert_eq!(s.engine().state("buy_up").unwrap().trades.len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let t0 = Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap();
        let mut s = LiveSession::new(SimulationEngine::new(INITIAL_BALANCE));
        for i in 0..30 {
            s.step(bar(t0 + Duration::minutes(15 * i), 100.0 + i as f64)).unwrap();
        }
        assert_eq!(s.recent_bars().count(), LIVE_HISTORY_BARS);
    }

    #[test]
    fn test_restore_fills_missing_strategies() {
        let persisted = PersistedState::default();
        let s = LiveSession::restore(persisted, INITIAL_BALANCE, Some(5)).unwrap();
        assert_eq!(s.engine().strategy_ids().len(), 5);
    }
}
