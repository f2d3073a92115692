//! Paper-trading simulation engine
//!
//! Holds one `StrategyState` per strategy id and applies decisions and
//! settlements to it. Strategies never share state, so a failing decision
//! function only costs that strategy its turn.

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{SimError, SimResult};
use crate::models::{
    Decision, Direction, PerformanceRecord, Position, PriceBar, StrategySnapshot, StrategyState, Trade,
};
use crate::strategies::{Strategy, StrategySet};

/// Generate a unique trade id (timestamp + random)
fn generate_trade_id(timestamp: DateTime<Utc>) -> String {
    let random: u64 = rand::thread_rng().gen();
    format!("{:016x}-{:016x}", timestamp.timestamp_millis() as u64, random)
}

struct Slot {
    strategy: Box<dyn Strategy>,
    state: StrategyState,
}

/// What happened to one strategy during a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Held,
    Executed(Trade),
    /// Cost exceeded balance; nothing happened
    Skipped { cost: f64, balance: f64 },
    Closed { pnl: f64 },
    Failed(String),
}

/// Per-strategy results of one `execute_cycle`
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub outcomes: Vec<(String, CycleOutcome)>,
}

impl CycleReport {
    pub fn executed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, CycleOutcome::Executed(_)))
            .count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, CycleOutcome::Failed(_)))
            .count()
    }
}

pub struct SimulationEngine {
    initial_balance: f64,
    slots: Vec<Slot>,
}

impl SimulationEngine {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            slots: Vec::new(),
        }
    }

    /// Engine seeded with the given decision functions, each with a fresh state
    pub fn with_strategies(initial_balance: f64, strategies: Vec<Box<dyn Strategy>>) -> Self {
        let mut engine = Self::new(initial_balance);
        for strategy in strategies {
            engine.add_strategy(strategy);
        }
        engine
    }

    /// Register a strategy with a fresh state; replaces any strategy with the same id
    pub fn add_strategy(&mut self, strategy: Box<dyn Strategy>) {
        let state = StrategyState::new(self.initial_balance);
        let id = strategy.id().to_string();
        match self.slots.iter_mut().find(|s| s.strategy.id() == id) {
            Some(slot) => {
                slot.strategy = strategy;
                slot.state = state;
            }
            None => self.slots.push(Slot { strategy, state }),
        }
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.strategy.id().to_string()).collect()
    }

    pub fn state(&self, id: &str) -> Option<&StrategyState> {
        self.slots.iter().find(|s| s.strategy.id() == id).map(|s| &s.state)
    }

    /// Run every strategy's decision function once against `current`
    pub fn execute_cycle(&mut self, current: &PriceBar, history: &[PriceBar]) -> CycleReport {
        let mut report = CycleReport::default();

        for slot in &mut self.slots {
            let id = slot.strategy.id().to_string();
            let outcome = match slot.strategy.decide(current, history) {
                Ok(decision) => apply_decision(&mut slot.state, decision, current),
                Err(e) => {
                    let err = SimError::Strategy {
                        strategy: id.clone(),
                        message: e.to_string(),
                    };
                    warn!("{} at {}", err, current.timestamp);
                    CycleOutcome::Failed(e.to_string())
                }
            };

            match &outcome {
                CycleOutcome::Executed(trade) => debug!(
                    "{}: {} x{} @ {:.2} (cost {:.2}, balance {:.2})",
                    id, trade.direction, trade.quantity, trade.price, trade.cost, slot.state.balance
                ),
                CycleOutcome::Skipped { cost, balance } => debug!(
                    "{}: skipped trade, cost {:.2} exceeds balance {:.2}",
                    id, cost, balance
                ),
                _ => {}
            }
            report.outcomes.push((id, outcome));
        }

        report
    }

    /// Realize every open position at `settlement`'s prices and clear them
    pub fn settle_positions(&mut self, settlement: &PriceBar) {
        for slot in &mut self.slots {
            let pnl = settle_state(&mut slot.state, settlement);
            if pnl != 0.0 {
                debug!(
                    "{}: settled pnl {:+.2}, balance {:.2}",
                    slot.strategy.id(),
                    pnl,
                    slot.state.balance
                );
            }
        }
    }

    pub fn reset(&mut self, id: &str) -> SimResult<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.strategy.id() == id)
            .ok_or_else(|| SimError::UnknownStrategy(id.to_string()))?;
        slot.state.reset();
        info!("Reset strategy {}", id);
        Ok(())
    }

    pub fn reset_all(&mut self) {
        for slot in &mut self.slots {
            slot.state.reset();
        }
        info!("Reset all {} strategies", self.slots.len());
    }

    /// Capture a performance record per strategy for `date`, then reset all of them
    pub fn roll_over(&mut self, date: NaiveDate) -> Vec<PerformanceRecord> {
        let records = self
            .slots
            .iter()
            .map(|slot| PerformanceRecord {
                strategy_id: slot.strategy.id().to_string(),
                date,
                starting_balance: slot.state.initial_balance,
                ending_balance: slot.state.balance,
                return_pct: slot.state.daily_return_pct,
                trade_count: slot.state.trades.len(),
                pnl: slot.state.total_pnl,
            })
            .collect();
        info!("Daily rollover for {}", date);
        self.reset_all();
        records
    }

    pub fn snapshots(&self) -> Vec<StrategySnapshot> {
        self.slots
            .iter()
            .map(|slot| StrategySnapshot::capture(slot.strategy.id(), &slot.state))
            .collect()
    }

    /// Rebuild an engine from persisted state, resolving decision functions by id
    pub fn restore(
        initial_balance: f64,
        snapshots: Vec<StrategySnapshot>,
        seed: Option<u64>,
    ) -> SimResult<Self> {
        let mut engine = Self::new(initial_balance);
        for snapshot in snapshots {
            let strategy = StrategySet::build_by_name(&snapshot.id, seed)?;
            engine.slots.push(Slot {
                strategy,
                state: snapshot.into_state(),
            });
        }
        Ok(engine)
    }
}

/// Apply one decision to a strategy's state
pub fn apply_decision(state: &mut StrategyState, decision: Decision, bar: &PriceBar) -> CycleOutcome {
    match decision {
        Decision::Hold => CycleOutcome::Held,
        Decision::Sell => CycleOutcome::Closed { pnl: close_at_entry(state) },
        Decision::BuyYes(qty) => buy(state, Direction::Up, qty, bar),
        Decision::BuyNo(qty) => buy(state, Direction::Down, qty, bar),
    }
}

fn buy(state: &mut StrategyState, direction: Direction, quantity: u32, bar: &PriceBar) -> CycleOutcome {
    let price = bar.price_for(direction);
    if !price.is_finite() || price <= 0.0 {
        warn!("Rejecting {} buy at {}: price {}", direction, bar.timestamp, price);
        return CycleOutcome::Failed(format!("invalid {} price {}", direction, price));
    }
    let quantity = quantity as f64;
    let cost = price * quantity;

    if cost > state.balance {
        return CycleOutcome::Skipped {
            cost,
            balance: state.balance,
        };
    }

    state.balance -= cost;
    let trade = Trade {
        id: generate_trade_id(bar.timestamp),
        timestamp: bar.timestamp,
        direction,
        price,
        quantity,
        cost,
    };
    state.trades.push(trade.clone());

    state
        .positions
        .entry(direction)
        .and_modify(|p| p.add(price, quantity))
        .or_insert_with(|| Position::open(direction, price, quantity));

    CycleOutcome::Executed(trade)
}

/// Close every position at its own average price; realized pnl is zero by construction
fn close_at_entry(state: &mut StrategyState) -> f64 {
    let mut pnl = 0.0;
    for position in state.positions.values() {
        let exit_value = position.value_at(position.average_price);
        pnl += exit_value - position.total_cost;
        state.balance += exit_value;
    }
    state.positions.clear();
    state.total_pnl += pnl;
    pnl
}

/// Settle one strategy's positions against `settlement`, returning realized pnl
pub fn settle_state(state: &mut StrategyState, settlement: &PriceBar) -> f64 {
    let mut pnl = 0.0;
    for position in state.positions.values() {
        let exit_value = position.value_at(settlement.price_for(position.direction));
        pnl += exit_value - position.total_cost;
        state.balance += exit_value;
    }
    state.positions.clear();
    state.total_pnl += pnl;
    state.daily_return_pct = (state.balance - state.initial_balance) / state.initial_balance * 100.0;
    pnl
}
