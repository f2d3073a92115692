use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Starting balance for every strategy (currency units)
pub const INITIAL_BALANCE: f64 = 100.0;

/// Binary contracts pay this amount to the winning side
pub const SETTLEMENT_PAYOUT: f64 = 100.0;

/// Tolerance for position cost-basis checks
pub const COST_EPSILON: f64 = 1e-9;

/// One 15-minute price observation with the binary market quoted on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    /// Underlying price at bar close
    pub price: f64,
    /// Price of the YES (UP) contract in cents
    pub yes_price: f64,
    /// Price of the NO (DOWN) contract in cents
    pub no_price: f64,
    pub volume: f64,
    /// Minute-level closes inside the bar (may be empty)
    #[serde(default)]
    pub sub_bars: Vec<f64>,
}

impl PriceBar {
    pub fn new(timestamp: DateTime<Utc>, price: f64, yes_price: f64, no_price: f64) -> Self {
        Self {
            timestamp,
            price,
            yes_price,
            no_price,
            volume: 0.0,
            sub_bars: Vec::new(),
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_sub_bars(mut self, sub_bars: Vec<f64>) -> Self {
        self.sub_bars = sub_bars;
        self
    }

    /// Execution price for buying a contract in this direction
    pub fn price_for(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Up => self.yes_price,
            Direction::Down => self.no_price,
        }
    }

    /// Copy of this bar with the binary market resolved to one winner (100/0)
    pub fn resolved(&self, winner: Direction) -> Self {
        let mut bar = self.clone();
        match winner {
            Direction::Up => {
                bar.yes_price = SETTLEMENT_PAYOUT;
                bar.no_price = 0.0;
            }
            Direction::Down => {
                bar.yes_price = 0.0;
                bar.no_price = SETTLEMENT_PAYOUT;
            }
        }
        bar
    }
}

/// Side of a binary bet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Winner of a bar-to-bar move; flat movement resolves DOWN
    pub fn from_move(from: f64, to: f64) -> Self {
        if to > from {
            Direction::Up
        } else {
            Direction::Down
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
        }
    }
}

/// Output of a decision function
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    BuyYes(u32),
    BuyNo(u32),
    Sell,
    Hold,
}

impl Decision {
    /// Direction and quantity for buy decisions
    pub fn as_buy(&self) -> Option<(Direction, u32)> {
        match *self {
            Decision::BuyYes(qty) => Some((Direction::Up, qty)),
            Decision::BuyNo(qty) => Some((Direction::Down, qty)),
            Decision::Sell | Decision::Hold => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::BuyYes(qty) => write!(f, "BUY_YES({})", qty),
            Decision::BuyNo(qty) => write!(f, "BUY_NO({})", qty),
            Decision::Sell => write!(f, "SELL"),
            Decision::Hold => write!(f, "HOLD"),
        }
    }
}

/// Open position in one direction, averaged across entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub direction: Direction,
    pub quantity: f64,
    /// Volume-weighted average entry price
    pub average_price: f64,
    /// Total cost basis; always average_price * quantity
    pub total_cost: f64,
}

impl Position {
    pub fn open(direction: Direction, price: f64, quantity: f64) -> Self {
        Self {
            direction,
            quantity,
            average_price: price,
            total_cost: price * quantity,
        }
    }

    /// Average a new fill into this position
    pub fn add(&mut self, price: f64, quantity: f64) {
        self.total_cost += price * quantity;
        self.quantity += quantity;
        if self.quantity > 0.0 {
            self.average_price = self.total_cost / self.quantity;
        }
    }

    pub fn value_at(&self, price: f64) -> f64 {
        price * self.quantity
    }

    pub fn is_consistent(&self) -> bool {
        let expected = self.average_price * self.quantity;
        (self.total_cost - expected).abs() <= COST_EPSILON * expected.abs().max(1.0)
    }
}

/// Immutable record of one executed decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub price: f64,
    pub quantity: f64,
    pub cost: f64,
}

/// Balance, positions and trade log owned by one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    pub initial_balance: f64,
    pub balance: f64,
    /// At most one open position per direction
    pub positions: BTreeMap<Direction, Position>,
    /// Append-only
    pub trades: Vec<Trade>,
    pub total_pnl: f64,
    /// (balance - initial) / initial * 100, refreshed on settlement
    pub daily_return_pct: f64,
}

impl StrategyState {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            balance: initial_balance,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            total_pnl: 0.0,
            daily_return_pct: 0.0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.initial_balance);
    }

    pub fn has_open_positions(&self) -> bool {
        !self.positions.is_empty()
    }
}

/// Serializable state of one strategy; behavior is re-attached by id on load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub id: String,
    pub initial_balance: f64,
    pub balance: f64,
    pub positions: Vec<Position>,
    pub trades: Vec<Trade>,
    pub total_pnl: f64,
    pub daily_return_pct: f64,
}

impl StrategySnapshot {
    pub fn capture(id: &str, state: &StrategyState) -> Self {
        Self {
            id: id.to_string(),
            initial_balance: state.initial_balance,
            balance: state.balance,
            positions: state.positions.values().cloned().collect(),
            trades: state.trades.clone(),
            total_pnl: state.total_pnl,
            daily_return_pct: state.daily_return_pct,
        }
    }

    pub fn into_state(self) -> StrategyState {
        StrategyState {
            initial_balance: self.initial_balance,
            balance: self.balance,
            positions: self.positions.into_iter().map(|p| (p.direction, p)).collect(),
            trades: self.trades,
            total_pnl: self.total_pnl,
            daily_return_pct: self.daily_return_pct,
        }
    }
}

/// Per-day performance row written before a daily reset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub strategy_id: String,
    pub date: NaiveDate,
    pub starting_balance: f64,
    pub ending_balance: f64,
    pub return_pct: f64,
    pub trade_count: usize,
    pub pnl: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_position_averaging() {
        let mut pos = Position::open(Direction::Up, 40.0, 5.0);
        pos.add(60.0, 5.0);

        assert!((pos.quantity - 10.0).abs() < 1e-12);
        assert!((pos.average_price - 50.0).abs() < 1e-12);
        assert!((pos.total_cost - 500.0).abs() < 1e-12);
        assert!(pos.is_consistent());
    }

    #[test]
    fn test_resolved_bar() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bar = PriceBar::new(ts, 100.0, 52.0, 48.0);

        let up = bar.resolved(Direction::Up);
        assert_eq!(up.yes_price, 100.0);
        assert_eq!(up.no_price, 0.0);

        let down = bar.resolved(Direction::Down);
        assert_eq!(down.yes_price, 0.0);
        assert_eq!(down.no_price, 100.0);
    }

    #[test]
    fn test_flat_move_resolves_down() {
        assert_eq!(Direction::from_move(100.0, 100.0), Direction::Down);
        assert_eq!(Direction::from_move(100.0, 100.01), Direction::Up);
        assert_eq!(Direction::from_move(100.0, 99.0), Direction::Down);
    }

    #[test]
    fn test_snapshot_round_trip_keeps_positions() {
        let mut state = StrategyState::new(INITIAL_BALANCE);
        state.positions.insert(Direction::Down, Position::open(Direction::Down, 45.0, 2.0));
        state.balance = 10.0;

        let snap = StrategySnapshot::capture("momentum", &state);
        assert_eq!(snap.positions.len(), 1);
        assert_eq!(snap.into_state(), state);
    }
}
