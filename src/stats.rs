use chrono::{DateTime, NaiveDate, Utc};
use statrs::statistics::Statistics;

/// Trading days per year used to annualize the Sharpe ratio
pub const ANNUALIZATION_DAYS: f64 = 252.0;

/// Arithmetic mean, 0 for an empty slice
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().mean()
}

/// Population standard deviation, 0 for fewer than two values
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().population_std_dev()
}

/// Simple returns between consecutive prices
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Annualized Sharpe ratio of periodic returns (no risk-free rate)
///
/// Returns 0 when the standard deviation is zero or there are fewer than two returns.
pub fn sharpe_ratio(returns: &[f64], annualization: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let sd = std_dev(returns);
    if sd == 0.0 || !sd.is_finite() {
        return 0.0;
    }
    mean(returns) / sd * annualization.sqrt()
}

/// Relative Strength Index over the changes in `prices`
///
/// Average loss of zero yields 100.
pub fn rsi(prices: &[f64]) -> f64 {
    let changes: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
    if changes.is_empty() {
        return 50.0;
    }
    let n = changes.len() as f64;
    let avg_gain = changes.iter().filter(|c| **c > 0.0).sum::<f64>() / n;
    let avg_loss = changes.iter().filter(|c| **c < 0.0).map(|c| -c).sum::<f64>() / n;

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Gross profit over gross loss
///
/// Infinite when there are wins but no losses, 0 when there is nothing to compare.
pub fn profit_factor(total_win_profit: f64, total_loss_amount: f64) -> f64 {
    if total_loss_amount > 0.0 {
        total_win_profit / total_loss_amount
    } else if total_win_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Running peak and worst drawdown of a balance curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawdownTracker {
    pub peak: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
}

impl DrawdownTracker {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            peak: starting_balance,
            max_drawdown: 0.0,
            max_drawdown_pct: 0.0,
        }
    }

    pub fn update(&mut self, balance: f64) {
        if balance > self.peak {
            self.peak = balance;
        }
        let drawdown = self.peak - balance;
        let drawdown_pct = if self.peak > 0.0 {
            drawdown / self.peak * 100.0
        } else {
            0.0
        };
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
        if drawdown_pct > self.max_drawdown_pct {
            self.max_drawdown_pct = drawdown_pct;
        }
    }
}

/// Per-day percent returns from a balance curve
///
/// Points are grouped by UTC calendar day; the last point of each day is its
/// closing balance and returns are taken between consecutive closing balances.
pub fn daily_returns(history: &[(DateTime<Utc>, f64)]) -> Vec<(NaiveDate, f64)> {
    let mut day_ends: Vec<(NaiveDate, f64)> = Vec::new();
    for (ts, balance) in history {
        let day = ts.date_naive();
        match day_ends.last_mut() {
            Some((last_day, last_balance)) if *last_day == day => *last_balance = *balance,
            _ => day_ends.push((day, *balance)),
        }
    }

    day_ends
        .windows(2)
        .map(|w| {
            let (_, prev) = w[0];
            let (day, close) = w[1];
            let ret = if prev != 0.0 { (close - prev) / prev * 100.0 } else { 0.0 };
            (day, ret)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_std_dev_population() {
        // population sd of 2,4,4,4,5,5,7,9 is exactly 2
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((std_dev(&values) - 2.0).abs() < 1e-12);
        assert_eq!(std_dev(&[1.0]), 0.0);
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn test_sharpe_zero_when_flat() {
        assert_eq!(sharpe_ratio(&[1.0, 1.0, 1.0], ANNUALIZATION_DAYS), 0.0);
        assert_eq!(sharpe_ratio(&[1.0], ANNUALIZATION_DAYS), 0.0);
    }

    #[test]
    fn test_sharpe_positive() {
        let returns = [1.0, 3.0];
        // mean 2, population sd 1
        let expected = 2.0 * ANNUALIZATION_DAYS.sqrt();
        assert!((sharpe_ratio(&returns, ANNUALIZATION_DAYS) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_bounds() {
        let falling: Vec<f64> = (0..15).map(|i| 100.0 - i as f64).collect();
        assert_eq!(rsi(&falling), 0.0);

        let rising: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&rising), 100.0);

        let mixed = [100.0, 101.0, 100.0];
        assert!((rsi(&mixed) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_profit_factor_edges() {
        assert_eq!(profit_factor(10.0, 5.0), 2.0);
        assert!(profit_factor(10.0, 0.0).is_infinite());
        assert_eq!(profit_factor(0.0, 0.0), 0.0);
    }

    #[test]
    fn test_drawdown_tracker() {
        let mut dd = DrawdownTracker::new(100.0);
        dd.update(120.0);
        dd.update(90.0);
        dd.update(130.0);
        assert_eq!(dd.peak, 130.0);
        assert!((dd.max_drawdown - 30.0).abs() < 1e-12);
        assert!((dd.max_drawdown_pct - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_daily_returns_uses_day_end_balance() {
        let d1 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let d1_late = Utc.with_ymd_and_hms(2024, 3, 1, 23, 45, 0).unwrap();
        let d2 = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
        let history = vec![(d1, 100.0), (d1_late, 110.0), (d2, 121.0)];

        let returns = daily_returns(&history);
        assert_eq!(returns.len(), 1);
        assert_eq!(returns[0].0, d2.date_naive());
        assert!((returns[0].1 - 10.0).abs() < 1e-9);
    }
}
