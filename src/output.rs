use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tabled::{Table, Tabled};

use crate::backtest::{BacktestReport, BacktestResult};
use crate::engine::SimulationEngine;
use crate::models::PerformanceRecord;
use crate::strategies::StrategyId;

#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Strategy")]
    name: String,
    #[tabled(rename = "Final")]
    final_balance: String,
    #[tabled(rename = "Return")]
    total_return: String,
    #[tabled(rename = "Trades")]
    trades: usize,
    #[tabled(rename = "Win Rate")]
    win_rate: String,
    #[tabled(rename = "Avg Win")]
    avg_win: String,
    #[tabled(rename = "Avg Loss")]
    avg_loss: String,
    #[tabled(rename = "PF")]
    profit_factor: String,
    #[tabled(rename = "Max DD")]
    max_drawdown: String,
    #[tabled(rename = "Sharpe")]
    sharpe: String,
}

impl From<&BacktestResult> for ResultRow {
    fn from(r: &BacktestResult) -> Self {
        Self {
            name: r.strategy_name.clone(),
            final_balance: format!("{:.2}", r.final_balance),
            total_return: format!("{:+.2}%", r.total_return_pct),
            trades: r.total_trades,
            win_rate: format!("{:.1}%", r.win_rate),
            avg_win: format!("{:.2}", r.avg_win),
            avg_loss: format!("{:.2}", r.avg_loss),
            profit_factor: format_profit_factor(r.profit_factor),
            max_drawdown: format!("{:.2}%", r.max_drawdown_pct),
            sharpe: format!("{:.2}", r.sharpe_ratio),
        }
    }
}

#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Strategy")]
    id: String,
    #[tabled(rename = "Balance")]
    balance: String,
    #[tabled(rename = "Open")]
    open_positions: usize,
    #[tabled(rename = "Trades")]
    trades: usize,
    #[tabled(rename = "P&L")]
    pnl: String,
    #[tabled(rename = "Return")]
    daily_return: String,
}

fn format_profit_factor(pf: f64) -> String {
    if pf.is_infinite() {
        "inf".to_string()
    } else {
        format!("{:.2}", pf)
    }
}

/// Human-readable backtest summary
pub fn generate_report(report: &BacktestReport) -> String {
    let mut out = String::new();

    out.push_str("╔══════════════════════════════════════════════════════════════════╗\n");
    out.push_str("║             UP/DOWN PAPER STRATEGIES - BACKTEST REPORT            ║\n");
    out.push_str("╚══════════════════════════════════════════════════════════════════╝\n\n");

    out.push_str("📊 PERIOD\n");
    out.push_str("─────────────────────────────────────────\n");
    out.push_str(&format!(
        "{} to {} ({} bars, {} days)\n\n",
        report.period.start.format("%Y-%m-%d %H:%M"),
        report.period.end.format("%Y-%m-%d %H:%M"),
        report.period.bars,
        report.period.days
    ));

    let rows: Vec<ResultRow> = report.results.iter().map(ResultRow::from).collect();
    out.push_str(&Table::new(rows).to_string());
    out.push_str("\n\n");

    out.push_str("📈 SUMMARY\n");
    out.push_str("─────────────────────────────────────────\n");
    let name_of = |id: &Option<String>| {
        id.as_deref()
            .and_then(|id| report.result(id))
            .map(|r| format!("{} ({:+.2}%)", r.strategy_name, r.total_return_pct))
            .unwrap_or_else(|| "-".to_string())
    };
    out.push_str(&format!("Best strategy:      {}\n", name_of(&report.best_strategy)));
    out.push_str(&format!("Worst strategy:     {}\n", name_of(&report.worst_strategy)));
    out.push_str(&format!("Average return:     {:+.2}%\n", report.average_return_pct));
    out.push_str(&format!("Average win rate:   {:.1}%\n", report.average_win_rate));

    out
}

pub fn print_report(report: &BacktestReport) {
    println!("{}", generate_report(report));
}

/// Current balances and positions of every strategy
pub fn generate_status(engine: &SimulationEngine, last_reset: Option<chrono::NaiveDate>) -> String {
    let rows: Vec<StateRow> = engine
        .strategy_ids()
        .into_iter()
        .filter_map(|id| {
            let state = engine.state(&id)?;
            Some(StateRow {
                balance: format!("{:.2}", state.balance),
                open_positions: state.positions.len(),
                trades: state.trades.len(),
                pnl: format!("{:+.2}", state.total_pnl),
                daily_return: format!("{:+.2}%", state.daily_return_pct),
                id,
            })
        })
        .collect();

    let holding = engine
        .strategy_ids()
        .iter()
        .filter_map(|id| engine.state(id))
        .filter(|s| s.has_open_positions())
        .count();

    let mut out = String::new();
    out.push_str("📊 PAPER TRADING STATUS\n");
    out.push_str("─────────────────────────────────────────\n");
    match last_reset {
        Some(date) => out.push_str(&format!("Last daily reset: {}\n", date)),
        None => out.push_str("Last daily reset: never\n"),
    }
    out.push_str(&format!("Starting balance: {:.2}\n", engine.initial_balance()));
    out.push_str(&format!("Holding positions: {}/{}\n", holding, rows.len()));
    out.push_str(&Table::new(rows).to_string());
    out.push('\n');
    out
}

/// List of registered strategies with descriptions
pub fn generate_strategy_list() -> String {
    let mut out = String::new();
    for id in StrategyId::ALL {
        out.push_str(&format!(
            "  {:<16} {:<16} {}\n",
            id.as_str(),
            id.display_name(),
            id.description()
        ));
    }
    out
}

/// Export the full report (results, balance curves, classified trades) to JSON
pub fn export_report_json(report: &BacktestReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// One row per strategy
pub fn export_results_csv(report: &BacktestReport, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    wtr.write_record([
        "strategy_id",
        "strategy_name",
        "initial_balance",
        "final_balance",
        "total_return_pct",
        "engine_pnl",
        "classified_net_pnl",
        "total_trades",
        "wins",
        "losses",
        "win_rate",
        "avg_win",
        "avg_loss",
        "profit_factor",
        "max_drawdown",
        "max_drawdown_pct",
        "sharpe_ratio",
    ])?;

    for r in &report.results {
        wtr.write_record(&[
            r.strategy_id.clone(),
            r.strategy_name.clone(),
            format!("{:.4}", r.initial_balance),
            format!("{:.4}", r.final_balance),
            format!("{:.4}", r.total_return_pct),
            format!("{:.4}", r.engine_pnl),
            format!("{:.4}", r.classified_net_pnl),
            r.total_trades.to_string(),
            r.wins.to_string(),
            r.losses.to_string(),
            format!("{:.2}", r.win_rate),
            format!("{:.4}", r.avg_win),
            format!("{:.4}", r.avg_loss),
            format_profit_factor(r.profit_factor),
            format!("{:.4}", r.max_drawdown),
            format!("{:.4}", r.max_drawdown_pct),
            format!("{:.4}", r.sharpe_ratio),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Long format: strategy_id, timestamp, balance
pub fn export_balance_history_csv(report: &BacktestReport, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    wtr.write_record(["strategy_id", "timestamp", "balance"])?;
    for r in &report.results {
        for point in &r.balance_history {
            wtr.write_record(&[
                r.strategy_id.clone(),
                point.timestamp.to_rfc3339(),
                format!("{:.4}", point.balance),
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// Daily performance rows recorded at each rollover
pub fn export_performance_csv(records: &[PerformanceRecord], path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for record in records {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{BacktestRunner, CancellationFlag};
    use crate::config::BacktestConfig;
    use crate::error::StrategyError;
    use crate::models::{Decision, PriceBar, INITIAL_BALANCE};
    use crate::strategies::Strategy;
    use chrono::{Duration, TimeZone, Utc};

    fn sample_report() -> BacktestReport {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let bars: Vec<PriceBar> = (0..60)
            .map(|i| {
                let price = 100.0 + (i as f64 * 0.7).sin();
                PriceBar::new(start + Duration::minutes(15 * i), price, 45.0, 55.0)
            })
            .collect();
        BacktestRunner::new(INITIAL_BALANCE, BacktestConfig::default())
            .run(&bars, &StrategyId::ALL, Some(11), Some(&CancellationFlag::new()))
            .unwrap()
    }

    #[test]
    fn test_generate_report() {
        let report = sample_report();
        let text = generate_report(&report);

        assert!(text.contains("BACKTEST REPORT"));
        assert!(text.contains("Momentum"));
        assert!(text.contains("Best strategy"));
        assert!(text.contains("60 bars"));
    }

    #[test]
    fn test_exports_write_files() {
        let report = sample_report();
        let dir = std::env::temp_dir().join(format!("paper-sim-out-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let csv_path = dir.join("results.csv");
        export_results_csv(&report, &csv_path).unwrap();
        let contents = std::fs::read_to_string(&csv_path).unwrap();
        assert_eq!(contents.lines().count(), 1 + StrategyId::ALL.len());

        let json_path = dir.join("report.json");
        export_report_json(&report, &json_path).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(parsed["results"].as_array().unwrap().len(), 5);

        let history_path = dir.join("balances.csv");
        export_balance_history_csv(&report, &history_path).unwrap();
        let rows = std::fs::read_to_string(&history_path).unwrap().lines().count();
        assert_eq!(rows, 1 + 5 * 40);

        std::fs::remove_dir_all(&dir).ok();
    }

    struct BuyYes(&'static str);

    impl Strategy for BuyYes {
        fn id(&self) -> &str {
            self.0
        }

        fn decide(&mut self, _: &PriceBar, _: &[PriceBar]) -> Result<Decision, StrategyError> {
            Ok(Decision::BuyYes(1))
        }
    }

    #[test]
    fn test_status_counts_open_positions() {
        let mut engine = SimulationEngine::with_strategies(
            INITIAL_BALANCE,
            vec![Box::new(BuyYes("cheap")), Box::new(BuyYes("pricey"))],
        );
        engine.execute_cycle(&PriceBar::new(Utc::now(), 100.0, 40.0, 60.0), &[]);
        engine.execute_cycle(&PriceBar::new(Utc::now(), 100.0, 80.0, 20.0), &[]);

        let text = generate_status(&engine, None);
        assert!(text.contains("Last daily reset: never"));
        assert!(text.contains("Starting balance: 100.00"));
        assert!(text.contains("Holding positions: 2/2"));
        assert!(text.contains("cheap"));
    }

    #[test]
    fn test_strategy_list_names_every_strategy() {
        let list = generate_strategy_list();
        for id in StrategyId::ALL {
            assert!(list.contains(id.as_str()));
        }
    }
}
