use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, info, warn};

use crate::models::{PerformanceRecord, Position, PriceBar, StrategySnapshot, Trade};
use crate::persistence::PersistedState;

/// Schema for snapshots, session metadata and daily performance rows
const MIGRATION: &str = include_str!("../migrations/001_paper_trading.sql");

/// Postgres-backed state store
pub struct PgStateStore {
    client: Client,
}

impl PgStateStore {
    /// Connect with TLS unless the URL disables it
    pub async fn connect(database_url: &str) -> Result<Self> {
        let client = if database_url.contains("sslmode=disable") {
            let (client, connection) = tokio_postgres::connect(database_url, NoTls)
                .await
                .context("Failed to connect to database")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!("Database connection error: {}", e);
                }
            });
            client
        } else {
            // Accept self-signed certs on managed Postgres
            let connector = TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .context("Failed to create TLS connector")?;
            let connector = MakeTlsConnector::new(connector);

            let (client, connection) = tokio_postgres::connect(database_url, connector)
                .await
                .context("Failed to connect to database")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!("Database connection error: {}", e);
                }
            });
            client
        };

        info!("Connected to state database");
        Ok(Self { client })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        self.client
            .batch_execute(MIGRATION)
            .await
            .context("Failed to run paper trading migration")?;
        info!("Database migrations complete");
        Ok(())
    }

    pub async fn load(&self) -> Result<PersistedState> {
        let snapshots = self
            .client
            .query(
                "SELECT strategy_id, initial_balance, balance, total_pnl, daily_return_pct, positions, trades
                 FROM paper_strategy_state ORDER BY strategy_id",
                &[],
            )
            .await
            .context("Failed to load strategy state")?
            .iter()
            .map(snapshot_from_row)
            .collect::<Result<Vec<_>>>()?;

        let meta = self
            .client
            .query_opt(
                "SELECT last_reset_date, recent_bars FROM paper_sim_meta WHERE id = 1",
                &[],
            )
            .await
            .context("Failed to load session metadata")?;
        let (last_reset_date, recent_bars) = match meta {
            Some(row) => {
                let date: Option<NaiveDate> = row.get(0);
                let bars: Vec<PriceBar> = serde_json::from_value(row.get(1))
                    .context("Corrupt recent bars")?;
                (date, bars)
            }
            None => (None, Vec::new()),
        };

        let history = self
            .client
            .query(
                "SELECT strategy_id, date, starting_balance, ending_balance, return_pct, trade_count, pnl
                 FROM paper_performance_history ORDER BY date, strategy_id",
                &[],
            )
            .await
            .context("Failed to load performance history")?
            .iter()
            .map(|row| {
                let trade_count: i32 = row.get(5);
                PerformanceRecord {
                    strategy_id: row.get(0),
                    date: row.get(1),
                    starting_balance: row.get(2),
                    ending_balance: row.get(3),
                    return_pct: row.get(4),
                    trade_count: trade_count.max(0) as usize,
                    pnl: row.get(6),
                }
            })
            .collect();

        Ok(PersistedState {
            snapshots,
            last_reset_date,
            history,
            recent_bars,
        })
    }

    /// Upsert snapshots and the reset date; history rows are insert-once per (strategy, date)
    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        let now = Utc::now();

        for snap in &state.snapshots {
            let positions = serde_json::to_value(&snap.positions)?;
            let trades = serde_json::to_value(&snap.trades)?;
            self.client
                .execute(
                    r#"
                    INSERT INTO paper_strategy_state
                        (strategy_id, initial_balance, balance, total_pnl, daily_return_pct, positions, trades, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (strategy_id) DO UPDATE SET
                        initial_balance = EXCLUDED.initial_balance,
                        balance = EXCLUDED.balance,
                        total_pnl = EXCLUDED.total_pnl,
                        daily_return_pct = EXCLUDED.daily_return_pct,
                        positions = EXCLUDED.positions,
                        trades = EXCLUDED.trades,
                        updated_at = EXCLUDED.updated_at
                    "#,
                    &[
                        &snap.id,
                        &snap.initial_balance,
                        &snap.balance,
                        &snap.total_pnl,
                        &snap.daily_return_pct,
                        &positions,
                        &trades,
                        &now,
                    ],
                )
                .await
                .with_context(|| format!("Failed to save state for {}", snap.id))?;
        }

        let recent_bars = serde_json::to_value(&state.recent_bars)?;
        self.client
            .execute(
                r#"
                INSERT INTO paper_sim_meta (id, last_reset_date, recent_bars, updated_at)
                VALUES (1, $1, $2, $3)
                ON CONFLICT (id) DO UPDATE SET
                    last_reset_date = EXCLUDED.last_reset_date,
                    recent_bars = EXCLUDED.recent_bars,
                    updated_at = EXCLUDED.updated_at
                "#,
                &[&state.last_reset_date, &recent_bars, &now],
            )
            .await
            .context("Failed to save session metadata")?;

        let mut inserted = 0u64;
        for record in &state.history {
            let trade_count = record.trade_count as i32;
            inserted += self
                .client
                .execute(
                    r#"
                    INSERT INTO paper_performance_history
                        (strategy_id, date, starting_balance, ending_balance, return_pct, trade_count, pnl)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (strategy_id, date) DO NOTHING
                    "#,
                    &[
                        &record.strategy_id,
                        &record.date,
                        &record.starting_balance,
                        &record.ending_balance,
                        &record.return_pct,
                        &trade_count,
                        &record.pnl,
                    ],
                )
                .await
                .context("Failed to append performance record")?;
        }

        debug!(
            "Saved {} snapshots, {} new performance rows",
            state.snapshots.len(),
            inserted
        );
        Ok(())
    }
}

fn snapshot_from_row(row: &Row) -> Result<StrategySnapshot> {
    let id: String = row.get(0);
    let positions: Vec<Position> = serde_json::from_value(row.get(5))
        .with_context(|| format!("Corrupt positions for {}", id))?;
    let trades: Vec<Trade> = serde_json::from_value(row.get(6))
        .with_context(|| format!("Corrupt trades for {}", id))?;

    Ok(StrategySnapshot {
        initial_balance: row.get(1),
        balance: row.get(2),
        total_pnl: row.get(3),
        daily_return_pct: row.get(4),
        positions,
        trades,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_columns_are_float8() {
        assert!(!MIGRATION.contains("NUMERIC"));
        for table in ["paper_strategy_state", "paper_sim_meta", "paper_performance_history"] {
            assert!(MIGRATION.contains(&format!("CREATE TABLE IF NOT EXISTS {}", table)));
        }
    }
}
