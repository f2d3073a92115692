//! Persisted simulator state
//!
//! Snapshots, the last daily reset date and the performance history survive
//! restarts either in a JSON file or in Postgres (see `db`).

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::db::PgStateStore;
use crate::error::SimError;
use crate::models::{PerformanceRecord, PriceBar, StrategySnapshot};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub snapshots: Vec<StrategySnapshot>,
    pub last_reset_date: Option<NaiveDate>,
    /// Append-only daily performance rows
    pub history: Vec<PerformanceRecord>,
    /// Live decision window, oldest first
    #[serde(default)]
    pub recent_bars: Vec<PriceBar>,
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.history.is_empty() && self.last_reset_date.is_none()
    }
}

/// Pretty JSON file holding the whole `PersistedState`
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file loads as empty state
    pub fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            debug!("No state file at {}", self.path.display());
            return Ok(PersistedState::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        let state = serde_json::from_str(&contents).map_err(|e| {
            SimError::Persistence(format!("corrupt state file {}: {}", self.path.display(), e))
        })?;
        Ok(state)
    }

    /// Write through a temp file so a crash never leaves half a state file
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace state file: {}", self.path.display()))?;
        debug!("Saved {} snapshots to {}", state.snapshots.len(), self.path.display());
        Ok(())
    }
}

/// Backend picked from configuration
pub enum StateStore {
    File(FileStateStore),
    Postgres(PgStateStore),
}

impl StateStore {
    /// Postgres when a database URL is configured, the state file otherwise
    pub async fn open(state_path: &Path, database_url: Option<&str>) -> Result<Self> {
        match database_url {
            Some(url) => {
                let store = PgStateStore::connect(url).await?;
                store.run_migrations().await?;
                Ok(Self::Postgres(store))
            }
            None => {
                info!("Using state file {}", state_path.display());
                Ok(Self::File(FileStateStore::new(state_path)))
            }
        }
    }

    pub async fn load(&self) -> Result<PersistedState> {
        match self {
            Self::File(store) => store.load(),
            Self::Postgres(store) => store.load().await,
        }
    }

    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        match self {
            Self::File(store) => store.save(state),
            Self::Postgres(store) => store.save(state).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Position, StrategyState, INITIAL_BALANCE};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("paper-sim-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_missing_file_is_empty() {
        let store = FileStateStore::new(temp_path("missing"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_persistence_error() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "{ not json").unwrap();
        let err = FileStateStore::new(&path).load().unwrap_err();
        std::fs::remove_file(&path).ok();

        let sim = err.downcast_ref::<SimError>().unwrap();
        assert_eq!(sim.kind(), "persistence");
    }

    #[test]
    fn test_file_round_trip() {
        let path = temp_path("round-trip");
        let store = FileStateStore::new(&path);

        let mut state = StrategyState::new(100.0);
        state.balance = 60.0;
        state.positions.insert(Direction::Up, Position::open(Direction::Up, 40.0, 1.0));
        let persisted = PersistedState {
            snapshots: vec![StrategySnapshot::capture("rsi", &state)],
            last_reset_date: NaiveDate::from_ymd_opt(2024, 7, 4),
            history: vec![PerformanceRecord {
                strategy_id: "rsi".to_string(),
                date: NaiveDate::from_ymd_opt(2024, 7, 3).unwrap(),
                starting_balance: 100.0,
                ending_balance: 112.5,
                return_pct: 12.5,
                trade_count: 3,
                pnl: 12.5,
            }],
            recent_bars: Vec::new(),
        };

        store.save(&persisted).unwrap();
        let loaded = store.load().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, persisted);
    }

    #[test]
    fn test_reload_is_bit_exact() {
        let mut rng = StdRng::seed_from_u64(11);
        let snapshots: Vec<StrategySnapshot> = (0..2000)
            .map(|i| {
                let mut state = StrategyState::new(INITIAL_BALANCE);
                state.balance = rng.gen_range(0.0..200.0);
                state.total_pnl = state.balance - INITIAL_BALANCE;
                state.daily_return_pct = state.total_pnl / INITIAL_BALANCE * 100.0;
                let price = rng.gen_range(1.0..99.0);
                let quantity = rng.gen_range(1..=10) as f64;
                state.positions.insert(Direction::Down, Position::open(Direction::Down, price, quantity));
                StrategySnapshot::capture(&format!("s{}", i), &state)
            })
            .collect();

        let path = temp_path("bit-exact");
        let store = FileStateStore::new(&path);
        let persisted = PersistedState {
            snapshots,
            ..Default::default()
        };
        store.save(&persisted).unwrap();
        let loaded = store.load().unwrap();
        std::fs::remove_file(&path).ok();

        for (before, after) in persisted.snapshots.iter().zip(&loaded.snapshots) {
            assert_eq!(before.balance.to_bits(), after.balance.to_bits(), "{}", before.id);
            assert_eq!(before, after);
        }
        assert_eq!(loaded.snapshots.len(), 2000);
    }
}
