use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the simulation core
#[derive(Error, Debug)]
pub enum SimError {
    /// Not enough bars to run a backtest
    #[error("Insufficient data: need at least {required} bars, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// A long-running job was cancelled between bars
    #[error("Run cancelled before completion")]
    Cancelled,

    /// Market data could not be obtained from the source nor the fallback generator
    #[error("Market data unavailable: {0}")]
    DataSource(String),

    /// A strategy failed to produce a decision
    #[error("Strategy '{strategy}' failed: {message}")]
    Strategy { strategy: String, message: String },

    /// No decision function is registered under this id
    #[error("Unknown strategy id: {0}")]
    UnknownStrategy(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SimError {
    /// Stable machine-readable kind, used in structured error reports
    pub fn kind(&self) -> &'static str {
        match self {
            SimError::InsufficientData { .. } => "insufficient_data",
            SimError::Cancelled => "cancelled",
            SimError::DataSource(_) => "data_source",
            SimError::Strategy { .. } => "strategy",
            SimError::UnknownStrategy(_) => "unknown_strategy",
            SimError::Persistence(_) => "persistence",
            SimError::Config(_) => "config",
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// Failure of a single decision function
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    #[error("invalid price {price} in {context}")]
    InvalidPrice { price: f64, context: &'static str },

    #[error("{0}")]
    Other(String),
}

/// Structured error description for user-visible failures (kind + message)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
}

pub type SimResult<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_data_report() {
        let err = SimError::InsufficientData { required: 20, actual: 15 };
        let report = err.report();
        assert_eq!(report.kind, "insufficient_data");
        assert!(report.message.contains("20"));
        assert!(report.message.contains("15"));
    }

    #[test]
    fn test_strategy_error_display() {
        let err = StrategyError::InvalidPrice { price: -1.0, context: "history" };
        assert_eq!(err.to_string(), "invalid price -1 in history");
    }
}
