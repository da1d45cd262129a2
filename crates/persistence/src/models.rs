//! Records shared between the engine and the repositories

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one backtest scope. Immutable once a session begins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BacktestContext {
    pub symbol: String,
    pub timeframe: String,
    /// Epoch milliseconds, inclusive
    pub start_timestamp: i64,
    /// Epoch milliseconds, exclusive
    pub end_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
}

impl BacktestContext {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        start_timestamp: i64,
        end_timestamp: i64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            start_timestamp,
            end_timestamp,
            config_hash: None,
        }
    }

    /// Copy of this context scoped to a single configuration
    pub fn with_config_hash(&self, config_hash: impl Into<String>) -> Self {
        Self {
            config_hash: Some(config_hash.into()),
            ..self.clone()
        }
    }

    /// Copy without the configuration scope (the session identity)
    pub fn session(&self) -> Self {
        Self {
            config_hash: None,
            ..self.clone()
        }
    }

    /// Key segment shared by every record of this session
    pub fn segment(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.symbol, self.timeframe, self.start_timestamp, self.end_timestamp
        )
    }
}

impl fmt::Display for BacktestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}..{}]",
            self.symbol, self.timeframe, self.start_timestamp, self.end_timestamp
        )?;
        if let Some(hash) = &self.config_hash {
            let short: String = hash.chars().take(12).collect();
            write!(f, " #{short}")?;
        }
        Ok(())
    }
}

/// One round trip. Negative sizes are shorts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub entry_timestamp: i64,
    pub entry_price: f64,
    pub entry_size: f64,
    pub exit_timestamp: i64,
    pub exit_price: f64,
    pub exit_size: f64,
    pub realized_pnl: f64,
    /// Closed synthetically at the last candle; PnL is unrealized
    #[serde(default)]
    pub marked_to_market: bool,
}
