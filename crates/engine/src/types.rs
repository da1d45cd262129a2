//! Types shared by the simulation loop and its collaborators

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sizes below this are treated as a flat position
pub const FLAT_EPSILON: f64 = 1e-12;

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time, epoch milliseconds
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Build from a `[timestamp, open, high, low, close, volume]` row
    pub fn from_row(row: [f64; 6]) -> Self {
        Self {
            timestamp: row[0] as i64,
            open: row[1],
            high: row[2],
            low: row[3],
            close: row[4],
            volume: row[5],
        }
    }
}

/// Side of an order or fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
}

/// Position as reported by the market after a step. Negative size is short.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub size: f64,
    pub entry_price: f64,
    /// Running total since the start of the run, fees included
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

impl PositionSnapshot {
    pub fn is_flat(&self) -> bool {
        self.size.abs() < FLAT_EPSILON
    }
}

/// Execution reported by the market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub bot_id: String,
    pub timestamp: i64,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
}

/// Indicator / pattern values available to the strategy at one candle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternResult {
    pub values: BTreeMap<String, f64>,
}

impl PatternResult {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }
}

/// One candidate bot. Field values are kept on coarse grids so that the
/// configuration space is finite and fingerprints can collide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfiguration {
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    /// Only enter with the trend of this SMA when set
    pub trend_sma: Option<usize>,
    /// Share of the quote balance committed per entry (e.g. 25.0 = 25%)
    pub position_size_pct: f64,
    pub take_profit_pct: Option<f64>,
    pub allow_short: bool,
}

impl Default for BotConfiguration {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            trend_sma: None,
            position_size_pct: 25.0,
            take_profit_pct: None,
            allow_short: false,
        }
    }
}
