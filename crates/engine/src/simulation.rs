//! Seams to the collaborators the orchestrator drives but does not own:
//! the matching engine, the strategy, the indicator catalog, the config
//! generator and the candle source.

use async_trait::async_trait;
use persistence::BacktestContext;

use crate::types::{BotConfiguration, Candle, FillEvent, OrderSide, PatternResult, PositionSnapshot};

/// Order-matching engine for one simulated pass
pub trait MarketSimulator: Send {
    /// Advance the market to `candle` (marks open positions at its close)
    fn update(&mut self, candle: &Candle);

    /// Fill resting limit orders of `side` that `price` trades through
    fn check_limit_order_fills_against_price(&mut self, price: f64, timestamp: i64, side: OrderSide);

    fn position(&self, bot_id: &str) -> PositionSnapshot;

    fn quote_balance(&self, bot_id: &str) -> f64;

    fn submit_market_order(
        &mut self,
        bot_id: &str,
        side: OrderSide,
        size: f64,
        price: f64,
        timestamp: i64,
    ) -> anyhow::Result<()>;

    fn submit_limit_order(
        &mut self,
        bot_id: &str,
        side: OrderSide,
        size: f64,
        price: f64,
        timestamp: i64,
    ) -> anyhow::Result<()>;

    fn cancel_orders(&mut self, bot_id: &str);

    /// Fills since the previous call
    fn drain_fills(&mut self) -> Vec<FillEvent>;
}

pub trait SimulatorFactory: Send + Sync {
    fn create(
        &self,
        bot_id: &str,
        config: &BotConfiguration,
        initial_balance: f64,
    ) -> anyhow::Result<Box<dyn MarketSimulator>>;
}

/// Strategy: decides and places orders for one bot
pub trait SignalEvaluator: Send {
    fn evaluate_signals_and_trade(
        &mut self,
        timestamp: i64,
        price: f64,
        pattern: &PatternResult,
        bot_id: &str,
        market: &mut dyn MarketSimulator,
    ) -> anyhow::Result<()>;
}

pub trait EvaluatorFactory: Send + Sync {
    fn create(&self, config: &BotConfiguration) -> Box<dyn SignalEvaluator>;
}

/// Precomputes one `PatternResult` per candle
pub trait PatternCatalog: Send + Sync {
    fn evaluate(&self, candles: &[Candle]) -> Vec<PatternResult>;
}

pub trait ConfigGenerator: Send {
    fn generate(&mut self) -> BotConfiguration;
}

/// Historical candles for a context, ordered by time
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch_candles(&self, ctx: &BacktestContext) -> anyhow::Result<Vec<Candle>>;
}
