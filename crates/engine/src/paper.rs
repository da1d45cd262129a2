//! Paper market: a netting single-instrument matching engine.
//!
//! Each bot has a margin account whose balance is the initial deposit plus
//! realized PnL net of fees. Market orders fill at the submitted price.
//! Limit orders rest until a price check trades through them and then fill
//! at their limit price.

use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::simulation::{MarketSimulator, SimulatorFactory};
use crate::types::{
    BotConfiguration, Candle, FillEvent, OrderKind, OrderSide, PositionSnapshot, FLAT_EPSILON,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperMarketConfig {
    /// Fee rate on market orders, e.g. 0.0004 = 4 bps
    pub taker_fee_rate: f64,
    pub maker_fee_rate: f64,
}

impl Default for PaperMarketConfig {
    fn default() -> Self {
        Self {
            taker_fee_rate: 0.0004,
            maker_fee_rate: 0.0002,
        }
    }
}

#[derive(Debug, Clone)]
struct RestingOrder {
    side: OrderSide,
    size: f64,
    price: f64,
}

#[derive(Debug, Clone, Default)]
struct Account {
    balance: f64,
    size: f64,
    entry_price: f64,
    realized_pnl: f64,
    orders: Vec<RestingOrder>,
}

impl Account {
    /// Net a fill into the position. Returns the fee charged.
    fn apply_fill(&mut self, side: OrderSide, size: f64, price: f64, fee_rate: f64) -> f64 {
        let signed = match side {
            OrderSide::Buy => size,
            OrderSide::Sell => -size,
        };
        let fee = size * price * fee_rate;
        self.balance -= fee;
        self.realized_pnl -= fee;

        let current = self.size;
        if current.abs() < FLAT_EPSILON || current.signum() == signed.signum() {
            let total = current.abs() + size;
            self.entry_price = (current.abs() * self.entry_price + size * price) / total;
            self.size = current + signed;
            return fee;
        }

        let closing = size.min(current.abs());
        let pnl = closing * (price - self.entry_price) * current.signum();
        self.balance += pnl;
        self.realized_pnl += pnl;

        let remaining = current + signed;
        if remaining.abs() < FLAT_EPSILON {
            self.size = 0.0;
            self.entry_price = 0.0;
        } else if remaining.signum() != current.signum() {
            self.size = remaining;
            self.entry_price = price;
        } else {
            self.size = remaining;
        }
        fee
    }
}

pub struct PaperMarket {
    config: PaperMarketConfig,
    accounts: HashMap<String, Account>,
    mark_price: f64,
    fills: Vec<FillEvent>,
}

impl PaperMarket {
    pub fn new(config: PaperMarketConfig) -> Self {
        Self {
            config,
            accounts: HashMap::new(),
            mark_price: 0.0,
            fills: Vec::new(),
        }
    }

    pub fn open_account(&mut self, bot_id: &str, initial_balance: f64) {
        self.accounts.insert(
            bot_id.to_string(),
            Account {
                balance: initial_balance,
                ..Account::default()
            },
        );
    }

    fn account_mut(&mut self, bot_id: &str) -> anyhow::Result<&mut Account> {
        match self.accounts.get_mut(bot_id) {
            Some(account) => Ok(account),
            None => bail!("unknown bot: {bot_id}"),
        }
    }
}

impl MarketSimulator for PaperMarket {
    fn update(&mut self, candle: &Candle) {
        self.mark_price = candle.close;
    }

    fn check_limit_order_fills_against_price(&mut self, price: f64, timestamp: i64, side: OrderSide) {
        let fee_rate = self.config.maker_fee_rate;
        for (bot_id, account) in self.accounts.iter_mut() {
            let (hit, resting): (Vec<RestingOrder>, Vec<RestingOrder>) =
                account.orders.drain(..).partition(|o| {
                    o.side == side
                        && match side {
                            OrderSide::Buy => price <= o.price,
                            OrderSide::Sell => price >= o.price,
                        }
                });
            account.orders = resting;
            for order in hit {
                let fee = account.apply_fill(order.side, order.size, order.price, fee_rate);
                debug!(bot_id = %bot_id, price = order.price, size = order.size, "Limit order filled");
                self.fills.push(FillEvent {
                    bot_id: bot_id.clone(),
                    timestamp,
                    side: order.side,
                    kind: OrderKind::Limit,
                    price: order.price,
                    size: order.size,
                    fee,
                });
            }
        }
    }

    fn position(&self, bot_id: &str) -> PositionSnapshot {
        let Some(account) = self.accounts.get(bot_id) else {
            return PositionSnapshot::default();
        };
        let unrealized_pnl = if account.size.abs() < FLAT_EPSILON {
            0.0
        } else {
            account.size * (self.mark_price - account.entry_price)
        };
        PositionSnapshot {
            size: account.size,
            entry_price: account.entry_price,
            realized_pnl: account.realized_pnl,
            unrealized_pnl,
        }
    }

    fn quote_balance(&self, bot_id: &str) -> f64 {
        self.accounts.get(bot_id).map_or(0.0, |a| a.balance)
    }

    fn submit_market_order(
        &mut self,
        bot_id: &str,
        side: OrderSide,
        size: f64,
        price: f64,
        timestamp: i64,
    ) -> anyhow::Result<()> {
        if !(size > 0.0 && price > 0.0) {
            bail!("invalid market order: size {size} at {price}");
        }
        let fee_rate = self.config.taker_fee_rate;
        let fee = self.account_mut(bot_id)?.apply_fill(side, size, price, fee_rate);
        self.fills.push(FillEvent {
            bot_id: bot_id.to_string(),
            timestamp,
            side,
            kind: OrderKind::Market,
            price,
            size,
            fee,
        });
        Ok(())
    }

    fn submit_limit_order(
        &mut self,
        bot_id: &str,
        side: OrderSide,
        size: f64,
        price: f64,
        _timestamp: i64,
    ) -> anyhow::Result<()> {
        if !(size > 0.0 && price > 0.0) {
            bail!("invalid limit order: size {size} at {price}");
        }
        self.account_mut(bot_id)?
            .orders
            .push(RestingOrder { side, size, price });
        Ok(())
    }

    fn cancel_orders(&mut self, bot_id: &str) {
        if let Some(account) = self.accounts.get_mut(bot_id) {
            account.orders.clear();
        }
    }

    fn drain_fills(&mut self) -> Vec<FillEvent> {
        std::mem::take(&mut self.fills)
    }
}

/// One fresh single-account market per run
#[derive(Debug, Clone, Default)]
pub struct PaperMarketFactory {
    pub config: PaperMarketConfig,
}

impl SimulatorFactory for PaperMarketFactory {
    fn create(
        &self,
        bot_id: &str,
        _config: &BotConfiguration,
        initial_balance: f64,
    ) -> anyhow::Result<Box<dyn MarketSimulator>> {
        if !(initial_balance > 0.0) {
            bail!("initial balance must be positive, got {initial_balance}");
        }
        let mut market = PaperMarket::new(self.config.clone());
        market.open_account(bot_id, initial_balance);
        Ok(Box::new(market))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> PaperMarket {
        let mut m = PaperMarket::new(PaperMarketConfig {
            taker_fee_rate: 0.0,
            maker_fee_rate: 0.0,
        });
        m.open_account("bot", 1000.0);
        m
    }

    fn candle(close: f64) -> Candle {
        Candle {
            timestamp: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_long_round_trip() {
        let mut m = market();
        m.update(&candle(100.0));
        m.submit_market_order("bot", OrderSide::Buy, 2.0, 100.0, 0).unwrap();
        m.update(&candle(110.0));
        assert_eq!(m.position("bot").unrealized_pnl, 20.0);

        m.submit_market_order("bot", OrderSide::Sell, 2.0, 110.0, 1).unwrap();
        let p = m.position("bot");
        assert!(p.is_flat());
        assert_eq!(p.realized_pnl, 20.0);
        assert_eq!(m.quote_balance("bot"), 1020.0);
        assert_eq!(m.drain_fills().len(), 2);
        assert!(m.drain_fills().is_empty());
    }

    #[test]
    fn test_reversal_flips_entry() {
        let mut m = market();
        m.submit_market_order("bot", OrderSide::Buy, 1.0, 100.0, 0).unwrap();
        m.submit_market_order("bot", OrderSide::Sell, 3.0, 90.0, 1).unwrap();
        let p = m.position("bot");
        assert_eq!(p.size, -2.0);
        assert_eq!(p.entry_price, 90.0);
        assert_eq!(p.realized_pnl, -10.0);
    }

    #[test]
    fn test_average_entry() {
        let mut m = market();
        m.submit_market_order("bot", OrderSide::Buy, 1.0, 100.0, 0).unwrap();
        m.submit_market_order("bot", OrderSide::Buy, 1.0, 110.0, 1).unwrap();
        assert_eq!(m.position("bot").entry_price, 105.0);
    }

    #[test]
    fn test_fees_reduce_balance() {
        let mut m = PaperMarket::new(PaperMarketConfig::default());
        m.open_account("bot", 1000.0);
        m.submit_market_order("bot", OrderSide::Buy, 1.0, 100.0, 0).unwrap();
        assert!((m.quote_balance("bot") - (1000.0 - 0.04)).abs() < 1e-9);
        assert!((m.position("bot").realized_pnl + 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_limit_fills_only_when_crossed() {
        let mut m = market();
        m.submit_market_order("bot", OrderSide::Buy, 1.0, 100.0, 0).unwrap();
        m.submit_limit_order("bot", OrderSide::Sell, 1.0, 105.0, 0).unwrap();
        m.drain_fills();

        m.check_limit_order_fills_against_price(104.0, 1, OrderSide::Sell);
        assert!(m.drain_fills().is_empty());
        m.check_limit_order_fills_against_price(105.0, 1, OrderSide::Buy);
        assert!(m.drain_fills().is_empty());

        m.check_limit_order_fills_against_price(106.0, 2, OrderSide::Sell);
        let fills = m.drain_fills();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, 105.0);
        assert_eq!(fills[0].kind, OrderKind::Limit);
        assert!(m.position("bot").is_flat());
        assert_eq!(m.quote_balance("bot"), 1005.0);
    }

    #[test]
    fn test_unknown_bot() {
        let mut m = market();
        assert!(m
            .submit_market_order("ghost", OrderSide::Buy, 1.0, 100.0, 0)
            .is_err());
        assert!(m.position("ghost").is_flat());
        assert_eq!(m.quote_balance("ghost"), 0.0);
    }

    #[test]
    fn test_factory_rejects_bad_balance() {
        let factory = PaperMarketFactory::default();
        assert!(factory
            .create("bot", &BotConfiguration::default(), 0.0)
            .is_err());
        assert!(factory
            .create("bot", &BotConfiguration::default(), 100.0)
            .is_ok());
    }
}
