//! RSI mean-reversion strategy driven by precomputed indicator values

use tracing::debug;

use crate::indicators::{rsi_key, sma_key};
use crate::simulation::{EvaluatorFactory, MarketSimulator, SignalEvaluator};
use crate::types::{BotConfiguration, OrderSide, PatternResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Long,
    Short,
    Flat,
}

/// Long when RSI is oversold, short (or flat, when shorting is disabled)
/// when overbought. Entries can be gated by an SMA trend filter and paired
/// with a resting take-profit order.
pub struct RsiReversalStrategy {
    config: BotConfiguration,
}

impl RsiReversalStrategy {
    pub fn new(config: BotConfiguration) -> Self {
        Self { config }
    }

    fn target(&self, price: f64, pattern: &PatternResult) -> Option<Target> {
        let rsi = pattern.get(&rsi_key(self.config.rsi_period))?;
        let trend = self.config.trend_sma.and_then(|p| pattern.get(&sma_key(p)));

        if rsi <= self.config.rsi_oversold {
            return trend.map_or(true, |sma| price >= sma).then_some(Target::Long);
        }
        if rsi >= self.config.rsi_overbought {
            if !self.config.allow_short {
                return Some(Target::Flat);
            }
            return Some(if trend.map_or(true, |sma| price <= sma) {
                Target::Short
            } else {
                Target::Flat
            });
        }
        None
    }
}

impl SignalEvaluator for RsiReversalStrategy {
    fn evaluate_signals_and_trade(
        &mut self,
        timestamp: i64,
        price: f64,
        pattern: &PatternResult,
        bot_id: &str,
        market: &mut dyn MarketSimulator,
    ) -> anyhow::Result<()> {
        let Some(target) = self.target(price, pattern) else {
            return Ok(());
        };
        if price <= 0.0 {
            return Ok(());
        }

        let position = market.position(bot_id);
        let (side, entering) = match target {
            Target::Long if position.is_flat() || position.size < 0.0 => (OrderSide::Buy, true),
            Target::Short if position.is_flat() || position.size > 0.0 => (OrderSide::Sell, true),
            Target::Flat if !position.is_flat() => {
                let side = if position.size > 0.0 {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                };
                (side, false)
            }
            _ => return Ok(()),
        };

        market.cancel_orders(bot_id);

        let entry_size = if entering {
            market.quote_balance(bot_id) * self.config.position_size_pct / 100.0 / price
        } else {
            0.0
        };
        let order_size = position.size.abs() + entry_size;
        if order_size <= 0.0 {
            return Ok(());
        }

        market.submit_market_order(bot_id, side, order_size, price, timestamp)?;
        debug!(bot_id, ?side, size = order_size, price, "Signal order");

        let Some(tp) = self.config.take_profit_pct.filter(|_| entry_size > 0.0) else {
            return Ok(());
        };
        let (exit_side, exit_price) = match side {
            OrderSide::Buy => (OrderSide::Sell, price * (1.0 + tp / 100.0)),
            OrderSide::Sell => (OrderSide::Buy, price * (1.0 - tp / 100.0)),
        };
        market.submit_limit_order(bot_id, exit_side, entry_size, exit_price, timestamp)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RsiReversalFactory;

impl EvaluatorFactory for RsiReversalFactory {
    fn create(&self, config: &BotConfiguration) -> Box<dyn SignalEvaluator> {
        Box::new(RsiReversalStrategy::new(config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperMarket, PaperMarketConfig};
    use crate::types::Candle;

    fn market() -> PaperMarket {
        let mut m = PaperMarket::new(PaperMarketConfig {
            taker_fee_rate: 0.0,
            maker_fee_rate: 0.0,
        });
        m.open_account("bot", 1000.0);
        m
    }

    fn pattern(rsi: f64) -> PatternResult {
        let mut p = PatternResult::default();
        p.insert(rsi_key(14), rsi);
        p.insert(sma_key(50), 100.0);
        p
    }

    fn step(m: &mut PaperMarket, s: &mut RsiReversalStrategy, price: f64, rsi: f64) {
        m.update(&Candle {
            timestamp: 0,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1.0,
        });
        s.evaluate_signals_and_trade(0, price, &pattern(rsi), "bot", m).unwrap();
    }

    #[test]
    fn test_oversold_opens_long_then_overbought_flattens() {
        let mut m = market();
        let mut s = RsiReversalStrategy::new(BotConfiguration::default());

        step(&mut m, &mut s, 100.0, 50.0);
        assert!(m.position("bot").is_flat());

        step(&mut m, &mut s, 100.0, 25.0);
        // 25% of 1000 at 100
        assert!((m.position("bot").size - 2.5).abs() < 1e-9);

        // already long: no pyramiding
        step(&mut m, &mut s, 98.0, 20.0);
        assert!((m.position("bot").size - 2.5).abs() < 1e-9);

        step(&mut m, &mut s, 110.0, 75.0);
        assert!(m.position("bot").is_flat());
        assert!((m.quote_balance("bot") - 1025.0).abs() < 1e-9);
    }

    #[test]
    fn test_overbought_reverses_when_shorting() {
        let mut m = market();
        let config = BotConfiguration {
            allow_short: true,
            ..BotConfiguration::default()
        };
        let mut s = RsiReversalStrategy::new(config);

        step(&mut m, &mut s, 100.0, 25.0);
        step(&mut m, &mut s, 100.0, 80.0);
        assert!(m.position("bot").size < 0.0);
    }

    #[test]
    fn test_trend_filter_blocks_counter_trend_entry() {
        let mut m = market();
        let config = BotConfiguration {
            trend_sma: Some(50),
            ..BotConfiguration::default()
        };
        let mut s = RsiReversalStrategy::new(config);

        step(&mut m, &mut s, 90.0, 20.0);
        assert!(m.position("bot").is_flat());
        step(&mut m, &mut s, 101.0, 20.0);
        assert!(!m.position("bot").is_flat());
    }

    #[test]
    fn test_take_profit_rests_after_entry() {
        let mut m = market();
        let config = BotConfiguration {
            take_profit_pct: Some(5.0),
            ..BotConfiguration::default()
        };
        let mut s = RsiReversalStrategy::new(config);

        step(&mut m, &mut s, 100.0, 25.0);
        m.drain_fills();
        m.check_limit_order_fills_against_price(105.5, 1, OrderSide::Sell);
        assert_eq!(m.drain_fills().len(), 1);
        assert!(m.position("bot").is_flat());
    }

    #[test]
    fn test_missing_indicator_is_a_no_op() {
        let mut m = market();
        let mut s = RsiReversalStrategy::new(BotConfiguration::default());
        s.evaluate_signals_and_trade(0, 100.0, &PatternResult::default(), "bot", &mut m)
            .unwrap();
        assert!(m.drain_fills().is_empty());
    }
}
