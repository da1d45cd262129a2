//! Performance metrics for one simulated run

use persistence::Trade;
use serde::{Deserialize, Serialize};

use crate::types::PositionSnapshot;

/// Cap used when a run has no losing trades
const PROFIT_FACTOR_CAP: f64 = 999.99;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub initial_balance: f64,
    pub final_balance: f64,
    pub profit: f64,
    pub profit_pct: f64,
    pub sharpe_ratio: f64,
    /// Fraction of peak, e.g. 0.25 = 25%
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub num_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub avg_trade_pnl: f64,
    pub profit_factor: f64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// `trades` are the closed trades of the run. An `open_position` left at
    /// the end contributes its unrealized return and equity but is not
    /// counted as a trade.
    pub fn calculate(
        trades: &[Trade],
        initial_balance: f64,
        final_balance: f64,
        open_position: Option<&PositionSnapshot>,
    ) -> PerformanceMetrics {
        let profit = final_balance - initial_balance;
        let profit_pct = if initial_balance > 0.0 {
            profit / initial_balance * 100.0
        } else {
            0.0
        };

        let mut returns: Vec<f64> = trades
            .iter()
            .map(|t| trade_return(t.realized_pnl, t.entry_size, t.entry_price))
            .collect();

        let mut equity = Vec::with_capacity(trades.len() + 2);
        let mut balance = final_balance;
        equity.push(balance);
        for trade in trades {
            balance += trade.realized_pnl;
            equity.push(balance);
        }

        if let Some(position) = open_position.filter(|p| !p.is_flat()) {
            returns.push(trade_return(
                position.unrealized_pnl,
                position.size,
                position.entry_price,
            ));
            equity.push(balance + position.unrealized_pnl);
        }

        let counted: Vec<&Trade> = trades.iter().filter(|t| !t.marked_to_market).collect();
        let num_trades = counted.len() as u32;
        let winning_trades = counted.iter().filter(|t| t.realized_pnl > 0.0).count() as u32;
        let losing_trades = num_trades - winning_trades;
        let win_rate = if num_trades > 0 {
            winning_trades as f64 / num_trades as f64
        } else {
            0.0
        };

        let gross_profit: f64 = counted
            .iter()
            .filter(|t| t.realized_pnl > 0.0)
            .map(|t| t.realized_pnl)
            .sum();
        let gross_loss: f64 = counted
            .iter()
            .filter(|t| t.realized_pnl < 0.0)
            .map(|t| t.realized_pnl.abs())
            .sum();
        let profit_factor = if gross_loss > 0.0 {
            (gross_profit / gross_loss).min(PROFIT_FACTOR_CAP)
        } else if gross_profit > 0.0 {
            PROFIT_FACTOR_CAP
        } else {
            0.0
        };
        let avg_trade_pnl = if num_trades > 0 {
            counted.iter().map(|t| t.realized_pnl).sum::<f64>() / num_trades as f64
        } else {
            0.0
        };

        PerformanceMetrics {
            initial_balance,
            final_balance,
            profit,
            profit_pct,
            sharpe_ratio: sharpe_ratio(&returns),
            max_drawdown: max_drawdown(&equity),
            win_rate,
            num_trades,
            winning_trades,
            losing_trades,
            avg_trade_pnl,
            profit_factor,
        }
    }
}

fn trade_return(pnl: f64, size: f64, entry_price: f64) -> f64 {
    let notional = size.abs() * entry_price;
    let denominator = if notional == 0.0 { 1.0 } else { notional };
    pnl / denominator
}

/// Mean over population standard deviation, unannualized
fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev > 0.0 {
        mean / std_dev
    } else {
        0.0
    }
}

/// Largest peak-to-trough decline of `equity` as a fraction of the peak
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0;
    for &value in equity {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            let drawdown = (peak - value) / peak;
            if drawdown > worst {
                worst = drawdown;
            }
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(pnl: f64, marked: bool) -> Trade {
        Trade {
            entry_timestamp: 0,
            entry_price: 1000.0,
            entry_size: 1.0,
            exit_timestamp: 1,
            exit_price: 1000.0 + pnl,
            exit_size: 1.0,
            realized_pnl: pnl,
            marked_to_market: marked,
        }
    }

    #[test]
    fn test_profit_and_win_rate() {
        let m = PerformanceCalculator::calculate(
            &[trade(100.0, false), trade(-50.0, false)],
            1000.0,
            1050.0,
            None,
        );
        assert_eq!(m.profit, 50.0);
        assert_eq!(m.num_trades, 2);
        assert_eq!(m.win_rate, 0.5);
        assert_eq!(m.winning_trades, 1);
        assert_eq!(m.losing_trades, 1);
        assert!((m.profit_factor - 2.0).abs() < 1e-9);
        assert!((m.profit_pct - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_sharpe_uses_population_std() {
        // returns 0.1 and -0.05: mean 0.025, std 0.075
        let m = PerformanceCalculator::calculate(
            &[trade(100.0, false), trade(-50.0, false)],
            1000.0,
            1050.0,
            None,
        );
        assert!((m.sharpe_ratio - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_trades() {
        let m = PerformanceCalculator::calculate(&[], 1000.0, 1000.0, None);
        assert_eq!(m.profit, 0.0);
        assert_eq!(m.sharpe_ratio, 0.0);
        assert_eq!(m.win_rate, 0.0);
        assert_eq!(m.num_trades, 0);
        assert_eq!(m.max_drawdown, 0.0);
    }

    #[test]
    fn test_single_return_has_zero_sharpe() {
        let m = PerformanceCalculator::calculate(&[trade(10.0, false)], 1000.0, 1010.0, None);
        assert_eq!(m.sharpe_ratio, 0.0);
    }

    #[test]
    fn test_marked_trades_excluded_from_counts() {
        let m = PerformanceCalculator::calculate(
            &[trade(100.0, false), trade(-30.0, true)],
            1000.0,
            1100.0,
            None,
        );
        assert_eq!(m.num_trades, 1);
        assert_eq!(m.win_rate, 1.0);
        assert_eq!(m.profit_factor, PROFIT_FACTOR_CAP);
    }

    #[test]
    fn test_open_position_feeds_returns_not_counts() {
        let open = PositionSnapshot {
            size: -2.0,
            entry_price: 500.0,
            realized_pnl: 0.0,
            unrealized_pnl: -100.0,
        };
        let m = PerformanceCalculator::calculate(&[trade(100.0, false)], 1000.0, 1100.0, Some(&open));
        assert_eq!(m.num_trades, 1);
        // returns 0.1 and -0.1
        assert_eq!(m.sharpe_ratio, 0.0);
        assert!(m.max_drawdown > 0.0);
    }

    #[test]
    fn test_zero_notional_uses_unit_denominator() {
        assert_eq!(trade_return(5.0, 0.0, 100.0), 5.0);
        assert_eq!(trade_return(5.0, 1.0, 0.0), 5.0);
    }

    #[test]
    fn test_max_drawdown() {
        let dd = max_drawdown(&[1000.0, 1100.0, 900.0, 950.0]);
        assert!((dd - 200.0 / 1100.0).abs() < 1e-9);
        assert_eq!(max_drawdown(&[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(max_drawdown(&[]), 0.0);
    }
}
