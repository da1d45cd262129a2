//! Turns per-step position snapshots into discrete round-trip trades

use persistence::Trade;
use tracing::debug;

use crate::types::PositionSnapshot;

#[derive(Debug, Clone, Copy)]
struct OpenTrade {
    timestamp: i64,
    price: f64,
    size: f64,
}

/// Diffs consecutive snapshots of one bot's position.
///
/// Only zero crossings matter: flat to open starts a trade, open to flat
/// closes it, and a sign change closes and reopens within the same step.
/// Growing or shrinking a position without crossing zero is not an event.
#[derive(Debug, Default)]
pub struct TradeLifecycleDetector {
    previous: PositionSnapshot,
    open: Option<OpenTrade>,
    closed: Vec<Trade>,
}

impl TradeLifecycleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, timestamp: i64, price: f64, current: &PositionSnapshot) {
        let previous = self.previous;
        match (previous.is_flat(), current.is_flat()) {
            (true, false) => self.open_trade_at(timestamp, current),
            (false, true) => self.close_trade_at(timestamp, price, &previous, current),
            (false, false) if previous.size.signum() != current.size.signum() => {
                self.close_trade_at(timestamp, price, &previous, current);
                self.open_trade_at(timestamp, current);
            }
            _ => {}
        }
        self.previous = *current;
    }

    /// Close any open trade at the last mark. Its PnL is the unrealized PnL
    /// of the final snapshot and it is flagged `marked_to_market`.
    pub fn finish(mut self, timestamp: i64, price: f64) -> Vec<Trade> {
        if let Some(open) = self.open.take() {
            self.closed.push(Trade {
                entry_timestamp: open.timestamp,
                entry_price: open.price,
                entry_size: open.size,
                exit_timestamp: timestamp,
                exit_price: price,
                exit_size: self.previous.size,
                realized_pnl: self.previous.unrealized_pnl,
                marked_to_market: true,
            });
        }
        self.closed
    }

    pub fn closed_trades(&self) -> &[Trade] {
        &self.closed
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Entry `(timestamp, price, size)` of the open trade
    pub fn open_trade(&self) -> Option<(i64, f64, f64)> {
        self.open.map(|o| (o.timestamp, o.price, o.size))
    }

    fn open_trade_at(&mut self, timestamp: i64, current: &PositionSnapshot) {
        self.open = Some(OpenTrade {
            timestamp,
            price: current.entry_price,
            size: current.size,
        });
    }

    fn close_trade_at(
        &mut self,
        timestamp: i64,
        price: f64,
        previous: &PositionSnapshot,
        current: &PositionSnapshot,
    ) {
        let Some(open) = self.open.take() else {
            debug!(timestamp, "Position closed with no tracked entry");
            return;
        };
        self.closed.push(Trade {
            entry_timestamp: open.timestamp,
            entry_price: open.price,
            entry_size: open.size,
            exit_timestamp: timestamp,
            exit_price: price,
            exit_size: previous.size,
            realized_pnl: current.realized_pnl - previous.realized_pnl,
            marked_to_market: false,
        });
    }
}
