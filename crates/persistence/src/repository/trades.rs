//! Trade lists: written once per run, never rewritten

use std::sync::Arc;
use tracing::{debug, warn};

use crate::keys;
use crate::models::{BacktestContext, Trade};
use crate::store::KvStore;
use crate::DbResult;

#[derive(Clone)]
pub struct TradeStore {
    store: Arc<dyn KvStore>,
}

impl TradeStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Persist the full trade list of `ctx.config_hash`. A list already on
    /// record is left untouched and `false` is returned.
    pub async fn save(&self, ctx: &BacktestContext, trades: &[Trade]) -> bool {
        let Some(hash) = ctx.config_hash.as_deref() else {
            warn!(context = %ctx, "Cannot save trades without a config hash");
            return false;
        };
        let value = match serde_json::to_string(trades) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to encode trades");
                return false;
            }
        };

        match self
            .store
            .set_if_absent(&keys::trades_key(ctx, hash), &value, None)
            .await
        {
            Ok(true) => {
                debug!(context = %ctx, trades = trades.len(), "Trades saved");
                true
            }
            Ok(false) => {
                warn!(context = %ctx, "Trade list already persisted, keeping the original");
                false
            }
            Err(e) => {
                warn!(context = %ctx, error = %e, "Failed to save trades");
                false
            }
        }
    }

    /// Trades of `ctx.config_hash`; empty when none were persisted
    pub async fn load(&self, ctx: &BacktestContext) -> DbResult<Vec<Trade>> {
        let Some(hash) = ctx.config_hash.as_deref() else {
            return Ok(Vec::new());
        };
        match self.store.get(&keys::trades_key(ctx, hash)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn trade(pnl: f64) -> Trade {
        Trade {
            entry_timestamp: 1,
            entry_price: 100.0,
            entry_size: 5.0,
            exit_timestamp: 3,
            exit_price: 110.0,
            exit_size: 5.0,
            realized_pnl: pnl,
            marked_to_market: false,
        }
    }

    #[tokio::test]
    async fn test_save_once() {
        let db = Database::in_memory().await.unwrap();
        let trades = TradeStore::new(Arc::new(db.store()));
        let ctx = BacktestContext::new("BTC/USDT", "1h", 0, 10).with_config_hash("h");

        assert!(trades.load(&ctx).await.unwrap().is_empty());
        assert!(trades.save(&ctx, &[trade(50.0), trade(-10.0)]).await);
        assert!(!trades.save(&ctx, &[trade(1.0)]).await);

        let loaded = trades.load(&ctx).await.unwrap();
        assert_eq!(loaded, vec![trade(50.0), trade(-10.0)]);
    }
}
