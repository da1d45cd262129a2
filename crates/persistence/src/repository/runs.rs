//! Run registry: one record per (context, config hash)
//!
//! Lifecycle: not found → running (claimed with a TTL) → completed | failed
//! (durable). Storage failures never escape the lifecycle operations: they are
//! logged and reported as `NotFound` / `false` so a campaign keeps moving
//! while the store is unavailable.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::keys;
use crate::models::BacktestContext;
use crate::store::KvStore;
use crate::DbResult;

/// Claims older than this are treated as orphaned and can be retried
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotFound,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::NotFound => "not_found",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_found" => Ok(RunStatus::NotFound),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Outcome of one configuration over one context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRunRecord {
    pub status: RunStatus,
    pub bot_id: String,
    pub config_hash: String,
    /// Epoch milliseconds
    pub last_updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The single terminal write for a run
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub bot_id: String,
    pub status: RunStatus,
    pub configuration: Option<serde_json::Value>,
    pub results_metadata: Option<serde_json::Value>,
    pub profit: Option<f64>,
    pub error: Option<String>,
}

/// Filters for listing the runs of a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunListFilter {
    pub status: Option<RunStatus>,
    pub min_profit: Option<f64>,
    pub max_profit: Option<f64>,
}

impl RunListFilter {
    fn matches(&self, record: &BacktestRunRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if self.min_profit.is_none() && self.max_profit.is_none() {
            return true;
        }
        let Some(profit) = record.profit else {
            return false;
        };
        self.min_profit.map_or(true, |min| profit >= min)
            && self.max_profit.map_or(true, |max| profit <= max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPage {
    pub records: Vec<BacktestRunRecord>,
    /// Pass back as `cursor` to continue; `None` once exhausted
    pub next_cursor: Option<usize>,
    /// Index entries considered by the listing
    pub total: usize,
}

/// Registry of run records
#[derive(Clone)]
pub struct RunRegistry {
    store: Arc<dyn KvStore>,
}

impl RunRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    async fn load(&self, ctx: &BacktestContext, hash: &str) -> DbResult<Option<BacktestRunRecord>> {
        match self.store.get(&keys::run_key(ctx, hash)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Current lifecycle state of `ctx.config_hash`
    pub async fn check_status(&self, ctx: &BacktestContext) -> RunStatus {
        let Some(hash) = ctx.config_hash.as_deref() else {
            warn!(context = %ctx, "Status check without a config hash");
            return RunStatus::NotFound;
        };

        match self.load(ctx, hash).await {
            Ok(Some(record)) if record.config_hash == hash => record.status,
            Ok(Some(record)) => {
                warn!(
                    context = %ctx,
                    stored_hash = %record.config_hash,
                    "Run record hash mismatch, treating as not found"
                );
                RunStatus::NotFound
            }
            Ok(None) => RunStatus::NotFound,
            Err(e) => {
                warn!(context = %ctx, error = %e, "Run status check failed");
                RunStatus::NotFound
            }
        }
    }

    /// Full record for `ctx.config_hash`, if readable
    pub async fn get(&self, ctx: &BacktestContext) -> Option<BacktestRunRecord> {
        let hash = ctx.config_hash.as_deref()?;
        match self.load(ctx, hash).await {
            Ok(record) => record.filter(|r| r.config_hash == hash),
            Err(e) => {
                warn!(context = %ctx, error = %e, "Run record read failed");
                None
            }
        }
    }

    /// Claim the configuration with a `running` record that expires after `ttl`.
    ///
    /// Returns `false` when another worker holds a live claim or the write
    /// failed; the caller decides whether to proceed.
    pub async fn record_start(&self, ctx: &BacktestContext, bot_id: &str, ttl: Duration) -> bool {
        let Some(hash) = ctx.config_hash.as_deref() else {
            warn!(context = %ctx, "Cannot claim a run without a config hash");
            return false;
        };

        let record = BacktestRunRecord {
            status: RunStatus::Running,
            bot_id: bot_id.to_string(),
            config_hash: hash.to_string(),
            last_updated: Utc::now().timestamp_millis(),
            results_metadata: None,
            configuration: None,
            profit: None,
            error: None,
        };
        let value = match serde_json::to_string(&record) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to encode run record");
                return false;
            }
        };

        match self
            .store
            .set_if_absent(&keys::run_key(ctx, hash), &value, Some(ttl))
            .await
        {
            Ok(true) => {
                self.move_index(ctx, hash, RunStatus::Running).await;
                debug!(context = %ctx, bot_id, "Run claimed");
                true
            }
            Ok(false) => {
                debug!(context = %ctx, "Run already claimed");
                false
            }
            Err(e) => {
                warn!(context = %ctx, error = %e, "Failed to record run start");
                false
            }
        }
    }

    /// Overwrite the record with its terminal status. Durable (no TTL).
    pub async fn record_completion(&self, ctx: &BacktestContext, completion: RunCompletion) -> bool {
        let Some(hash) = ctx.config_hash.as_deref() else {
            warn!(context = %ctx, "Cannot complete a run without a config hash");
            return false;
        };
        if !completion.status.is_terminal() {
            warn!(context = %ctx, status = %completion.status, "Completion requires a terminal status");
            return false;
        }

        let record = BacktestRunRecord {
            status: completion.status,
            bot_id: completion.bot_id,
            config_hash: hash.to_string(),
            last_updated: Utc::now().timestamp_millis(),
            results_metadata: completion.results_metadata,
            configuration: completion.configuration,
            profit: completion.profit,
            error: completion.error,
        };

        let written = match serde_json::to_string(&record) {
            Ok(value) => self.store.set(&keys::run_key(ctx, hash), &value, None).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            warn!(context = %ctx, error = %e, "Failed to record run completion");
            return false;
        }

        self.move_index(ctx, hash, record.status).await;
        let profit_key = keys::session_profit_key(ctx);
        let ranked = match record.profit {
            Some(profit) => self.store.sorted_add(&profit_key, hash, profit).await,
            None => self.store.sorted_remove(&profit_key, hash).await,
        };
        if let Err(e) = ranked {
            warn!(context = %ctx, error = %e, "Failed to update profit index");
        }

        info!(context = %ctx, status = %record.status, profit = ?record.profit, "Run recorded");
        true
    }

    /// Administrative removal of a record, its index entries and its trade list
    pub async fn delete(&self, ctx: &BacktestContext) -> bool {
        let Some(hash) = ctx.config_hash.as_deref() else {
            return false;
        };

        let removed = match self.store.delete(&keys::run_key(ctx, hash)).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(context = %ctx, error = %e, "Failed to delete run record");
                return false;
            }
        };

        let mut cleanup = vec![
            self.store.set_remove(&keys::session_bots_key(ctx, None), hash).await,
            self.store.sorted_remove(&keys::session_profit_key(ctx), hash).await,
            self.store.delete(&keys::trades_key(ctx, hash)).await.map(|_| ()),
        ];
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            cleanup.push(
                self.store
                    .set_remove(&keys::session_bots_key(ctx, Some(status.as_str())), hash)
                    .await,
            );
        }
        if let Some(e) = cleanup.into_iter().find_map(Result::err) {
            warn!(context = %ctx, error = %e, "Failed to clean run indexes");
        }

        removed
    }

    /// Page through the runs of a session in config-hash order
    pub async fn list_by_context(
        &self,
        ctx: &BacktestContext,
        filter: &RunListFilter,
        cursor: usize,
        limit: usize,
    ) -> DbResult<RunPage> {
        let index_key = keys::session_bots_key(ctx, filter.status.map(|s| s.as_str()));
        let hashes = self.store.set_members(&index_key).await?;

        let mut records = Vec::new();
        let mut position = cursor;
        while position < hashes.len() && records.len() < limit {
            if let Some(record) = self.load(ctx, &hashes[position]).await? {
                if filter.matches(&record) {
                    records.push(record);
                }
            }
            position += 1;
        }

        Ok(RunPage {
            records,
            next_cursor: (position < hashes.len()).then_some(position),
            total: hashes.len(),
        })
    }

    /// Best runs of a session by recorded profit
    pub async fn top_by_profit(
        &self,
        ctx: &BacktestContext,
        limit: usize,
    ) -> DbResult<Vec<BacktestRunRecord>> {
        let ranked = self
            .store
            .sorted_range_desc(&keys::session_profit_key(ctx), 0, limit)
            .await?;

        let mut records = Vec::with_capacity(ranked.len());
        for (hash, _) in ranked {
            if let Some(record) = self.load(ctx, &hash).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Secondary-index bookkeeping; the record itself stays authoritative
    async fn move_index(&self, ctx: &BacktestContext, hash: &str, status: RunStatus) {
        let mut results = vec![
            self.store.set_add(&keys::session_bots_key(ctx, None), hash).await,
        ];
        for other in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            let key = keys::session_bots_key(ctx, Some(other.as_str()));
            results.push(if other == status {
                self.store.set_add(&key, hash).await
            } else {
                self.store.set_remove(&key, hash).await
            });
        }
        if let Some(e) = results.into_iter().find_map(Result::err) {
            warn!(context = %ctx, error = %e, "Failed to update session index");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    async fn registry() -> RunRegistry {
        let db = Database::in_memory().await.unwrap();
        RunRegistry::new(Arc::new(db.store()))
    }

    fn ctx(hash: &str) -> BacktestContext {
        BacktestContext::new("BTC/USDT", "1h", 0, 3_600_000).with_config_hash(hash)
    }

    fn completion(status: RunStatus, profit: f64) -> RunCompletion {
        RunCompletion {
            bot_id: "bot-1".to_string(),
            status,
            configuration: Some(serde_json::json!({ "rsi_period": 14 })),
            results_metadata: Some(serde_json::json!({ "profit": profit })),
            profit: Some(profit),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let registry = registry().await;
        let ctx = ctx("h1");

        assert_eq!(registry.check_status(&ctx).await, RunStatus::NotFound);
        assert!(registry.record_start(&ctx, "bot-1", DEFAULT_CLAIM_TTL).await);
        assert_eq!(registry.check_status(&ctx).await, RunStatus::Running);

        assert!(registry.record_completion(&ctx, completion(RunStatus::Completed, 12.5)).await);
        assert_eq!(registry.check_status(&ctx).await, RunStatus::Completed);

        let record = registry.get(&ctx).await.unwrap();
        assert_eq!(record.profit, Some(12.5));
        assert_eq!(record.configuration.unwrap()["rsi_period"], 14);
    }

    #[tokio::test]
    async fn test_second_claim_is_rejected() {
        let registry = registry().await;
        let ctx = ctx("h1");
        assert!(registry.record_start(&ctx, "bot-1", DEFAULT_CLAIM_TTL).await);
        assert!(!registry.record_start(&ctx, "bot-2", DEFAULT_CLAIM_TTL).await);
        assert_eq!(registry.get(&ctx).await.unwrap().bot_id, "bot-1");
    }

    #[tokio::test]
    async fn test_expired_claim_becomes_retryable() {
        let registry = registry().await;
        let ctx = ctx("h1");
        assert!(registry.record_start(&ctx, "crashed", Duration::from_millis(1)).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(registry.check_status(&ctx).await, RunStatus::NotFound);
        assert!(registry.record_start(&ctx, "retry", DEFAULT_CLAIM_TTL).await);
    }

    #[tokio::test]
    async fn test_completion_is_last_write_wins() {
        let registry = registry().await;
        let ctx = ctx("h1");
        registry.record_start(&ctx, "bot-1", DEFAULT_CLAIM_TTL).await;

        assert!(registry.record_completion(&ctx, completion(RunStatus::Completed, 5.0)).await);
        assert!(registry.record_completion(&ctx, completion(RunStatus::Failed, -3.0)).await);

        let record = registry.get(&ctx).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.profit, Some(-3.0));
        assert_eq!(record.results_metadata.unwrap()["profit"], -3.0);

        let failed = registry
            .list_by_context(
                &ctx,
                &RunListFilter {
                    status: Some(RunStatus::Failed),
                    ..Default::default()
                },
                0,
                10,
            )
            .await
            .unwrap();
        assert_eq!(failed.records.len(), 1);
        let completed = registry
            .list_by_context(
                &ctx,
                &RunListFilter {
                    status: Some(RunStatus::Completed),
                    ..Default::default()
                },
                0,
                10,
            )
            .await
            .unwrap();
        assert!(completed.records.is_empty());
    }

    #[tokio::test]
    async fn test_completion_rejects_non_terminal_status() {
        let registry = registry().await;
        let ctx = ctx("h1");
        assert!(!registry.record_completion(&ctx, completion(RunStatus::Running, 1.0)).await);
        assert_eq!(registry.check_status(&ctx).await, RunStatus::NotFound);
    }

    #[tokio::test]
    async fn test_hash_mismatch_reads_as_not_found() {
        let db = Database::in_memory().await.unwrap();
        let store = Arc::new(db.store());
        let registry = RunRegistry::new(store.clone());
        let ctx = ctx("expected");

        let foreign = serde_json::json!({
            "status": "completed",
            "bot_id": "bot-x",
            "config_hash": "something-else",
            "last_updated": 0,
        });
        store
            .set(&keys::run_key(&ctx, "expected"), &foreign.to_string(), None)
            .await
            .unwrap();

        assert_eq!(registry.check_status(&ctx).await, RunStatus::NotFound);
        assert!(registry.get(&ctx).await.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_pagination() {
        let registry = registry().await;
        for (hash, profit) in [("a", 10.0), ("b", -5.0), ("c", 25.0), ("d", 3.0)] {
            let ctx = ctx(hash);
            registry.record_start(&ctx, hash, DEFAULT_CLAIM_TTL).await;
            registry
                .record_completion(&ctx, completion(RunStatus::Completed, profit))
                .await;
        }
        let session = ctx("a").session();

        let first = registry
            .list_by_context(&session, &RunListFilter::default(), 0, 3)
            .await
            .unwrap();
        assert_eq!(first.records.len(), 3);
        assert_eq!(first.next_cursor, Some(3));
        let rest = registry
            .list_by_context(&session, &RunListFilter::default(), 3, 3)
            .await
            .unwrap();
        assert_eq!(rest.records.len(), 1);
        assert_eq!(rest.next_cursor, None);

        let profitable = registry
            .list_by_context(
                &session,
                &RunListFilter {
                    min_profit: Some(5.0),
                    ..Default::default()
                },
                0,
                10,
            )
            .await
            .unwrap();
        let hashes: Vec<&str> = profitable.records.iter().map(|r| r.config_hash.as_str()).collect();
        assert_eq!(hashes, vec!["a", "c"]);

        let top = registry.top_by_profit(&session, 2).await.unwrap();
        assert_eq!(top[0].config_hash, "c");
        assert_eq!(top[1].config_hash, "a");
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_indexes() {
        let registry = registry().await;
        let ctx = ctx("h1");
        registry.record_start(&ctx, "bot-1", DEFAULT_CLAIM_TTL).await;
        registry
            .record_completion(&ctx, completion(RunStatus::Completed, 1.0))
            .await;

        assert!(registry.delete(&ctx).await);
        assert_eq!(registry.check_status(&ctx).await, RunStatus::NotFound);
        let page = registry
            .list_by_context(&ctx.session(), &RunListFilter::default(), 0, 10)
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert!(!registry.delete(&ctx).await);
    }

    #[tokio::test]
    async fn test_rerun_after_delete_keeps_fresh_trades() {
        let db = Database::in_memory().await.unwrap();
        let store: Arc<dyn KvStore> = Arc::new(db.store());
        let registry = RunRegistry::new(store.clone());
        let trades = crate::TradeStore::new(store);
        let ctx = ctx("h1");
        let trade = |pnl: f64| crate::Trade {
            entry_timestamp: 1,
            entry_price: 100.0,
            entry_size: 1.0,
            exit_timestamp: 2,
            exit_price: 100.0 + pnl,
            exit_size: 1.0,
            realized_pnl: pnl,
            marked_to_market: false,
        };

        registry.record_start(&ctx, "bot-1", DEFAULT_CLAIM_TTL).await;
        registry
            .record_completion(&ctx, completion(RunStatus::Completed, 111.0))
            .await;
        assert!(trades.save(&ctx, &[trade(111.0)]).await);

        assert!(registry.delete(&ctx).await);
        assert!(trades.load(&ctx).await.unwrap().is_empty());

        assert!(registry.record_start(&ctx, "bot-2", DEFAULT_CLAIM_TTL).await);
        registry
            .record_completion(&ctx, completion(RunStatus::Completed, -7.0))
            .await;
        assert!(trades.save(&ctx, &[trade(-7.0)]).await);

        assert_eq!(registry.get(&ctx).await.unwrap().profit, Some(-7.0));
        let loaded = trades.load(&ctx).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].realized_pnl, -7.0);
    }
}
