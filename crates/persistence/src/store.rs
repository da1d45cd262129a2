//! Key-value storage driver
//!
//! The repositories only talk to [`KvStore`]. Key scanning is part of the
//! trait so callers never reach into a concrete driver to enumerate keys.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

use crate::{DbResult, SqlitePool};

/// Keys returned per page by [`KvStore::scan_keys`]
pub const SCAN_PAGE_SIZE: usize = 100;

/// One page of a cursor-driven scan. A `cursor` of 0 means the scan is done.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<String>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> DbResult<Option<String>>;

    /// Unconditional write. `ttl = None` makes the entry durable.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> DbResult<()>;

    /// Atomic claim: writes only if the key is absent or expired.
    /// Returns whether this call wrote the entry.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> DbResult<bool>;

    async fn delete(&self, key: &str) -> DbResult<bool>;

    /// Glob-pattern scan starting at `cursor` (0 for the first page)
    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> DbResult<ScanPage>;

    async fn set_add(&self, key: &str, member: &str) -> DbResult<()>;
    async fn set_remove(&self, key: &str, member: &str) -> DbResult<()>;
    async fn set_members(&self, key: &str) -> DbResult<Vec<String>>;

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> DbResult<()>;
    async fn sorted_remove(&self, key: &str, member: &str) -> DbResult<()>;
    /// Members by descending score (ties by member)
    async fn sorted_range_desc(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> DbResult<Vec<(String, f64)>>;

    /// Drain a scan: follows the cursor until the driver reports completion
    async fn scan_keys(&self, pattern: &str) -> DbResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.scan(pattern, cursor, SCAN_PAGE_SIZE).await?;
            keys.extend(page.keys);
            if page.cursor == 0 {
                break;
            }
            cursor = page.cursor;
        }
        Ok(keys)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_ms() + ttl.as_millis() as i64)
}

/// SQLite-backed driver. Expired entries are invisible to reads and can be
/// claimed again by `set_if_absent`.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Physically remove expired entries, returning how many were dropped
    pub async fn purge_expired(&self) -> DbResult<u64> {
        let result =
            sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(now_ms())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM kv_entries WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO kv_entries (key, value, expires_at, updated_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 expires_at = excluded.expires_at,
                 updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> DbResult<bool> {
        // Single statement: a live row blocks the write, an expired one is taken over
        let now = now_ms();
        let result = sqlx::query(
            r#"INSERT INTO kv_entries (key, value, expires_at, updated_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 expires_at = excluded.expires_at,
                 updated_at = excluded.updated_at
               WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> DbResult<ScanPage> {
        let count = count.max(1);
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"SELECT rowid, key FROM kv_entries
               WHERE rowid > ?1 AND key GLOB ?2
                 AND (expires_at IS NULL OR expires_at > ?3)
               ORDER BY rowid
               LIMIT ?4"#,
        )
        .bind(cursor as i64)
        .bind(pattern)
        .bind(now_ms())
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        let next = if rows.len() == count {
            rows.last().map(|(rowid, _)| *rowid as u64).unwrap_or(0)
        } else {
            0
        };

        Ok(ScanPage {
            cursor: next,
            keys: rows.into_iter().map(|(_, key)| key).collect(),
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> DbResult<()> {
        sqlx::query("INSERT OR IGNORE INTO kv_set_members (key, member) VALUES (?, ?)")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM kv_set_members WHERE key = ? AND member = ?")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> DbResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT member FROM kv_set_members WHERE key = ? ORDER BY member")
                .bind(key)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(m,)| m).collect())
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO kv_sorted_members (key, member, score) VALUES (?1, ?2, ?3)
               ON CONFLICT(key, member) DO UPDATE SET score = excluded.score"#,
        )
        .bind(key)
        .bind(member)
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM kv_sorted_members WHERE key = ? AND member = ?")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sorted_range_desc(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> DbResult<Vec<(String, f64)>> {
        let rows: Vec<(String, f64)> = sqlx::query_as(
            r#"SELECT member, score FROM kv_sorted_members
               WHERE key = ?
               ORDER BY score DESC, member ASC
               LIMIT ? OFFSET ?"#,
        )
        .bind(key)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    async fn store() -> SqliteStore {
        Database::in_memory().await.unwrap().store()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = store().await;
        store.set("a", "1", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        store.set("a", "2", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_if_absent_blocks_live_claim() {
        let store = store().await;
        assert!(store
            .set_if_absent("claim", "first", Some(Duration::from_secs(60)))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("claim", "second", Some(Duration::from_secs(60)))
            .await
            .unwrap());
        assert_eq!(store.get("claim").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_expired_claim_is_invisible_and_reclaimable() {
        let store = store().await;
        assert!(store
            .set_if_absent("claim", "stale", Some(Duration::from_millis(1)))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.get("claim").await.unwrap().is_none());
        assert!(store.set_if_absent("claim", "fresh", None).await.unwrap());
        assert_eq!(store.get("claim").await.unwrap().as_deref(), Some("fresh"));
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scan_keys_drains_all_pages() {
        let store = store().await;
        for i in 0..(SCAN_PAGE_SIZE * 2 + 7) {
            store.set(&format!("sessions:s{i}"), "{}", None).await.unwrap();
        }
        store.set("runs:other", "{}", None).await.unwrap();

        let first = store.scan("sessions:*", 0, 10).await.unwrap();
        assert_eq!(first.keys.len(), 10);
        assert_ne!(first.cursor, 0);

        let keys = store.scan_keys("sessions:*").await.unwrap();
        assert_eq!(keys.len(), SCAN_PAGE_SIZE * 2 + 7);
        assert!(keys.iter().all(|k| k.starts_with("sessions:")));
    }

    #[tokio::test]
    async fn test_sets_and_sorted_sets() {
        let store = store().await;
        store.set_add("s", "b").await.unwrap();
        store.set_add("s", "a").await.unwrap();
        store.set_add("s", "a").await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["a", "b"]);
        store.set_remove("s", "a").await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["b"]);

        store.sorted_add("z", "low", -5.0).await.unwrap();
        store.sorted_add("z", "high", 25.0).await.unwrap();
        store.sorted_add("z", "mid", 10.0).await.unwrap();
        store.sorted_add("z", "low", 1.0).await.unwrap();
        let ranked = store.sorted_range_desc("z", 0, 10).await.unwrap();
        let members: Vec<&str> = ranked.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["high", "mid", "low"]);
        assert_eq!(store.sorted_range_desc("z", 1, 1).await.unwrap()[0].0, "mid");
    }

    #[tokio::test]
    async fn test_writes_stamp_updated_at() {
        let store = store().await;
        let before = now_ms();
        store.set("a", "1", None).await.unwrap();
        store
            .set_if_absent("b", "1", Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let stamps: Vec<(String, Option<i64>)> =
            sqlx::query_as("SELECT key, updated_at FROM kv_entries ORDER BY key")
                .fetch_all(&store.pool)
                .await
                .unwrap();
        assert_eq!(stamps.len(), 2);
        assert!(stamps.iter().all(|(_, at)| at.is_some_and(|t| t >= before)));
    }
}
