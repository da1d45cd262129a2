//! Session summaries: one aggregate record per backtest context

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::keys;
use crate::models::BacktestContext;
use crate::store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(SessionStatus::Running),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "stopped" => Ok(SessionStatus::Stopped),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Aggregate over every run of a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub context: BacktestContext,
    pub run_count: u64,
    pub last_config_hash: Option<String>,
    /// Epoch milliseconds
    pub last_update: i64,
    pub best_profit: Option<f64>,
    pub best_config_hash: Option<String>,
    pub current_profit: f64,
    pub current_status: SessionStatus,
    pub avg_profit: f64,
    pub error_count: u64,
    pub completed_runs: u64,
    pub active: bool,
    pub notes: Option<String>,
}

impl SessionSummary {
    /// Fresh, active summary with no runs
    pub fn new(context: BacktestContext) -> Self {
        Self {
            context: context.session(),
            run_count: 0,
            last_config_hash: None,
            last_update: Utc::now().timestamp_millis(),
            best_profit: None,
            best_config_hash: None,
            current_profit: 0.0,
            current_status: SessionStatus::Running,
            avg_profit: 0.0,
            error_count: 0,
            completed_runs: 0,
            active: true,
            notes: None,
        }
    }
}

/// Store for session summaries
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Overwrite the whole summary (last writer wins)
    pub async fn update(&self, ctx: &BacktestContext, summary: &SessionSummary) -> bool {
        let value = match serde_json::to_string(summary) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to encode session summary");
                return false;
            }
        };
        match self.store.set(&keys::session_key(ctx), &value, None).await {
            Ok(()) => true,
            Err(e) => {
                warn!(context = %ctx, error = %e, "Failed to update session");
                false
            }
        }
    }

    pub async fn fetch(&self, ctx: &BacktestContext) -> Option<SessionSummary> {
        self.fetch_key(&keys::session_key(ctx)).await
    }

    async fn fetch_key(&self, key: &str) -> Option<SessionSummary> {
        match self.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!(key, error = %e, "Undecodable session summary");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Failed to fetch session");
                None
            }
        }
    }

    /// Every known session, most recently updated first
    pub async fn list_all(&self) -> Vec<SessionSummary> {
        let keys = match self.store.scan_keys(&keys::sessions_pattern()).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to scan sessions");
                return Vec::new();
            }
        };

        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(summary) = self.fetch_key(&key).await {
                sessions.push(summary);
            }
        }
        sessions.sort_by(|a, b| b.last_update.cmp(&a.last_update));
        sessions
    }

    /// Control write from an external actor (pause / resume / stop).
    /// Returns `false` if the session does not exist or the write failed.
    pub async fn set_status(&self, ctx: &BacktestContext, status: SessionStatus) -> bool {
        let Some(mut summary) = self.fetch(ctx).await else {
            return false;
        };
        summary.current_status = status;
        summary.last_update = Utc::now().timestamp_millis();
        self.update(ctx, &summary).await
    }
}
