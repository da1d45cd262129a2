//! Storage key layout
//!
//! Every key is namespaced by a prefix and the context segment
//! `{symbol}:{timeframe}:{start}:{end}`:
//!
//! - `runs:{context}:{hash}`              run record (TTL while running)
//! - `sessions:{context}`                 session summary
//! - `trades:{context}:{hash}`            trade list of one run
//! - `session-bots:{context}[:{status}]`  config hashes per session / status
//! - `session-profit:{context}`           profit-ranked config hashes

use crate::models::BacktestContext;

pub const RUNS: &str = "runs";
pub const SESSIONS: &str = "sessions";
pub const TRADES: &str = "trades";
pub const SESSION_BOTS: &str = "session-bots";
pub const SESSION_PROFIT: &str = "session-profit";

pub fn run_key(ctx: &BacktestContext, config_hash: &str) -> String {
    format!("{RUNS}:{}:{config_hash}", ctx.segment())
}

pub fn session_key(ctx: &BacktestContext) -> String {
    format!("{SESSIONS}:{}", ctx.segment())
}

pub fn trades_key(ctx: &BacktestContext, config_hash: &str) -> String {
    format!("{TRADES}:{}:{config_hash}", ctx.segment())
}

/// Index of config hashes for a session, optionally narrowed to one status
pub fn session_bots_key(ctx: &BacktestContext, status: Option<&str>) -> String {
    match status {
        Some(status) => format!("{SESSION_BOTS}:{}:{status}", ctx.segment()),
        None => format!("{SESSION_BOTS}:{}", ctx.segment()),
    }
}

pub fn session_profit_key(ctx: &BacktestContext) -> String {
    format!("{SESSION_PROFIT}:{}", ctx.segment())
}

/// Glob matching every session summary
pub fn sessions_pattern() -> String {
    format!("{SESSIONS}:*")
}
