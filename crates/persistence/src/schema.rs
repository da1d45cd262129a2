//! Database schema definitions

/// SQL to create all tables
/// NOTE: values are JSON documents; expiry is stored as epoch milliseconds
pub const CREATE_TABLES: &str = r#"
-- Plain key/value entries (run records, sessions, trade lists)
CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER,
    updated_at INTEGER
);

-- Unordered sets (session -> config hashes, partitioned by status)
CREATE TABLE IF NOT EXISTS kv_set_members (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    PRIMARY KEY (key, member)
);

-- Score-ordered sets (profit ranking per session)
CREATE TABLE IF NOT EXISTS kv_sorted_members (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    score REAL NOT NULL,
    PRIMARY KEY (key, member)
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv_entries(expires_at);
CREATE INDEX IF NOT EXISTS idx_kv_sorted_score ON kv_sorted_members(key, score DESC)
"#;
