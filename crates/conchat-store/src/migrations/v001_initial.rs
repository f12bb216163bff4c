//! v001 -- Initial schema creation.
//!
//! Creates the `conversation_logs` table: one row per conversation holding
//! its bounded message log as a JSON array.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversation logs
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversation_logs (
    log_key         TEXT PRIMARY KEY NOT NULL,   -- conchat_messages_{dm|group}_{id}
    kind            TEXT NOT NULL,               -- 'dm' | 'group'
    conversation_id TEXT NOT NULL,               -- UUID
    messages        TEXT NOT NULL,               -- JSON array, oldest first
    updated_at      TEXT NOT NULL                -- RFC-3339, time of last append
);

CREATE INDEX IF NOT EXISTS idx_conversation_logs_updated
    ON conversation_logs(updated_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
