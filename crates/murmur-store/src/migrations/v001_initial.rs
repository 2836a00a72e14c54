//! v001 -- Initial schema creation.
//!
//! Users, chats with their membership and per-user overlay tables, and
//! messages with their delete-for-me overlay.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY NOT NULL,     -- opaque id from the identity gate
    name       TEXT NOT NULL,
    pic        TEXT,
    created_at TEXT NOT NULL                  -- RFC-3339, nanosecond precision
);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    chat_name         TEXT,
    is_group_chat     INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    pair_key          TEXT UNIQUE,                -- sorted member pair, one-to-one only
    group_admin       TEXT,                       -- FK -> users(id), groups only
    latest_message_id TEXT,                       -- shared, unfiltered pointer
    pic               TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chats_updated ON chats(updated_at DESC);

CREATE TABLE IF NOT EXISTS chat_members (
    chat_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    PRIMARY KEY (chat_id, user_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chat_members_user ON chat_members(user_id);

CREATE TABLE IF NOT EXISTS chat_archived (
    chat_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    PRIMARY KEY (chat_id, user_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS chat_deleted (
    chat_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    PRIMARY KEY (chat_id, user_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT, -- insertion order
    id             TEXT UNIQUE NOT NULL,              -- UUID v4
    chat_id        TEXT NOT NULL,
    sender_id      TEXT NOT NULL,
    content        TEXT NOT NULL,
    attachment     TEXT,
    fwd_name       TEXT,
    fwd_user_id    TEXT,
    fwd_chat_id    TEXT,
    call_type      TEXT,                              -- audio | video
    call_direction TEXT,                              -- outgoing | incoming
    call_status    TEXT,                              -- missed | ended
    call_from      TEXT,
    call_timestamp TEXT,
    created_at     TEXT NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_seq ON messages(chat_id, seq);

CREATE TABLE IF NOT EXISTS message_deleted (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
