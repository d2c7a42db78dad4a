//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `chats`, `messages`, and
//! `dialog_questions`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    user_lo    TEXT NOT NULL,               -- smaller participant UUID
    user_hi    TEXT NOT NULL,               -- larger participant UUID
    created_at TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_chats_pair ON chats(user_lo, user_hi);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
-- chat_id intentionally carries no foreign key: human chats are
-- provisioned by the wider platform, only dialog chats originate here.
CREATE TABLE IF NOT EXISTS messages (
    id        TEXT PRIMARY KEY NOT NULL,    -- UUID v4, chosen by the sender
    chat_id   TEXT NOT NULL,
    sender_id TEXT NOT NULL,                -- UUID of the author
    text      TEXT NOT NULL,
    sent_at   TEXT NOT NULL,                -- ISO-8601, server clock
    status    INTEGER NOT NULL DEFAULT 0,   -- 0 pending / 1 delivered / 2 read
    kind      INTEGER NOT NULL DEFAULT 0    -- 0 normal / 1 system / 2 question / 3 answer
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_sent
    ON messages(chat_id, sent_at DESC);

-- ----------------------------------------------------------------
-- Dialog questions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS dialog_questions (
    id       TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    owner_id TEXT NOT NULL,                 -- questioner who owns the list
    position INTEGER NOT NULL,              -- 1-based order within the list
    text     TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_questions_owner_pos
    ON dialog_questions(owner_id, position);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
