//! v001 -- Initial schema creation.
//!
//! Users and block lists (owned by external collaborators, read here),
//! the two aggregates with their ordered message lists, messages, and the
//! denormalized feed.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    name         TEXT NOT NULL,
    email        TEXT NOT NULL,
    avatar       TEXT,
    is_official  INTEGER NOT NULL DEFAULT 0,
    is_private   INTEGER NOT NULL DEFAULT 0,    -- refuses unsolicited conversations
    is_deleted   INTEGER NOT NULL DEFAULT 0,    -- soft delete
    presence     TEXT NOT NULL DEFAULT 'OFFLINE',
    last_seen_at TEXT,
    created_at   TEXT NOT NULL                  -- RFC-3339, microseconds, UTC
);

CREATE TABLE IF NOT EXISTS block_list (
    user_id    TEXT NOT NULL,                   -- the blocker
    blocked_id TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (user_id, blocked_id),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (blocked_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_block_list_blocked ON block_list(blocked_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,
    sender_id       TEXT NOT NULL,
    text            TEXT NOT NULL,
    source_kind     TEXT NOT NULL CHECK (source_kind IN ('CONVERSATION', 'GROUP')),
    source_id       TEXT NOT NULL,
    reply_to        TEXT,
    has_been_read   INTEGER NOT NULL DEFAULT 0,
    read_at         TEXT,
    has_been_edited INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,

    FOREIGN KEY (sender_id) REFERENCES users(id),
    FOREIGN KEY (reply_to) REFERENCES messages(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(source_id, has_been_read, sender_id);

-- Ordered message list of each aggregate.
CREATE TABLE IF NOT EXISTS source_messages (
    position    INTEGER PRIMARY KEY AUTOINCREMENT,
    source_kind TEXT NOT NULL,
    source_id   TEXT NOT NULL,
    message_id  TEXT NOT NULL UNIQUE,

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_source_messages_source
    ON source_messages(source_id, position);

-- Ordered reply list of each message.
CREATE TABLE IF NOT EXISTS message_replies (
    position   INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL,
    reply_id   TEXT NOT NULL UNIQUE,

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE,
    FOREIGN KEY (reply_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_message_replies_message
    ON message_replies(message_id, position);

-- ----------------------------------------------------------------
-- Conversations (two-party aggregate)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                   TEXT PRIMARY KEY NOT NULL,
    participant_low      TEXT NOT NULL,     -- the unordered pair, normalised
    participant_high     TEXT NOT NULL,
    last_message_id      TEXT,
    last_message_sent_at TEXT,
    version              INTEGER NOT NULL DEFAULT 0,
    created_at           TEXT NOT NULL,

    CHECK (participant_low < participant_high),
    UNIQUE (participant_low, participant_high),
    FOREIGN KEY (participant_low) REFERENCES users(id),
    FOREIGN KEY (participant_high) REFERENCES users(id),
    FOREIGN KEY (last_message_id) REFERENCES messages(id)
);

CREATE INDEX IF NOT EXISTS idx_conversations_high ON conversations(participant_high);

-- ----------------------------------------------------------------
-- Groups (multi-party aggregate) and membership
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_groups (
    id                   TEXT PRIMARY KEY NOT NULL,
    name                 TEXT NOT NULL,
    login                TEXT NOT NULL UNIQUE,
    avatar               TEXT,
    is_official          INTEGER NOT NULL DEFAULT 0,
    last_message_id      TEXT,
    last_message_sent_at TEXT,
    version              INTEGER NOT NULL DEFAULT 0,
    created_at           TEXT NOT NULL,

    FOREIGN KEY (last_message_id) REFERENCES messages(id)
);

CREATE TABLE IF NOT EXISTS participants (
    group_id  TEXT NOT NULL,
    user_id   TEXT NOT NULL,
    role      TEXT NOT NULL CHECK (role IN ('OWNER', 'MEMBER')),
    joined_at TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);

-- ----------------------------------------------------------------
-- Feed
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS feed_items (
    id             TEXT PRIMARY KEY NOT NULL,
    kind           TEXT NOT NULL CHECK (kind IN ('CONVERSATION', 'GROUP')),
    item_id        TEXT NOT NULL,
    last_action_at TEXT NOT NULL,

    UNIQUE (item_id, kind)
);

CREATE INDEX IF NOT EXISTS idx_feed_items_last_action ON feed_items(last_action_at DESC);

-- Visibility set of conversation feed items. Group visibility comes from
-- `participants`.
CREATE TABLE IF NOT EXISTS feed_item_users (
    feed_item_id TEXT NOT NULL,
    user_id      TEXT NOT NULL,

    PRIMARY KEY (feed_item_id, user_id),
    FOREIGN KEY (feed_item_id) REFERENCES feed_items(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_feed_item_users_user ON feed_item_users(user_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
