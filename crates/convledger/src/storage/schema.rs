//! `SQLite` schema definitions for convledger.
//!
//! This module contains the SQL statements for creating the ledger tables,
//! their indexes, and the triggers that keep audit collections append-only.

/// SQL statement to create the participants table.
pub const CREATE_PARTICIPANTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS participants (
    id TEXT PRIMARY KEY,
    bot_type TEXT NOT NULL
        CHECK (bot_type IN ('emotional', 'cognitive', 'motivational', 'neutral')),
    start_time TEXT NOT NULL,
    end_time TEXT,
    total_messages INTEGER NOT NULL DEFAULT 0 CHECK (total_messages >= 0),
    completed INTEGER NOT NULL DEFAULT 0,
    crisis_flagged INTEGER NOT NULL DEFAULT 0,
    external_id TEXT
)
";

/// SQL statement to create the messages table.
pub const CREATE_MESSAGES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    participant_id TEXT NOT NULL REFERENCES participants(id),
    message_num INTEGER NOT NULL CHECK (message_num >= 0),
    sender TEXT NOT NULL CHECK (sender IN ('user', 'bot')),
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    contains_crisis_keyword INTEGER NOT NULL DEFAULT 0
)
";

/// SQL statement to create the crisis flags table.
pub const CREATE_CRISIS_FLAGS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS crisis_flags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    participant_id TEXT NOT NULL REFERENCES participants(id),
    message_id INTEGER NOT NULL REFERENCES messages(id),
    keyword_matched TEXT NOT NULL,
    flagged_at TEXT NOT NULL,
    severity_level TEXT NOT NULL CHECK (severity_level IN ('high', 'medium', 'low'))
)
";

/// SQL statement to create the crisis flag review table.
pub const CREATE_FLAG_REVIEWS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS crisis_flag_reviews (
    flag_id INTEGER PRIMARY KEY REFERENCES crisis_flags(id),
    reviewer TEXT NOT NULL,
    reviewed_at TEXT NOT NULL,
    notes TEXT
)
";

/// SQL statement to create the export audit table.
pub const CREATE_EXPORT_LOGS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS export_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exported_at TEXT NOT NULL,
    actor TEXT NOT NULL,
    scope TEXT NOT NULL CHECK (scope IN ('participants', 'messages', 'crisis_flags', 'all')),
    format TEXT NOT NULL,
    row_count INTEGER NOT NULL CHECK (row_count >= 0),
    participant_count INTEGER NOT NULL CHECK (participant_count >= 0),
    destination TEXT,
    notes TEXT,
    content_digest TEXT,
    entry_hash TEXT NOT NULL
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Index for loading a conversation in order.
pub const CREATE_MESSAGES_PARTICIPANT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_messages_participant_num
    ON messages(participant_id, message_num, id)
";

/// User turns are numbered uniquely per participant.
pub const CREATE_USER_MESSAGE_NUM_UNIQUE: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_user_turn
    ON messages(participant_id, message_num) WHERE sender = 'user'
";

/// One flag per message and keyword.
pub const CREATE_FLAG_UNIQUE: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_crisis_flags_message_keyword
    ON crisis_flags(participant_id, message_id, keyword_matched)
";

/// Index for listing flags newest first.
pub const CREATE_FLAG_TIME_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_crisis_flags_flagged_at ON crisis_flags(flagged_at DESC)
";

/// Index for filtering participants by condition.
pub const CREATE_PARTICIPANT_BOT_TYPE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_participants_bot_type ON participants(bot_type)
";

/// Index for looking participants up by recruitment id.
pub const CREATE_PARTICIPANT_EXTERNAL_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_participants_external_id ON participants(external_id)
";

/// Participants are never deleted.
pub const PARTICIPANTS_NO_DELETE: &str = r"
CREATE TRIGGER IF NOT EXISTS participants_no_delete
BEFORE DELETE ON participants
BEGIN
    SELECT RAISE(ABORT, 'participants cannot be deleted');
END
";

/// Messages are never deleted.
pub const MESSAGES_NO_DELETE: &str = r"
CREATE TRIGGER IF NOT EXISTS messages_no_delete
BEFORE DELETE ON messages
BEGIN
    SELECT RAISE(ABORT, 'messages cannot be deleted');
END
";

/// Message content, sender and numbering never change after insert.
pub const MESSAGES_IMMUTABLE: &str = r"
CREATE TRIGGER IF NOT EXISTS messages_immutable
BEFORE UPDATE OF participant_id, message_num, sender, content, timestamp ON messages
BEGIN
    SELECT RAISE(ABORT, 'messages are immutable');
END
";

/// Crisis flags cannot be updated.
pub const CRISIS_FLAGS_NO_UPDATE: &str = r"
CREATE TRIGGER IF NOT EXISTS crisis_flags_no_update
BEFORE UPDATE ON crisis_flags
BEGIN
    SELECT RAISE(ABORT, 'crisis_flags is append-only');
END
";

/// Crisis flags cannot be deleted.
pub const CRISIS_FLAGS_NO_DELETE: &str = r"
CREATE TRIGGER IF NOT EXISTS crisis_flags_no_delete
BEFORE DELETE ON crisis_flags
BEGIN
    SELECT RAISE(ABORT, 'crisis_flags is append-only');
END
";

/// Reviews cannot be updated.
pub const FLAG_REVIEWS_NO_UPDATE: &str = r"
CREATE TRIGGER IF NOT EXISTS crisis_flag_reviews_no_update
BEFORE UPDATE ON crisis_flag_reviews
BEGIN
    SELECT RAISE(ABORT, 'crisis_flag_reviews is append-only');
END
";

/// Reviews cannot be deleted.
pub const FLAG_REVIEWS_NO_DELETE: &str = r"
CREATE TRIGGER IF NOT EXISTS crisis_flag_reviews_no_delete
BEFORE DELETE ON crisis_flag_reviews
BEGIN
    SELECT RAISE(ABORT, 'crisis_flag_reviews is append-only');
END
";

/// Export log entries cannot be updated.
pub const EXPORT_LOGS_NO_UPDATE: &str = r"
CREATE TRIGGER IF NOT EXISTS export_logs_no_update
BEFORE UPDATE ON export_logs
BEGIN
    SELECT RAISE(ABORT, 'export_logs is append-only');
END
";

/// Export log entries cannot be deleted.
pub const EXPORT_LOGS_NO_DELETE: &str = r"
CREATE TRIGGER IF NOT EXISTS export_logs_no_delete
BEFORE DELETE ON export_logs
BEGIN
    SELECT RAISE(ABORT, 'export_logs is append-only');
END
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_PARTICIPANTS_TABLE,
    CREATE_MESSAGES_TABLE,
    CREATE_CRISIS_FLAGS_TABLE,
    CREATE_FLAG_REVIEWS_TABLE,
    CREATE_EXPORT_LOGS_TABLE,
    CREATE_METADATA_TABLE,
    CREATE_MESSAGES_PARTICIPANT_INDEX,
    CREATE_USER_MESSAGE_NUM_UNIQUE,
    CREATE_FLAG_UNIQUE,
    CREATE_FLAG_TIME_INDEX,
    CREATE_PARTICIPANT_BOT_TYPE_INDEX,
    CREATE_PARTICIPANT_EXTERNAL_INDEX,
    PARTICIPANTS_NO_DELETE,
    MESSAGES_NO_DELETE,
    MESSAGES_IMMUTABLE,
    CRISIS_FLAGS_NO_UPDATE,
    CRISIS_FLAGS_NO_DELETE,
    FLAG_REVIEWS_NO_UPDATE,
    FLAG_REVIEWS_NO_DELETE,
    EXPORT_LOGS_NO_UPDATE,
    EXPORT_LOGS_NO_DELETE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_not_empty() {
        assert!(!SCHEMA_STATEMENTS.is_empty());
        for stmt in SCHEMA_STATEMENTS {
            assert!(!stmt.trim().is_empty());
        }
    }

    #[test]
    fn test_participants_table_contains_required_columns() {
        assert!(CREATE_PARTICIPANTS_TABLE.contains("id TEXT PRIMARY KEY"));
        assert!(CREATE_PARTICIPANTS_TABLE.contains("bot_type TEXT NOT NULL"));
        assert!(CREATE_PARTICIPANTS_TABLE.contains("total_messages INTEGER NOT NULL"));
        assert!(CREATE_PARTICIPANTS_TABLE.contains("crisis_flagged INTEGER NOT NULL"));
    }

    #[test]
    fn test_messages_reference_participants() {
        assert!(CREATE_MESSAGES_TABLE.contains("REFERENCES participants(id)"));
        assert!(CREATE_MESSAGES_TABLE.contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
    }

    #[test]
    fn test_crisis_flags_reference_messages() {
        assert!(CREATE_CRISIS_FLAGS_TABLE.contains("REFERENCES messages(id)"));
        assert!(CREATE_CRISIS_FLAGS_TABLE.contains("severity_level TEXT NOT NULL"));
    }

    #[test]
    fn test_user_turn_index_is_partial() {
        assert!(CREATE_USER_MESSAGE_NUM_UNIQUE.contains("UNIQUE"));
        assert!(CREATE_USER_MESSAGE_NUM_UNIQUE.contains("WHERE sender = 'user'"));
    }

    #[test]
    fn test_metadata_table_structure() {
        assert!(CREATE_METADATA_TABLE.contains("key TEXT PRIMARY KEY"));
        assert!(CREATE_METADATA_TABLE.contains("value TEXT NOT NULL"));
    }
}
