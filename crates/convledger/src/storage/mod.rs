//! Storage layer for convledger.
//!
//! This module provides the `SQLite`-backed conversation ledger: participant
//! sessions, their messages, crisis flags raised on those messages, flag
//! reviews and the export audit log. Every multi-row mutation runs in a single
//! `BEGIN IMMEDIATE` transaction so counters and flags are never partially
//! visible.

pub mod audit;
pub mod flags;
pub mod migrations;
pub mod schema;
pub mod stats;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use crate::assignment::{choose_bot_type, AssignmentStrategy};
use crate::config::Config;
use crate::crisis::CrisisDetector;
use crate::error::{Error, Result};
use crate::model::{BotType, CrisisFlag, Message, Participant, Sender};

pub use audit::{ExportOutcome, ExportRequest, ExportView};
pub use stats::{BotTypeSummary, IntegrityReport, StudyStats};

/// Metadata key holding the last allocated participant number.
const PARTICIPANT_SEQ_KEY: &str = "participant_seq";

const PARTICIPANT_COLUMNS: &str = "id, bot_type, start_time, end_time, total_messages, \
     completed, crisis_flagged, external_id";

const MESSAGE_COLUMNS: &str =
    "id, participant_id, message_num, sender, content, timestamp, contains_crisis_keyword";

/// Study rules applied by the ledger on every write.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Number of user messages that completes a conversation.
    pub message_quota: u32,
    /// Prefix for generated participant ids.
    pub participant_id_prefix: String,
    /// How long to wait on a locked database.
    pub busy_timeout: Duration,
    /// Also run crisis detection on bot messages.
    pub scan_bot_messages: bool,
    /// The keyword matcher run inside `append_message`.
    pub detector: CrisisDetector,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            message_quota: 20,
            participant_id_prefix: "P".to_string(),
            busy_timeout: Duration::from_secs(5),
            scan_bot_messages: false,
            detector: CrisisDetector::new(),
        }
    }
}

impl LedgerSettings {
    /// Build ledger settings from the application configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyword table cannot be compiled.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            message_quota: config.study.message_quota,
            participant_id_prefix: config.study.participant_id_prefix.trim().to_string(),
            busy_timeout: config.busy_timeout(),
            scan_bot_messages: config.safety.scan_bot_messages,
            detector: CrisisDetector::with_config(config.detector_config())?,
        })
    }
}

/// Parameters for opening a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    /// The assigned condition.
    pub bot_type: BotType,
    /// When the session started.
    pub start_time: DateTime<Utc>,
    /// Recruitment-platform id, if any.
    pub external_id: Option<String>,
}

impl NewSession {
    /// A session starting now with no external id.
    #[must_use]
    pub fn new(bot_type: BotType) -> Self {
        Self {
            bot_type,
            start_time: Utc::now(),
            external_id: None,
        }
    }

    /// Set the start time.
    #[must_use]
    pub fn started_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    /// Attach a recruitment-platform id.
    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

/// Result of appending a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendOutcome {
    /// Id of the stored message.
    pub message_id: i64,
    /// Turn number assigned to the message.
    pub message_num: u32,
    /// Crisis flags raised by this message.
    pub crisis_flags: Vec<CrisisFlag>,
}

impl AppendOutcome {
    /// Check whether the message raised any crisis flag.
    #[must_use]
    pub fn is_flagged(&self) -> bool {
        !self.crisis_flags.is_empty()
    }
}

/// Filter for listing participants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantFilter {
    /// Only participants in this condition.
    pub bot_type: Option<BotType>,
    /// Only completed (or only uncompleted) participants.
    pub completed: Option<bool>,
    /// Only flagged (or only unflagged) participants.
    pub crisis_flagged: Option<bool>,
    /// Only open (`false`) or closed (`true`) sessions.
    pub closed: Option<bool>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
}

/// The conversation ledger.
///
/// Wraps one `SQLite` connection. Open several ledgers on the same file to
/// write from several threads; `SQLite` serializes their transactions.
#[derive(Debug)]
pub struct Ledger {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Connection,
    /// Study rules.
    settings: LedgerSettings,
}

impl Ledger {
    /// Open or create a ledger database at the given path with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, LedgerSettings::default())
    }

    /// Open or create a ledger database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes the schema if this is a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open_with(path: impl AsRef<Path>, settings: LedgerSettings) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening ledger at {}", path.display());
        let mut conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.busy_timeout(settings.busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::initialize_schema(&mut conn)?;

        info!("Ledger opened at {}", path.display());
        Ok(Self {
            path,
            conn,
            settings,
        })
    }

    /// Open the ledger described by the application configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyword table is invalid or the database cannot be opened.
    pub fn from_config(config: &Config) -> Result<Self> {
        let settings = LedgerSettings::from_config(config)?;
        Self::open_with(config.database_path(), settings)
    }

    /// Create an in-memory ledger with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(LedgerSettings::default())
    }

    /// Create an in-memory ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory_with(settings: LedgerSettings) -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::initialize_schema(&mut conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
            settings,
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The study rules this ledger enforces.
    #[must_use]
    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Open a new session for the given condition, starting now.
    ///
    /// Returns the allocated participant id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn open_session(&mut self, bot_type: BotType) -> Result<String> {
        Ok(self.open_session_with(NewSession::new(bot_type))?.id)
    }

    /// Open a new session.
    ///
    /// The participant id is allocated from a sequence advanced in the same
    /// transaction as the insert.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn open_session_with(&mut self, session: NewSession) -> Result<Participant> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let participant = insert_participant(&tx, &self.settings.participant_id_prefix, &session)?;
        tx.commit()?;

        info!(participant = %participant.id, bot_type = %session.bot_type, "Opened session");
        Ok(participant)
    }

    /// Open a new session whose condition is chosen by `strategy`.
    ///
    /// The assignment counts are read in the same write transaction as the
    /// insert, so concurrent front-ends never both fill the same
    /// least-assigned slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn open_assigned_session<R: Rng + ?Sized>(
        &mut self,
        strategy: AssignmentStrategy,
        rng: &mut R,
        external_id: Option<String>,
    ) -> Result<Participant> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let counts = stats::bot_type_counts(&tx)?;
        let bot_type = choose_bot_type(&counts, strategy, rng)?;
        let session = NewSession {
            external_id,
            ..NewSession::new(bot_type)
        };
        let participant = insert_participant(&tx, &self.settings.participant_id_prefix, &session)?;
        tx.commit()?;

        info!(
            participant = %participant.id,
            %bot_type,
            %strategy,
            "Opened assigned session"
        );
        Ok(participant)
    }

    /// Attach or replace a participant's recruitment-platform id.
    ///
    /// Allowed on open and closed sessions.
    ///
    /// # Errors
    ///
    /// Returns `UnknownParticipant` for unknown ids, or a storage error.
    pub fn set_external_id(
        &mut self,
        participant_id: &str,
        external_id: &str,
    ) -> Result<Participant> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE participants SET external_id = ?2 WHERE id = ?1",
            params![participant_id, external_id],
        )?;
        if updated == 0 {
            return Err(Error::unknown_participant(participant_id));
        }
        let participant = load_participant(&tx, participant_id)?
            .ok_or_else(|| Error::unknown_participant(participant_id))?;
        tx.commit()?;

        debug!(participant = participant_id, "Set external id");
        Ok(participant)
    }

    /// Append a message to a participant's conversation.
    ///
    /// User messages are numbered `1..=quota`; bot messages share the number
    /// of the latest user message. Crisis detection runs on user messages
    /// (and bot messages when configured) in the same transaction as the
    /// insert, so the message, its flags and the participant's counters
    /// commit together or not at all.
    ///
    /// # Errors
    ///
    /// Returns `UnknownParticipant`, `SessionClosed` or `QuotaExceeded` when
    /// the append is not allowed, or a storage error.
    pub fn append_message(
        &mut self,
        participant_id: &str,
        sender: Sender,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        let quota = self.settings.message_quota;
        let scan = sender == Sender::User || self.settings.scan_bot_messages;
        let matches = if scan {
            self.settings.detector.detect(content)
        } else {
            Vec::new()
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let closed: bool = tx
            .query_row(
                "SELECT end_time IS NOT NULL FROM participants WHERE id = ?1",
                [participant_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::unknown_participant(participant_id))?;
        if closed {
            return Err(Error::SessionClosed {
                participant_id: participant_id.to_string(),
            });
        }

        let user_count = count_user_messages(&tx, participant_id)?;
        let message_num = match sender {
            Sender::User if user_count >= quota => {
                return Err(Error::QuotaExceeded {
                    participant_id: participant_id.to_string(),
                    quota,
                });
            }
            Sender::User => user_count + 1,
            Sender::Bot => user_count,
        };

        tx.execute(
            r"
            INSERT INTO messages
                (participant_id, message_num, sender, content, timestamp, contains_crisis_keyword)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                participant_id,
                message_num,
                sender,
                content,
                format_timestamp(&timestamp),
                !matches.is_empty(),
            ],
        )?;
        let message_id = tx.last_insert_rowid();

        let crisis_flags =
            flags::insert_flags(&tx, participant_id, message_id, &matches, Utc::now())?;

        tx.execute(
            r"
            UPDATE participants
            SET total_messages = total_messages + 1,
                crisis_flagged = crisis_flagged OR ?2
            WHERE id = ?1
            ",
            params![participant_id, !crisis_flags.is_empty()],
        )?;
        tx.commit()?;

        debug!(
            participant = participant_id,
            message_id, message_num, "Appended message"
        );
        if !crisis_flags.is_empty() {
            info!(
                participant = participant_id,
                message_id,
                flags = crisis_flags.len(),
                "Crisis keywords flagged"
            );
        }

        Ok(AppendOutcome {
            message_id,
            message_num,
            crisis_flags,
        })
    }

    /// Close a participant's session.
    ///
    /// Sets `end_time` and marks the participant completed iff the user
    /// message quota was reached. Closing an already closed session changes
    /// nothing and returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns `UnknownParticipant` for unknown ids, or a storage error.
    pub fn close_session(
        &mut self,
        participant_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<Participant> {
        let quota = self.settings.message_quota;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let participant = load_participant(&tx, participant_id)?
            .ok_or_else(|| Error::unknown_participant(participant_id))?;
        if participant.is_closed() {
            debug!(participant = participant_id, "Session already closed");
            return Ok(participant);
        }

        let participant = finish_session(&tx, participant_id, end_time, quota)?;
        tx.commit()?;

        info!(
            participant = participant_id,
            completed = participant.completed,
            "Closed session"
        );
        Ok(participant)
    }

    /// Close every open session idle for longer than `idle_for`.
    ///
    /// A session's last activity is its latest message, or its start time if
    /// it has none. Stale sessions are closed at `now` under the same
    /// completion rule as [`Ledger::close_session`]. Returns the closed
    /// participants.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn close_stale_sessions(
        &mut self,
        idle_for: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Participant>> {
        let quota = self.settings.message_quota;
        let cutoff = format_timestamp(&(now - idle_for));
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stale: Vec<String> = {
            let mut stmt = tx.prepare(
                r"
                SELECT p.id FROM participants p
                WHERE p.end_time IS NULL
                  AND COALESCE(
                        (SELECT MAX(m.timestamp) FROM messages m WHERE m.participant_id = p.id),
                        p.start_time
                      ) < ?1
                ORDER BY p.rowid
                ",
            )?;
            let ids = stmt
                .query_map([&cutoff], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            ids
        };

        let closed = stale
            .iter()
            .map(|id| finish_session(&tx, id, now, quota))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;

        if !closed.is_empty() {
            info!(count = closed.len(), "Closed stale sessions");
        }
        Ok(closed)
    }

    /// Get a participant by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn participant(&self, participant_id: &str) -> Result<Option<Participant>> {
        load_participant(&self.conn, participant_id)
    }

    /// Find the earliest participant with the given recruitment-platform id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn find_by_external_id(&self, external_id: &str) -> Result<Option<Participant>> {
        let sql = format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants \
             WHERE external_id = ?1 ORDER BY rowid LIMIT 1"
        );
        let participant = self
            .conn
            .query_row(&sql, [external_id], row_to_participant)
            .optional()?;
        Ok(participant)
    }

    /// List participants in the order they were opened.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn participants(&self, filter: &ParticipantFilter) -> Result<Vec<Participant>> {
        load_participants(&self.conn, filter)
    }

    /// Load a participant's conversation ordered by turn.
    ///
    /// # Errors
    ///
    /// Returns `UnknownParticipant` for unknown ids, or a storage error.
    pub fn conversation(&self, participant_id: &str) -> Result<Vec<Message>> {
        if load_participant(&self.conn, participant_id)?.is_none() {
            return Err(Error::unknown_participant(participant_id));
        }
        load_conversation(&self.conn, participant_id)
    }

    /// Get a message by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn message(&self, message_id: i64) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let message = self
            .conn
            .query_row(&sql, [message_id], row_to_message)
            .optional()?;
        Ok(message)
    }
}

/// Format a timestamp for storage.
///
/// Fixed microsecond precision keeps stored values sortable as text.
pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, reporting failures against the given column.
pub(crate) fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

/// Allocate the next participant id and insert the participant row.
fn insert_participant(conn: &Connection, prefix: &str, session: &NewSession) -> Result<Participant> {
    let mut seq: i64 = conn
        .query_row(
            "SELECT CAST(value AS INTEGER) FROM metadata WHERE key = ?1",
            [PARTICIPANT_SEQ_KEY],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    // Skip ids taken under an earlier prefix configuration.
    let id = loop {
        seq += 1;
        let candidate = format!("{prefix}{seq:03}");
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM participants WHERE id = ?1)",
            [&candidate],
            |row| row.get(0),
        )?;
        if !taken {
            break candidate;
        }
    };

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![PARTICIPANT_SEQ_KEY, seq.to_string()],
    )?;
    conn.execute(
        r"
        INSERT INTO participants (id, bot_type, start_time, external_id)
        VALUES (?1, ?2, ?3, ?4)
        ",
        params![
            id,
            session.bot_type,
            format_timestamp(&session.start_time),
            session.external_id,
        ],
    )?;

    load_participant(conn, &id)?
        .ok_or_else(|| Error::internal(format!("participant {id} missing after insert")))
}

/// Set `end_time` and `completed` on an open session.
fn finish_session(
    conn: &Connection,
    participant_id: &str,
    end_time: DateTime<Utc>,
    quota: u32,
) -> Result<Participant> {
    let completed = count_user_messages(conn, participant_id)? >= quota;
    conn.execute(
        r"
        UPDATE participants SET end_time = ?2, completed = ?3
        WHERE id = ?1 AND end_time IS NULL
        ",
        params![participant_id, format_timestamp(&end_time), completed],
    )?;

    load_participant(conn, participant_id)?
        .ok_or_else(|| Error::unknown_participant(participant_id))
}

fn count_user_messages(conn: &Connection, participant_id: &str) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE participant_id = ?1 AND sender = 'user'",
        [participant_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn load_participant(conn: &Connection, participant_id: &str) -> Result<Option<Participant>> {
    let sql = format!("SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE id = ?1");
    let participant = conn
        .query_row(&sql, [participant_id], row_to_participant)
        .optional()?;
    Ok(participant)
}

fn load_participants(conn: &Connection, filter: &ParticipantFilter) -> Result<Vec<Participant>> {
    let sql = format!(
        r"
        SELECT {PARTICIPANT_COLUMNS} FROM participants
        WHERE (?1 IS NULL OR bot_type = ?1)
          AND (?2 IS NULL OR completed = ?2)
          AND (?3 IS NULL OR crisis_flagged = ?3)
          AND (?4 IS NULL OR (end_time IS NOT NULL) = ?4)
        ORDER BY rowid
        LIMIT ?5
        "
    );
    let limit = filter
        .limit
        .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));

    let mut stmt = conn.prepare(&sql)?;
    let participants = stmt
        .query_map(
            params![
                filter.bot_type,
                filter.completed,
                filter.crisis_flagged,
                filter.closed,
                limit,
            ],
            row_to_participant,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(participants)
}

fn load_conversation(conn: &Connection, participant_id: &str) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE participant_id = ?1 ORDER BY message_num, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let messages = stmt
        .query_map([participant_id], row_to_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(messages)
}

fn load_all_messages(conn: &Connection) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m \
         ORDER BY (SELECT rowid FROM participants p WHERE p.id = m.participant_id), \
                  message_num, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let messages = stmt
        .query_map([], row_to_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(messages)
}

/// Convert a database row to a Participant.
fn row_to_participant(row: &rusqlite::Row) -> rusqlite::Result<Participant> {
    let start_time: String = row.get(2)?;
    let end_time: Option<String> = row.get(3)?;

    Ok(Participant {
        id: row.get(0)?,
        bot_type: row.get(1)?,
        start_time: parse_timestamp(2, &start_time)?,
        end_time: end_time
            .map(|value| parse_timestamp(3, &value))
            .transpose()?,
        total_messages: row.get(4)?,
        completed: row.get(5)?,
        crisis_flagged: row.get(6)?,
        external_id: row.get(7)?,
    })
}

/// Convert a database row to a Message.
fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let timestamp: String = row.get(5)?;

    Ok(Message {
        id: row.get(0)?,
        participant_id: row.get(1)?,
        message_num: row.get(2)?,
        sender: row.get(3)?,
        content: row.get(4)?,
        timestamp: parse_timestamp(5, &timestamp)?,
        contains_crisis_keyword: row.get(6)?,
    })
}
