//! Crisis flags and their reviews.
//!
//! Flags are append-only. A researcher acknowledges a flag by adding a
//! review row; the flag itself never changes.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use super::{format_timestamp, load_participant, parse_timestamp, Ledger};
use crate::crisis::KeywordMatch;
use crate::error::{Error, Result};
use crate::model::{CrisisFlag, FlagReview};

const FLAG_COLUMNS: &str =
    "id, participant_id, message_id, keyword_matched, flagged_at, severity_level";

impl Ledger {
    /// Run crisis detection on a stored message and record any new flags.
    ///
    /// Only keywords not already flagged for the message are inserted, so
    /// calling this twice has the same effect as calling it once. Returns the
    /// flags inserted by this call.
    ///
    /// # Errors
    ///
    /// Returns `UnknownParticipant` if the participant does not exist,
    /// `ReferentialIntegrityViolation` if the message does not exist, belongs
    /// to another participant or has different content, and `DuplicateFlag`
    /// if a concurrent writer inserted the same flag first.
    pub fn detect_and_flag(
        &mut self,
        participant_id: &str,
        message_id: i64,
        content: &str,
    ) -> Result<Vec<CrisisFlag>> {
        let matches = self.settings.detector.detect(content);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if load_participant(&tx, participant_id)?.is_none() {
            return Err(Error::unknown_participant(participant_id));
        }

        let stored: Option<(String, String)> = tx
            .query_row(
                "SELECT participant_id, content FROM messages WHERE id = ?1",
                [message_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match stored {
            None => {
                return Err(Error::integrity(format!(
                    "message {message_id} does not exist"
                )));
            }
            Some((owner, _)) if owner != participant_id => {
                return Err(Error::integrity(format!(
                    "message {message_id} belongs to {owner}, not {participant_id}"
                )));
            }
            Some((_, stored_content)) if stored_content != content => {
                return Err(Error::integrity(format!(
                    "content does not match stored message {message_id}"
                )));
            }
            Some(_) => {}
        }

        if matches.is_empty() {
            return Ok(Vec::new());
        }

        let existing: HashSet<String> = {
            let mut stmt =
                tx.prepare("SELECT keyword_matched FROM crisis_flags WHERE message_id = ?1")?;
            let rows = stmt
                .query_map([message_id], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            rows
        };
        let missing: Vec<KeywordMatch> = matches
            .into_iter()
            .filter(|m| !existing.contains(&m.keyword))
            .collect();

        let flags = insert_flags(&tx, participant_id, message_id, &missing, Utc::now())?;

        // The crisis bit on the message is derived from its flags.
        tx.execute(
            "UPDATE messages SET contains_crisis_keyword = 1 \
             WHERE id = ?1 AND contains_crisis_keyword = 0",
            [message_id],
        )?;
        if !flags.is_empty() {
            tx.execute(
                "UPDATE participants SET crisis_flagged = 1 WHERE id = ?1",
                [participant_id],
            )?;
        }
        tx.commit()?;

        if flags.is_empty() {
            debug!(message_id, "Message already fully flagged");
        } else {
            info!(
                participant = participant_id,
                message_id,
                flags = flags.len(),
                "Crisis keywords flagged"
            );
        }
        Ok(flags)
    }

    /// Get a crisis flag by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn crisis_flag(&self, flag_id: i64) -> Result<Option<CrisisFlag>> {
        let sql = format!("SELECT {FLAG_COLUMNS} FROM crisis_flags WHERE id = ?1");
        let flag = self
            .conn
            .query_row(&sql, [flag_id], row_to_flag)
            .optional()?;
        Ok(flag)
    }

    /// List a participant's crisis flags in the order they were raised.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn crisis_flags_for(&self, participant_id: &str) -> Result<Vec<CrisisFlag>> {
        let sql = format!(
            "SELECT {FLAG_COLUMNS} FROM crisis_flags WHERE participant_id = ?1 ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let flags = stmt
            .query_map([participant_id], row_to_flag)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(flags)
    }

    /// List every crisis flag, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn crisis_flags(&self) -> Result<Vec<CrisisFlag>> {
        load_all_flags(&self.conn)
    }

    /// List flags that nobody has reviewed yet, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn unreviewed_flags(&self) -> Result<Vec<CrisisFlag>> {
        let sql = format!(
            r"
            SELECT {FLAG_COLUMNS} FROM crisis_flags
            WHERE id NOT IN (SELECT flag_id FROM crisis_flag_reviews)
            ORDER BY flagged_at DESC, id DESC
            "
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let flags = stmt
            .query_map([], row_to_flag)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(flags)
    }

    /// Record a review of a crisis flag.
    ///
    /// A flag is reviewed once; reviewing it again returns the first review
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns `ReferentialIntegrityViolation` if the flag does not exist.
    pub fn review_flag(
        &mut self,
        flag_id: i64,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<FlagReview> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM crisis_flags WHERE id = ?1)",
            [flag_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::integrity(format!(
                "crisis flag {flag_id} does not exist"
            )));
        }

        if let Some(review) = load_review(&tx, flag_id)? {
            debug!(flag_id, "Flag already reviewed");
            return Ok(review);
        }

        tx.execute(
            r"
            INSERT INTO crisis_flag_reviews (flag_id, reviewer, reviewed_at, notes)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![flag_id, reviewer, format_timestamp(&Utc::now()), notes],
        )?;
        let review = load_review(&tx, flag_id)?
            .ok_or_else(|| Error::internal(format!("review for flag {flag_id} missing")))?;
        tx.commit()?;

        info!(flag_id, reviewer, "Reviewed crisis flag");
        Ok(review)
    }

    /// Get the review of a flag, if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn flag_review(&self, flag_id: i64) -> Result<Option<FlagReview>> {
        load_review(&self.conn, flag_id)
    }
}

/// Insert one flag per keyword match for a message.
///
/// A uniqueness violation on (message, keyword) maps to `DuplicateFlag`.
pub(super) fn insert_flags(
    conn: &Connection,
    participant_id: &str,
    message_id: i64,
    matches: &[KeywordMatch],
    flagged_at: DateTime<Utc>,
) -> Result<Vec<CrisisFlag>> {
    let flagged_at_str = format_timestamp(&flagged_at);
    let mut stmt = conn.prepare(
        r"
        INSERT INTO crisis_flags
            (participant_id, message_id, keyword_matched, flagged_at, severity_level)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ",
    )?;

    let mut flags = Vec::with_capacity(matches.len());
    for m in matches {
        stmt.execute(params![
            participant_id,
            message_id,
            m.keyword,
            flagged_at_str,
            m.severity,
        ])
        .map_err(|e| duplicate_or(e, message_id, &m.keyword))?;

        flags.push(CrisisFlag {
            id: conn.last_insert_rowid(),
            participant_id: participant_id.to_string(),
            message_id,
            keyword_matched: m.keyword.clone(),
            flagged_at: parse_timestamp(4, &flagged_at_str)?,
            severity_level: m.severity,
        });
    }
    Ok(flags)
}

fn duplicate_or(err: rusqlite::Error, message_id: i64, keyword: &str) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Error::DuplicateFlag {
                message_id,
                keyword: keyword.to_string(),
            }
        }
        _ => err.into(),
    }
}

pub(super) fn load_all_flags(conn: &Connection) -> Result<Vec<CrisisFlag>> {
    let sql =
        format!("SELECT {FLAG_COLUMNS} FROM crisis_flags ORDER BY flagged_at DESC, id DESC");
    let mut stmt = conn.prepare(&sql)?;
    let flags = stmt
        .query_map([], row_to_flag)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(flags)
}

fn load_review(conn: &Connection, flag_id: i64) -> Result<Option<FlagReview>> {
    let review = conn
        .query_row(
            "SELECT flag_id, reviewer, reviewed_at, notes FROM crisis_flag_reviews WHERE flag_id = ?1",
            [flag_id],
            |row| {
                let reviewed_at: String = row.get(2)?;
                Ok(FlagReview {
                    flag_id: row.get(0)?,
                    reviewer: row.get(1)?,
                    reviewed_at: parse_timestamp(2, &reviewed_at)?,
                    notes: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(review)
}

/// Convert a database row to a `CrisisFlag`.
fn row_to_flag(row: &rusqlite::Row) -> rusqlite::Result<CrisisFlag> {
    let flagged_at: String = row.get(4)?;

    Ok(CrisisFlag {
        id: row.get(0)?,
        participant_id: row.get(1)?,
        message_id: row.get(2)?,
        keyword_matched: row.get(3)?,
        flagged_at: parse_timestamp(4, &flagged_at)?,
        severity_level: row.get(5)?,
    })
}
