//! Research queries over the ledger.
//!
//! Aggregates are read inside a single read transaction so every number in
//! a report comes from the same snapshot.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::Serialize;

use super::{audit, Ledger};
use crate::error::Result;
use crate::model::{BotType, Sender};

/// Study-wide totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudyStats {
    /// Number of participants ever opened.
    pub total_participants: i64,
    /// Participants whose session is still open.
    pub active_participants: i64,
    /// Participants who reached the quota before close.
    pub completed_participants: i64,
    /// Participants with at least one crisis flag.
    pub flagged_participants: i64,
    /// All stored messages.
    pub total_messages: i64,
    /// Messages sent by participants.
    pub user_messages: i64,
    /// Messages sent by bots.
    pub bot_messages: i64,
    /// All crisis flags.
    pub total_crisis_flags: i64,
    /// Flags without a review.
    pub unreviewed_flags: i64,
    /// Export audit entries.
    pub export_count: i64,
    /// Participants per condition, including empty conditions.
    pub bot_type_distribution: BTreeMap<BotType, i64>,
}

/// Per-condition outcome summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotTypeSummary {
    /// The condition.
    pub bot_type: BotType,
    /// Participants assigned to it.
    pub participants: i64,
    /// Participants who completed.
    pub completed: i64,
    /// `completed / participants`, 0 when there are none.
    pub completion_rate: f64,
    /// Participants with a crisis flag.
    pub flagged: i64,
    /// `flagged / participants`, 0 when there are none.
    pub crisis_rate: f64,
    /// Average length of user messages in characters.
    pub avg_user_message_length: Option<f64>,
}

/// Result of an integrity check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// One line per violated invariant.
    pub violations: Vec<String>,
}

impl IntegrityReport {
    /// Check if no violation was found.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

impl Ledger {
    /// Compute study-wide totals.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn study_stats(&self) -> Result<StudyStats> {
        let tx = self.conn.unchecked_transaction()?;

        let participants: (i64, i64, i64, i64) = tx.query_row(
            r"
            SELECT COUNT(*),
                   COALESCE(SUM(end_time IS NULL), 0),
                   COALESCE(SUM(completed), 0),
                   COALESCE(SUM(crisis_flagged), 0)
            FROM participants
            ",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        let (total_participants, active_participants, completed_participants, flagged_participants) =
            participants;

        let (total_messages, user_messages, bot_messages): (i64, i64, i64) = tx.query_row(
            r"
            SELECT COUNT(*),
                   COALESCE(SUM(sender = 'user'), 0),
                   COALESCE(SUM(sender = 'bot'), 0)
            FROM messages
            ",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let (total_crisis_flags, unreviewed_flags): (i64, i64) = tx.query_row(
            r"
            SELECT COUNT(*),
                   COALESCE(SUM(id NOT IN (SELECT flag_id FROM crisis_flag_reviews)), 0)
            FROM crisis_flags
            ",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let export_count: i64 =
            tx.query_row("SELECT COUNT(*) FROM export_logs", [], |row| row.get(0))?;
        let bot_type_distribution = bot_type_counts(&tx)?;
        tx.finish()?;

        Ok(StudyStats {
            total_participants,
            active_participants,
            completed_participants,
            flagged_participants,
            total_messages,
            user_messages,
            bot_messages,
            total_crisis_flags,
            unreviewed_flags,
            export_count,
            bot_type_distribution,
        })
    }

    /// Number of participants per condition, including empty conditions.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn bot_type_counts(&self) -> Result<BTreeMap<BotType, i64>> {
        bot_type_counts(&self.conn)
    }

    /// Compare outcomes across conditions.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    #[allow(clippy::cast_precision_loss)]
    pub fn bot_type_summaries(&self) -> Result<Vec<BotTypeSummary>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut summaries = Vec::with_capacity(BotType::ALL.len());

        for bot_type in BotType::ALL {
            let (participants, completed, flagged): (i64, i64, i64) = tx.query_row(
                r"
                SELECT COUNT(*),
                       COALESCE(SUM(completed), 0),
                       COALESCE(SUM(crisis_flagged), 0)
                FROM participants WHERE bot_type = ?1
                ",
                [bot_type],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

            let avg_user_message_length: Option<f64> = tx.query_row(
                r"
                SELECT AVG(LENGTH(m.content))
                FROM messages m JOIN participants p ON p.id = m.participant_id
                WHERE p.bot_type = ?1 AND m.sender = 'user'
                ",
                [bot_type],
                |row| row.get(0),
            )?;

            let rate = |count: i64| {
                if participants == 0 {
                    0.0
                } else {
                    count as f64 / participants as f64
                }
            };

            summaries.push(BotTypeSummary {
                bot_type,
                participants,
                completed,
                completion_rate: rate(completed),
                flagged,
                crisis_rate: rate(flagged),
                avg_user_message_length,
            });
        }
        tx.finish()?;

        Ok(summaries)
    }

    /// Average message length in characters, optionally for one sender.
    ///
    /// Returns `None` when there are no matching messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn average_message_length(&self, sender: Option<Sender>) -> Result<Option<f64>> {
        let avg = self.conn.query_row(
            "SELECT AVG(LENGTH(content)) FROM messages WHERE ?1 IS NULL OR sender = ?1",
            [sender],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    /// Check every stored invariant.
    ///
    /// Covers message counters, crisis bits, flag references, completion
    /// against the configured quota and the export hash chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        let tx = self.conn.unchecked_transaction()?;
        let mut violations = Vec::new();

        collect(
            &tx,
            r"
            SELECT p.id || ': total_messages is ' || p.total_messages
                   || ' but ' || COUNT(m.id) || ' messages are stored'
            FROM participants p LEFT JOIN messages m ON m.participant_id = p.id
            GROUP BY p.id
            HAVING p.total_messages != COUNT(m.id)
            ",
            &mut violations,
        )?;

        collect(
            &tx,
            r"
            SELECT p.id || ': crisis_flagged is '
                   || CASE p.crisis_flagged WHEN 0 THEN 'false' ELSE 'true' END
                   || ' but ' || COUNT(f.id) || ' flags exist'
            FROM participants p LEFT JOIN crisis_flags f ON f.participant_id = p.id
            GROUP BY p.id
            HAVING (p.crisis_flagged != 0) != (COUNT(f.id) > 0)
            ",
            &mut violations,
        )?;

        collect(
            &tx,
            r"
            SELECT 'crisis flag ' || f.id || ': message ' || f.message_id
                   || COALESCE(' belongs to ' || m.participant_id, ' does not exist')
                   || ', not ' || f.participant_id
            FROM crisis_flags f LEFT JOIN messages m ON m.id = f.message_id
            WHERE m.id IS NULL OR m.participant_id != f.participant_id
            ",
            &mut violations,
        )?;

        collect(
            &tx,
            r"
            SELECT 'message ' || m.id || ': has crisis flags but contains_crisis_keyword is false'
            FROM messages m
            WHERE m.contains_crisis_keyword = 0
              AND EXISTS (SELECT 1 FROM crisis_flags f WHERE f.message_id = m.id)
            ",
            &mut violations,
        )?;

        collect(
            &tx,
            r"
            SELECT 'message ' || m.id || ': participant ' || m.participant_id || ' does not exist'
            FROM messages m LEFT JOIN participants p ON p.id = m.participant_id
            WHERE p.id IS NULL
            ",
            &mut violations,
        )?;

        let mut stmt = tx.prepare(
            r"
            SELECT p.id || ': completed with only ' || COUNT(m.id) || ' user messages'
            FROM participants p
            LEFT JOIN messages m ON m.participant_id = p.id AND m.sender = 'user'
            WHERE p.completed != 0
            GROUP BY p.id
            HAVING COUNT(m.id) < ?1
            ",
        )?;
        let incomplete = stmt
            .query_map([self.settings.message_quota], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        violations.extend(incomplete);
        drop(stmt);

        violations.extend(audit::verify_chain(&tx)?);
        tx.finish()?;

        Ok(IntegrityReport { violations })
    }
}

pub(super) fn bot_type_counts(conn: &Connection) -> Result<BTreeMap<BotType, i64>> {
    let mut counts: BTreeMap<BotType, i64> = BotType::ALL.iter().map(|b| (*b, 0)).collect();

    let mut stmt = conn.prepare("SELECT bot_type, COUNT(*) FROM participants GROUP BY bot_type")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, BotType>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (bot_type, count) = row?;
        counts.insert(bot_type, count);
    }
    Ok(counts)
}

/// Run a query returning one violation description per row.
fn collect(conn: &Connection, sql: &str, violations: &mut Vec<String>) -> Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    violations.extend(rows);
    Ok(())
}
