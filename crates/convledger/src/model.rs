//! Core record types for convledger.
//!
//! This module defines the participants, messages, crisis flags and export
//! log entries held by the ledger, along with the closed enumerations used
//! for bot types, senders and severity levels.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Implements `ToSql`/`FromSql` for an enum through its `Display`/`FromStr`.
macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|err: Error| FromSqlError::Other(Box::new(err)))
            }
        }
    };
}

/// The experimental condition assigned to a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotType {
    /// Validates and reflects the participant's feelings.
    Emotional,
    /// Helps the participant reframe their thinking.
    Cognitive,
    /// Encourages action and goal setting.
    Motivational,
    /// Control condition without an empathy style.
    Neutral,
}

impl BotType {
    /// Every bot type, in assignment order.
    pub const ALL: [Self; 4] = [
        Self::Emotional,
        Self::Cognitive,
        Self::Motivational,
        Self::Neutral,
    ];

    /// The stored name of this bot type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emotional => "emotional",
            Self::Cognitive => "cognitive",
            Self::Motivational => "motivational",
            Self::Neutral => "neutral",
        }
    }
}

impl fmt::Display for BotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emotional" => Ok(Self::Emotional),
            "cognitive" => Ok(Self::Cognitive),
            "motivational" => Ok(Self::Motivational),
            "neutral" => Ok(Self::Neutral),
            _ => Err(Error::InvalidBotType {
                value: s.to_string(),
            }),
        }
    }
}

sql_text_enum!(BotType);

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    /// The study participant.
    User,
    /// The assigned chatbot.
    Bot,
}

impl Sender {
    /// The stored name of this sender.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "bot" => Ok(Self::Bot),
            _ => Err(Error::InvalidSender {
                value: s.to_string(),
            }),
        }
    }
}

sql_text_enum!(Sender);

/// Priority of a detected crisis keyword.
///
/// Ordered so that `High` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityLevel {
    /// Worth a look during routine review.
    Low,
    /// Needs review soon.
    Medium,
    /// Needs immediate review.
    High,
}

impl SeverityLevel {
    /// The stored name of this severity.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeverityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(Error::InvalidSeverity {
                value: s.to_string(),
            }),
        }
    }
}

sql_text_enum!(SeverityLevel);

/// One study subject's conversation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Opaque participant id (e.g. `P001`).
    pub id: String,
    /// The assigned experimental condition.
    pub bot_type: BotType,
    /// When the session was opened.
    pub start_time: DateTime<Utc>,
    /// When the session was closed, if it has been.
    pub end_time: Option<DateTime<Utc>>,
    /// Number of messages recorded for this participant (user and bot).
    pub total_messages: i64,
    /// Whether the full user-message quota was reached before close.
    pub completed: bool,
    /// Whether at least one crisis flag exists for this participant.
    pub crisis_flagged: bool,
    /// Identifier from the recruitment platform, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl Participant {
    /// Check whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }

    /// Length of the session in minutes, once closed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_minutes(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_seconds() as f64 / 60.0)
    }
}

/// A single stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique, monotonically increasing id.
    pub id: i64,
    /// Owning participant.
    pub participant_id: String,
    /// Turn number; bot replies share the number of the user turn they follow.
    pub message_num: u32,
    /// Who wrote the message.
    pub sender: Sender,
    /// Message text.
    pub content: String,
    /// When the message was sent.
    pub timestamp: DateTime<Utc>,
    /// Whether a crisis keyword was detected in this message.
    pub contains_crisis_keyword: bool,
}

/// A crisis keyword detected in a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrisisFlag {
    /// Flag id.
    pub id: i64,
    /// Participant whose message triggered the flag.
    pub participant_id: String,
    /// The triggering message.
    pub message_id: i64,
    /// The configured keyword that matched.
    pub keyword_matched: String,
    /// When the flag was raised.
    pub flagged_at: DateTime<Utc>,
    /// Severity configured for the keyword.
    pub severity_level: SeverityLevel,
}

/// A researcher's review of a crisis flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagReview {
    /// The reviewed flag.
    pub flag_id: i64,
    /// Who reviewed it.
    pub reviewer: String,
    /// When it was reviewed.
    pub reviewed_at: DateTime<Utc>,
    /// Free-form notes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Which collections an export read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportScope {
    /// The participants collection.
    Participants,
    /// The messages collection.
    Messages,
    /// The crisis flags collection.
    CrisisFlags,
    /// Every collection.
    All,
}

impl ExportScope {
    /// The stored name of this scope.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Participants => "participants",
            Self::Messages => "messages",
            Self::CrisisFlags => "crisis_flags",
            Self::All => "all",
        }
    }
}

impl fmt::Display for ExportScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "participants" => Ok(Self::Participants),
            "messages" => Ok(Self::Messages),
            "crisis_flags" | "flags" => Ok(Self::CrisisFlags),
            "all" => Ok(Self::All),
            _ => Err(Error::internal(format!("unknown export scope '{s}'"))),
        }
    }
}

sql_text_enum!(ExportScope);

/// An entry in the append-only export audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportLog {
    /// Entry id.
    pub id: i64,
    /// When the export was recorded.
    pub exported_at: DateTime<Utc>,
    /// Who performed the export.
    pub actor: String,
    /// Which collections were read.
    pub scope: ExportScope,
    /// Output format reported by the exporter (e.g. `csv`).
    pub format: String,
    /// Number of rows written.
    pub row_count: i64,
    /// Number of distinct participants covered.
    pub participant_count: i64,
    /// Where the export was written, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Free-form notes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// BLAKE3 digest of the exported payload, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
    /// BLAKE3 chain hash over the previous entry and this entry.
    pub entry_hash: String,
}
