//! `convledger` - A durable conversation ledger for chatbot research studies
//!
//! This library records participant sessions, their messages and the crisis
//! flags raised on them in a `SQLite` database, keeping message counters and
//! crisis bits consistent with the rows they summarize. Data exports are
//! recorded in an append-only, hash-chained audit log.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod assignment;
pub mod cli;
pub mod config;
pub mod crisis;
pub mod error;
pub mod logging;
pub mod model;
pub mod storage;

pub use assignment::{assign_bot_type, AssignmentStrategy};
pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use model::{
    BotType, CrisisFlag, ExportLog, ExportScope, FlagReview, Message, Participant, Sender,
    SeverityLevel,
};
pub use storage::{AppendOutcome, Ledger, LedgerSettings, NewSession, ParticipantFilter};
