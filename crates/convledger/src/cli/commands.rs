//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::model::{BotType, ExportScope, Sender};

/// Session commands.
#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Open a session for a new participant
    Open {
        /// Bot type to assign (chosen by the configured strategy if omitted)
        #[arg(short, long, value_enum)]
        bot_type: Option<BotTypeArg>,

        /// Recruitment-platform id to attach
        #[arg(short, long)]
        external_id: Option<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Append a message to a conversation
    Append {
        /// Participant id (e.g. P001)
        participant_id: String,

        /// Who wrote the message
        #[arg(value_enum)]
        sender: SenderArg,

        /// Message text
        content: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Close a participant's session
    Close {
        /// Participant id
        participant_id: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Attach a recruitment-platform id to an existing participant
    Tag {
        /// Participant id
        participant_id: String,

        /// Recruitment-platform id
        external_id: String,
    },

    /// Close sessions with no activity for a while
    Sweep {
        /// Hours of inactivity before a session is closed
        #[arg(long, default_value_t = 2)]
        idle_hours: u32,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show a participant and their conversation
    Show {
        /// Participant id
        participant_id: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "plain")]
        format: OutputFormat,
    },
}

/// Crisis flag commands.
#[derive(Debug, Subcommand)]
pub enum FlagsCommand {
    /// List crisis flags
    List {
        /// Only flags nobody has reviewed
        #[arg(short, long)]
        unreviewed: bool,

        /// Only flags for this participant
        #[arg(short, long)]
        participant: Option<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Mark a flag as reviewed
    Review {
        /// Flag id
        flag_id: i64,

        /// Reviewer name (defaults to the configured audit actor)
        #[arg(short, long)]
        reviewer: Option<String>,

        /// Review notes
        #[arg(short, long)]
        notes: Option<String>,
    },
}

/// Stats command arguments.
#[derive(Debug, Args)]
pub struct StatsCommand {
    /// Break results down by bot type
    #[arg(short, long)]
    pub by_bot_type: bool,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Export audit commands.
#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    /// List export audit entries
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Record an export performed by another tool
    Record(RecordCommand),
}

/// Arguments for recording an external export.
#[derive(Debug, Args)]
pub struct RecordCommand {
    /// Collections that were exported
    #[arg(short, long, value_enum)]
    pub scope: ScopeArg,

    /// Output format (e.g. csv)
    #[arg(short, long)]
    pub format: String,

    /// Number of rows written
    #[arg(long)]
    pub rows: u64,

    /// Number of participants covered
    #[arg(long)]
    pub participants: u64,

    /// Who ran the export (defaults to the configured audit actor)
    #[arg(short, long)]
    pub actor: Option<String>,

    /// Where the export was written
    #[arg(short, long)]
    pub destination: Option<String>,

    /// Free-form notes
    #[arg(short, long)]
    pub notes: Option<String>,

    /// Exported file to fingerprint
    #[arg(long, value_name = "FILE")]
    pub payload: Option<PathBuf>,
}

/// Integrity check arguments.
#[derive(Debug, Args)]
pub struct CheckCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Bot type argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BotTypeArg {
    /// Emotional support condition
    Emotional,
    /// Cognitive reframing condition
    Cognitive,
    /// Motivational condition
    Motivational,
    /// Neutral control condition
    Neutral,
}

impl From<BotTypeArg> for BotType {
    fn from(arg: BotTypeArg) -> Self {
        match arg {
            BotTypeArg::Emotional => Self::Emotional,
            BotTypeArg::Cognitive => Self::Cognitive,
            BotTypeArg::Motivational => Self::Motivational,
            BotTypeArg::Neutral => Self::Neutral,
        }
    }
}

/// Message sender argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SenderArg {
    /// The participant
    User,
    /// The chatbot
    Bot,
}

impl From<SenderArg> for Sender {
    fn from(arg: SenderArg) -> Self {
        match arg {
            SenderArg::User => Self::User,
            SenderArg::Bot => Self::Bot,
        }
    }
}

/// Export scope argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    /// Participants only
    Participants,
    /// Messages only
    Messages,
    /// Crisis flags only
    CrisisFlags,
    /// Everything
    All,
}

impl From<ScopeArg> for ExportScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Participants => Self::Participants,
            ScopeArg::Messages => Self::Messages,
            ScopeArg::CrisisFlags => Self::CrisisFlags,
            ScopeArg::All => Self::All,
        }
    }
}

/// Output format for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Plain,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_type_arg_conversion() {
        assert_eq!(BotType::from(BotTypeArg::Emotional), BotType::Emotional);
        assert_eq!(BotType::from(BotTypeArg::Cognitive), BotType::Cognitive);
        assert_eq!(
            BotType::from(BotTypeArg::Motivational),
            BotType::Motivational
        );
        assert_eq!(BotType::from(BotTypeArg::Neutral), BotType::Neutral);
    }

    #[test]
    fn test_sender_arg_conversion() {
        assert_eq!(Sender::from(SenderArg::User), Sender::User);
        assert_eq!(Sender::from(SenderArg::Bot), Sender::Bot);
    }

    #[test]
    fn test_scope_arg_conversion() {
        assert_eq!(
            ExportScope::from(ScopeArg::CrisisFlags),
            ExportScope::CrisisFlags
        );
        assert_eq!(ExportScope::from(ScopeArg::All), ExportScope::All);
    }

    #[test]
    fn test_output_format_default() {
        assert_eq!(OutputFormat::default(), OutputFormat::Plain);
    }

    #[test]
    fn test_session_command_debug() {
        let cmd = SessionCommand::Close {
            participant_id: "P001".to_string(),
            json: true,
        };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("Close"));
        assert!(debug_str.contains("P001"));
    }
}
