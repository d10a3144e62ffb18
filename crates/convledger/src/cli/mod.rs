//! Command-line interface for convledger.
//!
//! This module provides the CLI structure for the `convledger` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    AuditCommand, BotTypeArg, CheckCommand, ConfigCommand, FlagsCommand, OutputFormat,
    RecordCommand, ScopeArg, SenderArg, SessionCommand, StatsCommand,
};

/// convledger - Conversation ledger for chatbot research studies
///
/// Records participant sessions, their messages and crisis-keyword flags in a
/// durable `SQLite` ledger, and keeps an append-only audit of data exports.
#[derive(Debug, Parser)]
#[command(name = "convledger")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Open, append to, close or show participant sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// List and review crisis flags
    #[command(subcommand)]
    Flags(FlagsCommand),

    /// Show study statistics
    Stats(StatsCommand),

    /// List or record data exports
    #[command(subcommand)]
    Audit(AuditCommand),

    /// Verify ledger consistency
    Check(CheckCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        crate::logging::Verbosity::from_flags(self.verbose, self.quiet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn cli_with(verbose: u8, quiet: bool) -> Cli {
        Cli {
            config: None,
            verbose,
            quiet,
            command: Command::Check(CheckCommand { json: false }),
        }
    }

    #[test]
    fn test_cli_name() {
        let cli = Cli::command();
        assert_eq!(cli.get_name(), "convledger");
    }

    #[test]
    fn test_verbosity_levels() {
        use crate::logging::Verbosity;

        assert_eq!(cli_with(0, true).verbosity(), Verbosity::Quiet);
        assert_eq!(cli_with(3, true).verbosity(), Verbosity::Quiet);
        assert_eq!(cli_with(0, false).verbosity(), Verbosity::Normal);
        assert_eq!(cli_with(1, false).verbosity(), Verbosity::Verbose);
        assert_eq!(cli_with(2, false).verbosity(), Verbosity::Trace);
    }

    #[test]
    fn test_cli_verify() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_session_open() {
        let args = vec!["convledger", "session", "open", "-b", "neutral", "-e", "abc"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(
            cli.command,
            Command::Session(SessionCommand::Open {
                bot_type: Some(BotTypeArg::Neutral),
                external_id: Some(_),
                json: false,
            })
        ));
    }

    #[test]
    fn test_parse_session_open_rejects_unknown_bot_type() {
        let args = vec!["convledger", "session", "open", "-b", "sarcastic"];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_parse_session_append() {
        let args = vec!["convledger", "session", "append", "P001", "user", "I feel ok"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Session(SessionCommand::Append {
                participant_id,
                sender,
                content,
                ..
            }) => {
                assert_eq!(participant_id, "P001");
                assert_eq!(sender, SenderArg::User);
                assert_eq!(content, "I feel ok");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_session_sweep_defaults_to_two_hours() {
        let args = vec!["convledger", "session", "sweep"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(
            cli.command,
            Command::Session(SessionCommand::Sweep {
                idle_hours: 2,
                json: false
            })
        ));
    }

    #[test]
    fn test_parse_session_tag() {
        let args = vec!["convledger", "session", "tag", "P004", "5f2a9c"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Session(SessionCommand::Tag {
                participant_id,
                external_id,
            }) => {
                assert_eq!(participant_id, "P004");
                assert_eq!(external_id, "5f2a9c");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_flags_review() {
        let args = vec!["convledger", "flags", "review", "3", "-r", "dr-smith"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(
            cli.command,
            Command::Flags(FlagsCommand::Review { flag_id: 3, .. })
        ));
    }

    #[test]
    fn test_parse_audit_record() {
        let args = vec![
            "convledger",
            "audit",
            "record",
            "--scope",
            "crisis-flags",
            "--format",
            "csv",
            "--rows",
            "12",
            "--participants",
            "4",
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Audit(AuditCommand::Record(record)) => {
                assert_eq!(record.scope, ScopeArg::CrisisFlags);
                assert_eq!(record.rows, 12);
                assert_eq!(record.participants, 4);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_stats() {
        let args = vec!["convledger", "stats", "--by-bot-type", "--json"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(
            cli.command,
            Command::Stats(StatsCommand {
                by_bot_type: true,
                json: true
            })
        ));
    }

    #[test]
    fn test_parse_with_config() {
        let args = vec!["convledger", "-c", "/custom/config.toml", "check"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/custom/config.toml")));
    }

    #[test]
    fn test_parse_with_verbose() {
        let args = vec!["convledger", "-v", "check"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.verbose, 1);
    }

    #[test]
    fn test_parse_with_quiet() {
        let args = vec!["convledger", "-q", "check"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.quiet);
    }
}
