//! `convledger` - CLI for the conversation ledger
//!
//! This binary provides the command-line interface for recording study
//! sessions, reviewing crisis flags and auditing data exports.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;

use convledger::cli::{
    AuditCommand, CheckCommand, Cli, Command, ConfigCommand, FlagsCommand, OutputFormat,
    RecordCommand, SessionCommand, StatsCommand,
};
use convledger::storage::{ExportOutcome, ExportRequest, NewSession};
use convledger::{init_logging, Config, Ledger};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Validation reports its own errors
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        return handle_validate(file.clone().or_else(|| cli.config.clone()));
    }

    // Load configuration
    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;

    // Execute the command
    match cli.command {
        Command::Session(cmd) => handle_session(&config, cmd),
        Command::Flags(cmd) => handle_flags(&config, cmd),
        Command::Stats(cmd) => handle_stats(&config, &cmd),
        Command::Audit(cmd) => handle_audit(&config, cmd),
        Command::Check(cmd) => handle_check(&config, &cmd),
        Command::Config(cmd) => handle_config(&config, &cmd),
    }
}

fn open_ledger(config: &Config) -> Result<Ledger> {
    Ledger::from_config(config).with_context(|| {
        format!(
            "failed to open ledger at {}",
            config.database_path().display()
        )
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_session(config: &Config, cmd: SessionCommand) -> Result<()> {
    let mut ledger = open_ledger(config)?;

    match cmd {
        SessionCommand::Open {
            bot_type,
            external_id,
            json,
        } => {
            let participant = match bot_type {
                Some(arg) => ledger.open_session_with(NewSession {
                    external_id,
                    ..NewSession::new(arg.into())
                })?,
                None => ledger.open_assigned_session(
                    config.study.assignment,
                    &mut rand::rng(),
                    external_id,
                )?,
            };
            if json {
                print_json(&participant)?;
            } else {
                println!("{} ({})", participant.id, participant.bot_type);
            }
        }
        SessionCommand::Append {
            participant_id,
            sender,
            content,
            json,
        } => {
            let outcome =
                ledger.append_message(&participant_id, sender.into(), &content, Utc::now())?;
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Message {} recorded as turn {}",
                    outcome.message_id, outcome.message_num
                );
                for flag in &outcome.crisis_flags {
                    println!(
                        "  CRISIS FLAG {}: '{}' ({})",
                        flag.id, flag.keyword_matched, flag.severity_level
                    );
                }
            }
        }
        SessionCommand::Close {
            participant_id,
            json,
        } => {
            let participant = ledger.close_session(&participant_id, Utc::now())?;
            if json {
                print_json(&participant)?;
            } else {
                println!(
                    "Closed {} ({} messages, {})",
                    participant.id,
                    participant.total_messages,
                    if participant.completed {
                        "completed"
                    } else {
                        "not completed"
                    }
                );
            }
        }
        SessionCommand::Tag {
            participant_id,
            external_id,
        } => {
            let participant = ledger.set_external_id(&participant_id, &external_id)?;
            println!(
                "{} tagged with {}",
                participant.id,
                participant.external_id.as_deref().unwrap_or_default()
            );
        }
        SessionCommand::Sweep { idle_hours, json } => {
            let idle_for = chrono::Duration::hours(i64::from(idle_hours));
            let closed = ledger.close_stale_sessions(idle_for, Utc::now())?;
            if json {
                print_json(&closed)?;
            } else if closed.is_empty() {
                println!("No stale sessions.");
            } else {
                for participant in &closed {
                    println!(
                        "Closed {} ({} messages, {})",
                        participant.id,
                        participant.total_messages,
                        if participant.completed {
                            "completed"
                        } else {
                            "not completed"
                        }
                    );
                }
            }
        }
        SessionCommand::Show {
            participant_id,
            format,
        } => {
            let Some(participant) = ledger.participant(&participant_id)? else {
                bail!("unknown participant '{participant_id}'");
            };
            let messages = ledger.conversation(&participant_id)?;
            let flags = ledger.crisis_flags_for(&participant_id)?;

            match format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "participant": participant,
                    "messages": messages,
                    "crisis_flags": flags,
                }))?,
                OutputFormat::Plain => {
                    println!("Participant:   {}", participant.id);
                    println!("Bot type:      {}", participant.bot_type);
                    println!("Started:       {}", participant.start_time.to_rfc3339());
                    match participant.end_time {
                        Some(end) => println!("Ended:         {}", end.to_rfc3339()),
                        None => println!("Ended:         (open)"),
                    }
                    println!("Messages:      {}", participant.total_messages);
                    println!("Completed:     {}", participant.completed);
                    println!("Crisis flags:  {}", flags.len());
                    println!();
                    for message in &messages {
                        let marker = if message.contains_crisis_keyword {
                            " [!]"
                        } else {
                            ""
                        };
                        println!(
                            "#{:>2} {:<4} {}{}",
                            message.message_num,
                            message.sender.as_str(),
                            message.content,
                            marker
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

fn handle_flags(config: &Config, cmd: FlagsCommand) -> Result<()> {
    let mut ledger = open_ledger(config)?;

    match cmd {
        FlagsCommand::List {
            unreviewed,
            participant,
            json,
        } => {
            let mut flags = if unreviewed {
                ledger.unreviewed_flags()?
            } else {
                ledger.crisis_flags()?
            };
            if let Some(participant) = participant {
                flags.retain(|flag| flag.participant_id == participant);
            }

            if json {
                print_json(&flags)?;
            } else if flags.is_empty() {
                println!("No crisis flags.");
            } else {
                for flag in &flags {
                    println!(
                        "{:>4}  {}  {:<6}  {:<6}  msg {:<6} '{}'",
                        flag.id,
                        flag.flagged_at.to_rfc3339(),
                        flag.participant_id,
                        flag.severity_level.as_str(),
                        flag.message_id,
                        flag.keyword_matched
                    );
                }
            }
        }
        FlagsCommand::Review {
            flag_id,
            reviewer,
            notes,
        } => {
            let reviewer = reviewer.unwrap_or_else(|| config.audit.default_actor.clone());
            let review = ledger.review_flag(flag_id, &reviewer, notes.as_deref())?;
            println!(
                "Flag {} reviewed by {} at {}",
                review.flag_id,
                review.reviewer,
                review.reviewed_at.to_rfc3339()
            );
        }
    }
    Ok(())
}

fn handle_stats(config: &Config, cmd: &StatsCommand) -> Result<()> {
    let ledger = open_ledger(config)?;

    if cmd.by_bot_type {
        let summaries = ledger.bot_type_summaries()?;
        if cmd.json {
            return print_json(&summaries);
        }
        println!(
            "{:<13} {:>6} {:>11} {:>8} {:>12}",
            "bot type", "count", "completion", "crisis", "avg length"
        );
        for s in &summaries {
            println!(
                "{:<13} {:>6} {:>10.1}% {:>7.1}% {:>12}",
                s.bot_type.as_str(),
                s.participants,
                s.completion_rate * 100.0,
                s.crisis_rate * 100.0,
                s.avg_user_message_length
                    .map_or_else(|| "-".to_string(), |avg| format!("{avg:.1}"))
            );
        }
        return Ok(());
    }

    let stats = ledger.study_stats()?;
    if cmd.json {
        return print_json(&stats);
    }
    println!("Study statistics");
    println!("----------------");
    println!("Participants:     {}", stats.total_participants);
    println!("  active:         {}", stats.active_participants);
    println!("  completed:      {}", stats.completed_participants);
    println!("  crisis flagged: {}", stats.flagged_participants);
    println!("Messages:         {}", stats.total_messages);
    println!("  user:           {}", stats.user_messages);
    println!("  bot:            {}", stats.bot_messages);
    println!("Crisis flags:     {}", stats.total_crisis_flags);
    println!("  unreviewed:     {}", stats.unreviewed_flags);
    println!("Exports:          {}", stats.export_count);
    println!();
    println!("Bot type distribution:");
    for (bot_type, count) in &stats.bot_type_distribution {
        println!("  {:<13} {}", bot_type.as_str(), count);
    }
    Ok(())
}

fn handle_audit(config: &Config, cmd: AuditCommand) -> Result<()> {
    let mut ledger = open_ledger(config)?;

    match cmd {
        AuditCommand::List { json } => {
            let logs = ledger.export_logs()?;
            if json {
                print_json(&logs)?;
            } else if logs.is_empty() {
                println!("No exports recorded.");
            } else {
                for log in &logs {
                    println!(
                        "{:>4}  {}  {:<12} {:<12} {:<5} {:>6} rows  {:>4} participants{}",
                        log.id,
                        log.exported_at.to_rfc3339(),
                        log.actor,
                        log.scope.as_str(),
                        log.format,
                        log.row_count,
                        log.participant_count,
                        log.destination
                            .as_deref()
                            .map(|d| format!("  -> {d}"))
                            .unwrap_or_default()
                    );
                }
            }
        }
        AuditCommand::Record(record) => {
            let (request, outcome) = build_record(config, record)?;
            let log = ledger.record_export(&request, &outcome)?;
            let short_hash = log.entry_hash.get(..16).unwrap_or(&log.entry_hash);
            println!("Recorded export {} ({short_hash})", log.id);
        }
    }
    Ok(())
}

fn build_record(config: &Config, record: RecordCommand) -> Result<(ExportRequest, ExportOutcome)> {
    let actor = record
        .actor
        .unwrap_or_else(|| config.audit.default_actor.clone());
    let mut request = ExportRequest::new(actor, record.scope.into(), record.format);
    if let Some(destination) = record.destination {
        request = request.with_destination(destination);
    }
    if let Some(notes) = record.notes {
        request = request.with_notes(notes);
    }

    let mut outcome = ExportOutcome::new(record.rows, record.participants);
    if let Some(path) = record.payload {
        let payload = std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        outcome = outcome.with_payload(&payload);
    }
    Ok((request, outcome))
}

fn handle_check(config: &Config, cmd: &CheckCommand) -> Result<()> {
    let ledger = open_ledger(config)?;
    let report = ledger.verify_integrity()?;

    if cmd.json {
        print_json(&report)?;
    } else if report.is_consistent() {
        println!("Ledger is consistent.");
    } else {
        for violation in &report.violations {
            println!("{violation}");
        }
    }

    if !report.is_consistent() {
        bail!("{} integrity violation(s) found", report.violations.len());
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: &ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if *json {
                print_json(config)?;
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Busy timeout (ms):  {}", config.storage.busy_timeout_ms);
                println!();
                println!("[Study]");
                println!("  Message quota:      {}", config.study.message_quota);
                println!("  Id prefix:          {}", config.study.participant_id_prefix);
                println!("  Assignment:         {}", config.study.assignment);
                println!();
                println!("[Safety]");
                println!("  Detection enabled:  {}", config.safety.detection_enabled);
                println!("  Match mode:         {:?}", config.safety.match_mode);
                println!("  Scan bot messages:  {}", config.safety.scan_bot_messages);
                println!("  Keywords:           {}", config.safety.keywords.len());
                println!();
                println!("[Audit]");
                println!("  Default actor:      {}", config.audit.default_actor);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => return handle_validate(file.clone()),
    }
    Ok(())
}

fn handle_validate(file: Option<std::path::PathBuf>) -> Result<()> {
    let path = file.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => {
            println!("Configuration is valid.");
            Ok(())
        }
        Err(e) => bail!("configuration error: {e}"),
    }
}
