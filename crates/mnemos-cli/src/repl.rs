//! REPL – the `mnemos` operator shell.
//!
//! Supported slash-commands:
//!   /help                     – show this list
//!   /stats                    – record counts and pending work
//!   /history [n]              – newest `n` turns (default 10)
//!   /summaries [n]            – newest `n` batch summaries (default 5)
//!   /memory                   – the long-term memory blob
//!   /speakers                 – known names and unknown labels
//!   /promote <label> <name>   – name an unknown speaker
//!   /forget <name>            – remove a known speaker
//!   /quit | /exit             – leave the shell

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mnemos_memory::ConversationMemory;
use mnemos_speaker::SpeakerIdentity;

/// Stores the shell operates on.
pub struct Session {
    pub memory: ConversationMemory,
    pub speakers: SpeakerIdentity,
}

/// A parsed input line.
#[derive(Debug, PartialEq)]
pub enum Command {
    Help,
    Stats,
    History(usize),
    Summaries(usize),
    Memory,
    Speakers,
    Promote { label: String, name: String },
    Forget(String),
    Quit,
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Command {
        let line = line.trim();
        let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        match head {
            "/help" => Command::Help,
            "/stats" => Command::Stats,
            "/history" => count_arg(rest, 10).map_or_else(Command::Invalid, Command::History),
            "/summaries" => count_arg(rest, 5).map_or_else(Command::Invalid, Command::Summaries),
            "/memory" => Command::Memory,
            "/speakers" => Command::Speakers,
            "/promote" => match split_promote_args(rest) {
                Some((label, name)) => Command::Promote { label, name },
                None => Command::Invalid("usage: /promote <label> <name>".into()),
            },
            "/forget" if !rest.is_empty() => Command::Forget(rest.to_string()),
            "/forget" => Command::Invalid("usage: /forget <name>".into()),
            "/quit" | "/exit" => Command::Quit,
            other => Command::Invalid(format!("Unknown command: '{other}'")),
        }
    }
}

fn count_arg(raw: &str, default: usize) -> Result<usize, String> {
    if raw.is_empty() {
        return Ok(default);
    }
    raw.parse::<usize>()
        .map_err(|_| format!("expected a number, got '{raw}'"))
}

/// `"Unknown Speaker 3 Ada Lovelace"` or `"3 Ada Lovelace"` → label and name.
fn split_promote_args(rest: &str) -> Option<(String, String)> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    let label_len = if words.len() >= 2
        && words[0].eq_ignore_ascii_case("unknown")
        && words[1].eq_ignore_ascii_case("speaker")
    {
        3
    } else {
        1
    };
    if words.len() <= label_len {
        return None;
    }
    Some((words[..label_len].join(" "), words[label_len..].join(" ")))
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(session: &Session, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "mnemos>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Command::Help => cmd_help(),
            Command::Stats => cmd_stats(session),
            Command::History(n) => cmd_history(session, n),
            Command::Summaries(n) => cmd_summaries(session, n),
            Command::Memory => cmd_memory(session),
            Command::Speakers => cmd_speakers(session),
            Command::Promote { label, name } => cmd_promote(session, &label, &name),
            Command::Forget(name) => cmd_forget(session, &name),
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Command::Invalid(msg) => {
                println!(
                    "{} Type {} for available commands.",
                    msg.red(),
                    "/help".bold()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "mnemos Commands".bold().underline());
    println!("  {}                 – record counts and pending work", "/stats".bold().cyan());
    println!("  {}           – newest turns", "/history [n]".bold().cyan());
    println!("  {}         – newest batch summaries", "/summaries [n]".bold().cyan());
    println!("  {}                – long-term memory", "/memory".bold().cyan());
    println!("  {}              – known and unknown speakers", "/speakers".bold().cyan());
    println!("  {} – name an unknown speaker", "/promote <label> <name>".bold().cyan());
    println!("  {}         – remove a known speaker", "/forget <name>".bold().cyan());
    println!("  {}           – exit the shell", "/quit  /exit".bold().cyan());
    println!();
}

fn report<T, E: std::fmt::Display>(what: &str, result: Result<T, E>) -> Option<T> {
    result
        .map_err(|e| println!("{} {}: {}", "✗".red(), what, e))
        .ok()
}

fn cmd_stats(session: &Session) {
    let memory = &session.memory;
    println!("{}", "Stores".bold().underline());
    if let Some(n) = report("history", memory.history_count()) {
        println!("  History turns    : {}", n.to_string().yellow());
    }
    if let Some(n) = report("summaries", memory.summary_count()) {
        println!("  Summaries        : {}", n.to_string().yellow());
    }
    if let Some(pending) = report("pending batches", memory.pending_batches()) {
        let count = pending.len().to_string();
        let shown = if pending.is_empty() { count.green() } else { count.yellow() };
        println!("  Pending batches  : {}", shown);
    }
    if let Some(ltm) = report("long-term memory", memory.long_term_memory()) {
        println!("  Long-term tokens : {}", ltm.token_count.to_string().yellow());
    }
    if let Some(names) = report("known speakers", session.speakers.known_names()) {
        println!("  Known speakers   : {}", names.len().to_string().yellow());
    }
    if let Some(labels) = report("unknown speakers", session.speakers.unknown_labels()) {
        println!("  Unknown speakers : {}", labels.len().to_string().yellow());
    }
    println!("  Root             : {}", memory.root().display().to_string().dimmed());
}

fn cmd_history(session: &Session, n: usize) {
    let Some(entries) = report("history", session.memory.history_before(None, n)) else {
        return;
    };
    if entries.is_empty() {
        println!("  {}", "No history yet.".dimmed());
        return;
    }
    for entry in entries.iter().rev() {
        let who = entry.name.as_deref().unwrap_or(entry.role.as_str());
        println!(
            "  {} {} {} {}",
            format!("#{}", entry.id).dimmed(),
            format!("[batch {}]", entry.batch_id).dimmed(),
            format!("{who}:").bold(),
            entry.content
        );
    }
}

fn cmd_summaries(session: &Session, n: usize) {
    let Some(summaries) = report("summaries", session.memory.summaries_before(None, n)) else {
        return;
    };
    if summaries.is_empty() {
        println!("  {}", "No summaries yet.".dimmed());
        return;
    }
    for summary in summaries.iter().rev() {
        println!(
            "  {} {} {}",
            format!("#{}", summary.id).dimmed(),
            format!("[batch {}, {} tok]", summary.batch_id, summary.token_count).dimmed(),
            summary.content
        );
    }
}

fn cmd_memory(session: &Session) {
    let Some(ltm) = report("long-term memory", session.memory.long_term_memory()) else {
        return;
    };
    if ltm.is_empty() {
        println!("  {}", "Long-term memory is empty.".dimmed());
        return;
    }
    println!("{}", "Long-term memory".bold().underline());
    println!("  {}", ltm.content);
    let updated = ltm
        .updated_at
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "  {}",
        format!(
            "through summary {} · {} tokens · updated {}",
            ltm.through_summary, ltm.token_count, updated
        )
        .dimmed()
    );
}

fn cmd_speakers(session: &Session) {
    println!("{}", "Speakers".bold().underline());
    if let Some(names) = report("known speakers", session.speakers.known_names()) {
        if names.is_empty() {
            println!("  Known   : {}", "none".dimmed());
        } else {
            println!("  Known   : {}", names.join(", ").green());
        }
    }
    if let Some(labels) = report("unknown speakers", session.speakers.unknown_labels()) {
        if labels.is_empty() {
            println!("  Unknown : {}", "none".dimmed());
        } else {
            let labels: Vec<String> = labels.iter().map(ToString::to_string).collect();
            println!("  Unknown : {}", labels.join(", ").yellow());
        }
    }
}

fn cmd_promote(session: &Session, label: &str, name: &str) {
    if let Some(known) = report("promote", session.speakers.promote(label, name)) {
        println!("{} {} is now {}", "✓".green(), label.yellow(), known.to_string().bold());
    }
}

fn cmd_forget(session: &Session, name: &str) {
    if let Some(n) = report("forget", session.speakers.forget(name)) {
        println!("{} Removed {} voice(s) for {}", "✓".green(), n, name.bold());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_counts_with_defaults() {
        assert_eq!(Command::parse("/history"), Command::History(10));
        assert_eq!(Command::parse("/history 3"), Command::History(3));
        assert_eq!(Command::parse("  /summaries 2 "), Command::Summaries(2));
        assert!(matches!(Command::parse("/history many"), Command::Invalid(_)));
    }

    #[test]
    fn promote_accepts_both_label_forms() {
        assert_eq!(
            Command::parse("/promote Unknown Speaker 3 Ada Lovelace"),
            Command::Promote {
                label: "Unknown Speaker 3".into(),
                name: "Ada Lovelace".into()
            }
        );
        assert_eq!(
            Command::parse("/promote 3 Ada"),
            Command::Promote {
                label: "3".into(),
                name: "Ada".into()
            }
        );
        assert!(matches!(Command::parse("/promote 3"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/promote unknown speaker 3"), Command::Invalid(_)));
    }

    #[test]
    fn forget_needs_a_name() {
        assert_eq!(Command::parse("/forget Grace Hopper"), Command::Forget("Grace Hopper".into()));
        assert!(matches!(Command::parse("/forget"), Command::Invalid(_)));
    }

    #[test]
    fn unknown_commands_are_invalid() {
        assert!(matches!(Command::parse("/start"), Command::Invalid(_)));
        assert_eq!(Command::parse("/exit"), Command::Quit);
    }
}
