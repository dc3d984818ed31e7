//! `mnemos` – operator shell for the conversation and speaker stores.
//!
//! The binary:
//!
//! 1. Loads `~/.mnemos/config.toml`, writing defaults on first run.
//! 2. Opens the conversation memory and the speaker stores under `data_dir`.
//! 3. Drops the operator into a REPL for inspecting history, summaries, the
//!    long-term memory and speakers (`/help` lists the commands).
//! 4. Exits cleanly on Ctrl-C.
//!
//! No language model is wired in, so pending batches stay pending until an
//! application with a summarizer opens the same store.

mod config;
mod repl;
mod telemetry;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use mnemos_memory::{Capabilities, ConversationMemory};
use mnemos_speaker::SpeakerIdentity;
use mnemos_types::{CapabilityError, ChatMessage, Summarizer, WhitespaceTokenizer};

/// Summarizer for a shell with no model attached.
struct OfflineSummarizer;

impl Summarizer for OfflineSummarizer {
    fn summarize(&self, _messages: &[ChatMessage]) -> Result<ChatMessage, CapabilityError> {
        Err(CapabilityError::Unavailable {
            capability: "summarizer",
            reason: "no language model is configured for the mnemos shell".to_string(),
        })
    }
}

fn main() {
    let _telemetry = telemetry::init_tracing("mnemos");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – closing stores …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  Wrote default config to {}",
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Config error".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    // ── Stores ────────────────────────────────────────────────────────────
    let caps = Capabilities::new(Arc::new(WhitespaceTokenizer), Arc::new(OfflineSummarizer));
    let memory = match ConversationMemory::open(cfg.conversation_root(), cfg.memory.clone(), caps) {
        Ok(memory) => memory,
        Err(e) => {
            eprintln!("{}: {}", "Failed to open conversation memory".red(), e);
            std::process::exit(1);
        }
    };
    let speakers = match SpeakerIdentity::open(cfg.speaker_root(), &cfg.speaker_config()) {
        Ok(speakers) => speakers,
        Err(e) => {
            eprintln!("{}: {}", "Failed to open speaker stores".red(), e);
            std::process::exit(1);
        }
    };
    println!(
        "  Data directory {}",
        cfg.data_dir.display().to_string().dimmed()
    );
    println!(
        "\n  Type {} to see available commands.\n",
        "/help".bold().cyan()
    );

    repl::run(&repl::Session { memory, speakers }, shutdown);
}

fn print_banner() {
    println!();
    println!("{}", "╔══════════════════════════════════╗".cyan());
    println!("{}", "║   mnemos  ·  conversation store  ║".cyan().bold());
    println!("{}", "╚══════════════════════════════════╝".cyan());
    println!();
}
