//! `mnemos-memory` – conversation memory on top of the embedded store.
//!
//! Keeps every chat turn, condenses finished batches into summaries, rolls
//! the summaries into one long-term memory blob, and assembles the most
//! useful slice of all of it into a token budget.
//!
//! # Modules
//!
//! - [`conversation`] – [`ConversationMemory`]: storing turns, summarising
//!   pending batches, batch navigation and the system prompt.
//! - [`context`] – [`ConversationMemory::gather_context`] and its
//!   [`ContextReport`].
//! - [`long_term`] – [`LongTermMemory`]: the rolling blob and its on-disk
//!   form.
//! - [`config`] – [`MemoryConfig`].

pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod long_term;

pub use config::MemoryConfig;
pub use context::{ContextReport, GatheredContext, LayerReport};
pub use conversation::{
    Capabilities, ConversationMemory, HistoryEntry, ReduceReport, Summary, Turn,
};
pub use error::{MemoryError, MemoryResult};
pub use long_term::LongTermMemory;
