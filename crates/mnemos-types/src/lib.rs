//! `mnemos-types` – shared vocabulary for the mnemos stores.
//!
//! Every other crate in the workspace speaks in these types: the
//! [`MonotonicId`] handed out by the ledger, the [`ChatMessage`] shape the
//! conversation layer exchanges with language-model collaborators, the
//! [`Scalar`] attribute values stored next to each record, and the capability
//! traits ([`Tokenizer`], [`Embedder`], [`Summarizer`], [`Completer`]) that the
//! surrounding application injects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Identifier handed out by the sequential ledger.
///
/// Strictly increasing within a scope and never reused, even after the record
/// that carried it has been deleted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MonotonicId(pub u64);

impl MonotonicId {
    /// The value a ledger reports before it has allocated anything.
    pub const ZERO: MonotonicId = MonotonicId(0);

    pub fn get(self) -> u64 {
        self.0
    }

    /// The identifier that follows `self`.
    pub fn next(self) -> MonotonicId {
        MonotonicId(self.0 + 1)
    }
}

impl fmt::Display for MonotonicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MonotonicId {
    fn from(value: u64) -> Self {
        MonotonicId(value)
    }
}

/// The role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Speaker attribution, when the message came from a recognised voice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A scalar attribute value stored alongside a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

/// Attribute map attached to every stored record. Ordered so that the JSON
/// encoding is stable.
pub type Attributes = BTreeMap<String, Scalar>;

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// Failure reported by an injected capability (tokenizer, embedder,
/// summarizer, completer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("{capability} is unavailable: {reason}")]
    Unavailable {
        capability: &'static str,
        reason: String,
    },
    #[error("{capability} timed out")]
    Timeout { capability: &'static str },
    #[error("{capability} returned an unusable response: {reason}")]
    BadResponse {
        capability: &'static str,
        reason: String,
    },
}

/// Counts tokens for budget accounting.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Turns text into a dense embedding vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;
}

/// Condenses a list of messages into a single message.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, messages: &[ChatMessage]) -> Result<ChatMessage, CapabilityError>;
}

/// Produces a reply to a conversation. Consumed by the application built on
/// top of the stores, never by the stores themselves.
pub trait Completer: Send + Sync {
    fn complete(&self, messages: &[ChatMessage]) -> Result<ChatMessage, CapabilityError>;
}

/// Whitespace tokenizer: one token per whitespace-separated word.
///
/// Good enough for tests and for deployments without a model-specific
/// tokenizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}
