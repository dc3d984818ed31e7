//! Tunables for [`ConversationMemory`][crate::ConversationMemory].
//!
//! Deserialisable so the binary can embed it as the `[memory]` table of its
//! config file; every field has a default.

use serde::{Deserialize, Serialize};

/// Placeholder replaced by the possessive form of the user's name.
pub const FIXED_USER_INJECTION: &str = "FIXED_USER_INJECTION";
/// Placeholder replaced by the current local date and time.
pub const DATETIME_INJECTION: &str = "DATETIME_INJECTION";
/// Placeholder replaced by the rolling long-term memory text.
pub const LONG_TERM_MEMORY_INJECTION: &str = "LONG_TERM_MEMORY_INJECTION";

/// Conversation memory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Name the system prompt refers to the user by.
    #[serde(default = "default_username")]
    pub username: String,

    /// System prompt template. May contain the `*_INJECTION` placeholders.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Context window of the model the gathered context is meant for.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Budget for the long-term memory rollup.
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: usize,

    /// Newest batches always offered first when gathering context.
    #[serde(default = "default_minimum_recent_history_length")]
    pub minimum_recent_history_length: usize,

    /// Hits requested from each similarity search.
    #[serde(default = "default_query_n_max")]
    pub query_n_max: usize,

    /// Similarity hits at or beyond this distance are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_cutoff: Option<f32>,

    /// Prefix each stored turn with `"On <weekday>, <date> at <time>: "`.
    #[serde(default = "default_true")]
    pub time_injection: bool,

    /// Prefix assistant turns that name their model with
    /// `"Source AI Model: <model> - "`.
    #[serde(default = "default_true")]
    pub model_injection: bool,

    /// Dimension of the vectors produced by the injected embedder.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
}

fn default_username() -> String {
    "User".to_string()
}
fn default_system_prompt() -> String {
    format!(
        "You are {FIXED_USER_INJECTION} personal assistant. \
         The current date and time is {DATETIME_INJECTION}. \
         What you remember about earlier conversations: {LONG_TERM_MEMORY_INJECTION}"
    )
}
fn default_max_tokens() -> usize {
    4096
}
fn default_summary_max_tokens() -> usize {
    512
}
fn default_minimum_recent_history_length() -> usize {
    2
}
fn default_query_n_max() -> usize {
    3
}
fn default_true() -> bool {
    true
}
fn default_embedding_dim() -> usize {
    1536
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            system_prompt: default_system_prompt(),
            max_tokens: default_max_tokens(),
            summary_max_tokens: default_summary_max_tokens(),
            minimum_recent_history_length: default_minimum_recent_history_length(),
            query_n_max: default_query_n_max(),
            distance_cutoff: None,
            time_injection: true,
            model_injection: true,
            embedding_dim: default_embedding_dim(),
        }
    }
}

impl MemoryConfig {
    /// Budget used by `gather_context` when the caller gives none: 85 % of
    /// `max_tokens`, leaving room for the reply.
    pub fn default_budget(&self) -> usize {
        self.max_tokens * 85 / 100
    }

    /// `"James'"` for names ending in `s`, `"Ada's"` otherwise.
    pub fn fixed_user(&self) -> String {
        if self.username.ends_with('s') {
            format!("{}'", self.username)
        } else {
            format!("{}'s", self.username)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn possessive_follows_trailing_s() {
        let mut cfg = MemoryConfig {
            username: "James".into(),
            ..MemoryConfig::default()
        };
        assert_eq!(cfg.fixed_user(), "James'");
        cfg.username = "Ada".into();
        assert_eq!(cfg.fixed_user(), "Ada's");
    }

    #[test]
    fn default_budget_is_85_percent() {
        let cfg = MemoryConfig {
            max_tokens: 1000,
            ..MemoryConfig::default()
        };
        assert_eq!(cfg.default_budget(), 850);
    }

    #[test]
    fn default_prompt_uses_every_placeholder() {
        let prompt = MemoryConfig::default().system_prompt;
        for placeholder in [FIXED_USER_INJECTION, DATETIME_INJECTION, LONG_TERM_MEMORY_INJECTION] {
            assert!(prompt.contains(placeholder), "{placeholder}");
        }
    }
}
