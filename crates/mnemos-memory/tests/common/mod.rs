//! Deterministic stand-ins for the language-model capabilities.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use mnemos_memory::{Capabilities, ConversationMemory, MemoryConfig, Turn};
use mnemos_types::{CapabilityError, ChatMessage, Embedder, Summarizer, WhitespaceTokenizer};

pub const DIM: usize = 16;

/// Summarises to `"summary of <n> messages"`; can be switched to fail.
#[derive(Default)]
pub struct FakeSummarizer {
    pub calls: AtomicUsize,
    pub failing: AtomicBool,
}

impl FakeSummarizer {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Summarizer for FakeSummarizer {
    fn summarize(&self, messages: &[ChatMessage]) -> Result<ChatMessage, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CapabilityError::Unavailable {
                capability: "summarizer",
                reason: "offline".into(),
            });
        }
        Ok(ChatMessage::assistant(format!("summary of {} messages", messages.len())))
    }
}

/// Bag-of-words hashed into `DIM` buckets.
pub struct BagEmbedder;

impl Embedder for BagEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let mut v = vec![0.0f32; DIM];
        for word in text.split_whitespace() {
            let h = word
                .bytes()
                .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
            v[h % DIM] += 1.0;
        }
        if v.iter().all(|x| *x == 0.0) {
            v[0] = 1.0;
        }
        Ok(v)
    }
}

pub fn config() -> MemoryConfig {
    MemoryConfig {
        system_prompt: "Be brief.".into(),
        time_injection: false,
        embedding_dim: DIM,
        ..MemoryConfig::default()
    }
}

pub fn open(
    dir: &Path,
    config: MemoryConfig,
    summarizer: Arc<FakeSummarizer>,
    embedder: bool,
) -> ConversationMemory {
    let mut caps = Capabilities::new(Arc::new(WhitespaceTokenizer), summarizer);
    if embedder {
        caps = caps.with_embedder(Arc::new(BagEmbedder));
    }
    ConversationMemory::open(dir, config, caps).unwrap()
}

/// `n` distinct words tagged with `tag`.
pub fn words(tag: &str, n: usize) -> String {
    (0..n).map(|i| format!("{tag}{i}")).collect::<Vec<_>>().join(" ")
}

/// A user/assistant pair of `tokens`-token turns.
pub fn exchange(tag: &str, tokens: usize) -> Vec<Turn> {
    vec![
        Turn::user(words(&format!("{tag}q"), tokens)),
        Turn::assistant(words(&format!("{tag}a"), tokens)),
    ]
}
