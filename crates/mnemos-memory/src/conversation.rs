//! Conversation Memory – chat history, batch summaries and the long-term
//! rollup, each persisted in its own embedded store.
//!
//! # Layout
//!
//! | path                       | contents                                     |
//! |----------------------------|----------------------------------------------|
//! | `history/`                 | one record per turn, ledger scope `chat`     |
//! | `summaries/`               | one record per summarised batch, scope `summary` |
//! | `long_term_memory.json`    | [`LongTermMemory`]                           |
//!
//! A *batch* is the set of turns stored by one [`ConversationMemory::add_context`]
//! call; its id is the id of its first turn. A batch is *pending* while no
//! summary names it, so pending work is always derived from what is on disk
//! and a crashed or failed reduction is simply retried.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone, Utc};
use mnemos_store::{EmbeddedStore, NewEntry, Record, StoreConfig, WriteGuard};
use mnemos_types::{ChatMessage, Embedder, MonotonicId, Role, Summarizer, Tokenizer};
use tracing::{debug, info, warn};

use crate::config::{
    DATETIME_INJECTION, FIXED_USER_INJECTION, LONG_TERM_MEMORY_INJECTION, MemoryConfig,
};
use crate::error::{MemoryError, MemoryResult};
use crate::long_term::LongTermMemory;

pub const HISTORY_DIR: &str = "history";
pub const SUMMARIES_DIR: &str = "summaries";

const HISTORY_SCOPE: &str = "chat";
const SUMMARY_SCOPE: &str = "summary";

/// Upper bound for "newest first" lookups; SQLite integers are signed.
const NEWEST: MonotonicId = MonotonicId(i64::MAX as u64);

// Attribute keys.
const ROLE: &str = "role";
const TOKENS: &str = "token_count";
const TIMESTAMP: &str = "timestamp";
const MODEL: &str = "model";
const NAME: &str = "name";
const BATCH: &str = "batch_id";
const SOURCES: &str = "source_ids";

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// Collaborators injected by the application.
#[derive(Clone)]
pub struct Capabilities {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub summarizer: Arc<dyn Summarizer>,
    /// Without an embedder nothing is vector-indexed and similarity lookups
    /// fall back to substring matching.
    pub embedder: Option<Arc<dyn Embedder>>,
}

impl Capabilities {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            tokenizer,
            summarizer,
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entities
// ─────────────────────────────────────────────────────────────────────────────

/// One turn handed to [`ConversationMemory::add_context`].
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Speaker name, when the turn came from an identified voice.
    pub name: Option<String>,
    /// Model that produced an assistant turn.
    pub model: Option<String>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            model: None,
        }
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

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

impl From<ChatMessage> for Turn {
    fn from(message: ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content,
            name: message.name,
            model: None,
        }
    }
}

/// A stored turn.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: MonotonicId,
    pub batch_id: MonotonicId,
    pub role: Role,
    /// Content as stored, prefixes included.
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    pub model: Option<String>,
    pub name: Option<String>,
}

impl HistoryEntry {
    pub(crate) fn from_record(record: Record) -> MemoryResult<Self> {
        let role = record
            .attr_str(ROLE)
            .and_then(Role::parse)
            .ok_or_else(|| MemoryError::malformed(format!("history record {} has no role", record.id)))?;
        Ok(Self {
            id: record.id,
            batch_id: record.group_id,
            role,
            timestamp: timestamp_of(&record),
            token_count: token_count_of(&record)?,
            model: record.attr_str(MODEL).map(str::to_string),
            name: record.attr_str(NAME).map(str::to_string),
            content: record.payload,
        })
    }

    pub fn to_message(&self) -> ChatMessage {
        let message = ChatMessage::new(self.role, self.content.clone());
        match &self.name {
            Some(name) => message.with_name(name.clone()),
            None => message,
        }
    }
}

/// A stored batch summary.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub id: MonotonicId,
    /// The history batch this summary condenses.
    pub batch_id: MonotonicId,
    pub source_ids: Vec<MonotonicId>,
    pub content: String,
    pub token_count: usize,
    /// Timestamp of the summarised batch.
    pub timestamp: DateTime<Utc>,
}

impl Summary {
    pub(crate) fn from_record(record: Record) -> MemoryResult<Self> {
        let batch_id = batch_of(&record)
            .ok_or_else(|| MemoryError::malformed(format!("summary {} names no batch", record.id)))?;
        let source_ids = record
            .attr_str(SOURCES)
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.trim()
                    .parse::<u64>()
                    .map(MonotonicId)
                    .map_err(|_| MemoryError::malformed(format!("summary {} source id {s:?}", record.id)))
            })
            .collect::<MemoryResult<Vec<_>>>()?;
        Ok(Self {
            id: record.id,
            batch_id,
            source_ids,
            timestamp: timestamp_of(&record),
            token_count: token_count_of(&record)?,
            content: record.payload,
        })
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::assistant(self.content.clone())
    }

    /// Every source turn is in `included`.
    pub(crate) fn covered_by(&self, included: impl Fn(&MonotonicId) -> bool) -> bool {
        !self.source_ids.is_empty() && self.source_ids.iter().all(included)
    }
}

fn timestamp_of(record: &Record) -> DateTime<Utc> {
    record
        .attr_str(TIMESTAMP)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(record.created_at)
}

fn token_count_of(record: &Record) -> MemoryResult<usize> {
    record
        .attr_i64(TOKENS)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| MemoryError::malformed(format!("record {} has no token count", record.id)))
}

fn batch_of(record: &Record) -> Option<MonotonicId> {
    record
        .attr_i64(BATCH)
        .and_then(|n| u64::try_from(n).ok())
        .map(MonotonicId)
}

/// `"On Monday, May 6, 2024 at 3:04 PM: "`.
pub fn time_prefix<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("On {}: ", at.format("%A, %B %-d, %Y at %-I:%M %p"))
}

/// Fill the placeholders of a system prompt template.
pub fn render_system<Tz: TimeZone>(
    template: &str,
    fixed_user: &str,
    long_term: &str,
    now: &DateTime<Tz>,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    template
        .replace(FIXED_USER_INJECTION, fixed_user)
        .replace(DATETIME_INJECTION, &now.format("%A, %B %d, %Y at %I:%M %p").to_string())
        .replace(LONG_TERM_MEMORY_INJECTION, long_term)
}

// ─────────────────────────────────────────────────────────────────────────────
// ConversationMemory
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one [`ConversationMemory::reduce_context`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReduceReport {
    /// Batches summarised by this call.
    pub batches: Vec<MonotonicId>,
    /// Ids of the summaries written for them.
    pub summaries: Vec<MonotonicId>,
    pub long_term_updated: bool,
}

impl ReduceReport {
    pub fn is_noop(&self) -> bool {
        self.batches.is_empty() && !self.long_term_updated
    }
}

pub struct ConversationMemory {
    root: PathBuf,
    config: MemoryConfig,
    caps: Capabilities,
    pub(crate) history: EmbeddedStore,
    pub(crate) summaries: EmbeddedStore,
}

impl ConversationMemory {
    /// Open both stores under `root`. Batches left pending by an earlier run
    /// are summarised straight away; a failure there is logged and the
    /// batches stay pending.
    pub fn open(
        root: impl AsRef<Path>,
        config: MemoryConfig,
        caps: Capabilities,
    ) -> MemoryResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let dim = config.embedding_dim;
        let history =
            EmbeddedStore::open(StoreConfig::new(root.join(HISTORY_DIR), HISTORY_SCOPE, dim))?;
        let summaries =
            EmbeddedStore::open(StoreConfig::new(root.join(SUMMARIES_DIR), SUMMARY_SCOPE, dim))?;

        let memory = Self {
            root,
            config,
            caps,
            history,
            summaries,
        };

        if memory.needs_reduce()? {
            info!(root = %memory.root.display(), "unsummarised history found at open");
            if let Err(e) = memory.reduce_context() {
                warn!(error = %e, "reduce at open failed; batches stay pending");
            }
        }
        Ok(memory)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub(crate) fn count_tokens(&self, text: &str) -> usize {
        self.caps.tokenizer.count_tokens(text)
    }

    pub(crate) fn embedder(&self) -> Option<&dyn Embedder> {
        self.caps.embedder.as_deref()
    }

    fn embed(&self, text: &str) -> MemoryResult<Option<Vec<f32>>> {
        match self.embedder() {
            Some(embedder) => Ok(Some(embedder.embed(text)?)),
            None => Ok(None),
        }
    }

    // ── writing ──────────────────────────────────────────────────────────────

    /// Store `turns` as one batch and return the batch id.
    ///
    /// Embeddings are computed before anything is written, so an embedder
    /// failure stores nothing.
    pub fn add_context(&self, turns: Vec<Turn>) -> MemoryResult<MonotonicId> {
        if turns.is_empty() {
            return Err(MemoryError::EmptyBatch);
        }
        let now = Local::now();
        let prefix = self.config.time_injection.then(|| time_prefix(&now));
        let timestamp = now.with_timezone(&Utc).to_rfc3339();

        let mut entries = Vec::with_capacity(turns.len());
        for turn in turns {
            let content = self.decorate(&turn, prefix.as_deref());
            let tokens = self.count_tokens(&content);
            let vector = self.embed(&content)?;
            let mut entry = NewEntry::new(content)
                .with_optional_vector(vector)
                .with_attribute(ROLE, turn.role.as_str())
                .with_attribute(TOKENS, tokens as i64)
                .with_attribute(TIMESTAMP, timestamp.clone());
            if let Some(model) = turn.model {
                entry = entry.with_attribute(MODEL, model);
            }
            if let Some(name) = turn.name {
                entry = entry.with_attribute(NAME, name);
            }
            entries.push(entry);
        }

        let ids = self.history.add_batch(entries)?;
        let batch = ids.first().copied().ok_or(MemoryError::EmptyBatch)?;
        debug!(batch = %batch, turns = ids.len(), "batch added");
        Ok(batch)
    }

    fn decorate(&self, turn: &Turn, time_prefix: Option<&str>) -> String {
        let mut content = String::new();
        if self.config.model_injection
            && let Some(model) = &turn.model
        {
            content.push_str(&format!("Source AI Model: {model} - "));
        }
        if let Some(prefix) = time_prefix {
            content.push_str(prefix);
        }
        content.push_str(&turn.content);
        content
    }

    /// Summarise every pending batch, then refresh the long-term memory if
    /// any summary is newer than it.
    ///
    /// Runs under the summary store's write lock, so concurrent reducers in
    /// other processes never summarise the same batch twice. The first
    /// summariser failure stops the run and is returned; that batch and any
    /// after it stay pending.
    pub fn reduce_context(&self) -> MemoryResult<ReduceReport> {
        let mut guard = self.summaries.write()?;
        let done = summarised_batches(&guard.all()?);
        let pending: Vec<MonotonicId> = self
            .history
            .group_ids()?
            .into_iter()
            .filter(|batch| !done.contains(batch))
            .collect();

        let mut report = ReduceReport::default();
        for batch in pending {
            let entries = self.batch(batch)?;
            let Some(first) = entries.first() else { continue };
            let stripped: Vec<ChatMessage> = entries
                .iter()
                .map(|e| ChatMessage::new(e.role, e.content.clone()))
                .collect();

            let summary = match self.caps.summarizer.summarize(&stripped) {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(batch = %batch, error = %e, "summarisation failed; batch stays pending");
                    return Err(e.into());
                }
            };

            let tokens = self.count_tokens(&summary.content);
            let vector = self.embed(&summary.content)?;
            let sources = entries
                .iter()
                .map(|e| e.id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let entry = NewEntry::new(summary.content)
                .with_optional_vector(vector)
                .with_attribute(ROLE, Role::Assistant.as_str())
                .with_attribute(BATCH, batch.get() as i64)
                .with_attribute(SOURCES, sources)
                .with_attribute(TOKENS, tokens as i64)
                .with_attribute(TIMESTAMP, first.timestamp.to_rfc3339());
            let id = guard.add_entry(entry)?;

            info!(batch = %batch, summary = %id, tokens, "batch summarised");
            report.batches.push(batch);
            report.summaries.push(id);
        }

        report.long_term_updated = self.refresh_long_term(&guard)?;
        Ok(report)
    }

    /// Regenerate the long-term memory from the newest summaries that fit
    /// `summary_max_tokens`, when any summary postdates it.
    fn refresh_long_term(&self, guard: &WriteGuard<'_>) -> MemoryResult<bool> {
        let ltm = LongTermMemory::load(&self.root)?;
        let summaries = guard
            .all()?
            .into_iter()
            .map(Summary::from_record)
            .collect::<MemoryResult<Vec<_>>>()?;
        let Some(newest) = summaries.last().map(|s| s.id) else {
            return Ok(false);
        };
        if newest <= ltm.through_summary {
            return Ok(false);
        }

        let budget = self.config.summary_max_tokens;
        let mut used = 0;
        let mut picked = Vec::new();
        for summary in summaries.iter().rev() {
            if used + summary.token_count > budget {
                break;
            }
            used += summary.token_count;
            picked.push(summary.to_message());
        }
        picked.reverse();

        let content = if picked.is_empty() {
            warn!(
                summary = %newest,
                budget,
                "newest summary alone exceeds the long-term budget; keeping previous text"
            );
            ltm.content
        } else {
            self.caps.summarizer.summarize(&picked)?.content
        };

        let token_count = self.count_tokens(&content);
        if token_count > budget {
            warn!(tokens = token_count, budget, "long-term memory exceeds its budget");
        }
        LongTermMemory {
            content,
            through_summary: newest,
            token_count,
            updated_at: Some(Utc::now()),
        }
        .save(&self.root)?;
        info!(through = %newest, folded = picked.len(), tokens = token_count, "long-term memory regenerated");
        Ok(true)
    }

    /// Batches not yet named by any summary, ascending.
    pub fn pending_batches(&self) -> MemoryResult<Vec<MonotonicId>> {
        let done = summarised_batches(&self.summaries.all()?);
        Ok(self
            .history
            .group_ids()?
            .into_iter()
            .filter(|batch| !done.contains(batch))
            .collect())
    }

    fn needs_reduce(&self) -> MemoryResult<bool> {
        if !self.pending_batches()?.is_empty() {
            return Ok(true);
        }
        let through = LongTermMemory::load(&self.root)?.through_summary;
        Ok(self.summaries.latest()?.is_some_and(|s| s.id > through))
    }

    // ── reading ──────────────────────────────────────────────────────────────

    /// The system prompt with its placeholders filled in.
    pub fn system_message(&self) -> MemoryResult<ChatMessage> {
        let ltm = self.long_term_memory()?;
        Ok(ChatMessage::system(render_system(
            &self.config.system_prompt,
            &self.config.fixed_user(),
            &ltm.content,
            &Local::now(),
        )))
    }

    pub fn long_term_memory(&self) -> MemoryResult<LongTermMemory> {
        LongTermMemory::load(&self.root)
    }

    /// Turns of one batch, ascending.
    pub fn batch(&self, batch_id: MonotonicId) -> MemoryResult<Vec<HistoryEntry>> {
        to_entries(self.history.get_by_group(batch_id)?)
    }

    /// The newest batch, empty when there is no history.
    pub fn last_batch(&self) -> MemoryResult<Vec<HistoryEntry>> {
        match self.history.latest()? {
            Some(record) => self.batch(record.group_id),
            None => Ok(Vec::new()),
        }
    }

    /// The batch stored just before `batch_id`, empty when there is none.
    pub fn batch_before(&self, batch_id: MonotonicId) -> MemoryResult<Vec<HistoryEntry>> {
        let Some(prev) = batch_id.get().checked_sub(1).filter(|&id| id > 0) else {
            return Ok(Vec::new());
        };
        match self.history.at_or_before(MonotonicId(prev), 1)?.into_iter().next() {
            Some(record) => self.batch(record.group_id),
            None => Ok(Vec::new()),
        }
    }

    /// Up to `n` turns with id `<= at` (default: newest), newest first.
    pub fn history_before(
        &self,
        at: Option<MonotonicId>,
        n: usize,
    ) -> MemoryResult<Vec<HistoryEntry>> {
        let at = at.unwrap_or(NEWEST);
        to_entries(self.history.at_or_before(at, n)?)
    }

    /// Up to `n` summaries with id `<= at` (default: newest), newest first.
    pub fn summaries_before(&self, at: Option<MonotonicId>, n: usize) -> MemoryResult<Vec<Summary>> {
        let at = at.unwrap_or(NEWEST);
        self.summaries
            .at_or_before(at, n)?
            .into_iter()
            .map(Summary::from_record)
            .collect()
    }

    /// Every summary, ascending.
    pub fn all_summaries(&self) -> MemoryResult<Vec<Summary>> {
        self.summaries
            .all()?
            .into_iter()
            .map(Summary::from_record)
            .collect()
    }

    pub fn history_count(&self) -> MemoryResult<usize> {
        Ok(self.history.count()?)
    }

    pub fn summary_count(&self) -> MemoryResult<usize> {
        Ok(self.summaries.count()?)
    }
}

fn summarised_batches(records: &[Record]) -> HashSet<MonotonicId> {
    records.iter().filter_map(batch_of).collect()
}

fn to_entries(records: Vec<Record>) -> MemoryResult<Vec<HistoryEntry>> {
    records.into_iter().map(HistoryEntry::from_record).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
