//! Token-budgeted context assembly.
//!
//! [`ConversationMemory::gather_context`] fills a budget in four layers, each
//! only offered what is left over by the ones before:
//!
//! | layer | source                                               | candidate unit |
//! |-------|------------------------------------------------------|----------------|
//! | 1     | newest `minimum_recent_history_length` batches       | batch          |
//! | 2     | history similarity search (substring without an embedder) | batch     |
//! | 3     | summary similarity search                            | summary        |
//! | 4     | every summary, newest first                          | summary        |
//!
//! A candidate that does not fit is skipped whole; layer 1 stops there,
//! the others move on to the next candidate. Nothing is ever truncated.
//! [`ConversationMemory::gather_summaries`] runs layer 4 alone.

use std::collections::BTreeMap;

use mnemos_types::{ChatMessage, MonotonicId};
use tracing::{debug, warn};

use crate::conversation::{ConversationMemory, HistoryEntry, Summary};
use crate::error::{MemoryError, MemoryResult};

/// What one layer contributed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerReport {
    pub ids: Vec<MonotonicId>,
    pub tokens: usize,
}

/// Where every token of a gathered context came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextReport {
    pub budget: usize,
    pub preamble_tokens: usize,
    pub recent: LayerReport,
    pub history_search: LayerReport,
    pub summary_search: LayerReport,
    pub summaries: LayerReport,
}

impl ContextReport {
    pub fn total_tokens(&self) -> usize {
        self.preamble_tokens
            + self.recent.tokens
            + self.history_search.tokens
            + self.summary_search.tokens
            + self.summaries.tokens
    }
}

/// Messages ready to send: system, summaries oldest first, history oldest
/// first.
#[derive(Debug, Clone)]
pub struct GatheredContext {
    pub messages: Vec<ChatMessage>,
    pub report: ContextReport,
}

#[derive(Debug, PartialEq)]
enum Offer {
    Taken,
    /// Nothing new: every record is already included.
    Redundant,
    TooBig,
}

/// Running selection for one `gather_context` call.
struct Assembly {
    budget: usize,
    used: usize,
    history: BTreeMap<MonotonicId, HistoryEntry>,
    summaries: BTreeMap<MonotonicId, Summary>,
}

impl Assembly {
    fn new(budget: usize, preamble: usize) -> Self {
        Self {
            budget,
            used: preamble,
            history: BTreeMap::new(),
            summaries: BTreeMap::new(),
        }
    }

    fn has_room(&self) -> bool {
        self.used < self.budget
    }

    fn fits(&self, tokens: usize) -> bool {
        self.used + tokens <= self.budget
    }

    /// Offer the not-yet-included turns of a batch as one unit.
    fn offer_batch(&mut self, batch: Vec<HistoryEntry>, layer: &mut LayerReport) -> Offer {
        let fresh: Vec<HistoryEntry> = batch
            .into_iter()
            .filter(|e| !self.history.contains_key(&e.id))
            .collect();
        if fresh.is_empty() {
            return Offer::Redundant;
        }
        let tokens: usize = fresh.iter().map(|e| e.token_count).sum();
        if !self.fits(tokens) {
            return Offer::TooBig;
        }
        self.used += tokens;
        layer.tokens += tokens;
        for entry in fresh {
            layer.ids.push(entry.id);
            self.history.insert(entry.id, entry);
        }
        Offer::Taken
    }

    fn offer_summary(&mut self, summary: Summary, layer: &mut LayerReport) -> Offer {
        if self.summaries.contains_key(&summary.id)
            || summary.covered_by(|id| self.history.contains_key(id))
        {
            return Offer::Redundant;
        }
        if !self.fits(summary.token_count) {
            return Offer::TooBig;
        }
        self.used += summary.token_count;
        layer.tokens += summary.token_count;
        layer.ids.push(summary.id);
        self.summaries.insert(summary.id, summary);
        Offer::Taken
    }
}

impl ConversationMemory {
    /// Assemble the context for `query` within `budget` tokens
    /// (default [`MemoryConfig::default_budget`][crate::MemoryConfig::default_budget]).
    ///
    /// The system message counts against the budget. An empty query skips
    /// the two search layers.
    pub fn gather_context(
        &self,
        query: &str,
        budget: Option<usize>,
    ) -> MemoryResult<GatheredContext> {
        self.assemble(query, budget, false)
    }

    /// Like [`gather_context`][Self::gather_context] with only the last
    /// layer: the system message plus summaries, newest first while they fit.
    pub fn gather_summaries(&self, budget: Option<usize>) -> MemoryResult<GatheredContext> {
        self.assemble("", budget, true)
    }

    fn assemble(
        &self,
        query: &str,
        budget: Option<usize>,
        only_summaries: bool,
    ) -> MemoryResult<GatheredContext> {
        let budget = budget.unwrap_or_else(|| self.config().default_budget());
        let system = self.system_message()?;
        let preamble = self.count_tokens(&system.content);
        if preamble > budget {
            return Err(MemoryError::BudgetTooSmall { budget, preamble });
        }

        let mut report = ContextReport {
            budget,
            preamble_tokens: preamble,
            ..ContextReport::default()
        };
        let mut asm = Assembly::new(budget, preamble);
        let config = self.config();

        // 1. newest batches
        let recent = if only_summaries { 0 } else { config.minimum_recent_history_length };
        let mut batch = if recent > 0 { self.last_batch()? } else { Vec::new() };
        for _ in 0..recent {
            let Some(batch_id) = batch.first().map(|e| e.batch_id) else { break };
            if asm.offer_batch(batch, &mut report.recent) == Offer::TooBig {
                break;
            }
            batch = self.batch_before(batch_id)?;
        }

        // 2. similar history
        let query = if only_summaries { "" } else { query.trim() };
        let query_vector = if query.is_empty() { None } else { self.embed_query(query) };
        if asm.has_room() && !query.is_empty() {
            for batch_id in self.similar_batches(query, query_vector.as_deref())? {
                asm.offer_batch(self.batch(batch_id)?, &mut report.history_search);
            }
        }

        // 3. similar summaries
        if asm.has_room()
            && let Some(vector) = &query_vector
        {
            for (record, distance) in self.summaries.search(vector, config.query_n_max)? {
                if !self.within_cutoff(distance) {
                    continue;
                }
                let summary = Summary::from_record(record)?;
                asm.offer_summary(summary, &mut report.summary_search);
            }
        }

        // 4. everything summarised, newest first
        if asm.has_room() {
            for summary in self.all_summaries()?.into_iter().rev() {
                asm.offer_summary(summary, &mut report.summaries);
            }
        }

        let used = report.total_tokens();
        if used > budget || used != asm.used {
            return Err(MemoryError::BudgetOverflow { budget, used });
        }
        debug!(
            budget,
            used,
            recent = report.recent.ids.len(),
            history_hits = report.history_search.ids.len(),
            summary_hits = report.summary_search.ids.len(),
            summaries = report.summaries.ids.len(),
            "context gathered"
        );

        let mut messages = Vec::with_capacity(1 + asm.summaries.len() + asm.history.len());
        messages.push(system);
        messages.extend(asm.summaries.values().map(Summary::to_message));
        messages.extend(asm.history.values().map(HistoryEntry::to_message));
        Ok(GatheredContext { messages, report })
    }

    /// Embed the query, degrading to substring search when the embedder
    /// fails.
    fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder()?;
        match embedder.embed(query) {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(error = %e, "query embedding failed; falling back to substring search");
                None
            }
        }
    }

    fn within_cutoff(&self, distance: f32) -> bool {
        self.config().distance_cutoff.is_none_or(|cutoff| distance < cutoff)
    }

    /// Batch ids of the best history hits, best first, without repeats.
    fn similar_batches(&self, query: &str, vector: Option<&[f32]>) -> MemoryResult<Vec<MonotonicId>> {
        let n = self.config().query_n_max;
        let hits: Vec<MonotonicId> = match vector {
            Some(vector) => self
                .history
                .search(vector, n)?
                .into_iter()
                .filter(|(_, distance)| self.within_cutoff(*distance))
                .map(|(record, _)| record.group_id)
                .collect(),
            None => self
                .history
                .find_by_substring(query)?
                .into_iter()
                .rev()
                .take(n)
                .map(|record| record.group_id)
                .collect(),
        };
        let mut seen = Vec::with_capacity(hits.len());
        for batch in hits {
            if !seen.contains(&batch) {
                seen.push(batch);
            }
        }
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: u64, batch: u64, tokens: usize) -> HistoryEntry {
        HistoryEntry {
            id: MonotonicId(id),
            batch_id: MonotonicId(batch),
            role: mnemos_types::Role::User,
            content: format!("turn {id}"),
            timestamp: Utc::now(),
            token_count: tokens,
            model: None,
            name: None,
        }
    }

    fn summary(id: u64, sources: &[u64], tokens: usize) -> Summary {
        Summary {
            id: MonotonicId(id),
            batch_id: MonotonicId(sources[0]),
            source_ids: sources.iter().copied().map(MonotonicId).collect(),
            content: format!("summary {id}"),
            token_count: tokens,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn batch_is_taken_whole_or_not_at_all() {
        let mut asm = Assembly::new(50, 10);
        let mut layer = LayerReport::default();
        assert_eq!(asm.offer_batch(vec![entry(1, 1, 20), entry(2, 1, 25)], &mut layer), Offer::TooBig);
        assert_eq!(asm.used, 10);
        assert_eq!(asm.offer_batch(vec![entry(3, 3, 20), entry(4, 3, 20)], &mut layer), Offer::Taken);
        assert_eq!(asm.used, 50);
        assert_eq!(layer.ids, vec![MonotonicId(3), MonotonicId(4)]);
    }

    #[test]
    fn included_turns_are_not_offered_twice() {
        let mut asm = Assembly::new(100, 0);
        let mut layer = LayerReport::default();
        asm.offer_batch(vec![entry(1, 1, 10)], &mut layer);
        assert_eq!(asm.offer_batch(vec![entry(1, 1, 10)], &mut layer), Offer::Redundant);
        assert_eq!(asm.offer_batch(vec![entry(1, 1, 10), entry(2, 1, 5)], &mut layer), Offer::Taken);
        assert_eq!(asm.used, 15);
    }

    #[test]
    fn summary_of_included_turns_is_redundant() {
        let mut asm = Assembly::new(100, 0);
        let mut layer = LayerReport::default();
        asm.offer_batch(vec![entry(1, 1, 10), entry(2, 1, 10)], &mut layer);
        assert_eq!(asm.offer_summary(summary(1, &[1, 2], 5), &mut layer), Offer::Redundant);
        assert_eq!(asm.offer_summary(summary(2, &[3, 4], 5), &mut layer), Offer::Taken);
        assert_eq!(asm.offer_summary(summary(2, &[3, 4], 5), &mut layer), Offer::Redundant);
    }
}
