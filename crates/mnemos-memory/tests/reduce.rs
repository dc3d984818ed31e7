mod common;

use std::sync::Arc;

use common::{FakeSummarizer, exchange, open};
use mnemos_memory::{MemoryConfig, MemoryError};

#[test]
fn second_reduce_with_nothing_new_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let summarizer = Arc::new(FakeSummarizer::default());
    let memory = open(dir.path(), common::config(), Arc::clone(&summarizer), true);
    memory.add_context(exchange("a", 3)).unwrap();
    memory.add_context(exchange("b", 3)).unwrap();

    let first = memory.reduce_context().unwrap();
    assert_eq!(first.batches.len(), 2);
    assert!(first.long_term_updated);
    let ltm = memory.long_term_memory().unwrap();
    let calls = summarizer.calls();

    let second = memory.reduce_context().unwrap();
    assert!(second.is_noop());
    assert_eq!(summarizer.calls(), calls);
    assert_eq!(memory.summary_count().unwrap(), 2);
    assert_eq!(memory.long_term_memory().unwrap(), ltm);
}

#[test]
fn failed_summary_leaves_batch_pending_until_retry() {
    let dir = tempfile::tempdir().unwrap();
    let summarizer = Arc::new(FakeSummarizer::default());
    let memory = open(dir.path(), common::config(), Arc::clone(&summarizer), false);
    let batch = memory.add_context(exchange("a", 3)).unwrap();

    summarizer.set_failing(true);
    let err = memory.reduce_context().unwrap_err();
    assert!(matches!(err, MemoryError::Capability(_)));
    assert_eq!(memory.pending_batches().unwrap(), vec![batch]);
    assert_eq!(memory.summary_count().unwrap(), 0);
    assert!(memory.long_term_memory().unwrap().is_empty());

    summarizer.set_failing(false);
    let report = memory.reduce_context().unwrap();
    assert_eq!(report.batches, vec![batch]);
    assert!(memory.pending_batches().unwrap().is_empty());
    assert!(!memory.long_term_memory().unwrap().is_empty());
}

#[test]
fn long_term_memory_is_bounded_by_summary_budget() {
    let dir = tempfile::tempdir().unwrap();
    let summarizer = Arc::new(FakeSummarizer::default());
    // Each summary is 4 tokens; only the newest two fit.
    let config = MemoryConfig {
        summary_max_tokens: 9,
        ..common::config()
    };
    let memory = open(dir.path(), config, summarizer, false);
    for tag in ["a", "b", "c"] {
        memory.add_context(exchange(tag, 2)).unwrap();
    }
    memory.reduce_context().unwrap();

    let ltm = memory.long_term_memory().unwrap();
    assert_eq!(ltm.content, "summary of 2 messages");
    let newest = memory.summaries_before(None, 1).unwrap();
    assert_eq!(ltm.through_summary, newest[0].id);
}

#[test]
fn reopening_summarises_leftover_batches() {
    let dir = tempfile::tempdir().unwrap();
    let summarizer = Arc::new(FakeSummarizer::default());
    let batch = {
        let memory = open(dir.path(), common::config(), Arc::clone(&summarizer), true);
        memory.add_context(exchange("a", 3)).unwrap()
    };

    let memory = open(dir.path(), common::config(), summarizer, true);
    assert!(memory.pending_batches().unwrap().is_empty());
    assert_eq!(memory.all_summaries().unwrap()[0].batch_id, batch);
}

#[test]
fn reopening_with_summarizer_down_still_opens() {
    let dir = tempfile::tempdir().unwrap();
    let summarizer = Arc::new(FakeSummarizer::default());
    {
        let memory = open(dir.path(), common::config(), Arc::clone(&summarizer), false);
        memory.add_context(exchange("a", 3)).unwrap();
    }

    summarizer.set_failing(true);
    let memory = open(dir.path(), common::config(), summarizer, false);
    assert_eq!(memory.pending_batches().unwrap().len(), 1);
    assert_eq!(memory.history_count().unwrap(), 2);
}

#[test]
fn ids_keep_growing_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let summarizer = Arc::new(FakeSummarizer::default());
    let first = {
        let memory = open(dir.path(), common::config(), Arc::clone(&summarizer), false);
        memory.add_context(exchange("a", 1)).unwrap()
    };
    let memory = open(dir.path(), common::config(), summarizer, false);
    let second = memory.add_context(exchange("b", 1)).unwrap();
    assert_eq!(memory.batch_before(second).unwrap()[0].batch_id, first);
    assert!(second > first.next());
}
