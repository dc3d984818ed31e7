//! Embedded Store – ledger, row store and vector index composed into one
//! crash-safe collection.
//!
//! # Lifecycle
//!
//! [`EmbeddedStore::open`] takes the directory's write lock and runs recovery
//! before anything else can touch the store:
//!
//! 1. orphaned ledger allocations and half-written temp files are removed;
//! 2. the ledger counter is lifted past every id present in the row store or
//!    its tombstones;
//! 3. the vector index is built from the row store and checked against it.
//!
//! After that the store is open until it is dropped.
//!
//! # Concurrency
//!
//! Mutations go through a [`WriteGuard`], which holds an in-process mutex and
//! the directory's `flock` for as long as it lives. Reads use a second SQLite
//! connection and never take the file lock; they compare the cached index
//! against the row store's `(generation, count)` first and rebuild it when
//! another writer (in this process or another) has moved on.
//!
//! # Example
//!
//! ```rust
//! use mnemos_store::{EmbeddedStore, NewEntry, StoreConfig};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = EmbeddedStore::open(StoreConfig::new(dir.path(), "speaker", 3)).unwrap();
//!
//! let id = store
//!     .add_entry(NewEntry::new("Unknown Speaker").with_vector(vec![0.1, 0.9, 0.3]))
//!     .unwrap();
//!
//! let (nearest, distance) = store.find_nearest(&[0.1, 0.9, 0.3]).unwrap().unwrap();
//! assert_eq!(nearest, id);
//! assert!(distance < 1e-6);
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};

use chrono::Utc;
use mnemos_types::{Attributes, MonotonicId, Scalar};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::ledger::{Ledger, RecoveryReport};
use crate::lock::DirLock;
use crate::row_store::{Record, RowStore};
use crate::vector_index::VectorIndex;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Where a store lives and what it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Directory holding the row store, ledger files and lock file.
    pub dir: PathBuf,
    /// Ledger scope used for this store's ids.
    pub scope: String,
    /// Embedding dimension every vector must have.
    pub dim: usize,
}

impl StoreConfig {
    pub fn new(dir: impl AsRef<Path>, scope: impl Into<String>, dim: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            scope: scope.into(),
            dim,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NewEntry
// ─────────────────────────────────────────────────────────────────────────────

/// A record waiting for its id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewEntry {
    pub payload: String,
    pub vector: Option<Vec<f32>>,
    pub attributes: Attributes,
}

impl NewEntry {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_optional_vector(mut self, vector: Option<Vec<f32>>) -> Self {
        self.vector = vector;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EmbeddedStore
// ─────────────────────────────────────────────────────────────────────────────

/// A directory-backed collection of records with a flat vector index.
pub struct EmbeddedStore {
    config: StoreConfig,
    ledger: Ledger,
    writer: Mutex<RowStore>,
    reader: Mutex<RowStore>,
    index: RwLock<VectorIndex>,
    recovery: RecoveryReport,
}

impl EmbeddedStore {
    /// Open (or create) the store described by `config`, running recovery.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let lock = DirLock::acquire(&config.dir)?;

        let ledger = Ledger::open(&config.dir)?;
        let recovery = ledger.recover()?;

        let mut writer = RowStore::open(&config.dir)?;
        let reader = RowStore::open(&config.dir)?;
        ledger.raise_floor(&config.scope, writer.max_consumed_id()?)?;

        let mut index = VectorIndex::new(config.dim);
        rebuild_from(&mut writer, &mut index)?;
        drop(lock);

        info!(
            dir = %config.dir.display(),
            scope = %config.scope,
            records = index.size(),
            vectors = index.vector_count(),
            abandoned = recovery.abandoned.len(),
            "embedded store open"
        );

        Ok(Self {
            config,
            ledger,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            index: RwLock::new(index),
            recovery,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// What recovery cleaned up when this instance was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Last id committed by the ledger for this store's scope.
    pub fn current_id(&self) -> StoreResult<MonotonicId> {
        self.ledger.current(&self.config.scope)
    }

    /// Take the write lock. Every mutation made through the guard is
    /// serialised against other writers in this and other processes.
    pub fn write(&self) -> StoreResult<WriteGuard<'_>> {
        let mut rows = self.writer.lock()?;
        let lock = DirLock::acquire(&self.config.dir)?;
        self.ensure_index(&mut rows)?;
        Ok(WriteGuard {
            store: self,
            rows,
            _lock: lock,
        })
    }

    // ── mutations ────────────────────────────────────────────────────────────

    /// Store one entry as its own group and return its id.
    pub fn add_entry(&self, entry: NewEntry) -> StoreResult<MonotonicId> {
        self.write()?.add_entry(entry)
    }

    /// Store several entries as one group (`group_id` = first id).
    pub fn add_batch(&self, entries: Vec<NewEntry>) -> StoreResult<Vec<MonotonicId>> {
        self.write()?.add_batch(entries)
    }

    /// Delete `id`; its id is tombstoned and never handed out again.
    pub fn remove_entry(&self, id: MonotonicId) -> StoreResult<()> {
        self.write()?.remove_entry(id)
    }

    // ── reads ────────────────────────────────────────────────────────────────

    /// Nearest stored vector to `vector`, or `None` when the store holds no
    /// vectors.
    pub fn find_nearest(&self, vector: &[f32]) -> StoreResult<Option<(MonotonicId, f32)>> {
        self.read(|_, index| nearest(index, vector))
    }

    /// Up to `k` nearest records with their distances, closest first.
    pub fn search(&self, vector: &[f32], k: usize) -> StoreResult<Vec<(Record, f32)>> {
        self.read(|rows, index| search(rows, index, vector, k))
    }

    /// Records whose payload contains `pattern`, ascending by id.
    pub fn find_by_substring(&self, pattern: &str) -> StoreResult<Vec<Record>> {
        self.read(|rows, _| rows.find_by_substring(pattern))
    }

    pub fn get(&self, id: MonotonicId) -> StoreResult<Option<Record>> {
        self.read(|rows, _| rows.get(id))
    }

    pub fn get_by_group(&self, group_id: MonotonicId) -> StoreResult<Vec<Record>> {
        self.read(|rows, _| rows.get_by_group(group_id))
    }

    pub fn latest(&self) -> StoreResult<Option<Record>> {
        self.read(|rows, _| rows.latest())
    }

    /// Up to `limit` records with `id <= at`, newest first.
    pub fn at_or_before(&self, at: MonotonicId, limit: usize) -> StoreResult<Vec<Record>> {
        self.read(|rows, _| rows.at_or_before(at, limit))
    }

    pub fn all(&self) -> StoreResult<Vec<Record>> {
        self.read(|rows, _| rows.all())
    }

    pub fn group_ids(&self) -> StoreResult<Vec<MonotonicId>> {
        self.read(|rows, _| rows.group_ids())
    }

    pub fn count(&self) -> StoreResult<usize> {
        self.read(|rows, _| rows.count())
    }

    /// Slots in the (freshly checked) vector index.
    pub fn index_size(&self) -> StoreResult<usize> {
        self.read(|_, index| Ok(index.size()))
    }

    fn read<T>(&self, f: impl FnOnce(&mut RowStore, &VectorIndex) -> StoreResult<T>) -> StoreResult<T> {
        let mut rows = self.reader.lock()?;
        self.ensure_index(&mut rows)?;
        let index = self.index.read()?;
        f(&mut rows, &index)
    }

    /// Consistency check: rebuild the cached index when it no longer matches
    /// the row store; fail when a rebuild cannot make it match.
    fn ensure_index(&self, rows: &mut RowStore) -> StoreResult<()> {
        let (generation, count) = rows.fingerprint()?;
        {
            let index = self.index.read()?;
            if index.generation() == generation && index.size() == count {
                return Ok(());
            }
        }

        let mut index = self.index.write()?;
        if index.generation() == generation && index.size() == count {
            return Ok(());
        }
        if index.generation() == generation {
            warn!(
                scope = %self.config.scope,
                index = index.size(),
                rows = count,
                "vector index out of step with row store; rebuilding"
            );
        } else {
            debug!(
                scope = %self.config.scope,
                cached = index.generation(),
                current = generation,
                "row store changed since index was built; rebuilding"
            );
        }
        rebuild_from(rows, &mut index)
    }
}

/// Full rebuild from one row-store snapshot, then verify.
fn rebuild_from(rows: &mut RowStore, index: &mut VectorIndex) -> StoreResult<()> {
    let snapshot = rows.index_snapshot()?;
    index.rebuild(snapshot.rows)?;
    index.set_generation(snapshot.generation);
    if index.size() != snapshot.count {
        error!(
            index = index.size(),
            rows = snapshot.count,
            "vector index still disagrees with row store after rebuild"
        );
        return Err(StoreError::Corruption(format!(
            "index holds {} slots but row store holds {} rows after rebuild",
            index.size(),
            snapshot.count
        )));
    }
    Ok(())
}

fn nearest(index: &VectorIndex, vector: &[f32]) -> StoreResult<Option<(MonotonicId, f32)>> {
    let hit = index.search(vector, 1)?.into_iter().next();
    Ok(hit.and_then(|(pos, distance)| index.id_at(pos).map(|id| (id, distance))))
}

fn search(
    rows: &RowStore,
    index: &VectorIndex,
    vector: &[f32],
    k: usize,
) -> StoreResult<Vec<(Record, f32)>> {
    let mut out = Vec::new();
    for (pos, distance) in index.search(vector, k)? {
        let Some(id) = index.id_at(pos) else { continue };
        match rows.get(id)? {
            Some(record) => out.push((record, distance)),
            None => debug!(id = %id, "search hit vanished before it could be read"),
        }
    }
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// WriteGuard
// ─────────────────────────────────────────────────────────────────────────────

/// Exclusive access to a store for the guard's lifetime.
///
/// Reads made through the guard see every mutation made through it.
pub struct WriteGuard<'a> {
    store: &'a EmbeddedStore,
    rows: MutexGuard<'a, RowStore>,
    _lock: DirLock,
}

impl WriteGuard<'_> {
    pub fn add_entry(&mut self, entry: NewEntry) -> StoreResult<MonotonicId> {
        let ids = self.add_batch(vec![entry])?;
        Ok(ids[0])
    }

    /// Store `entries` in order as one group. Each entry goes through the
    /// full allocate → row → index → resolve sequence before the next starts.
    pub fn add_batch(&mut self, entries: Vec<NewEntry>) -> StoreResult<Vec<MonotonicId>> {
        let dim = self.store.config.dim;
        for entry in &entries {
            if let Some(v) = &entry.vector
                && (v.len() != dim || v.is_empty())
            {
                return Err(StoreError::DimensionMismatch {
                    expected: dim,
                    got: v.len(),
                });
            }
        }

        let scope = self.store.config.scope.as_str();
        let ledger = &self.store.ledger;
        let mut ids = Vec::with_capacity(entries.len());
        let mut group_id = None;

        for entry in entries {
            let session = Uuid::new_v4().simple().to_string();
            let id = ledger.next_id(scope, &session)?;
            let group = *group_id.get_or_insert(id);

            let record = Record {
                id,
                group_id: group,
                payload: entry.payload,
                vector: entry.vector,
                attributes: entry.attributes,
                created_at: Utc::now(),
            };
            // Readers must not rebuild the index between the row commit and
            // the append, or the append would find its own id already there.
            let store = self.store;
            let mut index = store.index.write()?;
            if let Err(e) = self.rows.put(&record) {
                drop(index);
                ledger.abandon(scope, &session)?;
                return Err(e);
            }
            let indexed = index_row(&mut self.rows, &mut index, &record, scope);
            drop(index);

            // The row is durable from here on, so the id is committed even
            // when indexing failed.
            if let Err(e) = ledger.resolve(scope, &session) {
                settle_unresolved(ledger, scope, &session, id);
                return Err(e);
            }
            indexed?;
            debug!(scope, id = %id, group = %group, "entry added");
            ids.push(id);
        }
        Ok(ids)
    }

    /// Delete `id` and rebuild the index.
    pub fn remove_entry(&mut self, id: MonotonicId) -> StoreResult<()> {
        let store = self.store;
        let mut index = store.index.write()?;
        if !self.rows.delete(id)? {
            return Err(StoreError::NotFound(id));
        }
        rebuild_from(&mut self.rows, &mut index).inspect_err(|_| index.invalidate())?;
        debug!(scope = %self.store.config.scope, id = %id, "entry removed");
        Ok(())
    }

    pub fn find_nearest(&self, vector: &[f32]) -> StoreResult<Option<(MonotonicId, f32)>> {
        let index = self.store.index.read()?;
        nearest(&index, vector)
    }

    pub fn search(&self, vector: &[f32], k: usize) -> StoreResult<Vec<(Record, f32)>> {
        let index = self.store.index.read()?;
        search(&self.rows, &index, vector, k)
    }

    pub fn find_by_substring(&self, pattern: &str) -> StoreResult<Vec<Record>> {
        self.rows.find_by_substring(pattern)
    }

    pub fn get(&self, id: MonotonicId) -> StoreResult<Option<Record>> {
        self.rows.get(id)
    }

    pub fn get_by_group(&self, group_id: MonotonicId) -> StoreResult<Vec<Record>> {
        self.rows.get_by_group(group_id)
    }

    pub fn latest(&self) -> StoreResult<Option<Record>> {
        self.rows.latest()
    }

    pub fn all(&self) -> StoreResult<Vec<Record>> {
        self.rows.all()
    }

    pub fn count(&self) -> StoreResult<usize> {
        self.rows.count()
    }
}

/// Append a freshly stored row to the index. When the append fails the index
/// is rebuilt from the rows; when that fails too it is invalidated so the
/// next consistency check starts over.
fn index_row(
    rows: &mut RowStore,
    index: &mut VectorIndex,
    record: &Record,
    scope: &str,
) -> StoreResult<()> {
    let appended = index
        .add(record.id, record.vector.as_deref())
        .and_then(|_| rows.generation());
    match appended {
        Ok(generation) => {
            index.set_generation(generation);
            Ok(())
        }
        Err(e) => {
            warn!(scope, id = %record.id, error = %e, "index append failed; rebuilding from rows");
            rebuild_from(rows, index).inspect_err(|_| index.invalidate())
        }
    }
}

/// `resolve` failed after the row was stored: drop the pending file and lift
/// the committed counter to `id` so the scope keeps allocating and `id` is
/// never handed out again.
fn settle_unresolved(ledger: &Ledger, scope: &str, session: &str, id: MonotonicId) {
    if let Err(e) = ledger
        .abandon(scope, session)
        .and_then(|_| ledger.raise_floor(scope, id))
    {
        error!(scope, id = %id, error = %e, "could not settle ledger after a stored row");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> EmbeddedStore {
        EmbeddedStore::open(StoreConfig::new(dir, "test", 2)).unwrap()
    }

    fn assert_consistent(store: &EmbeddedStore) {
        assert_eq!(store.index_size().unwrap(), store.count().unwrap());
    }

    #[test]
    fn ids_increase_across_adds_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let a = store.add_entry(NewEntry::new("a")).unwrap();
        let b = store.add_entry(NewEntry::new("b")).unwrap();
        store.remove_entry(b).unwrap();
        let c = store.add_entry(NewEntry::new("c")).unwrap();
        assert!(a < b && b < c);
        assert_eq!(store.current_id().unwrap(), c);
        assert_consistent(&store);
    }

    #[test]
    fn batch_shares_first_id_as_group() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.add_entry(NewEntry::new("solo")).unwrap();
        let ids = store
            .add_batch(vec![NewEntry::new("q"), NewEntry::new("a")])
            .unwrap();
        let batch = store.get_by_group(ids[0]).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|r| r.group_id == ids[0]));
        assert_eq!(store.add_batch(vec![]).unwrap(), vec![]);
    }

    #[test]
    fn find_nearest_on_empty_store_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        assert!(store.find_nearest(&[1.0, 0.0]).unwrap().is_none());
        store.add_entry(NewEntry::new("no vector")).unwrap();
        assert!(store.find_nearest(&[1.0, 0.0]).unwrap().is_none());
    }

    #[test]
    fn find_nearest_picks_closest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let near = store
            .add_entry(NewEntry::new("near").with_vector(vec![1.0, 0.1]))
            .unwrap();
        store
            .add_entry(NewEntry::new("far").with_vector(vec![-1.0, 0.0]))
            .unwrap();
        let (id, distance) = store.find_nearest(&[1.0, 0.0]).unwrap().unwrap();
        assert_eq!(id, near);
        assert!(distance < 0.2);
    }

    #[test]
    fn remove_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        assert!(matches!(
            store.remove_entry(MonotonicId(42)),
            Err(StoreError::NotFound(MonotonicId(42)))
        ));
    }

    #[test]
    fn wrong_dimension_allocates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let err = store
            .add_entry(NewEntry::new("bad").with_vector(vec![1.0, 2.0, 3.0]))
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 2, got: 3 }));
        assert_eq!(store.current_id().unwrap(), MonotonicId::ZERO);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn stale_index_self_heals_on_next_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        for i in 0..3 {
            store
                .add_entry(NewEntry::new(format!("r{i}")).with_vector(vec![i as f32, 1.0]))
                .unwrap();
        }
        store.index.write().unwrap().truncate_for_test(1);

        assert!(store.find_nearest(&[2.0, 1.0]).unwrap().is_some());
        assert_consistent(&store);
    }

    #[test]
    fn stale_index_self_heals_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.add_entry(NewEntry::new("a").with_vector(vec![1.0, 0.0])).unwrap();
        store.index.write().unwrap().truncate_for_test(0);

        store.add_entry(NewEntry::new("b").with_vector(vec![0.0, 1.0])).unwrap();
        assert_consistent(&store);
        assert_eq!(store.index_size().unwrap(), 2);
    }

    #[test]
    fn failed_index_append_still_commits_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let id = {
            let mut guard = store.write().unwrap();
            // A bogus slot past every real id makes the next append out of order.
            store.index.write().unwrap().add(MonotonicId(100), None).unwrap();
            guard
                .add_entry(NewEntry::new("a").with_vector(vec![1.0, 0.0]))
                .unwrap()
        };
        assert_eq!(store.current_id().unwrap(), id);
        assert!(store.ledger.pending("test").unwrap().is_empty());
        assert_consistent(&store);

        let next = store.add_entry(NewEntry::new("b")).unwrap();
        assert_eq!(next, id.next());
        assert_eq!(store.find_nearest(&[1.0, 0.0]).unwrap().unwrap().0, id);
    }

    #[test]
    fn write_guard_sees_its_own_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut guard = store.write().unwrap();
        let id = guard
            .add_entry(NewEntry::new("Ada -- x").with_vector(vec![0.0, 1.0]))
            .unwrap();
        assert_eq!(guard.find_nearest(&[0.0, 1.0]).unwrap().unwrap().0, id);
        assert_eq!(guard.find_by_substring("Ada -- ").unwrap().len(), 1);
        guard.remove_entry(id).unwrap();
        assert!(guard.get(id).unwrap().is_none());
        assert_eq!(guard.count().unwrap(), 0);
    }

    #[test]
    fn search_returns_records_with_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store
            .add_entry(
                NewEntry::new("hello")
                    .with_vector(vec![1.0, 0.0])
                    .with_attribute("role", "user"),
            )
            .unwrap();
        let hits = store.search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.attr_str("role"), Some("user"));
    }
}
