//! Flat (brute-force) vector index.
//!
//! Holds one slot per row of the [`RowStore`][crate::row_store::RowStore], in
//! ascending id order, so that a slot's *position* is the row's position in
//! that enumeration. Rows stored without an embedding occupy a slot that
//! search skips; this keeps `size()` equal to the row count.
//!
//! Vectors are stored L2-normalised and compared by Euclidean distance, so the
//! distance lies in `[0, 2]` and smaller means more similar.
//!
//! The index is derived data. It is never persisted; every process rebuilds it
//! from the row store.

use mnemos_types::MonotonicId;

use crate::error::{StoreError, StoreResult};

/// Scale `v` to unit length. Zero vectors are returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        v.to_vec()
    } else {
        v.iter().map(|x| x / norm).collect()
    }
}

/// Euclidean distance between two equal-length vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// In-memory flat index over normalised vectors.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dim: usize,
    ids: Vec<MonotonicId>,
    vectors: Vec<Option<Vec<f32>>>,
    /// Row-store generation this index was built against.
    generation: u64,
}

impl VectorIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ids: Vec::new(),
            vectors: Vec::new(),
            generation: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of slots, vector-less rows included.
    pub fn size(&self) -> usize {
        self.ids.len()
    }

    /// Number of slots that carry a vector.
    pub fn vector_count(&self) -> usize {
        self.vectors.iter().filter(|v| v.is_some()).count()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Drop every slot and forget the generation, so the next consistency
    /// check rebuilds from the row store.
    pub fn invalidate(&mut self) {
        self.ids.clear();
        self.vectors.clear();
        self.generation = u64::MAX;
    }

    /// Record id stored at `position`.
    pub fn id_at(&self, position: usize) -> Option<MonotonicId> {
        self.ids.get(position).copied()
    }

    /// Append a slot for `id`. The vector is normalised before storage.
    ///
    /// Ids must arrive in ascending order; anything else would break the
    /// position ↔ row correspondence.
    pub fn add(&mut self, id: MonotonicId, vector: Option<&[f32]>) -> StoreResult<usize> {
        if let Some(last) = self.ids.last()
            && id <= *last
        {
            return Err(StoreError::Corruption(format!(
                "index append out of order: {id} after {last}"
            )));
        }
        let slot = match vector {
            Some(v) => {
                self.check_dim(v.len())?;
                Some(normalize(v))
            }
            None => None,
        };
        self.ids.push(id);
        self.vectors.push(slot);
        Ok(self.ids.len() - 1)
    }

    /// Replace the whole index with `rows`, which must be in ascending id order
    /// and already normalised (as read from the row store).
    ///
    /// Produces exactly the ordering that an empty index plus sequential
    /// [`add`][Self::add] calls would.
    pub fn rebuild(&mut self, rows: Vec<(MonotonicId, Option<Vec<f32>>)>) -> StoreResult<()> {
        let mut ids = Vec::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len());
        for (id, vector) in rows {
            if let Some(last) = ids.last()
                && id <= *last
            {
                return Err(StoreError::Corruption(format!(
                    "rebuild rows out of order: {id} after {last}"
                )));
            }
            if let Some(v) = &vector
                && v.len() != self.dim
            {
                return Err(StoreError::Corruption(format!(
                    "row {id} holds a {}-dimensional vector in a {}-dimensional store",
                    v.len(),
                    self.dim
                )));
            }
            ids.push(id);
            vectors.push(vector);
        }
        self.ids = ids;
        self.vectors = vectors;
        Ok(())
    }

    /// The `k` nearest slots to `query`, as `(position, distance)` sorted by
    /// ascending distance. Ties keep position order.
    pub fn search(&self, query: &[f32], k: usize) -> StoreResult<Vec<(usize, f32)>> {
        self.check_dim(query.len())?;
        let query = normalize(query);
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .filter_map(|(pos, v)| v.as_ref().map(|v| (pos, euclidean_distance(v, &query))))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    fn check_dim(&self, got: usize) -> StoreResult<()> {
        if got != self.dim || got == 0 {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                got,
            });
        }
        Ok(())
    }

    /// Drop the last slot. Only used to simulate a stale index in tests.
    #[cfg(test)]
    pub(crate) fn truncate_for_test(&mut self, len: usize) {
        self.ids.truncate(len);
        self.vectors.truncate(len);
    }
}
