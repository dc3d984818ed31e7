//! `mnemos-store` – the embedded store engine.
//!
//! A small file-backed database that gives ACID-like guarantees on top of
//! SQLite and the filesystem: ids that are never reused, even across crashes,
//! and a vector index that is always in step with the rows it indexes.
//!
//! # Modules
//!
//! - [`ledger`] – [`Ledger`][ledger::Ledger]: crash-safe monotonic id
//!   allocation with pending files resolved by atomic rename.
//! - [`row_store`] – [`RowStore`][row_store::RowStore]: the SQLite table that
//!   is the single source of truth, with batch lookup and tombstones.
//! - [`vector_index`] – [`VectorIndex`][vector_index::VectorIndex]: flat,
//!   in-memory nearest-neighbour search over normalised vectors.
//! - [`lock`] – [`DirLock`][lock::DirLock]: the cross-process write lock.
//! - [`store`] – [`EmbeddedStore`][store::EmbeddedStore]: the composition of
//!   all of the above.

pub mod error;
pub mod ledger;
pub mod lock;
pub mod row_store;
pub mod store;
pub mod vector_index;

pub use error::{StoreError, StoreResult};
pub use ledger::{Ledger, PendingAllocation, RecoveryReport};
pub use row_store::Record;
pub use store::{EmbeddedStore, NewEntry, StoreConfig, WriteGuard};
