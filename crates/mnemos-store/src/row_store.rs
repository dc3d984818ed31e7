//! Row Store – the durable source of truth for a store directory.
//!
//! # Storage layout
//!
//! `rows.sqlite3` (WAL journal) holds three tables:
//!
//! | table        | column             | type    | description                           |
//! |--------------|--------------------|---------|---------------------------------------|
//! | `records`    | `id`               | INTEGER | ledger-assigned primary key           |
//! |              | `group_id`         | INTEGER | batch the record belongs to           |
//! |              | `payload`          | TEXT    | record text (content, speaker key)    |
//! |              | `attributes`       | TEXT    | JSON object of scalar attributes      |
//! |              | `embedding`        | BLOB    | raw little-endian f32 vector, or NULL |
//! |              | `normal_embedding` | BLOB    | unit-length copy of `embedding`       |
//! |              | `created_at`       | TEXT    | RFC-3339 insertion time (UTC)         |
//! | `tombstones` | `id`, `deleted_at` |         | ids that were deleted; never reused   |
//! | `meta`       | `key`, `value`     |         | `generation`, bumped on every change  |
//!
//! The generation counter lets a process that caches a vector index notice
//! that another process changed the table, even when the row count happens to
//! come out the same.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mnemos_types::{Attributes, MonotonicId};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::StoreResult;
use crate::vector_index::normalize;

/// File name of the SQLite database inside a store directory.
pub const ROWS_FILE: &str = "rows.sqlite3";

const RECORD_COLUMNS: &str = "id, group_id, payload, attributes, embedding, created_at";

// ─────────────────────────────────────────────────────────────────────────────
// Record
// ─────────────────────────────────────────────────────────────────────────────

/// A single stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: MonotonicId,
    /// Batch this record was produced in. Equal to `id` for standalone records.
    pub group_id: MonotonicId,
    pub payload: String,
    /// Embedding exactly as supplied (not normalised).
    pub vector: Option<Vec<f32>>,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
}

impl Record {
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn attr_i64(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(|v| v.as_i64())
    }
}

/// Consistent view of everything the vector index is derived from.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub generation: u64,
    /// `SELECT COUNT(*)` read in the same transaction as `rows`.
    pub count: usize,
    /// `(id, normalised vector)` in ascending id order.
    pub rows: Vec<(MonotonicId, Option<Vec<f32>>)>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding serialisation helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn blob_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = row.get(idx)?;
    match blob {
        None => Ok(None),
        Some(bytes) => bytes_to_embedding(&bytes).map(Some).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Blob,
                format!("embedding blob of {} bytes is not a whole number of f32s", bytes.len()).into(),
            )
        }),
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let id: u64 = row.get(0)?;
    let group_id: u64 = row.get(1)?;
    let payload: String = row.get(2)?;
    let attributes_json: String = row.get(3)?;
    let vector = blob_column(row, 4)?;
    let created_at: String = row.get(5)?;

    let attributes: Attributes = serde_json::from_str(&attributes_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    let created_at = created_at
        .parse::<DateTime<Utc>>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(Record {
        id: MonotonicId(id),
        group_id: MonotonicId(group_id),
        payload,
        vector,
        attributes,
        created_at,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// RowStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed record table.
pub struct RowStore {
    conn: Connection,
}

impl RowStore {
    /// Open (or create) `rows.sqlite3` inside `dir`.
    pub fn open(dir: &Path) -> StoreResult<Self> {
        let conn = Connection::open(dir.join(ROWS_FILE))?;
        conn.busy_timeout(Duration::from_secs(30))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a temporary in-memory table (useful for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                id               INTEGER NOT NULL PRIMARY KEY,
                group_id         INTEGER NOT NULL,
                payload          TEXT    NOT NULL,
                attributes       TEXT    NOT NULL,
                embedding        BLOB,
                normal_embedding BLOB,
                created_at       TEXT    NOT NULL
            );
            CREATE INDEX IF NOT EXISTS records_by_group ON records (group_id, id);
            CREATE TABLE IF NOT EXISTS tombstones (
                id         INTEGER NOT NULL PRIMARY KEY,
                deleted_at TEXT    NOT NULL
            );
            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT    NOT NULL PRIMARY KEY,
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO meta (key, value) VALUES ('generation', 0);",
        )?;
        Ok(())
    }

    /// Insert `record`. Fails if the id is already present.
    pub fn put(&mut self, record: &Record) -> StoreResult<()> {
        let attributes = serde_json::to_string(&record.attributes)?;
        let raw = record.vector.as_deref().map(embedding_to_bytes);
        let normal = record
            .vector
            .as_deref()
            .map(|v| embedding_to_bytes(&normalize(v)));

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO records
                 (id, group_id, payload, attributes, embedding, normal_embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.get(),
                record.group_id.get(),
                record.payload,
                attributes,
                raw,
                normal,
                record.created_at.to_rfc3339(),
            ],
        )?;
        bump_generation(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete the record `id` and tombstone its id.
    ///
    /// Returns `false` (and changes nothing) when no such record exists.
    pub fn delete(&mut self, id: MonotonicId) -> StoreResult<bool> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM records WHERE id = ?1", params![id.get()])?;
        if removed == 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT OR REPLACE INTO tombstones (id, deleted_at) VALUES (?1, ?2)",
            params![id.get(), Utc::now().to_rfc3339()],
        )?;
        bump_generation(&tx)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get(&self, id: MonotonicId) -> StoreResult<Option<Record>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id.get()], row_to_record)
            .optional()?)
    }

    /// Records of one batch, ascending by id.
    pub fn get_by_group(&self, group_id: MonotonicId) -> StoreResult<Vec<Record>> {
        self.query_records(
            &format!("SELECT {RECORD_COLUMNS} FROM records WHERE group_id = ?1 ORDER BY id ASC"),
            params![group_id.get()],
        )
    }

    /// Records whose payload contains `pattern` verbatim, ascending by id.
    pub fn find_by_substring(&self, pattern: &str) -> StoreResult<Vec<Record>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records WHERE instr(payload, ?1) > 0 ORDER BY id ASC"
            ),
            params![pattern],
        )
    }

    /// Up to `limit` records with `id <= at`, newest first.
    pub fn at_or_before(&self, at: MonotonicId, limit: usize) -> StoreResult<Vec<Record>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records WHERE id <= ?1 ORDER BY id DESC LIMIT ?2"
            ),
            params![at.get(), limit as i64],
        )
    }

    /// Every record, ascending by id.
    pub fn all(&self) -> StoreResult<Vec<Record>> {
        self.query_records(
            &format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY id ASC"),
            [],
        )
    }

    /// The record with the highest id.
    pub fn latest(&self) -> StoreResult<Option<Record>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY id DESC LIMIT 1");
        Ok(self.conn.query_row(&sql, [], row_to_record).optional()?)
    }

    /// Distinct group ids, ascending.
    pub fn group_ids(&self) -> StoreResult<Vec<MonotonicId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT group_id FROM records ORDER BY group_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, u64>(0).map(MonotonicId))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> StoreResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn generation(&self) -> StoreResult<u64> {
        Ok(self.conn.query_row(
            "SELECT value FROM meta WHERE key = 'generation'",
            [],
            |row| row.get(0),
        )?)
    }

    /// Highest id ever stored: live rows and tombstones alike.
    pub fn max_consumed_id(&self) -> StoreResult<MonotonicId> {
        let max: Option<u64> = self.conn.query_row(
            "SELECT MAX(id) FROM (SELECT id FROM records UNION ALL SELECT id FROM tombstones)",
            [],
            |row| row.get(0),
        )?;
        Ok(MonotonicId(max.unwrap_or(0)))
    }

    pub fn is_tombstoned(&self, id: MonotonicId) -> StoreResult<bool> {
        let hit: Option<u64> = self
            .conn
            .query_row(
                "SELECT id FROM tombstones WHERE id = ?1",
                params![id.get()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// Generation, row count and id-ordered normalised vectors, all read
    /// inside one transaction.
    pub fn index_snapshot(&mut self) -> StoreResult<IndexSnapshot> {
        let tx = self.conn.transaction()?;
        let generation: u64 =
            tx.query_row("SELECT value FROM meta WHERE key = 'generation'", [], |row| row.get(0))?;
        let count: i64 = tx.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        let rows = {
            let mut stmt =
                tx.prepare("SELECT id, normal_embedding FROM records ORDER BY id ASC")?;
            let mapped = stmt.query_map([], |row| {
                let id: u64 = row.get(0)?;
                Ok((MonotonicId(id), blob_column(row, 1)?))
            })?;
            mapped.collect::<Result<Vec<_>, _>>()?
        };
        tx.commit()?;
        Ok(IndexSnapshot {
            generation,
            count: count as usize,
            rows,
        })
    }

    /// `(generation, count)` read inside one transaction.
    pub fn fingerprint(&mut self) -> StoreResult<(u64, usize)> {
        let tx = self.conn.transaction()?;
        let generation: u64 =
            tx.query_row("SELECT value FROM meta WHERE key = 'generation'", [], |row| row.get(0))?;
        let count: i64 = tx.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        tx.commit()?;
        Ok((generation, count as usize))
    }

    fn query_records<P: rusqlite::Params>(&self, sql: &str, params: P) -> StoreResult<Vec<Record>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn bump_generation(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute("UPDATE meta SET value = value + 1 WHERE key = 'generation'", [])?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
