//! Sequential ID Ledger.
//!
//! Crash-safe allocator of [`MonotonicId`]s, one counter per *scope*
//! (`"chat"`, `"summary"`, `"speaker"`, ...).
//!
//! # On-disk layout
//!
//! | file                          | contents                                  |
//! |-------------------------------|-------------------------------------------|
//! | `<scope>.ledger`              | last committed id, decimal ASCII          |
//! | `<scope>.<session>.pending`   | id handed out but not yet resolved        |
//! | `*.tmp`                       | half-written file from an interrupted write |
//!
//! Every write goes to a temp file, is fsynced, and is then renamed into
//! place, so a reader only ever sees a complete value.
//!
//! # Protocol
//!
//! 1. [`Ledger::next_id`] reads the committed value `c`, writes `c + 1` to a
//!    pending file named by the caller's session token and returns `c + 1`.
//! 2. The caller stores its record.
//! 3. [`Ledger::resolve`] renames the pending file onto `<scope>.ledger`.
//!
//! A crash between 1 and 3 leaves a pending file behind. [`Ledger::recover`]
//! deletes it at the next open: the id is abandoned, the committed value is
//! untouched. Gaps are allowed; reuse is not. If the record write did land
//! before the crash, the owning store lifts the counter past it with
//! [`Ledger::raise_floor`].
//!
//! Callers must serialise `next_id`..`resolve` per directory (the embedded
//! store does this with its write lock); two pending files for one scope mean
//! a writer was lost and are reported as corruption.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use mnemos_types::MonotonicId;
use tracing::{debug, error, warn};

use crate::error::{StoreError, StoreResult};

const LEDGER_EXT: &str = "ledger";
const PENDING_EXT: &str = "pending";
const TMP_EXT: &str = "tmp";

/// An unresolved allocation found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAllocation {
    pub scope: String,
    pub session: String,
    pub id: MonotonicId,
}

/// What [`Ledger::recover`] cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Allocations whose owner never resolved them.
    pub abandoned: Vec<PendingAllocation>,
    /// Half-written temp files removed.
    pub temp_files_removed: usize,
}

/// File-backed sequential id allocator.
#[derive(Debug, Clone)]
pub struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    /// Open (or create) a ledger rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Last committed id for `scope` (`0` when nothing was ever committed).
    pub fn current(&self, scope: &str) -> StoreResult<MonotonicId> {
        validate_token(scope)?;
        let path = self.committed_path(scope);
        if !path.exists() {
            return Ok(MonotonicId::ZERO);
        }
        read_id(&path)
    }

    /// Allocate the next id for `scope` on behalf of `session`.
    ///
    /// The id is not committed until [`resolve`][Self::resolve] is called with
    /// the same `session`.
    pub fn next_id(&self, scope: &str, session: &str) -> StoreResult<MonotonicId> {
        validate_token(scope)?;
        validate_token(session)?;

        let pending = self.pending(scope)?;
        if let Some(stale) = pending.first() {
            error!(
                scope,
                stale_session = %stale.session,
                stale_id = %stale.id,
                "refusing to allocate: an unresolved allocation already exists"
            );
            return Err(StoreError::Corruption(format!(
                "scope {scope:?} already has an unresolved allocation (id {}, session {})",
                stale.id, stale.session
            )));
        }

        let candidate = self.current(scope)?.next();
        write_atomic(&self.pending_path(scope, session), candidate)?;
        debug!(scope, session, id = %candidate, "ledger allocation pending");
        Ok(candidate)
    }

    /// Commit the allocation made by `session`, making its id the new
    /// committed value for `scope`.
    pub fn resolve(&self, scope: &str, session: &str) -> StoreResult<MonotonicId> {
        validate_token(scope)?;
        validate_token(session)?;

        let pending_path = self.pending_path(scope, session);
        if !pending_path.exists() {
            return Err(StoreError::Corruption(format!(
                "no pending allocation for scope {scope:?} session {session:?}"
            )));
        }
        let id = read_id(&pending_path)?;
        let committed = self.current(scope)?;
        if id <= committed {
            return Err(StoreError::Corruption(format!(
                "pending id {id} for scope {scope:?} does not advance committed id {committed}"
            )));
        }
        fs::rename(&pending_path, self.committed_path(scope))?;
        sync_dir(&self.dir);
        debug!(scope, session, id = %id, "ledger allocation resolved");
        Ok(id)
    }

    /// Drop the allocation made by `session` without committing it.
    ///
    /// Used when the record write failed; the id becomes a gap.
    pub fn abandon(&self, scope: &str, session: &str) -> StoreResult<()> {
        validate_token(scope)?;
        validate_token(session)?;
        let path = self.pending_path(scope, session);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!(scope, session, "ledger allocation abandoned");
        }
        Ok(())
    }

    /// Unresolved allocations currently on disk for `scope`.
    pub fn pending(&self, scope: &str) -> StoreResult<Vec<PendingAllocation>> {
        validate_token(scope)?;
        Ok(self
            .scan_pending()?
            .into_iter()
            .filter(|p| p.scope == scope)
            .collect())
    }

    /// Startup recovery: delete orphaned pending files and temp files.
    ///
    /// More than one pending file for the same scope is corruption and is
    /// returned as an error with nothing deleted.
    pub fn recover(&self) -> StoreResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TMP_EXT) {
                fs::remove_file(&path)?;
                report.temp_files_removed += 1;
                warn!(path = %path.display(), "removed half-written ledger file");
            }
        }

        let mut by_scope: BTreeMap<String, Vec<PendingAllocation>> = BTreeMap::new();
        for pending in self.scan_pending()? {
            by_scope.entry(pending.scope.clone()).or_default().push(pending);
        }

        if let Some((scope, list)) = by_scope.iter().find(|(_, list)| list.len() > 1) {
            error!(scope = %scope, count = list.len(), "multiple unresolved ledger allocations");
            return Err(StoreError::Corruption(format!(
                "scope {scope:?} has {} unresolved allocations",
                list.len()
            )));
        }

        for pending in by_scope.into_values().flatten() {
            fs::remove_file(self.pending_path(&pending.scope, &pending.session))?;
            warn!(
                scope = %pending.scope,
                session = %pending.session,
                id = %pending.id,
                "abandoned orphaned ledger allocation"
            );
            report.abandoned.push(pending);
        }
        Ok(report)
    }

    /// Lift the committed value of `scope` to at least `floor`.
    ///
    /// Returns `true` when the counter had to move. Never lowers it.
    pub fn raise_floor(&self, scope: &str, floor: MonotonicId) -> StoreResult<bool> {
        let current = self.current(scope)?;
        if floor <= current {
            return Ok(false);
        }
        write_atomic(&self.committed_path(scope), floor)?;
        warn!(scope, from = %current, to = %floor, "ledger counter raised to cover stored ids");
        Ok(true)
    }

    fn committed_path(&self, scope: &str) -> PathBuf {
        self.dir.join(format!("{scope}.{LEDGER_EXT}"))
    }

    fn pending_path(&self, scope: &str, session: &str) -> PathBuf {
        self.dir.join(format!("{scope}.{session}.{PENDING_EXT}"))
    }

    fn scan_pending(&self) -> StoreResult<Vec<PendingAllocation>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let parts: Vec<&str> = name.split('.').collect();
            if let [scope, session, ext] = parts.as_slice()
                && *ext == PENDING_EXT
            {
                found.push(PendingAllocation {
                    scope: (*scope).to_string(),
                    session: (*session).to_string(),
                    id: read_id(&path)?,
                });
            }
        }
        found.sort_by(|a, b| a.scope.cmp(&b.scope).then(a.id.cmp(&b.id)));
        Ok(found)
    }
}

/// Scopes and session tokens become file-name components.
fn validate_token(token: &str) -> StoreResult<()> {
    let ok = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidScope(token.to_string()))
    }
}

fn read_id(path: &Path) -> StoreResult<MonotonicId> {
    let raw = fs::read_to_string(path)?;
    raw.trim()
        .parse::<u64>()
        .map(MonotonicId)
        .map_err(|e| StoreError::Corruption(format!("unreadable ledger file {}: {e}", path.display())))
}

fn write_atomic(path: &Path, id: MonotonicId) -> StoreResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".");
    tmp.push(TMP_EXT);
    let tmp = PathBuf::from(tmp);

    {
        let mut file = File::create(&tmp)?;
        writeln!(file, "{id}")?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

/// Persist a rename. Best effort: not every platform can fsync a directory.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
    #[cfg(not(unix))]
    let _ = dir;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        (dir, ledger)
    }

    #[test]
    fn fresh_scope_starts_at_zero() {
        let (_dir, ledger) = ledger();
        assert_eq!(ledger.current("chat").unwrap(), MonotonicId::ZERO);
    }

    #[test]
    fn allocate_and_resolve_advances_counter() {
        let (_dir, ledger) = ledger();
        let id = ledger.next_id("chat", "s1").unwrap();
        assert_eq!(id, MonotonicId(1));
        assert_eq!(ledger.current("chat").unwrap(), MonotonicId::ZERO, "not yet committed");

        ledger.resolve("chat", "s1").unwrap();
        assert_eq!(ledger.current("chat").unwrap(), MonotonicId(1));
        assert!(ledger.pending("chat").unwrap().is_empty());

        assert_eq!(ledger.next_id("chat", "s2").unwrap(), MonotonicId(2));
    }

    #[test]
    fn scopes_are_independent() {
        let (_dir, ledger) = ledger();
        for session in ["a", "b", "c"] {
            ledger.next_id("chat", session).unwrap();
            ledger.resolve("chat", session).unwrap();
        }
        assert_eq!(ledger.next_id("summary", "x").unwrap(), MonotonicId(1));
        assert_eq!(ledger.current("chat").unwrap(), MonotonicId(3));
    }

    #[test]
    fn second_allocation_while_pending_is_corruption() {
        let (_dir, ledger) = ledger();
        ledger.next_id("chat", "lost").unwrap();
        let err = ledger.next_id("chat", "other").unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn recover_abandons_single_orphan() {
        let (dir, ledger) = ledger();
        ledger.next_id("chat", "a").unwrap();
        ledger.resolve("chat", "a").unwrap();
        ledger.next_id("chat", "crashed").unwrap();

        let reopened = Ledger::open(dir.path()).unwrap();
        let report = reopened.recover().unwrap();
        assert_eq!(report.abandoned.len(), 1);
        assert_eq!(report.abandoned[0].id, MonotonicId(2));
        assert_eq!(reopened.current("chat").unwrap(), MonotonicId(1));
        assert!(reopened.pending("chat").unwrap().is_empty());
    }

    #[test]
    fn recover_refuses_multiple_orphans_for_one_scope() {
        let (dir, ledger) = ledger();
        write_atomic(&dir.path().join("chat.one.pending"), MonotonicId(1)).unwrap();
        write_atomic(&dir.path().join("chat.two.pending"), MonotonicId(1)).unwrap();

        let err = ledger.recover().unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(ledger.pending("chat").unwrap().len(), 2, "nothing deleted");
    }

    #[test]
    fn recover_removes_temp_files() {
        let (dir, ledger) = ledger();
        fs::write(dir.path().join("chat.ledger.tmp"), "garbage").unwrap();
        let report = ledger.recover().unwrap();
        assert_eq!(report.temp_files_removed, 1);
        assert!(!dir.path().join("chat.ledger.tmp").exists());
    }

    #[test]
    fn resolve_without_pending_is_corruption() {
        let (_dir, ledger) = ledger();
        assert!(ledger.resolve("chat", "nobody").unwrap_err().is_corruption());
    }

    #[test]
    fn abandon_leaves_gap_free_counter() {
        let (_dir, ledger) = ledger();
        ledger.next_id("chat", "a").unwrap();
        ledger.abandon("chat", "a").unwrap();
        assert_eq!(ledger.current("chat").unwrap(), MonotonicId::ZERO);
        assert!(ledger.pending("chat").unwrap().is_empty());
    }

    #[test]
    fn raise_floor_never_lowers() {
        let (_dir, ledger) = ledger();
        assert!(ledger.raise_floor("chat", MonotonicId(7)).unwrap());
        assert!(!ledger.raise_floor("chat", MonotonicId(3)).unwrap());
        assert_eq!(ledger.current("chat").unwrap(), MonotonicId(7));
        assert_eq!(ledger.next_id("chat", "s").unwrap(), MonotonicId(8));
    }

    #[test]
    fn scope_with_separator_is_rejected() {
        let (_dir, ledger) = ledger();
        assert!(matches!(
            ledger.current("chat.old"),
            Err(StoreError::InvalidScope(_))
        ));
    }

    #[test]
    fn unreadable_ledger_file_is_corruption() {
        let (dir, ledger) = ledger();
        fs::write(dir.path().join("chat.ledger"), "not a number").unwrap();
        assert!(ledger.current("chat").unwrap_err().is_corruption());
    }
}
