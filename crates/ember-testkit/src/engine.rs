//! In-memory MVCC storage engine.
//!
//! Keeps every commit as an explicit per-table change record, tracks which
//! versions read transactions have pinned, and supports fault injection for
//! the coordinator's error paths. History is never reclaimed, so any version
//! from the base onward is readable.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use ember_error::{EmberError, Result};
use ember_store::{OpenedStore, ReadTransaction, StorageEngine, TransactionChangeInfo};
use ember_types::{ChangeSet, RowKey, VersionId};

const BASE_VERSION: VersionId = VersionId::new(1, 0);

struct ListDelta {
    table: usize,
    column: usize,
    row: RowKey,
    changes: ChangeSet,
}

struct CommitRecord {
    version: VersionId,
    tables: Vec<(usize, ChangeSet)>,
    lists: Vec<ListDelta>,
}

#[derive(Default)]
struct EngineState {
    commits: Vec<CommitRecord>,
    pins: BTreeMap<u64, usize>,
    fail_next_open: bool,
    background_read_only: bool,
    open_count: usize,
}

impl EngineState {
    fn latest(&self) -> VersionId {
        self.commits.last().map_or(BASE_VERSION, |commit| commit.version)
    }

    fn is_available(&self, version: VersionId) -> bool {
        version.index() == 0
            && version.version() >= BASE_VERSION.version()
            && version.version() <= self.latest().version()
    }

    fn pin(&mut self, version: VersionId) {
        *self.pins.entry(version.version()).or_insert(0) += 1;
    }

    fn unpin(&mut self, version: VersionId) {
        if let Some(count) = self.pins.get_mut(&version.version()) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&version.version());
            }
        }
    }
}

/// An in-memory engine for one imaginary file.
///
/// Wrap in `Arc` and pass as the configuration's engine; keep a second
/// reference for committing and for inspecting pins.
pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
        }
    }

    /// Append a commit touching the given tables.
    pub fn commit(&self, tables: Vec<(usize, ChangeSet)>) -> VersionId {
        self.commit_with_lists(tables, Vec::new())
    }

    /// Append a commit with both table- and list-level changes.
    pub fn commit_with_lists(
        &self,
        tables: Vec<(usize, ChangeSet)>,
        lists: Vec<(usize, usize, RowKey, ChangeSet)>,
    ) -> VersionId {
        let mut state = self.state.lock();
        let version = VersionId::new(state.latest().version() + 1, 0);
        state.commits.push(CommitRecord {
            version,
            tables,
            lists: lists
                .into_iter()
                .map(|(table, column, row, changes)| ListDelta {
                    table,
                    column,
                    row,
                    changes,
                })
                .collect(),
        });
        version
    }

    /// Append a commit modifying one row of one table.
    pub fn commit_modification(&self, table: usize, row: u64) -> VersionId {
        let mut changes = ChangeSet::new();
        changes.record_modification(RowKey::new(row));
        self.commit(vec![(table, changes)])
    }

    /// Append a commit inserting one row into one table.
    pub fn commit_insertion(&self, table: usize, row: u64) -> VersionId {
        let mut changes = ChangeSet::new();
        changes.record_insertion(RowKey::new(row));
        self.commit(vec![(table, changes)])
    }

    /// Append a commit deleting one row from one table.
    pub fn commit_deletion(&self, table: usize, row: u64) -> VersionId {
        let mut changes = ChangeSet::new();
        changes.record_deletion(RowKey::new(row));
        self.commit(vec![(table, changes)])
    }

    pub fn latest_version(&self) -> VersionId {
        self.state.lock().latest()
    }

    /// Versions currently pinned by at least one read, ascending.
    pub fn pinned_versions(&self) -> Vec<u64> {
        self.state.lock().pins.keys().copied().collect()
    }

    /// Number of active reads pinning `version`.
    pub fn pin_count(&self, version: u64) -> usize {
        self.state.lock().pins.get(&version).copied().unwrap_or(0)
    }

    /// Make the next `open` fail with a simulated I/O error.
    pub fn set_fail_next_open(&self, fail: bool) {
        self.state.lock().fail_next_open = fail;
    }

    /// Make subsequent opens report read-only sessions.
    pub fn set_open_read_only(&self, read_only: bool) {
        self.state.lock().background_read_only = read_only;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemoryEngine {
    fn open(&self) -> Result<OpenedStore> {
        let mut state = self.state.lock();
        state.open_count += 1;
        if state.fail_next_open {
            state.fail_next_open = false;
            return Err(EmberError::Io(std::io::Error::other(
                "simulated open failure",
            )));
        }
        let read_only = state.background_read_only;
        Ok(OpenedStore {
            transaction: Arc::new(MemoryTransaction {
                state: Arc::clone(&self.state),
                read: Mutex::new(None),
            }),
            read_only,
        })
    }
}

/// A read transaction over a [`MemoryEngine`].
pub struct MemoryTransaction {
    state: Arc<Mutex<EngineState>>,
    read: Mutex<Option<VersionId>>,
}

impl ReadTransaction for MemoryTransaction {
    fn begin_read(&self, version: Option<VersionId>) -> Result<VersionId> {
        let mut read = self.read.lock();
        if read.is_some() {
            return Err(EmberError::internal("begin_read with a read already active"));
        }
        let mut state = self.state.lock();
        let target = version.unwrap_or_else(|| state.latest());
        if !state.is_available(target) {
            return Err(EmberError::SnapshotUnavailable {
                version: target.version(),
            });
        }
        state.pin(target);
        *read = Some(target);
        Ok(target)
    }

    fn end_read(&self) {
        let mut read = self.read.lock();
        if let Some(version) = read.take() {
            self.state.lock().unpin(version);
        }
    }

    fn current_version(&self) -> Option<VersionId> {
        *self.read.lock()
    }

    fn advance(
        &self,
        info: &mut TransactionChangeInfo,
        target: Option<VersionId>,
    ) -> Result<VersionId> {
        let mut read = self.read.lock();
        let Some(current) = *read else {
            return Err(EmberError::internal("advance without an active read"));
        };
        let mut state = self.state.lock();
        let target = target.unwrap_or_else(|| state.latest());
        if !state.is_available(target) {
            return Err(EmberError::SnapshotUnavailable {
                version: target.version(),
            });
        }
        if target < current {
            return Err(EmberError::internal("cannot advance a read backwards"));
        }

        for commit in state
            .commits
            .iter()
            .filter(|commit| commit.version > current && commit.version <= target)
        {
            for (table, changes) in &commit.tables {
                info.table_mut(*table).merge(changes);
            }
            for delta in &commit.lists {
                for entry in &info.lists {
                    if entry.table == delta.table
                        && entry.column == delta.column
                        && entry.row == delta.row
                    {
                        entry.changes.lock().merge(&delta.changes);
                    }
                }
            }
        }

        state.unpin(current);
        state.pin(target);
        *read = Some(target);
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_read_pins_latest_by_default() {
        let engine = MemoryEngine::new();
        engine.commit_modification(0, 1);
        let opened = engine.open().unwrap();
        let version = opened.transaction.begin_read(None).unwrap();
        assert_eq!(version, VersionId::new(2, 0));
        assert_eq!(engine.pinned_versions(), vec![2]);

        opened.transaction.end_read();
        assert!(engine.pinned_versions().is_empty());
    }

    #[test]
    fn advance_folds_intervening_commits() {
        let engine = MemoryEngine::new();
        let opened = engine.open().unwrap();
        opened.transaction.begin_read(None).unwrap();

        engine.commit_insertion(0, 10);
        engine.commit_modification(0, 11);
        engine.commit_modification(1, 12);

        let mut info = TransactionChangeInfo::default();
        let version = opened.transaction.advance(&mut info, None).unwrap();
        assert_eq!(version, VersionId::new(4, 0));
        assert!(info.tables[0].contains_insertion(RowKey::new(10)));
        assert!(info.tables[0].contains_modification(RowKey::new(11)));
        assert!(info.tables[1].contains_modification(RowKey::new(12)));
    }

    #[test]
    fn advance_to_intermediate_version_stops_there() {
        let engine = MemoryEngine::new();
        let opened = engine.open().unwrap();
        opened.transaction.begin_read(None).unwrap();

        let middle = engine.commit_insertion(0, 1);
        engine.commit_insertion(0, 2);

        let mut info = TransactionChangeInfo::default();
        opened.transaction.advance(&mut info, Some(middle)).unwrap();
        assert!(info.tables[0].contains_insertion(RowKey::new(1)));
        assert!(!info.tables[0].contains_insertion(RowKey::new(2)));
        assert_eq!(opened.transaction.current_version(), Some(middle));
    }

    #[test]
    fn fail_next_open_is_one_shot() {
        let engine = MemoryEngine::new();
        engine.set_fail_next_open(true);
        assert!(engine.open().is_err());
        assert!(engine.open().is_ok());
    }

    #[test]
    fn old_snapshots_stay_readable() {
        let engine = MemoryEngine::new();
        engine.commit_modification(0, 1);
        engine.commit_modification(0, 2);

        let opened = engine.open().unwrap();
        let version = opened.transaction.begin_read(Some(VersionId::new(1, 0))).unwrap();
        assert_eq!(version, BASE_VERSION);
    }
}
