//! Storage-engine seam consumed by the coordinator.
//!
//! The coordinator never touches storage internals; it drives the engine
//! exclusively through [`StorageEngine`] and [`ReadTransaction`], and the
//! engine reports what changed between versions through
//! [`TransactionChangeInfo`].
//!
//! Transactions are shared as `Arc<dyn ReadTransaction>` with interior
//! mutability: a notifier attached to a transaction outlives any borrow of
//! it, and the engine guarantees the snapshot a transaction holds stays
//! readable until `end_read`.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use ember_error::Result;
use ember_types::{ChangeSet, RowKey, VersionId};

// ---------------------------------------------------------------------------
// TransactionChangeInfo
// ---------------------------------------------------------------------------

/// Changes accumulated while advancing a read transaction.
///
/// `tables` is indexed by table index and grows on demand. `lists` holds the
/// list-level observers registered by notifiers before the advance; the
/// engine folds list changes into each matching observer's accumulator.
#[derive(Debug, Default)]
pub struct TransactionChangeInfo {
    pub tables: Vec<ChangeSet>,
    pub lists: Vec<ListChangeInfo>,
}

impl TransactionChangeInfo {
    /// The change set for `table`, growing the table vector if needed.
    pub fn table_mut(&mut self, table: usize) -> &mut ChangeSet {
        if self.tables.len() <= table {
            self.tables.resize_with(table + 1, ChangeSet::default);
        }
        &mut self.tables[table]
    }
}

/// A list-level observer: the list's identity plus the accumulator shared
/// with the notifier that registered it.
#[derive(Clone)]
pub struct ListChangeInfo {
    pub table: usize,
    pub column: usize,
    pub row: RowKey,
    pub changes: Arc<Mutex<ChangeSet>>,
}

impl ListChangeInfo {
    /// Whether `self` and `other` observe the same list.
    #[must_use]
    pub fn same_list(&self, other: &ListChangeInfo) -> bool {
        self.table == other.table && self.column == other.column && self.row == other.row
    }
}

impl fmt::Debug for ListChangeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListChangeInfo")
            .field("table", &self.table)
            .field("column", &self.column)
            .field("row", &self.row)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// StorageEngine / ReadTransaction
// ---------------------------------------------------------------------------

/// A session opened against the underlying file.
///
/// `read_only` reports how the engine actually opened the session. The
/// coordinator's background machinery requires writable sessions and asserts
/// on this flag.
pub struct OpenedStore {
    pub transaction: Arc<dyn ReadTransaction>,
    pub read_only: bool,
}

/// The per-file MVCC storage engine, as seen by the coordinator.
pub trait StorageEngine: Send + Sync {
    /// Open a new session against the file.
    ///
    /// Each call returns an independent transaction; the coordinator opens
    /// one per handle plus two for its background work.
    fn open(&self) -> Result<OpenedStore>;
}

/// An MVCC read transaction pinned at a single snapshot.
///
/// At most one read is active per transaction at a time. Implementations are
/// internally synchronized; the coordinator serializes its own use.
pub trait ReadTransaction: Send + Sync {
    /// Begin a read at `version`, or at the latest committed version when
    /// `None`. Returns the pinned version.
    fn begin_read(&self, version: Option<VersionId>) -> Result<VersionId>;

    /// Release the current read, if any. The transaction object stays usable
    /// for a later `begin_read`.
    fn end_read(&self);

    /// The currently pinned version, or `None` when no read is active.
    fn current_version(&self) -> Option<VersionId>;

    /// Advance the active read to `target` (latest when `None`), folding
    /// every commit in between into `info`. Returns the new pinned version.
    fn advance(&self, info: &mut TransactionChangeInfo, target: Option<VersionId>)
        -> Result<VersionId>;
}
