//! Collection change sets and their composition algebra.
//!
//! A [`ChangeSet`] records which rows of a table (or entries of a list) were
//! inserted, deleted, or modified across some window of commits. Change sets
//! compose: folding the per-commit sets for versions `(a, b]` and `(b, c]`
//! with [`ChangeSet::merge`] yields the set for `(a, c]`.

use std::collections::BTreeSet;
use std::fmt;

/// Stable identity of a row within a table.
///
/// Row keys survive compaction and are never reused within the lifetime of a
/// file, so change sets compose by key identity rather than by position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct RowKey(u64);

impl RowKey {
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row#{}", self.0)
    }
}

/// Accumulated insertions, deletions, and modifications over a commit window.
///
/// The three sets are kept pairwise disjoint: a row is in at most one of them
/// at any time. Recording and merging both preserve that invariant.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    insertions: BTreeSet<RowKey>,
    deletions: BTreeSet<RowKey>,
    modifications: BTreeSet<RowKey>,
}

impl ChangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty() && self.deletions.is_empty() && self.modifications.is_empty()
    }

    /// Record that `row` was inserted.
    ///
    /// A delete-then-insert of the same key within the window folds to a
    /// modification: the consumer saw the row before and sees it after.
    pub fn record_insertion(&mut self, row: RowKey) {
        if self.deletions.remove(&row) {
            self.modifications.insert(row);
        } else {
            self.modifications.remove(&row);
            self.insertions.insert(row);
        }
    }

    /// Record that `row` was deleted.
    ///
    /// An insert-then-delete within the window cancels out entirely.
    pub fn record_deletion(&mut self, row: RowKey) {
        if self.insertions.remove(&row) {
            return;
        }
        self.modifications.remove(&row);
        self.deletions.insert(row);
    }

    /// Record that `row` was modified.
    ///
    /// Modifications of rows inserted within the window fold into the
    /// insertion.
    pub fn record_modification(&mut self, row: RowKey) {
        if self.insertions.contains(&row) || self.deletions.contains(&row) {
            return;
        }
        self.modifications.insert(row);
    }

    pub fn insertions(&self) -> impl Iterator<Item = RowKey> + '_ {
        self.insertions.iter().copied()
    }

    pub fn deletions(&self) -> impl Iterator<Item = RowKey> + '_ {
        self.deletions.iter().copied()
    }

    pub fn modifications(&self) -> impl Iterator<Item = RowKey> + '_ {
        self.modifications.iter().copied()
    }

    #[must_use]
    pub fn contains_insertion(&self, row: RowKey) -> bool {
        self.insertions.contains(&row)
    }

    #[must_use]
    pub fn contains_deletion(&self, row: RowKey) -> bool {
        self.deletions.contains(&row)
    }

    #[must_use]
    pub fn contains_modification(&self, row: RowKey) -> bool {
        self.modifications.contains(&row)
    }

    /// Fold `newer` (changes for a later window) into `self`.
    ///
    /// Equivalent to having recorded `newer`'s underlying operations directly
    /// onto `self`, provided the operations were consistent with row
    /// existence at the window boundary.
    pub fn merge(&mut self, newer: &ChangeSet) {
        for &row in &newer.deletions {
            if self.insertions.remove(&row) {
                continue;
            }
            self.modifications.remove(&row);
            self.deletions.insert(row);
        }
        for &row in &newer.insertions {
            if self.deletions.remove(&row) {
                self.modifications.insert(row);
            } else {
                self.modifications.remove(&row);
                self.insertions.insert(row);
            }
        }
        for &row in &newer.modifications {
            if self.insertions.contains(&row) || self.deletions.contains(&row) {
                continue;
            }
            self.modifications.insert(row);
        }
    }

    /// Clear all three sets.
    pub fn clear(&mut self) {
        self.insertions.clear();
        self.deletions.clear();
        self.modifications.clear();
    }
}
