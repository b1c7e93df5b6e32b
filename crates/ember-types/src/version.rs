//! Snapshot and schema version identifiers.

use std::fmt;

/// Identifier for a committed snapshot of the database.
///
/// Totally ordered: `version` is the commit counter and `index` disambiguates
/// snapshots sharing a counter value (slot reuse in the storage engine's
/// version ring). While any read transaction holds a `VersionId`, the storage
/// engine keeps that snapshot readable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct VersionId {
    version: u64,
    index: u32,
}

impl VersionId {
    /// Construct a version identifier.
    #[inline]
    #[must_use]
    pub const fn new(version: u64, index: u32) -> Self {
        Self { version, index }
    }

    /// The commit counter.
    #[inline]
    #[must_use]
    pub const fn version(self) -> u64 {
        self.version
    }

    /// The slot index within the commit counter value.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.version, self.index)
    }
}

/// On-disk schema version of a database file.
///
/// [`SchemaVersion::NOT_VERSIONED`] is the sentinel an opener supplies when it
/// does not care about the schema version; compatibility checks skip it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SchemaVersion(u64);

impl SchemaVersion {
    /// Sentinel for "opener does not declare a schema version".
    pub const NOT_VERSIONED: Self = Self(u64::MAX);

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

    /// Whether this is a real version rather than the sentinel.
    #[inline]
    #[must_use]
    pub const fn is_versioned(self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_versioned() {
            write!(f, "schema#{}", self.0)
        } else {
            write!(f, "schema#unversioned")
        }
    }
}
