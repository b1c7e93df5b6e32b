//! Open configuration and compatibility enforcement.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use ember_error::{EmberError, Result};
use ember_store::StorageEngine;
use ember_types::SchemaVersion;

/// Configuration for opening a database file.
///
/// The first substantive opener's configuration is adopted by the path's
/// coordinator; `read_only`, `in_memory`, `encryption_key`, and
/// `schema_version` are then immutable while any handle is live, and later
/// openers must match them.
#[derive(Clone)]
pub struct CoordConfig {
    pub path: PathBuf,
    pub read_only: bool,
    pub in_memory: bool,
    /// Whether openers on the same thread may share one handle.
    pub cache: bool,
    pub encryption_key: Option<Vec<u8>>,
    pub schema_version: SchemaVersion,
    /// Whether to watch the file for commits and wake consumers.
    pub automatic_change_notifications: bool,
    /// The storage engine backing this path. Not part of the compatibility
    /// check; every opener of one path supplies the same engine.
    pub engine: Arc<dyn StorageEngine>,
}

impl CoordConfig {
    /// A writable, cached, auto-notifying configuration for `path`.
    pub fn new(path: impl Into<PathBuf>, engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            in_memory: false,
            cache: true,
            encryption_key: None,
            schema_version: SchemaVersion::NOT_VERSIONED,
            automatic_change_notifications: true,
            engine,
        }
    }

    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn with_in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_encryption_key(mut self, key: Option<Vec<u8>>) -> Self {
        self.encryption_key = key;
        self
    }

    #[must_use]
    pub fn with_schema_version(mut self, version: SchemaVersion) -> Self {
        self.schema_version = version;
        self
    }

    #[must_use]
    pub fn with_automatic_change_notifications(mut self, enabled: bool) -> Self {
        self.automatic_change_notifications = enabled;
        self
    }

    /// Check that `incoming` may re-open the file `self` was adopted for.
    pub(crate) fn check_compatible(&self, incoming: &CoordConfig) -> Result<()> {
        if self.read_only != incoming.read_only {
            return Err(self.mismatch("already opened with different read permissions"));
        }
        if self.in_memory != incoming.in_memory {
            return Err(self.mismatch("already opened with different in-memory settings"));
        }
        if self.encryption_key != incoming.encryption_key {
            return Err(self.mismatch("already opened with a different encryption key"));
        }
        if self.schema_version != incoming.schema_version && incoming.schema_version.is_versioned()
        {
            return Err(self.mismatch("already opened with a different schema version"));
        }
        Ok(())
    }

    fn mismatch(&self, what: &str) -> EmberError {
        EmberError::mismatched(format!("'{}' {what}", self.path.display()))
    }
}

impl fmt::Debug for CoordConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordConfig")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("in_memory", &self.in_memory)
            .field("cache", &self.cache)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .field("schema_version", &self.schema_version)
            .field(
                "automatic_change_notifications",
                &self.automatic_change_notifications,
            )
            .finish_non_exhaustive()
    }
}
