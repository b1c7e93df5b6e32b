//! Core vocabulary types for EmberDB's coordination layer.
//!
//! This crate defines the cross-cutting identifiers and change-set algebra
//! referenced throughout the coordinator: snapshot versions, schema versions,
//! stable row keys, and the collection change sets accumulated while a read
//! transaction is advanced between versions.

pub mod changeset;
pub mod version;

pub use changeset::{ChangeSet, RowKey};
pub use version::{SchemaVersion, VersionId};
