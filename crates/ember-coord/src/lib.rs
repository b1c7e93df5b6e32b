//! Per-database-file concurrency and notification hub.
//!
//! For each database file exactly one [`Coordinator`] is live at a time. It
//! mediates handle caching across openers on the same thread, configuration
//! compatibility across concurrent openers, commit wake-ups, and the
//! lifecycle of background [`ChangeNotifier`]s: advancing them from their
//! origin snapshot to the latest committed version, computing diffs, and
//! delivering results on each handle's own thread.
//!
//! The storage engine under the coordinator is opaque; see `ember-store` for
//! the seam it is driven through.

mod commit_notify;
pub mod config;
pub mod coordinator;
pub mod handle;
pub mod notifier;
pub mod registry;

use std::sync::Arc;

use ember_error::Result;

pub use config::CoordConfig;
pub use coordinator::Coordinator;
pub use handle::Handle;
pub use notifier::ChangeNotifier;
pub use registry::{clear_all_caches, get_coordinator, get_existing_coordinator};

/// Open a handle for `config.path`, creating the path's coordinator on
/// first use.
pub fn open(config: CoordConfig) -> Result<Arc<Handle>> {
    let coordinator = registry::get_coordinator(&config.path);
    coordinator.get_handle(config)
}
