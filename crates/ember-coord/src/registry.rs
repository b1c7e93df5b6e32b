//! Process-wide coordinator registry.
//!
//! One live [`Coordinator`] exists per path at a time, held alive solely by
//! its handles and notifiers. The registry stores weak references; expired
//! entries are swept when a coordinator drops.
//!
//! Coordinator methods are never called while the registry lock is held,
//! other than weak-to-strong upgrades. Lock order across the crate is
//! registry → realm → notifier.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::coordinator::Coordinator;

static COORDINATORS: OnceLock<Mutex<HashMap<PathBuf, Weak<Coordinator>>>> = OnceLock::new();

fn coordinators() -> &'static Mutex<HashMap<PathBuf, Weak<Coordinator>>> {
    COORDINATORS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The coordinator for `path`, creating one if none is live.
///
/// The returned strong reference is the caller's only lifeline: the registry
/// itself keeps nothing alive.
pub fn get_coordinator(path: &Path) -> Arc<Coordinator> {
    let mut map = coordinators().lock();
    if let Some(coordinator) = map.get(path).and_then(Weak::upgrade) {
        return coordinator;
    }
    let coordinator = Arc::new(Coordinator::new(path.to_path_buf()));
    map.insert(path.to_path_buf(), Arc::downgrade(&coordinator));
    coordinator
}

/// The live coordinator for `path`, if any. Never creates.
pub fn get_existing_coordinator(path: &Path) -> Option<Arc<Coordinator>> {
    coordinators().lock().get(path).and_then(Weak::upgrade)
}

/// Close every cached handle of every live coordinator and empty the
/// registry.
pub fn clear_all_caches() {
    let snapshot: Vec<Weak<Coordinator>> = coordinators().lock().values().cloned().collect();
    // Upgrades and clear_cache run outside the registry lock; clear_cache
    // re-enters the registry to drop its own entry.
    for weak in snapshot {
        if let Some(coordinator) = weak.upgrade() {
            coordinator.clear_cache();
        }
    }
}

/// Drop `path`'s registry entry, live or not.
pub(crate) fn forget(path: &Path) {
    coordinators().lock().remove(path);
}

/// Sweep entries whose coordinator is gone.
pub(crate) fn sweep_expired() {
    coordinators()
        .lock()
        .retain(|_, weak| weak.strong_count() > 0);
}
