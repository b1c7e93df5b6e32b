//! `clear_all_caches` runs in its own test binary: it empties the
//! process-wide registry, which would race with unrelated tests sharing the
//! process.

use std::sync::Arc;

use tempfile::tempdir;

use ember_coord::{clear_all_caches, get_existing_coordinator, open, CoordConfig, Coordinator};
use ember_testkit::{MemoryEngine, RecordingNotifier};

#[test]
fn clear_all_caches_races_cleanly_with_notification_cycles() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("notes.ember");
    let engine = Arc::new(MemoryEngine::new());
    let config = CoordConfig::new(&path, engine.clone());

    let handle = open(config).unwrap();
    let notifier = RecordingNotifier::new(&handle, &[0]);
    Coordinator::register_notifier(notifier).unwrap();

    let coordinator = get_existing_coordinator(&path).unwrap();

    // Hammer notification cycles from another thread while the cache is
    // cleared; both sides must finish without deadlocking.
    let churn = {
        let coordinator = Arc::clone(&coordinator);
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            for row in 0..50 {
                engine.commit_modification(0, row);
                coordinator.on_change();
            }
        })
    };

    clear_all_caches();
    churn.join().unwrap();

    assert!(handle.is_closed());
    assert!(get_existing_coordinator(&path).is_none());
}
