//! End-to-end coordinator scenarios against the in-memory engine.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use ember_coord::{
    get_coordinator, get_existing_coordinator, open, CoordConfig, Coordinator,
};
use ember_store::TransactionChangeInfo;
use ember_testkit::{Delivery, MemoryEngine, NotifySignal, RecordingNotifier};
use ember_types::{ChangeSet, RowKey, SchemaVersion, VersionId};

fn setup() -> (TempDir, PathBuf, Arc<MemoryEngine>, CoordConfig) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("notes.ember");
    let engine = Arc::new(MemoryEngine::new());
    let config = CoordConfig::new(&path, engine.clone());
    (dir, path, engine, config)
}

fn table_changes(delivery: &Delivery, table: usize) -> ChangeSet {
    delivery
        .tables
        .iter()
        .find(|(index, _)| *index == table)
        .map(|(_, changes)| changes.clone())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Registry and handle caching
// ---------------------------------------------------------------------------

#[test]
fn one_live_coordinator_per_path() {
    let (_dir, path, _engine, _config) = setup();

    let first = get_coordinator(&path);
    let again = get_coordinator(&path);
    assert!(Arc::ptr_eq(&first, &again));

    drop(again);
    drop(first);
    assert!(get_existing_coordinator(&path).is_none());

    // A fresh coordinator can be created once the old one is fully gone.
    let fresh = get_coordinator(&path);
    assert_eq!(fresh.handle_count(), 0);
}

#[test]
fn cached_open_returns_same_handle() {
    let (_dir, path, _engine, config) = setup();

    let first = open(config.clone()).unwrap();
    let second = open(config).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let coordinator = get_existing_coordinator(&path).unwrap();
    assert_eq!(coordinator.handle_count(), 1);
}

#[test]
fn cache_is_per_thread() {
    let (_dir, path, _engine, config) = setup();

    let first = open(config.clone()).unwrap();
    let second = std::thread::spawn(move || open(config).unwrap())
        .join()
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    let coordinator = get_existing_coordinator(&path).unwrap();
    assert_eq!(coordinator.handle_count(), 2);
    second.close();
}

#[test]
fn uncached_opens_get_distinct_handles() {
    let (_dir, _path, _engine, config) = setup();

    let first = open(config.clone().with_cache(false)).unwrap();
    let second = open(config.with_cache(false)).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
}

#[test]
fn get_handle_cached_reuses_adopted_config() {
    let (_dir, path, _engine, config) = setup();

    let first = open(config.with_schema_version(SchemaVersion::new(4))).unwrap();
    let coordinator = get_existing_coordinator(&path).unwrap();
    let second = coordinator.get_handle_cached().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.config().schema_version, SchemaVersion::new(4));
}

// ---------------------------------------------------------------------------
// Configuration compatibility
// ---------------------------------------------------------------------------

#[test]
fn read_only_reopen_with_write_access_is_rejected() {
    let (_dir, _path, _engine, config) = setup();

    let _reader = open(config.clone().with_read_only(true)).unwrap();
    let err = open(config).unwrap_err();
    assert!(err.is_mismatched_config());
    assert!(err.to_string().contains("read permissions"));
}

#[test]
fn in_memory_mismatch_is_rejected() {
    let (_dir, _path, _engine, config) = setup();

    let _first = open(config.clone()).unwrap();
    let err = open(config.with_in_memory(true).with_cache(false)).unwrap_err();
    assert!(err.to_string().contains("in-memory"));
}

#[test]
fn read_only_config_is_renegotiable_once_handles_close() {
    let (_dir, _path, _engine, config) = setup();

    let reader = open(config.clone().with_read_only(true)).unwrap();
    reader.close();
    drop(reader);

    // No live handles on a read-only path: the next open adopts its own
    // config instead of checking against the old one.
    let writer = open(config).unwrap();
    assert!(!writer.config().read_only);
}

#[test]
fn schema_version_is_advisory_for_undeclared_openers() {
    let (_dir, _path, _engine, config) = setup();

    let _first = open(
        config
            .clone()
            .with_schema_version(SchemaVersion::new(7))
            .with_cache(false),
    )
    .unwrap();
    // NOT_VERSIONED skips the check; a conflicting declared version fails.
    assert!(open(config.clone().with_cache(false)).is_ok());
    let err = open(
        config
            .with_schema_version(SchemaVersion::new(8))
            .with_cache(false),
    )
    .unwrap_err();
    assert!(err.to_string().contains("schema version"));
}

#[test]
fn schema_version_accessor_tracks_live_handles() {
    let (_dir, path, _engine, config) = setup();

    let coordinator = get_coordinator(&path);
    assert_eq!(coordinator.schema_version(), None);

    let handle = coordinator
        .get_handle(config.with_schema_version(SchemaVersion::new(2)))
        .unwrap();
    assert_eq!(coordinator.schema_version(), Some(SchemaVersion::new(2)));

    coordinator.update_schema_version(SchemaVersion::new(3));
    assert_eq!(coordinator.schema_version(), Some(SchemaVersion::new(3)));

    handle.close();
    assert_eq!(coordinator.schema_version(), None);
}

// ---------------------------------------------------------------------------
// Version pinning
// ---------------------------------------------------------------------------

#[test]
fn advancer_pins_minimum_staged_origin() {
    let (_dir, _path, engine, config) = setup();

    let old_handle = open(config.clone().with_cache(false)).unwrap();
    assert_eq!(old_handle.current_version(), Some(VersionId::new(1, 0)));

    engine.commit_modification(0, 1);
    let new_handle = open(config.with_cache(false)).unwrap();
    assert_eq!(new_handle.current_version(), Some(VersionId::new(2, 0)));

    // Register the newer origin first; the older one must drag the pin back.
    let newer = RecordingNotifier::new(&new_handle, &[0]);
    Coordinator::register_notifier(newer).unwrap();
    assert_eq!(engine.pin_count(2), 2);

    let older = RecordingNotifier::new(&old_handle, &[0]);
    Coordinator::register_notifier(older).unwrap();
    assert_eq!(engine.pin_count(1), 2);
    assert_eq!(engine.pin_count(2), 1);
}

// ---------------------------------------------------------------------------
// The notification cycle
// ---------------------------------------------------------------------------

#[test]
fn notifier_at_latest_version_gets_empty_first_delivery() {
    let (_dir, path, _engine, config) = setup();

    let handle = open(config).unwrap();
    let notifier = RecordingNotifier::new(&handle, &[0]);
    Coordinator::register_notifier(Arc::clone(&notifier) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    let coordinator = get_existing_coordinator(&path).unwrap();
    coordinator.on_change();
    handle.advance_to_ready().unwrap();

    let deliveries = notifier.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].version, handle.current_version());
    assert!(table_changes(&deliveries[0], 0).is_empty());
}

#[test]
fn active_notifiers_see_merged_commits() {
    let (_dir, path, engine, config) = setup();

    let handle = open(config).unwrap();
    let first = RecordingNotifier::new(&handle, &[0]);
    let second = RecordingNotifier::new(&handle, &[0]);
    Coordinator::register_notifier(Arc::clone(&first) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();
    Coordinator::register_notifier(Arc::clone(&second) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    let coordinator = get_existing_coordinator(&path).unwrap();
    coordinator.on_change();
    handle.advance_to_ready().unwrap();

    engine.commit_modification(0, 5);
    engine.commit_insertion(0, 6);
    coordinator.on_change();
    handle.advance_to_ready().unwrap();

    for notifier in [&first, &second] {
        let deliveries = notifier.deliveries();
        assert_eq!(deliveries.len(), 2);
        let changes = table_changes(&deliveries[1], 0);
        assert!(changes.contains_modification(RowKey::new(5)));
        assert!(changes.contains_insertion(RowKey::new(6)));
        assert_eq!(deliveries[1].version, Some(VersionId::new(3, 0)));
    }
}

#[test]
fn staged_notifiers_see_changes_from_their_own_origin() {
    let (_dir, path, engine, config) = setup();

    engine.commit_insertion(0, 20);
    engine.commit_insertion(0, 30);
    let old_handle = open(config.clone().with_cache(false)).unwrap();
    assert_eq!(old_handle.current_version(), Some(VersionId::new(3, 0)));

    engine.commit_insertion(0, 40);
    engine.commit_insertion(0, 50);
    let new_handle = open(config.with_cache(false)).unwrap();

    // An already-active notifier at version 5.
    let active = RecordingNotifier::new(&new_handle, &[0]);
    Coordinator::register_notifier(Arc::clone(&active) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();
    let coordinator = get_existing_coordinator(&path).unwrap();
    coordinator.on_change();
    new_handle.advance_to_ready().unwrap();

    // Two staged notifiers with distinct origins.
    let staged_old = RecordingNotifier::new(&old_handle, &[0]);
    let staged_new = RecordingNotifier::new(&new_handle, &[0]);
    Coordinator::register_notifier(Arc::clone(&staged_old) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();
    Coordinator::register_notifier(Arc::clone(&staged_new) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    engine.commit_insertion(0, 60);
    engine.commit_insertion(0, 70);
    coordinator.on_change();

    old_handle.advance_to_ready().unwrap();
    new_handle.advance_to_ready().unwrap();

    // The old-origin notifier sees everything since version 3.
    let old_changes = table_changes(&staged_old.deliveries()[0], 0);
    for row in [40, 50, 60, 70] {
        assert!(old_changes.contains_insertion(RowKey::new(row)), "row {row}");
    }
    assert!(!old_changes.contains_insertion(RowKey::new(30)));

    // The new-origin notifier and the active one see only commits 6 and 7.
    for notifier in [&staged_new, &active] {
        let delivery = notifier.deliveries().last().cloned().unwrap();
        let changes = table_changes(&delivery, 0);
        assert!(changes.contains_insertion(RowKey::new(60)));
        assert!(changes.contains_insertion(RowKey::new(70)));
        assert!(!changes.contains_insertion(RowKey::new(50)));
    }

    // The advancer's read was released at cycle end; with both handles now
    // advanced, only version 7 is still pinned (handles plus the main
    // notifier transaction).
    assert_eq!(engine.pinned_versions(), vec![7]);
}

#[test]
fn diff_matches_direct_storage_walk() {
    let (_dir, path, engine, config) = setup();

    let handle = open(config.clone()).unwrap();
    let origin = handle.current_version();
    let notifier = RecordingNotifier::new(&handle, &[0]);
    Coordinator::register_notifier(Arc::clone(&notifier) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    engine.commit_insertion(0, 1);
    engine.commit_deletion(0, 1);
    engine.commit_insertion(0, 2);
    engine.commit_modification(0, 2);

    let coordinator = get_existing_coordinator(&path).unwrap();
    coordinator.on_change();
    handle.advance_to_ready().unwrap();

    // Walk the same window directly through the engine.
    let probe = config.engine.open().unwrap();
    probe.transaction.begin_read(origin).unwrap();
    let mut expected = TransactionChangeInfo::default();
    probe.transaction.advance(&mut expected, None).unwrap();

    let delivered = table_changes(&notifier.deliveries()[0], 0);
    assert_eq!(delivered, expected.tables[0]);
}

#[test]
fn list_observers_accumulate_list_changes() {
    let (_dir, path, engine, config) = setup();

    let handle = open(config).unwrap();
    let notifier =
        RecordingNotifier::with_lists(&handle, &[0], &[(0, 2, RowKey::new(9))]);
    Coordinator::register_notifier(Arc::clone(&notifier) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    let coordinator = get_existing_coordinator(&path).unwrap();
    coordinator.on_change();
    handle.advance_to_ready().unwrap();

    let mut link_changes = ChangeSet::new();
    link_changes.record_insertion(RowKey::new(100));
    engine.commit_with_lists(Vec::new(), vec![(0, 2, RowKey::new(9), link_changes)]);

    coordinator.on_change();
    handle.advance_to_ready().unwrap();

    let delivery = notifier.deliveries().last().cloned().unwrap();
    assert!(delivery.lists[0].contains_insertion(RowKey::new(100)));
}

#[test]
fn stale_prepared_results_are_not_delivered() {
    let (_dir, path, engine, config) = setup();

    let handle = open(config).unwrap();
    let notifier = RecordingNotifier::new(&handle, &[0]);
    Coordinator::register_notifier(Arc::clone(&notifier) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    let coordinator = get_existing_coordinator(&path).unwrap();
    coordinator.on_change();
    handle.advance_to_ready().unwrap();
    assert_eq!(notifier.deliveries().len(), 1);

    // Results prepared for version 2...
    engine.commit_modification(0, 1);
    coordinator.on_change();

    // ...but the handle advances past them on its own before delivery.
    engine.commit_modification(0, 2);
    let mut scratch = TransactionChangeInfo::default();
    handle.transaction().advance(&mut scratch, None).unwrap();

    handle.advance_to_ready().unwrap();
    assert_eq!(notifier.deliveries().len(), 1);
}

#[test]
fn process_available_async_is_idempotent() {
    let (_dir, path, engine, config) = setup();

    let handle = open(config).unwrap();
    let notifier = RecordingNotifier::new(&handle, &[0]);
    Coordinator::register_notifier(Arc::clone(&notifier) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    let coordinator = get_existing_coordinator(&path).unwrap();
    coordinator.on_change();
    handle.advance_to_ready().unwrap();

    engine.commit_modification(0, 3);
    coordinator.on_change();
    handle.advance_to_ready().unwrap();
    let delivered = notifier.deliveries().len();

    handle.process_available_async();
    handle.process_available_async();
    assert_eq!(notifier.deliveries().len(), delivered);
}

#[test]
fn closed_handle_notifiers_are_reaped_with_release_data() {
    let (_dir, path, engine, config) = setup();

    let handle = open(config.with_cache(false)).unwrap();
    let notifier = RecordingNotifier::new(&handle, &[0]);
    Coordinator::register_notifier(Arc::clone(&notifier) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    let coordinator = get_existing_coordinator(&path).unwrap();
    coordinator.on_change();

    handle.close();
    engine.commit_modification(0, 1);
    coordinator.on_change();

    assert!(notifier.is_released());
    // Both background reads were released along with the handle's.
    assert!(engine.pinned_versions().is_empty());
}

#[test]
fn callbacks_may_reenter_the_coordinator() {
    let (_dir, path, _engine, config) = setup();

    let handle = open(config).unwrap();
    let notifier = RecordingNotifier::new(&handle, &[0]);

    let reentry_result: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
    let weak_handle = Arc::downgrade(&handle);
    let result_slot = Arc::clone(&reentry_result);
    notifier.set_on_callback(move |_delivery| {
        let Some(handle) = weak_handle.upgrade() else {
            return;
        };
        let nested = RecordingNotifier::new(&handle, &[1]);
        let outcome = Coordinator::register_notifier(nested).is_ok();
        *result_slot.lock().unwrap() = Some(outcome);
    });
    Coordinator::register_notifier(Arc::clone(&notifier) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    let coordinator = get_existing_coordinator(&path).unwrap();
    coordinator.on_change();
    handle.advance_to_ready().unwrap();

    assert_eq!(*reentry_result.lock().unwrap(), Some(true));
}

// ---------------------------------------------------------------------------
// Async error latching
// ---------------------------------------------------------------------------

#[test]
fn background_open_failure_latches_and_drains_with_error() {
    let (_dir, path, engine, config) = setup();

    let handle = open(config).unwrap();
    engine.set_fail_next_open(true);

    let notifier = RecordingNotifier::new(&handle, &[0]);
    Coordinator::register_notifier(Arc::clone(&notifier) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    // Registration keeps working after the latch.
    let second = RecordingNotifier::new(&handle, &[0]);
    Coordinator::register_notifier(Arc::clone(&second) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    let coordinator = get_existing_coordinator(&path).unwrap();
    coordinator.on_change();
    handle.process_available_async();

    for notifier in [&notifier, &second] {
        let deliveries = notifier.deliveries();
        assert_eq!(deliveries.len(), 1);
        let error = deliveries[0].error.as_deref().unwrap();
        assert!(error.contains("simulated open failure"), "{error}");
        assert_eq!(notifier.run_count(), 0);
    }

    // The error stays latched: every later delivery pass hands it over again.
    handle.process_available_async();
    assert_eq!(notifier.deliveries().len(), 2);
}

// ---------------------------------------------------------------------------
// clear_cache and commit notification plumbing
// ---------------------------------------------------------------------------

#[test]
fn clear_cache_closes_every_handle_once() {
    let (_dir, path, _engine, config) = setup();

    let first = open(config.clone().with_cache(false)).unwrap();
    let second = open(config.with_cache(false)).unwrap();
    let coordinator = get_existing_coordinator(&path).unwrap();
    assert_eq!(coordinator.handle_count(), 2);

    coordinator.clear_cache();
    assert!(first.is_closed());
    assert!(second.is_closed());
    assert_eq!(coordinator.handle_count(), 0);
    assert!(get_existing_coordinator(&path).is_none());

    // Idempotent.
    coordinator.clear_cache();
}

#[test]
fn send_commit_notifications_wakes_consumers() {
    let (_dir, path, engine, config) = setup();

    let handle = open(config).unwrap();
    let signal = NotifySignal::install(&handle);
    let notifier = RecordingNotifier::new(&handle, &[0]);
    Coordinator::register_notifier(Arc::clone(&notifier) as Arc<dyn ember_coord::ChangeNotifier>).unwrap();

    let coordinator = get_existing_coordinator(&path).unwrap();
    engine.commit_insertion(0, 8);
    coordinator.send_commit_notifications();

    assert!(signal.wait(Duration::from_secs(5)), "no wake-up arrived");
    handle.advance_to_ready().unwrap();

    let delivery = notifier.deliveries().last().cloned().unwrap();
    assert!(table_changes(&delivery, 0).contains_insertion(RowKey::new(8)));
}

#[test]
#[should_panic(expected = "read-only coordinator")]
fn send_commit_notifications_on_read_only_coordinator_panics() {
    let (_dir, path, _engine, config) = setup();

    let _handle = open(config.with_read_only(true)).unwrap();
    let coordinator = get_existing_coordinator(&path).unwrap();
    coordinator.send_commit_notifications();
}
