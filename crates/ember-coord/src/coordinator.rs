//! The per-path coordinator: handle caching, configuration compatibility,
//! commit notification fan-out, and the background-notifier lifecycle.
//!
//! Two mutexes with disjoint responsibilities:
//!
//! - `realm`: the adopted configuration, the weak-handle set, and the commit
//!   notifier's lifecycle.
//! - `notify`: the notifier lists, the two background read transactions, and
//!   the latched async error.
//!
//! Neither lock is ever held across user-visible calls, and they are never
//! held together. Lock order with the registry is registry → realm → notify.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use ember_error::{EmberError, Result};
use ember_store::{ReadTransaction, StorageEngine, TransactionChangeInfo};
use ember_types::{SchemaVersion, VersionId};

use crate::commit_notify::CommitNotifier;
use crate::config::CoordConfig;
use crate::handle::{Handle, HandleSet};
use crate::notifier::ChangeNotifier;
use crate::registry;

/// State guarded by the realm mutex.
#[derive(Default)]
struct RealmState {
    config: Option<CoordConfig>,
    handles: HandleSet,
    commit_notifier: Option<CommitNotifier>,
}

/// State guarded by the notifier mutex.
#[derive(Default)]
struct NotifyState {
    /// Engine used for background sessions; recorded on first registration.
    engine: Option<Arc<dyn StorageEngine>>,
    /// Notifiers whose diffs are delivered on each advance.
    notifiers: Vec<Arc<dyn ChangeNotifier>>,
    /// Registered notifiers awaiting their first advance.
    new_notifiers: Vec<Arc<dyn ChangeNotifier>>,
    /// Pinned at the oldest origin among `new_notifiers`.
    advancer_tx: Option<Arc<dyn ReadTransaction>>,
    /// Pinned at the version whose changes were most recently delivered.
    notifier_tx: Option<Arc<dyn ReadTransaction>>,
    /// Latched on the first background failure; never cleared.
    async_error: Option<Arc<EmberError>>,
}

impl NotifyState {
    /// The version of the first notifier with prepared results.
    fn prepared_version(&self) -> Option<VersionId> {
        self.notifiers.iter().find_map(|notifier| notifier.version())
    }
}

/// The concurrency and notification hub for one database file.
///
/// Obtained from [`registry::get_coordinator`]; held alive by its handles
/// and notifiers.
pub struct Coordinator {
    path: PathBuf,
    realm: Mutex<RealmState>,
    notify: Mutex<NotifyState>,
}

impl Coordinator {
    pub(crate) fn new(path: PathBuf) -> Self {
        tracing::debug!(path = %path.display(), "coordinator created");
        Self {
            path,
            realm: Mutex::new(RealmState::default()),
            notify: Mutex::new(NotifyState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of registered handle entries.
    pub fn handle_count(&self) -> usize {
        self.realm.lock().handles.len()
    }

    // -----------------------------------------------------------------------
    // Handle management
    // -----------------------------------------------------------------------

    /// Open a handle for this path.
    ///
    /// The first substantive opener's configuration is adopted; later openers
    /// must match it. With `config.cache` set, an existing cache-eligible
    /// handle opened on the calling thread is returned instead of a new one.
    pub fn get_handle(self: &Arc<Self>, config: CoordConfig) -> Result<Arc<Handle>> {
        let cache_entry;
        {
            let mut state = self.realm.lock();
            let first_open = match &state.config {
                None => true,
                Some(adopted) => {
                    (!adopted.read_only && state.commit_notifier.is_none())
                        || (adopted.read_only && state.handles.is_empty())
                }
            };
            if first_open {
                state.config = Some(config.clone());
                if !config.read_only
                    && state.commit_notifier.is_none()
                    && config.automatic_change_notifications
                {
                    match CommitNotifier::spawn(Arc::downgrade(self), &config.path) {
                        Ok(notifier) => state.commit_notifier = Some(notifier),
                        Err(err) => {
                            return Err(EmberError::access(&config.path, err.to_string()))
                        }
                    }
                }
            } else {
                let adopted = state
                    .config
                    .as_ref()
                    .expect("a non-first open implies an adopted config");
                adopted.check_compatible(&config)?;
            }

            if config.cache {
                if let Some(handle) = state.handles.cached_for_current_thread() {
                    return Ok(handle);
                }
            }
            cache_entry = state.config.as_ref().is_some_and(|adopted| adopted.cache);
        }

        // Opening the session can block on I/O; no lock held here.
        let opened = config.engine.open()?;
        opened.transaction.begin_read(None)?;
        let handle = Arc::new(Handle::new(
            Arc::clone(self),
            config,
            opened.transaction,
        ));

        let mut state = self.realm.lock();
        state.handles.insert(&handle, cache_entry);
        Ok(handle)
    }

    /// Re-open using the configuration this coordinator has already adopted.
    pub fn get_handle_cached(self: &Arc<Self>) -> Result<Arc<Handle>> {
        let config = self.realm.lock().config.clone();
        match config {
            Some(config) => self.get_handle(config),
            None => Err(EmberError::internal(
                "no configuration has been adopted for this path",
            )),
        }
    }

    pub(crate) fn unregister_handle(&self, handle: &Handle) {
        let mut state = self.realm.lock();
        state.handles.remove(handle);
    }

    /// The adopted schema version, while any handle is live.
    pub fn schema_version(&self) -> Option<SchemaVersion> {
        let state = self.realm.lock();
        if state.handles.is_empty() {
            return None;
        }
        state.config.as_ref().map(|config| config.schema_version)
    }

    /// Rewrite the adopted schema version. Takes effect for handles opened
    /// after this call; live handles are unaffected.
    pub fn update_schema_version(&self, version: SchemaVersion) {
        let mut state = self.realm.lock();
        if let Some(config) = state.config.as_mut() {
            config.schema_version = version;
        }
    }

    /// Stop watching for commits, close every live handle, and drop this
    /// coordinator's registry entry.
    pub fn clear_cache(&self) {
        let (commit_notifier, to_close) = {
            let mut state = self.realm.lock();
            let commit_notifier = state.commit_notifier.take();
            let to_close = state.handles.collect_live();
            state.handles.clear();
            (commit_notifier, to_close)
        };
        // Dropping the notifier joins its worker, and the worker takes the
        // realm lock during fan-out; the join must happen unlocked.
        drop(commit_notifier);

        registry::forget(&self.path);

        // close() re-enters unregister_handle, so it cannot run under the
        // realm lock either.
        for handle in to_close {
            handle.close();
        }
    }

    /// Publish a local commit to every listener on this path.
    ///
    /// # Panics
    ///
    /// Calling this on a read-only coordinator is a programming error.
    pub fn send_commit_notifications(&self) {
        let state = self.realm.lock();
        assert!(
            state.config.as_ref().is_none_or(|config| !config.read_only),
            "send_commit_notifications called on a read-only coordinator"
        );
        if let Some(notifier) = &state.commit_notifier {
            notifier.notify_others();
        }
    }

    // -----------------------------------------------------------------------
    // Notifier registration and version pinning
    // -----------------------------------------------------------------------

    /// Stage `notifier` for the next notification cycle, pinning its origin
    /// snapshot so the storage engine cannot reclaim it.
    pub fn register_notifier(notifier: Arc<dyn ChangeNotifier>) -> Result<()> {
        let Some(version) = notifier.version() else {
            return Err(EmberError::internal("notifier has no origin version"));
        };
        let Some(handle) = notifier.handle() else {
            return Err(EmberError::internal("notifier is not bound to a live handle"));
        };
        let coordinator = Arc::clone(handle.coordinator());
        let engine = Arc::clone(&handle.config().engine);
        drop(handle);

        let mut state = coordinator.notify.lock();
        if state.engine.is_none() {
            state.engine = Some(Arc::clone(&engine));
        }
        coordinator.pin_version(&mut state, &engine, version);
        state.new_notifiers.push(notifier);
        Ok(())
    }

    /// Keep the advancer transaction pinned at the oldest staged origin.
    fn pin_version(
        &self,
        state: &mut NotifyState,
        engine: &Arc<dyn StorageEngine>,
        version: VersionId,
    ) {
        if state.async_error.is_some() {
            return;
        }

        let Some(advancer) = state.advancer_tx.clone() else {
            match engine.open() {
                Ok(opened) => {
                    assert!(
                        !opened.read_only,
                        "storage engine returned a read-only session for background work"
                    );
                    match opened.transaction.begin_read(Some(version)) {
                        Ok(_) => state.advancer_tx = Some(opened.transaction),
                        Err(err) => self.latch_async_error(state, err),
                    }
                }
                Err(err) => self.latch_async_error(state, err),
            }
            return;
        };

        if state.new_notifiers.is_empty() {
            // The last flush released the read; the transaction object holds
            // no snapshot.
            if let Err(err) = advancer.begin_read(Some(version)) {
                state.advancer_tx = None;
                self.latch_async_error(state, err);
            }
        } else if advancer
            .current_version()
            .is_some_and(|current| version < current)
        {
            advancer.end_read();
            if let Err(err) = advancer.begin_read(Some(version)) {
                state.advancer_tx = None;
                self.latch_async_error(state, err);
            }
        }
    }

    fn latch_async_error(&self, state: &mut NotifyState, error: EmberError) {
        if state.async_error.is_some() {
            return;
        }
        tracing::warn!(
            path = %self.path.display(),
            error = %error,
            "background session failed; latching error for all notifiers"
        );
        state.async_error = Some(Arc::new(error));
    }

    /// Drop notifiers whose consumer is gone, releasing reads that no longer
    /// pin anything useful.
    fn reap_dead_notifiers(&self, state: &mut NotifyState) {
        if swap_remove_dead(&mut state.notifiers) && state.notifiers.is_empty() {
            if let Some(transaction) = &state.notifier_tx {
                transaction.end_read();
            }
        }
        if swap_remove_dead(&mut state.new_notifiers) {
            if state.new_notifiers.is_empty() {
                if let Some(transaction) = &state.advancer_tx {
                    transaction.end_read();
                }
            } else if let Some(advancer) = state.advancer_tx.clone() {
                // The dead notifier may have been the one pinning the oldest
                // origin; move the pin up to the new minimum.
                let minimum = state
                    .new_notifiers
                    .iter()
                    .filter_map(|notifier| notifier.version())
                    .min();
                if let Some(minimum) = minimum {
                    if advancer
                        .current_version()
                        .is_some_and(|current| current < minimum)
                    {
                        advancer.end_read();
                        if let Err(err) = advancer.begin_read(Some(minimum)) {
                            state.advancer_tx = None;
                            self.latch_async_error(state, err);
                        }
                    }
                }
            }
        }
    }

    /// Open (or re-arm) the main notifier transaction at the latest version.
    fn open_notifier_transaction(&self, state: &mut NotifyState) {
        if let Some(transaction) = state.notifier_tx.clone() {
            if state.notifiers.is_empty() {
                if let Err(err) = transaction.begin_read(None) {
                    state.notifier_tx = None;
                    self.latch_async_error(state, err);
                }
            }
            return;
        }
        let Some(engine) = state.engine.clone() else {
            return;
        };
        match engine.open() {
            Ok(opened) => {
                assert!(
                    !opened.read_only,
                    "storage engine returned a read-only session for background work"
                );
                match opened.transaction.begin_read(None) {
                    Ok(_) => state.notifier_tx = Some(opened.transaction),
                    Err(err) => self.latch_async_error(state, err),
                }
            }
            Err(err) => self.latch_async_error(state, err),
        }
    }

    // -----------------------------------------------------------------------
    // The notification cycle
    // -----------------------------------------------------------------------

    /// Advance every notifier to the latest version and prepare their diffs.
    ///
    /// One cycle per coordinator runs at a time; the commit worker is the
    /// only caller in production.
    fn run_async_notifiers(&self) {
        let mut state = self.notify.lock();

        self.reap_dead_notifiers(&mut state);

        if state.notifiers.is_empty() && state.new_notifiers.is_empty() {
            return;
        }

        if state.async_error.is_none() {
            self.open_notifier_transaction(&mut state);
        }

        if state.async_error.is_some() {
            // Never advanced; drained through deliver with the latched error.
            let staged = std::mem::take(&mut state.new_notifiers);
            state.notifiers.extend(staged);
            return;
        }

        // One entry per distinct staged origin version, plus entry 0 for the
        // already-active notifiers.
        let mut change_info: SmallVec<[TransactionChangeInfo; 2]> = SmallVec::new();
        let mut target: Option<VersionId> = None;

        let mut new_notifiers = std::mem::take(&mut state.new_notifiers);
        // Which change_info entry each staged notifier was attached under.
        let mut slots: Vec<usize> = Vec::with_capacity(new_notifiers.len());

        change_info.push(TransactionChangeInfo::default());
        if !new_notifiers.is_empty() {
            change_info.push(TransactionChangeInfo::default());

            // Ascending origin order lets one pass over the commit log pull
            // every staged notifier forward.
            new_notifiers.sort_by_key(|notifier| notifier.version());

            let advancer = state
                .advancer_tx
                .clone()
                .expect("staged notifiers require a pinned advancer transaction");
            let mut version = advancer
                .current_version()
                .expect("advancer transaction holds a read while notifiers are staged");
            let minimum = new_notifiers
                .first()
                .and_then(|notifier| notifier.version())
                .expect("staged notifiers have an origin version");
            assert_eq!(
                version, minimum,
                "advancer transaction must pin the oldest staged origin"
            );

            let mut slot = change_info.len() - 1;
            let mut failed = None;
            for notifier in &new_notifiers {
                let origin = notifier
                    .version()
                    .expect("staged notifiers have an origin version");
                if origin != version {
                    // Collect changes up to this origin into the current
                    // entry, then start a new one so this notifier never sees
                    // changes from before its own snapshot. In-progress list
                    // accumulators carry forward.
                    if let Err(err) = advancer.advance(&mut change_info[slot], Some(origin)) {
                        failed = Some(err);
                        break;
                    }
                    let lists = std::mem::take(&mut change_info[slot].lists);
                    change_info.push(TransactionChangeInfo {
                        tables: Vec::new(),
                        lists,
                    });
                    slot += 1;
                    version = origin;
                }
                notifier.attach_to(&advancer);
                notifier.add_required_change_info(&mut change_info[slot]);
                slots.push(slot);
            }

            if failed.is_none() {
                if let Err(err) = advancer.advance(&mut change_info[slot], None) {
                    failed = Some(err);
                }
            }

            for notifier in &new_notifiers {
                notifier.detach();
            }

            if let Some(err) = failed {
                advancer.end_read();
                self.latch_async_error(&mut state, err);
                state.notifiers.extend(new_notifiers);
                return;
            }

            target = advancer.current_version();
            advancer.end_read();
        }

        // Copy the active list and release the lock: running notifiers can
        // reach user code, and other threads must be free to register or
        // unregister meanwhile.
        let notifier_tx = state
            .notifier_tx
            .clone()
            .expect("notifier transaction is open when notifiers exist");
        let mut notifiers = state.notifiers.clone();
        drop(state);

        for notifier in &notifiers {
            notifier.add_required_change_info(&mut change_info[0]);
        }

        if let Err(err) = notifier_tx.advance(&mut change_info[0], target) {
            let mut state = self.notify.lock();
            self.latch_async_error(&mut state, err);
            state.notifiers.extend(new_notifiers);
            return;
        }

        // Staged notifiers move onto the main transaction and into the
        // active set; they stay invisible to entry 0's collection above.
        for notifier in &new_notifiers {
            notifier.attach_to(&notifier_tx);
        }
        let first_staged = notifiers.len();
        notifiers.extend(new_notifiers.iter().cloned());

        // Merge per-origin deltas backwards so each entry ends up holding
        // the aggregate from its origin to the final version, in one pass.
        for index in (2..change_info.len()).rev() {
            let (head, tail) = change_info.split_at_mut(index);
            let previous = &mut head[index - 1];
            let current = &tail[0];
            if current.tables.is_empty() {
                continue;
            }
            if previous.tables.is_empty() {
                previous.tables = current.tables.clone();
                continue;
            }
            for (older, newer) in previous.tables.iter_mut().zip(&current.tables) {
                older.merge(newer);
            }
            if previous.tables.len() < current.tables.len() {
                previous
                    .tables
                    .extend_from_slice(&current.tables[previous.tables.len()..]);
            }
        }

        // Observers of the same list share their changes: fold later
        // occurrences into each earlier one.
        for info in &mut change_info {
            for later in 1..info.lists.len() {
                for earlier in (0..later).rev() {
                    if !info.lists[later].same_list(&info.lists[earlier]) {
                        continue;
                    }
                    if Arc::ptr_eq(&info.lists[later].changes, &info.lists[earlier].changes) {
                        continue;
                    }
                    let newer = info.lists[later].changes.lock().clone();
                    info.lists[earlier].changes.lock().merge(&newer);
                }
            }
        }

        for (index, notifier) in notifiers.iter().enumerate() {
            let slot = if index < first_staged {
                0
            } else {
                slots[index - first_staged]
            };
            notifier.run(&change_info[slot]);
        }

        // Reacquire the lock only to publish results to other threads.
        let mut state = self.notify.lock();
        for notifier in &notifiers {
            notifier.prepare_handover();
        }
        state.notifiers = notifiers;
        self.reap_dead_notifiers(&mut state);
    }

    /// Commit wake-up entry point: one global advance pass, then per-handle
    /// notification.
    pub fn on_change(&self) {
        self.run_async_notifiers();

        let state = self.realm.lock();
        state.handles.notify_all();
    }

    // -----------------------------------------------------------------------
    // Consumer-side delivery
    // -----------------------------------------------------------------------

    /// Move `handle`'s transaction to the latest version with prepared
    /// notifier results, then fire callbacks. Runs on the handle's thread.
    pub fn advance_to_ready(&self, handle: &Handle) -> Result<()> {
        let transaction = handle.transaction();

        let prepared = self.notify.lock().prepared_version();
        let Some(mut target) = prepared else {
            // No async notifiers; just advance to latest.
            let mut scratch = TransactionChangeInfo::default();
            transaction.advance(&mut scratch, None)?;
            return Ok(());
        };

        // Prepared results are older than what the handle already reads;
        // ignore them.
        if transaction
            .current_version()
            .is_some_and(|current| target < current)
        {
            return Ok(());
        }

        let ready = loop {
            // Advancing can run binding-side callbacks, so no lock is held.
            let mut scratch = TransactionChangeInfo::default();
            transaction.advance(&mut scratch, Some(target))?;

            // The notifiers may have moved on while the lock was released;
            // if so, chase the new version.
            let state = self.notify.lock();
            let Some(prepared) = state.prepared_version() else {
                return Ok(());
            };
            if Some(prepared) != transaction.current_version() {
                target = prepared;
                continue;
            }

            let mut ready = Vec::new();
            for notifier in &state.notifiers {
                if notifier.deliver(transaction.as_ref(), state.async_error.clone()) {
                    ready.push(Arc::clone(notifier));
                }
            }
            break ready;
        };

        for notifier in &ready {
            notifier.call_callbacks();
        }
        Ok(())
    }

    /// Deliver whatever results match `handle`'s current snapshot without
    /// advancing it.
    pub fn process_available_async(&self, handle: &Handle) {
        let transaction = handle.transaction();
        let ready: Vec<Arc<dyn ChangeNotifier>> = {
            let state = self.notify.lock();
            state
                .notifiers
                .iter()
                .filter(|notifier| {
                    notifier.deliver(transaction.as_ref(), state.async_error.clone())
                })
                .cloned()
                .collect()
        };

        for notifier in &ready {
            notifier.call_callbacks();
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        registry::sweep_expired();
        tracing::debug!(path = %self.path.display(), "coordinator dropped");
    }
}

/// Swap-remove notifiers whose consumer is gone, breaking each one's
/// reference cycles on the way out.
fn swap_remove_dead(list: &mut Vec<Arc<dyn ChangeNotifier>>) -> bool {
    let mut removed = false;
    let mut index = 0;
    while index < list.len() {
        if list[index].is_alive() {
            index += 1;
            continue;
        }
        // Tear down here even if stray references to the notifier linger.
        list[index].release_data();
        list.swap_remove(index);
        removed = true;
    }
    removed
}
