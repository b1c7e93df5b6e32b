//! Thread-bound database handles and the coordinator's weak-handle set.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use ember_error::Result;
use ember_store::ReadTransaction;
use ember_types::VersionId;

use crate::config::CoordConfig;
use crate::coordinator::Coordinator;

/// A thread-bound opener of a database file.
///
/// Handles hold a strong reference to their coordinator; the coordinator
/// holds only weak references back, so a coordinator outlives every handle
/// that can call into it and is dropped when the last handle goes away.
pub struct Handle {
    coordinator: Arc<Coordinator>,
    config: CoordConfig,
    thread: ThreadId,
    transaction: Arc<dyn ReadTransaction>,
    on_notify: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    closed: AtomicBool,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("path", &self.config.path)
            .field("thread", &self.thread)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(
        coordinator: Arc<Coordinator>,
        config: CoordConfig,
        transaction: Arc<dyn ReadTransaction>,
    ) -> Self {
        Self {
            coordinator,
            config,
            thread: thread::current().id(),
            transaction,
            on_notify: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// The handle's own read transaction.
    pub fn transaction(&self) -> &Arc<dyn ReadTransaction> {
        &self.transaction
    }

    /// The snapshot this handle currently reads from.
    pub fn current_version(&self) -> Option<VersionId> {
        self.transaction.current_version()
    }

    /// The thread this handle was opened on. Callbacks for the handle's
    /// notifiers fire on this thread.
    pub fn owner_thread(&self) -> ThreadId {
        self.thread
    }

    pub fn is_on_owner_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Install the hook used to wake this handle's thread after a commit.
    ///
    /// The hook must be a non-blocking post (enqueue on the thread's event
    /// loop); it runs while the coordinator's handle lock is held.
    pub fn set_on_notify(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self.on_notify.lock() = Some(hook);
    }

    pub(crate) fn notify(&self) {
        if self.is_closed() {
            return;
        }
        if let Some(hook) = self.on_notify.lock().as_ref() {
            hook();
        }
    }

    /// Advance this handle's transaction to the latest version for which
    /// notifier results are ready, then fire their callbacks. Must run on
    /// the owner thread.
    pub fn advance_to_ready(&self) -> Result<()> {
        self.coordinator.advance_to_ready(self)
    }

    /// Deliver whatever notifier results match this handle's current
    /// snapshot, without advancing it.
    pub fn process_available_async(&self) {
        self.coordinator.process_available_async(self);
    }

    /// Release the handle's read and unregister from the coordinator.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transaction.end_read();
        self.coordinator.unregister_handle(self);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// WeakHandle / HandleSet
// ---------------------------------------------------------------------------

/// A weak registry entry for one live handle, tagged with the identity of
/// the thread that opened it.
pub(crate) struct WeakHandle {
    handle: std::sync::Weak<Handle>,
    thread: ThreadId,
    cacheable: bool,
}

impl WeakHandle {
    fn new(handle: &Arc<Handle>, cacheable: bool) -> Self {
        Self {
            handle: Arc::downgrade(handle),
            thread: handle.owner_thread(),
            cacheable,
        }
    }

    fn upgrade(&self) -> Option<Arc<Handle>> {
        self.handle.upgrade()
    }

    fn expired(&self) -> bool {
        self.handle.strong_count() == 0
    }

    fn is_cached_for_current_thread(&self) -> bool {
        self.cacheable && self.thread == thread::current().id()
    }

    fn is_for(&self, handle: &Handle) -> bool {
        std::ptr::eq(self.handle.as_ptr(), handle)
    }
}

/// The ordered set of live handles bound to one coordinator.
#[derive(Default)]
pub(crate) struct HandleSet {
    entries: Vec<WeakHandle>,
}

impl HandleSet {
    pub(crate) fn insert(&mut self, handle: &Arc<Handle>, cacheable: bool) {
        self.entries.push(WeakHandle::new(handle, cacheable));
    }

    /// A cache-eligible handle opened on the calling thread, if any.
    pub(crate) fn cached_for_current_thread(&self) -> Option<Arc<Handle>> {
        // An entry can be dead here if its refcount hit zero before
        // `unregister_handle` took the lock; skip it.
        self.entries
            .iter()
            .filter(|entry| entry.is_cached_for_current_thread())
            .find_map(WeakHandle::upgrade)
    }

    /// Remove `handle`'s entry along with any expired ones.
    pub(crate) fn remove(&mut self, handle: &Handle) {
        self.entries
            .retain(|entry| !entry.expired() && !entry.is_for(handle));
    }

    pub(crate) fn collect_live(&self) -> Vec<Arc<Handle>> {
        self.entries.iter().filter_map(WeakHandle::upgrade).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn notify_all(&self) {
        for entry in &self.entries {
            if let Some(handle) = entry.upgrade() {
                handle.notify();
            }
        }
    }
}
