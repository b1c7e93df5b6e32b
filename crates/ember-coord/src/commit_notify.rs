//! Commit wake-up plumbing.
//!
//! Each coordinator with automatic notifications owns a [`CommitNotifier`]:
//! a worker thread plus a registration on the process-wide, path-keyed wake
//! bus. `notify_others` publishes a commit to every listener on the path
//! (including the committing coordinator's own worker); each worker responds
//! by running its coordinator's `on_change`.
//!
//! Cross-process transport is the platform layer's job; this module
//! implements the same contract for listeners inside one process.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{OnceLock, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::coordinator::Coordinator;

enum WakeUp {
    Commit,
    Stop,
}

struct BusEntry {
    id: u64,
    sender: Sender<WakeUp>,
}

static BUS: OnceLock<Mutex<HashMap<PathBuf, Vec<BusEntry>>>> = OnceLock::new();
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(0);

fn bus() -> &'static Mutex<HashMap<PathBuf, Vec<BusEntry>>> {
    BUS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Watches a path for commits and schedules `on_change` on a worker thread.
pub(crate) struct CommitNotifier {
    path: PathBuf,
    id: u64,
    sender: Sender<WakeUp>,
    worker: Option<JoinHandle<()>>,
}

impl CommitNotifier {
    /// Spawn the worker and register on the wake bus. Fails if the worker
    /// thread cannot be spawned.
    pub(crate) fn spawn(coordinator: Weak<Coordinator>, path: &Path) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("ember-commit-notify".to_owned())
            .spawn(move || Self::run(&coordinator, &receiver))?;

        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        bus()
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .push(BusEntry {
                id,
                sender: sender.clone(),
            });
        tracing::debug!(path = %path.display(), listener = id, "commit notifier started");

        Ok(Self {
            path: path.to_path_buf(),
            id,
            sender,
            worker: Some(worker),
        })
    }

    fn run(coordinator: &Weak<Coordinator>, receiver: &Receiver<WakeUp>) {
        while let Ok(wake) = receiver.recv() {
            if matches!(wake, WakeUp::Stop) {
                break;
            }
            // Coalesce bursts of commits into one pass.
            let mut stop = false;
            while let Ok(extra) = receiver.try_recv() {
                if matches!(extra, WakeUp::Stop) {
                    stop = true;
                    break;
                }
            }
            let Some(coordinator) = coordinator.upgrade() else {
                break;
            };
            coordinator.on_change();
            drop(coordinator);
            if stop {
                break;
            }
        }
    }

    /// Publish that this process committed. Non-blocking; every listener on
    /// the path observes the event in finite time.
    pub(crate) fn notify_others(&self) {
        let bus = bus().lock();
        if let Some(entries) = bus.get(&self.path) {
            for entry in entries {
                let _ = entry.sender.send(WakeUp::Commit);
            }
        }
    }
}

impl Drop for CommitNotifier {
    fn drop(&mut self) {
        {
            let mut bus = bus().lock();
            if let Some(entries) = bus.get_mut(&self.path) {
                entries.retain(|entry| entry.id != self.id);
                if entries.is_empty() {
                    bus.remove(&self.path);
                }
            }
        }
        let _ = self.sender.send(WakeUp::Stop);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                // The last coordinator reference died inside on_change, so
                // this drop is running on the worker itself; the Stop message
                // lets it unwind instead of joining its own thread.
                return;
            }
            let _ = worker.join();
        }
        tracing::debug!(path = %self.path.display(), listener = self.id, "commit notifier stopped");
    }
}
