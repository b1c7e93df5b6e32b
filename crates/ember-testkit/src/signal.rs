//! Channel-backed probe for handle wake-ups.

use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use parking_lot::Mutex;

use ember_coord::Handle;

/// Installs an `on_notify` hook that forwards each wake-up over a channel,
/// so tests can block until the commit worker has notified a handle.
pub struct NotifySignal {
    receiver: Receiver<()>,
}

impl NotifySignal {
    pub fn install(handle: &Handle) -> Self {
        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        handle.set_on_notify(Box::new(move || {
            let _ = sender.lock().send(());
        }));
        Self { receiver }
    }

    /// Wait for one wake-up.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.receiver.recv_timeout(timeout).is_ok()
    }

    /// Consume any queued wake-ups, returning how many there were.
    pub fn drain(&self) -> usize {
        let mut count = 0;
        while self.receiver.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}
