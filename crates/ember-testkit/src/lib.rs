//! Test doubles for exercising the coordinator without a real storage
//! engine: an in-memory MVCC commit log, a scriptable notifier, and a
//! channel-backed wake-up probe.

pub mod engine;
pub mod notifier;
pub mod signal;

pub use engine::MemoryEngine;
pub use notifier::{Delivery, RecordingNotifier};
pub use signal::NotifySignal;
