//! Cooperative shutdown signal shared between a producer and every
//! reader/writer task it spawns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A flag observed at suspension points by long-running tasks. Setting
/// it does not cancel anything by itself; tasks are expected to check
/// it between units of work and unwind cleanly.
#[derive(Debug, Default)]
pub struct ShutdownFlag {
    stopping: AtomicBool,
    notify: Notify,
}

impl ShutdownFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True once [`Self::stop`] has been called.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Signals shutdown and wakes every task parked in [`Self::wait`].
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Resolves immediately if shutdown has already been signaled,
    /// otherwise parks until [`Self::stop`] is called.
    pub async fn wait(&self) {
        if self.is_stopping() {
            return;
        }
        self.notify.notified().await;
    }
}
