use std::sync::atomic::{AtomicBool, Ordering};

/// The upstream collaborator a segment's reader task consults before
/// re-delivering a decoded message, so a downstream outage does not
/// turn into a tight re-delivery loop.
pub trait MessageSource: Send + Sync {
    /// True while the downstream this source feeds is unable to accept
    /// more messages.
    fn is_blocked(&self) -> bool;
}

/// A toggleable [`MessageSource`] test double.
#[derive(Debug, Default)]
pub struct ToggleSource {
    blocked: AtomicBool,
}

impl ToggleSource {
    pub fn new(blocked: bool) -> Self {
        Self {
            blocked: AtomicBool::new(blocked),
        }
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }
}

impl MessageSource for ToggleSource {
    fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }
}
