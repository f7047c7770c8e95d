//! A non-blocking, double-buffered message accumulator.
//!
//! A single atomic word packs which buffer is currently accepting
//! appends, its fill level, a closed bit, and a generation counter.
//! `append` is a bounded compare-and-swap loop that never blocks;
//! `flush` closes the active buffer, swaps in the other one, and
//! drains the frozen buffer asynchronously. Actual slot storage uses a
//! small per-buffer mutex rather than unsafe shared-memory slots: the
//! atomic word still decides *which* slot an appender owns, so the
//! mutex is never contended by more than the reservation race, not by
//! the write itself.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use router_core::Message;
use tokio::sync::Notify;

const ACTIVE_SHIFT: u32 = 63;
const CLOSED_SHIFT: u32 = 62;
const FILL_SHIFT: u32 = 32;
const FILL_MASK: u64 = 0x3FFF_FFFF;
const GEN_MASK: u64 = 0xFFFF_FFFF;

fn pack(active: u64, closed: bool, fill: u64, generation: u64) -> u64 {
    (active << ACTIVE_SHIFT)
        | ((closed as u64) << CLOSED_SHIFT)
        | ((fill & FILL_MASK) << FILL_SHIFT)
        | (generation & GEN_MASK)
}

fn unpack(word: u64) -> (u64, bool, u64, u64) {
    let active = (word >> ACTIVE_SHIFT) & 1;
    let closed = ((word >> CLOSED_SHIFT) & 1) != 0;
    let fill = (word >> FILL_SHIFT) & FILL_MASK;
    let generation = word & GEN_MASK;
    (active, closed, fill, generation)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushWait {
    CompletedOnTime,
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch flush coordination lock was poisoned")]
    Poisoned,
}

struct Buffer {
    slots: Mutex<Vec<Option<Message>>>,
}

impl Buffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
        }
    }

    fn set(&self, index: usize, msg: Message) {
        self.slots.lock().expect("buffer mutex poisoned")[index] = Some(msg);
    }

    fn take_and_reset(&self, capacity: usize) -> Vec<Message> {
        let mut guard = self.slots.lock().expect("buffer mutex poisoned");
        let fresh: Vec<Option<Message>> = (0..capacity).map(|_| None).collect();
        let drained = std::mem::replace(&mut *guard, fresh);
        drained.into_iter().flatten().collect()
    }
}

pub struct MessageBatch {
    state: AtomicU64,
    buffers: [Buffer; 2],
    capacity: usize,
    flush_lock: tokio::sync::Mutex<()>,
    flush_notify: Notify,
}

impl MessageBatch {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "batch capacity must be positive");
        Self {
            state: AtomicU64::new(pack(0, false, 0, 0)),
            buffers: [Buffer::with_capacity(capacity), Buffer::with_capacity(capacity)],
            capacity,
            flush_lock: tokio::sync::Mutex::new(()),
            flush_notify: Notify::new(),
        }
    }

    /// Reserves a slot in the active buffer and stores `msg` there.
    /// Never blocks; rejects if the active buffer is full or closed
    /// for writing (a flush or [`Self::after_flush_do`] is in
    /// progress).
    pub fn append(&self, msg: Message) -> AppendOutcome {
        loop {
            let word = self.state.load(Ordering::Acquire);
            let (active, closed, fill, generation) = unpack(word);
            if closed || fill as usize >= self.capacity {
                return AppendOutcome::Rejected;
            }
            let new_word = pack(active, closed, fill + 1, generation);
            if self
                .state
                .compare_exchange_weak(word, new_word, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.buffers[active as usize].set(fill as usize, msg);
                return AppendOutcome::Accepted;
            }
        }
    }

    /// True if the active buffer currently holds no messages. Does not
    /// account for a buffer mid-drain during a concurrent flush.
    pub fn is_empty(&self) -> bool {
        let (_, _, fill, _) = unpack(self.state.load(Ordering::Acquire));
        fill == 0
    }

    /// Closes the active buffer, swaps in the other one, and runs
    /// `write_fn` over the messages the closed buffer held. A second
    /// caller arriving while a flush is already draining observes the
    /// in-flight flush and returns once it completes, without
    /// triggering a second drain.
    pub async fn flush<F, Fut, E>(&self, write_fn: F) -> Result<(), E>
    where
        F: FnOnce(Vec<Message>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let guard = match self.flush_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // A flush is already in flight; piggyback on it rather
                // than starting a second drain of the same buffer.
                drop(self.flush_lock.lock().await);
                return Ok(());
            }
        };

        self.close_active();
        let drained_idx = self.swap_active();
        let messages = self.buffers[drained_idx as usize].take_and_reset(self.capacity);

        let result = write_fn(messages).await;
        self.flush_notify.notify_waiters();
        drop(guard);
        result
    }

    fn close_active(&self) {
        loop {
            let word = self.state.load(Ordering::Acquire);
            let (active, _closed, fill, generation) = unpack(word);
            let new_word = pack(active, true, fill, generation);
            if self
                .state
                .compare_exchange_weak(word, new_word, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Flips the active buffer index, clears fill and the closed bit,
    /// bumps the generation, and returns the index of the
    /// now-frozen buffer to drain.
    fn swap_active(&self) -> u64 {
        loop {
            let word = self.state.load(Ordering::Acquire);
            let (active, _closed, _fill, generation) = unpack(word);
            let new_active = 1 - active;
            let new_word = pack(new_active, false, 0, generation.wrapping_add(1));
            if self
                .state
                .compare_exchange_weak(word, new_word, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return active;
            }
        }
    }

    /// Blocks until the currently in-flight flush (if any) has
    /// drained, or `timeout` elapses.
    pub async fn wait_for_flush(&self, timeout: Duration) -> FlushWait {
        match tokio::time::timeout(timeout, self.flush_lock.lock()).await {
            Ok(guard) => {
                drop(guard);
                FlushWait::CompletedOnTime
            }
            Err(_) => FlushWait::TimedOut,
        }
    }

    /// Runs `action` once both buffers are quiescent, holding off
    /// concurrent flushes and appends to the active buffer for its
    /// duration. Used by rotation to retarget the writer without
    /// racing an in-flight flush.
    pub async fn after_flush_do<T, F, Fut>(&self, action: F) -> Result<T, BatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.flush_lock.lock().await;
        self.close_active();
        let result = action().await;
        self.reopen_active();
        Ok(result)
    }

    fn reopen_active(&self) {
        loop {
            let word = self.state.load(Ordering::Acquire);
            let (active, _closed, fill, generation) = unpack(word);
            let new_word = pack(active, false, fill, generation);
            if self
                .state
                .compare_exchange_weak(word, new_word, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use router_core::StreamId;
    use std::sync::Arc;

    fn msg(payload: &'static str) -> Message {
        Message::new(payload.as_bytes().to_vec(), StreamId::new("s", 1))
    }

    #[test]
    fn append_rejects_once_capacity_is_reached() {
        let batch = MessageBatch::new(2);
        assert_eq!(batch.append(msg("a")), AppendOutcome::Accepted);
        assert_eq!(batch.append(msg("b")), AppendOutcome::Accepted);
        assert_eq!(batch.append(msg("c")), AppendOutcome::Rejected);
    }

    #[tokio::test]
    async fn flush_drains_exactly_the_appended_messages() {
        let batch = MessageBatch::new(4);
        batch.append(msg("a"));
        batch.append(msg("b"));

        let drained: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let drained_clone = drained.clone();
        batch
            .flush(move |messages| {
                let drained = drained_clone.clone();
                async move {
                    drained.lock().unwrap().extend(messages);
                    Ok::<(), ()>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(drained.lock().unwrap().len(), 2);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn appends_after_flush_lands_in_new_active_buffer() {
        let batch = MessageBatch::new(4);
        batch.append(msg("a"));
        batch
            .flush(|_messages| async { Ok::<(), ()>(()) })
            .await
            .unwrap();

        assert_eq!(batch.append(msg("b")), AppendOutcome::Accepted);
        assert!(!batch.is_empty());
    }

    #[tokio::test]
    async fn after_flush_do_rejects_appends_while_running() {
        let batch = Arc::new(MessageBatch::new(4));
        let batch2 = batch.clone();
        let outcome = batch
            .after_flush_do(move || async move { batch2.append(msg("during")) })
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Rejected);
        // Once the action returns, the active buffer accepts again.
        assert_eq!(batch.append(msg("after")), AppendOutcome::Accepted);
    }

    #[tokio::test]
    async fn wait_for_flush_times_out_without_a_pending_flush_holder() {
        let batch = MessageBatch::new(4);
        let outcome = batch.wait_for_flush(Duration::from_millis(10)).await;
        assert_eq!(outcome, FlushWait::CompletedOnTime);
    }
}
