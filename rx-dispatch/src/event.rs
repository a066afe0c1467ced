//! Wake and acknowledgment primitives for rx threads
//!
//! `EventFlags` is the per-thread flag word producers and the dispatcher set
//! before waking the thread. `Event` is a resettable one-shot signal used for
//! the started/suspended/resumed/shutdown handshakes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// New batches are queued
pub const RX_POST_EVENT: u8 = 1 << 0;
/// Thread should park after its current drain
pub const RX_SUSPEND_EVENT: u8 = 1 << 1;
/// Thread should exit
pub const RX_SHUTDOWN_EVENT: u8 = 1 << 2;

/// Atomic flag word with a condition variable to sleep on.
///
/// Setters must call `wake` after `set`. `wake` takes the lock before
/// notifying, so a waiter that checked the flags under the lock can't miss it.
pub(crate) struct EventFlags {
    bits: AtomicU8,
    lock: Mutex<()>,
    cond: Condvar,
}

impl EventFlags {
    pub fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self, mask: u8) {
        self.bits.fetch_or(mask, Ordering::SeqCst);
    }

    pub fn test(&self, mask: u8) -> bool {
        self.bits.load(Ordering::SeqCst) & mask != 0
    }

    pub fn clear(&self, mask: u8) {
        self.bits.fetch_and(!mask, Ordering::SeqCst);
    }

    /// Clear `mask` and report whether any of it was set
    pub fn test_and_clear(&self, mask: u8) -> bool {
        self.bits.fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    pub fn wake(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Sleep until any flag in `mask` is set
    pub fn wait_any(&self, mask: u8) {
        let mut guard = self.lock.lock();
        while !self.test(mask) {
            self.cond.wait(&mut guard);
        }
    }
}

/// Resettable signal. Stays set until `reset`; waiting doesn't consume it.
pub(crate) struct Event {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    #[cfg(test)]
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    /// Returns false if `timeout` elapsed before the event was set
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                return *set;
            }
        }
        true
    }
}
