//! Completion signal shared by a session and its reclaim worker.
//!
//! A binary, auto-resetting event: [`signal_completion`] sets it and wakes one
//! waiter, a successful wait clears it. Signals do not count, so a completion
//! and a shutdown wake arriving together collapse into one wake. Waiters must
//! re-check session state after every wake.
//!
//! [`signal_completion`] is safe to call from the driver callback context. It
//! never allocates. When the signal is already set it returns after a single
//! atomic swap; otherwise it takes the internal mutex only long enough to
//! notify, and that mutex is never held by anyone across a blocking call
//! (the waiter releases it while parked).
//!
//! [`signal_completion`]: CompletionSignal::signal_completion

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Binary auto-reset wake primitive.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    signaled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl CompletionSignal {
    /// Create an unsignaled instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal and wake one waiter.
    pub fn signal_completion(&self) {
        if self.signaled.swap(true, Ordering::AcqRel) {
            return;
        }
        // The waiter checks the flag under this lock before parking, so
        // notifying under it cannot be lost.
        let _guard = self.lock.lock();
        self.cond.notify_one();
    }

    /// Block until signaled, then clear the signal.
    pub fn wait_one(&self) {
        let mut guard = self.lock.lock();
        while !self.signaled.swap(false, Ordering::AcqRel) {
            self.cond.wait(&mut guard);
        }
    }

    /// Like [`wait_one`](Self::wait_one) but gives up after `timeout`.
    ///
    /// Returns true if the signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if self.signaled.swap(false, Ordering::AcqRel) {
                return true;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.signaled.swap(false, Ordering::AcqRel);
            }
        }
    }

    /// Clear a pending signal without waiting.
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    /// Whether the signal is currently set.
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}
