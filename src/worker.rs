//! Background reclamation thread.
//!
//! A [`ReclaimWorker`] drains completed buffers from a [`BufferRegistry`] for
//! as long as its session stays in one *active* state (Streaming for input,
//! Open for output):
//!
//! ```text
//! while state == active:
//!     wait for the completion signal
//!     if state == active:
//!         reclaim the oldest buffer
//! ```
//!
//! The worker never stops on its own. The session changes state, signals
//! once, and joins.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{MidiError, Result};
use crate::registry::BufferRegistry;
use crate::signal::CompletionSignal;
use crate::state::{AtomicState, SessionState};

/// Poll interval while waiting for the worker thread to finish.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running reclaim thread.
#[derive(Debug)]
pub struct ReclaimWorker {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl ReclaimWorker {
    /// Spawn the reclaim loop on a new named thread.
    ///
    /// The caller must already have moved `state` to `active`, otherwise the
    /// loop exits immediately.
    ///
    /// # Errors
    ///
    /// [`MidiError::WorkerSpawn`] if the OS refuses to create the thread.
    pub fn spawn(
        name: &str,
        active: SessionState,
        state: Arc<AtomicState>,
        signal: Arc<CompletionSignal>,
        registry: Arc<BufferRegistry>,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(active, &state, &signal, &registry))
            .map_err(MidiError::WorkerSpawn)?;
        debug!(worker = name, %active, "Spawned reclaim worker");
        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
        })
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the loop to return.
    ///
    /// Returns true if the thread was joined. On timeout the handle is kept,
    /// so [`is_finished`](Self::is_finished) keeps reporting the thread and a
    /// later `join` can still collect it. Dropping an unjoined worker detaches
    /// the thread; it only holds reference-counted session state, so it can
    /// finish later without touching freed memory.
    pub fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(worker = %self.name, ?timeout, "Reclaim worker did not exit in time");
                self.handle = Some(handle);
                return false;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }
        if handle.join().is_err() {
            warn!(worker = %self.name, "Reclaim worker panicked");
        }
        debug!(worker = %self.name, "Reclaim worker joined");
        true
    }
}

impl Drop for ReclaimWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!(worker = %self.name, "Detaching reclaim worker");
        }
    }
}

fn run(
    active: SessionState,
    state: &AtomicState,
    signal: &CompletionSignal,
    registry: &BufferRegistry,
) {
    while state.is(active) {
        signal.wait_one();
        // The wake may be the shutdown signal rather than a completion.
        if state.is(active) {
            let reclaimed = registry.reclaim_one();
            trace!(reclaimed, pending = registry.len(), "Reclaim worker woke");
        }
    }
    trace!(state = %state.load(), "Reclaim worker exiting");
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::buffer::BufferDescriptor;
    use crate::driver::mock::MockDriver;
    use crate::driver::{DeviceHandle, Direction, DriverEvent, MidiDriver, TransferBuffer};

    struct Fixture {
        state: Arc<AtomicState>,
        signal: Arc<CompletionSignal>,
        registry: Arc<BufferRegistry>,
    }

    impl Fixture {
        fn new(initial: SessionState) -> Self {
            Self {
                state: Arc::new(AtomicState::new(initial)),
                signal: Arc::new(CompletionSignal::new()),
                registry: Arc::new(BufferRegistry::new()),
            }
        }

        fn spawn(&self, active: SessionState) -> ReclaimWorker {
            ReclaimWorker::spawn(
                "test-reclaim",
                active,
                self.state.clone(),
                self.signal.clone(),
                self.registry.clone(),
            )
            .unwrap()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn test_exits_when_state_inactive_at_spawn() {
        let fixture = Fixture::new(SessionState::Open);
        let mut worker = fixture.spawn(SessionState::Streaming);
        assert_eq!(worker.name(), "test-reclaim");
        assert!(worker.join(Duration::from_secs(2)));
        assert!(worker.is_finished());
    }

    #[test]
    fn test_reclaims_one_buffer_per_wake() {
        let driver = Arc::new(MockDriver::new());
        let handle = driver
            .open(
                Direction::Output,
                0,
                Arc::new(|_: DeviceHandle, _: DriverEvent<'_>| {}),
            )
            .unwrap();
        let fixture = Fixture::new(SessionState::Streaming);
        for _ in 0..3 {
            let descriptor = BufferDescriptor::prepare(
                driver.clone(),
                handle,
                TransferBuffer::from_payload(vec![0xF0, 0xF7]),
            )
            .unwrap();
            fixture.registry.add_buffer(descriptor);
        }
        let mut worker = fixture.spawn(SessionState::Streaming);

        fixture.signal.signal_completion();
        assert!(wait_until(|| fixture.registry.len() == 2));

        fixture.state.store(SessionState::Open);
        fixture.signal.signal_completion();
        assert!(worker.join(Duration::from_secs(2)));

        // The shutdown wake must not reclaim.
        assert_eq!(fixture.registry.len(), 2);
    }

    #[test]
    fn test_join_timeout_keeps_worker_joinable() {
        let fixture = Fixture::new(SessionState::Streaming);
        let mut worker = fixture.spawn(SessionState::Streaming);
        assert!(!worker.join(Duration::from_millis(20)));
        assert!(!worker.is_finished());

        fixture.state.store(SessionState::Open);
        fixture.signal.signal_completion();
        assert!(worker.join(Duration::from_secs(2)));
        assert!(worker.is_finished());
    }
}
