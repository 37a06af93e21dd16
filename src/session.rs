//! Input device session.
//!
//! [`DeviceSession`] drives one MIDI input device through
//! Closed → Open → Streaming and owns everything that must outlive the
//! driver's asynchronous activity: the buffer registry, the completion
//! signal, the reclaim worker and the receiver binding.
//!
//! # Threads
//!
//! - The control thread calls the `&mut self` methods. They are not
//!   serialized against each other beyond what `&mut` enforces.
//! - The driver callback context runs the closure registered at open time. It
//!   dispatches to the receiver and, for long events while Streaming, signals
//!   the completion signal after dispatch.
//! - The reclaim worker runs while Streaming and releases the oldest buffer
//!   per wake.
//!
//! # Shutdown
//!
//! `stop_streaming` moves to Open, wakes the worker once, stops and resets the
//! driver (the reset returns queued buffers through the callback; those late
//! events are ignored because the session is no longer Streaming), joins the
//! worker and reclaims everything left. The registry is empty when it returns.
//!
//! A worker that misses the join timeout stays attached and keeps showing in
//! [`DeviceSession::worker_running`] until it exits; the next join collects it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::buffer::BufferDescriptor;
use crate::driver::{
    BufferId, DeviceCaps, DeviceHandle, DeviceId, Direction, DriverCallback, DriverEvent,
    MidiDriver, TransferBuffer,
};
use crate::error::{MidiError, Result};
use crate::receiver::{MidiReceiver, ReceiverSlot};
use crate::registry::{BufferRegistry, RegistryStats};
use crate::signal::CompletionSignal;
use crate::state::{AtomicState, SessionState};
use crate::worker::ReclaimWorker;

/// Default name given to reclaim worker threads.
pub const DEFAULT_WORKER_NAME: &str = "midi-reclaim";

/// Default bound on joining a reclaim worker.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables shared by input sessions and output devices.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Name of the reclaim worker thread
    pub worker_name: String,
    /// How long to wait for the worker to exit before detaching it
    pub join_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            worker_name: DEFAULT_WORKER_NAME.to_string(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// State shared with the callback closure and the worker.
struct Shared {
    state: Arc<AtomicState>,
    signal: Arc<CompletionSignal>,
    registry: Arc<BufferRegistry>,
    receiver: Arc<ReceiverSlot>,
}

/// A MIDI input device session.
pub struct DeviceSession {
    driver: Arc<dyn MidiDriver>,
    shared: Shared,
    handle: Option<DeviceHandle>,
    device: Option<DeviceId>,
    worker: Option<ReclaimWorker>,
    options: SessionOptions,
}

impl DeviceSession {
    /// Create a closed session delivering to `receiver`.
    pub fn new(driver: Arc<dyn MidiDriver>, receiver: Arc<dyn MidiReceiver>) -> Self {
        Self::with_options(driver, receiver, SessionOptions::default())
    }

    /// Create a closed session with explicit options.
    pub fn with_options(
        driver: Arc<dyn MidiDriver>,
        receiver: Arc<dyn MidiReceiver>,
        options: SessionOptions,
    ) -> Self {
        Self {
            driver,
            shared: Shared {
                state: Arc::new(AtomicState::default()),
                signal: Arc::new(CompletionSignal::new()),
                registry: Arc::new(BufferRegistry::new()),
                receiver: Arc::new(ReceiverSlot::new(receiver)),
            },
            handle: None,
            device: None,
            worker: None,
            options,
        }
    }

    /// Create a session and open `device` immediately.
    pub fn open_device(
        driver: Arc<dyn MidiDriver>,
        device: DeviceId,
        receiver: Arc<dyn MidiReceiver>,
    ) -> Result<Self> {
        let mut session = Self::new(driver, receiver);
        session.open(device)?;
        Ok(session)
    }

    /// Number of input devices the driver reports.
    pub fn device_count(driver: &dyn MidiDriver) -> u32 {
        driver.device_count(Direction::Input)
    }

    /// Capabilities of one input device.
    pub fn capabilities(driver: &dyn MidiDriver, device: DeviceId) -> Result<DeviceCaps> {
        Ok(driver.capabilities(Direction::Input, device)?)
    }

    /// Open `device`, closing any device this session already holds.
    ///
    /// # Errors
    ///
    /// [`MidiError::DeviceOpen`] if the driver refuses; the session is then
    /// Closed. Errors from the implicit close are returned as-is.
    pub fn open(&mut self, device: DeviceId) -> Result<()> {
        self.close()?;

        let callback = self.callback();
        let handle = self
            .driver
            .open(Direction::Input, device, callback)
            .map_err(|source| MidiError::DeviceOpen { device, source })?;

        self.handle = Some(handle);
        self.device = Some(device);
        self.shared.state.store(SessionState::Open);
        info!(device, %handle, "Opened MIDI input device");
        Ok(())
    }

    /// Stop streaming if needed and release the device handle.
    ///
    /// Buffers still registered are returned by a driver reset and reclaimed
    /// before the handle is closed. No-op when Closed.
    ///
    /// # Errors
    ///
    /// [`MidiError::DeviceClose`] if the driver fails to release the handle.
    /// The session is Closed afterwards regardless.
    pub fn close(&mut self) -> Result<()> {
        if self.shared.state.is(SessionState::Streaming) {
            self.stop_streaming()?;
        }
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        if !self.shared.registry.is_empty() {
            if let Err(e) = self.driver.reset(handle) {
                warn!(%handle, error = %e, "Driver reset before close failed");
            }
            self.shared.registry.reclaim_all();
        }

        self.shared.state.store(SessionState::Closed);
        let device = self.device.take();
        self.driver.close(handle).map_err(MidiError::DeviceClose)?;
        info!(device, %handle, "Closed MIDI input device");
        Ok(())
    }

    /// Move from Open to Streaming.
    ///
    /// No-op when already Streaming.
    ///
    /// # Errors
    ///
    /// - [`MidiError::InvalidState`] when Closed.
    /// - [`MidiError::WorkerSpawn`] if the reclaim thread cannot start.
    /// - [`MidiError::DriverStart`] if the driver refuses; the worker is
    ///   stopped and the session is back in Open.
    pub fn start_streaming(&mut self) -> Result<()> {
        let handle = match self.shared.state.load() {
            SessionState::Streaming => return Ok(()),
            SessionState::Closed => {
                return Err(MidiError::InvalidState {
                    operation: "start streaming",
                    state: SessionState::Closed,
                })
            }
            SessionState::Open => self.open_handle("start streaming")?,
        };

        self.detach_stale_worker();
        // A wake left over from the previous run would reclaim an incomplete buffer.
        self.shared.signal.reset();
        // The worker loops only while the state is Streaming, so publish it first.
        self.shared.state.store(SessionState::Streaming);
        let worker = match ReclaimWorker::spawn(
            &self.options.worker_name,
            SessionState::Streaming,
            self.shared.state.clone(),
            self.shared.signal.clone(),
            self.shared.registry.clone(),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                self.shared.state.store(SessionState::Open);
                return Err(e);
            }
        };
        self.worker = Some(worker);

        if let Err(e) = self.driver.start(handle) {
            self.shared.state.store(SessionState::Open);
            self.shared.signal.signal_completion();
            self.join_worker();
            warn!(%handle, error = %e, "Driver refused to start streaming");
            return Err(MidiError::DriverStart(e));
        }

        info!(%handle, pending = self.shared.registry.len(), "Started streaming");
        Ok(())
    }

    /// Move from Streaming to Open, leaving the registry empty.
    ///
    /// No-op unless Streaming. A failing driver stop or reset is logged; the
    /// remaining buffers are reclaimed regardless.
    pub fn stop_streaming(&mut self) -> Result<()> {
        if !self.shared.state.is(SessionState::Streaming) {
            return Ok(());
        }
        let handle = self.open_handle("stop streaming")?;

        self.shared.state.store(SessionState::Open);
        self.shared.signal.signal_completion();

        if let Err(e) = self.driver.stop(handle) {
            warn!(%handle, error = %e, "Driver stop failed while stopping");
        }
        if let Err(e) = self.driver.reset(handle) {
            warn!(%handle, error = %e, "Driver reset failed while stopping");
        }

        self.join_worker();
        let reclaimed = self.shared.registry.reclaim_all();
        info!(%handle, reclaimed, "Stopped streaming");
        Ok(())
    }

    /// Queue `buffer` for incoming long messages.
    ///
    /// Allowed while Open (buffers waiting for streaming to start) and while
    /// Streaming.
    ///
    /// # Errors
    ///
    /// - [`MidiError::InvalidState`] when Closed.
    /// - Prepare or submit failures; a buffer that was prepared is
    ///   unprepared before the error is returned.
    pub fn add_buffer(&self, buffer: TransferBuffer) -> Result<BufferId> {
        let handle = self.open_handle("add buffer")?;
        let descriptor = BufferDescriptor::prepare(self.driver.clone(), handle, buffer)?;
        let id = self.shared.registry.submit(descriptor)?;
        debug!(%handle, buffer = id, "Queued input buffer");
        Ok(id)
    }

    /// Allocate and queue a zeroed buffer of `capacity` bytes.
    pub fn add_sysex_buffer(&self, capacity: usize) -> Result<BufferId> {
        self.add_buffer(TransferBuffer::with_capacity(capacity))
    }

    /// Bind a new receiver and return the previous one.
    pub fn set_receiver(&self, receiver: Arc<dyn MidiReceiver>) -> Arc<dyn MidiReceiver> {
        self.shared.receiver.replace(receiver)
    }

    /// Currently bound receiver.
    pub fn receiver(&self) -> Arc<dyn MidiReceiver> {
        self.shared.receiver.get()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state.load()
    }

    /// True when Open or Streaming.
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// True when Streaming.
    pub fn is_streaming(&self) -> bool {
        self.shared.state.is(SessionState::Streaming)
    }

    /// Handle of the open device.
    pub fn handle(&self) -> Option<DeviceHandle> {
        self.handle
    }

    /// Identifier of the open device.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.device
    }

    /// Number of buffers awaiting reclamation.
    pub fn pending_buffers(&self) -> usize {
        self.shared.registry.len()
    }

    /// Registry counters.
    pub fn stats(&self) -> RegistryStats {
        self.shared.registry.stats()
    }

    /// Whether a reclaim worker is attached and still running.
    ///
    /// Stays true after a stop whose join timed out, until that worker exits.
    pub fn worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    fn open_handle(&self, operation: &'static str) -> Result<DeviceHandle> {
        self.handle.ok_or(MidiError::InvalidState {
            operation,
            state: self.shared.state.load(),
        })
    }

    fn join_worker(&mut self) {
        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        if worker.join(self.options.join_timeout) {
            self.worker = None;
        } else {
            warn!(
                worker = worker.name(),
                pending = self.shared.registry.len(),
                "Reclaim worker still running after stop"
            );
        }
    }

    fn detach_stale_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if !worker.is_finished() {
                warn!(
                    worker = worker.name(),
                    "Detaching reclaim worker from previous run"
                );
            }
        }
    }

    fn callback(&self) -> DriverCallback {
        let state = self.shared.state.clone();
        let signal = self.shared.signal.clone();
        let receiver = self.shared.receiver.clone();
        Arc::new(move |handle: DeviceHandle, event: DriverEvent<'_>| {
            let is_long = matches!(
                event,
                DriverEvent::LongData { .. } | DriverEvent::LongError { .. }
            );
            if is_long && !state.is(SessionState::Streaming) {
                // Buffer returned by a reset after stop; reclaimed by the control thread.
                trace!(%handle, "Ignoring late buffer completion");
                return;
            }
            if receiver.dispatch(event) {
                signal.signal_completion();
            }
        })
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close MIDI input device on drop");
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("state", &self.state())
            .field("device", &self.device)
            .field("handle", &self.handle)
            .field("pending", &self.pending_buffers())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::driver::mock::{MockDriver, MockOperation};
    use crate::error::DriverStatus;
    use crate::message::ShortMessage;
    use crate::receiver::{NullReceiver, RecordingReceiver};
    use std::thread;
    use std::time::Instant;
    use tracing_test::traced_test;

    fn note_on() -> ShortMessage {
        ShortMessage::pack(0x90, 60, 100)
    }

    fn session(driver: &Arc<MockDriver>) -> (DeviceSession, Arc<RecordingReceiver>) {
        let recorder = Arc::new(RecordingReceiver::new());
        (DeviceSession::new(driver.clone(), recorder.clone()), recorder)
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
    fn test_open_failure_stays_closed() {
        let driver = Arc::new(MockDriver::new());
        let (mut session, _) = session(&driver);
        driver.fail_next(MockOperation::Open, DriverStatus::Allocated);

        let err = session.open(0).unwrap_err();
        assert!(matches!(err, MidiError::DeviceOpen { device: 0, .. }));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(driver.open_handle_count(), 0);
    }

    #[test]
    fn test_add_buffer_requires_open_device() {
        let driver = Arc::new(MockDriver::new());
        let (session, _) = session(&driver);
        let err = session.add_sysex_buffer(64).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_start_requires_open_device() {
        let driver = Arc::new(MockDriver::new());
        let (mut session, _) = session(&driver);
        assert!(session.start_streaming().unwrap_err().is_invalid_state());
        assert!(session.stop_streaming().is_ok());
    }

    #[test]
    fn test_submit_failure_unprepares() {
        let driver = Arc::new(MockDriver::new());
        let (mut session, _) = session(&driver);
        session.open(0).unwrap();
        let handle = session.handle().unwrap();
        driver.fail_next(MockOperation::Submit, DriverStatus::NoMemory);

        let err = session.add_sysex_buffer(64).unwrap_err();
        assert!(err.is_resource_exhausted());
        assert_eq!(session.pending_buffers(), 0);
        assert_eq!(driver.prepared_count(handle), 0);
        assert_eq!(driver.unprepared_log().len(), 1);
    }

    #[test]
    fn test_short_messages_dispatch_in_any_open_state() {
        let driver = Arc::new(MockDriver::new());
        let (mut session, recorder) = session(&driver);
        session.open(0).unwrap();
        let handle = session.handle().unwrap();

        assert!(driver.deliver_short(handle, note_on(), 10));
        assert!(driver.deliver_short_error(handle, note_on(), 11));
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn test_set_receiver_swaps_binding() {
        let driver = Arc::new(MockDriver::new());
        let (mut session, first) = session(&driver);
        session.open(0).unwrap();
        let handle = session.handle().unwrap();

        let null: Arc<dyn MidiReceiver> = Arc::new(NullReceiver);
        let previous = session.set_receiver(null.clone());
        driver.deliver_short(handle, note_on(), 0);

        assert!(first.is_empty());
        assert_eq!(
            Arc::as_ptr(&previous) as *const (),
            Arc::as_ptr(&first) as *const ()
        );
        assert_eq!(
            Arc::as_ptr(&session.receiver()) as *const (),
            Arc::as_ptr(&null) as *const ()
        );
    }

    #[test]
    #[traced_test]
    fn test_stop_failure_is_logged_and_buffers_reclaimed() {
        let driver = Arc::new(MockDriver::new());
        let (mut session, _) = session(&driver);
        session.open(0).unwrap();
        session.add_sysex_buffer(16).unwrap();
        session.start_streaming().unwrap();
        driver.fail_next(MockOperation::Stop, DriverStatus::InvalidHandle);

        session.stop_streaming().unwrap();

        assert!(logs_contain("Driver stop failed while stopping"));
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.pending_buffers(), 0);
        assert!(!session.worker_running());
    }

    #[test]
    #[traced_test]
    fn test_join_timeout_keeps_worker_attached() {
        let driver = Arc::new(MockDriver::new());
        let options = SessionOptions {
            worker_name: "slow-reclaim".into(),
            join_timeout: Duration::from_millis(1),
        };
        let mut session =
            DeviceSession::with_options(driver.clone(), Arc::new(NullReceiver), options);
        session.open(0).unwrap();
        let handle = session.handle().unwrap();
        session.add_sysex_buffer(16).unwrap();
        session.add_sysex_buffer(16).unwrap();
        session.start_streaming().unwrap();

        // The worker is still inside the driver when the stop joins it.
        driver.stall_next(MockOperation::Unprepare, Duration::from_millis(200));
        assert!(driver.complete_input(handle, &[0xF0, 0xF7], 0));
        assert!(wait_until(|| driver.stalled_calls() == 1));

        session.stop_streaming().unwrap();

        assert!(logs_contain("Reclaim worker still running after stop"));
        assert_eq!(session.pending_buffers(), 0);
        assert_eq!(session.stats().reclaimed, 2);
        assert!(wait_until(|| !session.worker_running()));

        session.close().unwrap();
        assert_eq!(driver.open_handle_count(), 0);
    }

    #[test]
    fn test_drop_closes_device() {
        let driver = Arc::new(MockDriver::new());
        {
            let (mut session, _) = session(&driver);
            session.open(0).unwrap();
            session.add_sysex_buffer(32).unwrap();
            session.start_streaming().unwrap();
        }
        assert_eq!(driver.open_handle_count(), 0);
        assert_eq!(driver.unprepared_log().len(), 1);
    }
}
