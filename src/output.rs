//! Output device.
//!
//! [`OutputDevice`] is the transmit-side counterpart of
//! [`DeviceSession`](crate::session::DeviceSession). It has only two states,
//! Closed and Open, and its reclaim worker runs for the whole time the device
//! is open: every long message sent is held in the registry until the driver
//! reports `OutputDone` for it.
//!
//! Completions are counted by wakes, and wakes collapse: several `OutputDone`
//! events that land before the worker runs again release a single buffer.
//! Under a fast completion rate transmitted messages therefore pile up in
//! the registry, bounded only by how many were sent. [`OutputDevice::close`]
//! reclaims all of them.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::buffer::BufferDescriptor;
use crate::driver::{
    BufferId, DeviceCaps, DeviceHandle, DeviceId, Direction, DriverCallback, DriverEvent,
    MidiDriver, TransferBuffer,
};
use crate::error::{MidiError, Result};
use crate::message::ShortMessage;
use crate::registry::{BufferRegistry, RegistryStats};
use crate::session::SessionOptions;
use crate::signal::CompletionSignal;
use crate::state::{AtomicState, SessionState};
use crate::worker::ReclaimWorker;

/// A MIDI output device.
pub struct OutputDevice {
    driver: Arc<dyn MidiDriver>,
    state: Arc<AtomicState>,
    signal: Arc<CompletionSignal>,
    registry: Arc<BufferRegistry>,
    handle: Option<DeviceHandle>,
    device: Option<DeviceId>,
    worker: Option<ReclaimWorker>,
    options: SessionOptions,
}

impl OutputDevice {
    /// Create a closed output device.
    pub fn new(driver: Arc<dyn MidiDriver>) -> Self {
        Self::with_options(driver, SessionOptions::default())
    }

    /// Create a closed output device with explicit options.
    pub fn with_options(driver: Arc<dyn MidiDriver>, options: SessionOptions) -> Self {
        Self {
            driver,
            state: Arc::new(AtomicState::default()),
            signal: Arc::new(CompletionSignal::new()),
            registry: Arc::new(BufferRegistry::new()),
            handle: None,
            device: None,
            worker: None,
            options,
        }
    }

    /// Create an output device and open `device` immediately.
    pub fn open_device(driver: Arc<dyn MidiDriver>, device: DeviceId) -> Result<Self> {
        let mut output = Self::new(driver);
        output.open(device)?;
        Ok(output)
    }

    /// Number of output devices the driver reports.
    pub fn device_count(driver: &dyn MidiDriver) -> u32 {
        driver.device_count(Direction::Output)
    }

    /// Capabilities of one output device.
    pub fn capabilities(driver: &dyn MidiDriver, device: DeviceId) -> Result<DeviceCaps> {
        Ok(driver.capabilities(Direction::Output, device)?)
    }

    /// Open `device`, closing any device already held.
    ///
    /// # Errors
    ///
    /// - [`MidiError::WorkerSpawn`] if the reclaim thread cannot start.
    /// - [`MidiError::DeviceOpen`] if the driver refuses; the worker is
    ///   stopped and the device stays Closed.
    pub fn open(&mut self, device: DeviceId) -> Result<()> {
        self.close()?;

        if let Some(worker) = self.worker.take() {
            if !worker.is_finished() {
                warn!(
                    worker = worker.name(),
                    "Detaching reclaim worker from previous open"
                );
            }
        }
        self.signal.reset();
        self.state.store(SessionState::Open);
        match ReclaimWorker::spawn(
            &self.options.worker_name,
            SessionState::Open,
            self.state.clone(),
            self.signal.clone(),
            self.registry.clone(),
        ) {
            Ok(worker) => self.worker = Some(worker),
            Err(e) => {
                self.state.store(SessionState::Closed);
                return Err(e);
            }
        }

        let callback = self.callback();
        match self.driver.open(Direction::Output, device, callback) {
            Ok(handle) => {
                self.handle = Some(handle);
                self.device = Some(device);
                info!(device, %handle, "Opened MIDI output device");
                Ok(())
            }
            Err(source) => {
                self.state.store(SessionState::Closed);
                self.signal.signal_completion();
                self.join_worker();
                Err(MidiError::DeviceOpen { device, source })
            }
        }
    }

    /// Release the device, reclaiming every buffer still in flight.
    ///
    /// No-op when Closed.
    ///
    /// # Errors
    ///
    /// [`MidiError::DeviceClose`] if the driver fails to release the handle.
    /// The device is Closed afterwards regardless.
    pub fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        self.state.store(SessionState::Closed);
        self.signal.signal_completion();
        self.join_worker();

        // Returns queued buffers through the callback; ignored now that we are Closed.
        if let Err(e) = self.driver.reset(handle) {
            warn!(%handle, error = %e, "Driver reset before close failed");
        }
        let reclaimed = self.registry.reclaim_all();

        let device = self.device.take();
        self.driver.close(handle).map_err(MidiError::DeviceClose)?;
        info!(device, %handle, reclaimed, "Closed MIDI output device");
        Ok(())
    }

    /// Send one short message.
    ///
    /// # Errors
    ///
    /// [`MidiError::InvalidState`] when Closed; driver failures otherwise.
    pub fn send_short(&self, message: ShortMessage) -> Result<()> {
        let handle = self.open_handle("send short message")?;
        self.driver
            .send_short(handle, message)
            .map_err(|e| MidiError::from_transfer("send short message", e))?;
        trace!(%handle, %message, "Sent short message");
        Ok(())
    }

    /// Send a long (system exclusive) message.
    ///
    /// The payload stays registered until the driver reports it transmitted
    /// and the worker wakes for it. Wakes collapse, so a transmitted payload
    /// may stay registered until [`close`](Self::close); callers streaming
    /// many messages on one open device should watch
    /// [`pending_buffers`](Self::pending_buffers).
    ///
    /// # Errors
    ///
    /// [`MidiError::InvalidState`] when Closed; prepare or submit failures
    /// otherwise, after unpreparing anything that was prepared.
    pub fn send_long(&self, payload: Vec<u8>) -> Result<BufferId> {
        let handle = self.open_handle("send long message")?;
        let descriptor = BufferDescriptor::prepare(
            self.driver.clone(),
            handle,
            TransferBuffer::from_payload(payload),
        )?;
        let id = self.registry.submit(descriptor)?;
        debug!(%handle, buffer = id, "Queued long message");
        Ok(id)
    }

    /// Current lifecycle state (never Streaming).
    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// True when Open.
    pub fn is_open(&self) -> bool {
        self.state.is(SessionState::Open)
    }

    /// Handle of the open device.
    pub fn handle(&self) -> Option<DeviceHandle> {
        self.handle
    }

    /// Identifier of the open device.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.device
    }

    /// Number of long messages awaiting reclamation.
    pub fn pending_buffers(&self) -> usize {
        self.registry.len()
    }

    /// Registry counters.
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Whether a reclaim worker is attached and still running.
    ///
    /// Stays true after a close whose join timed out, until that worker exits.
    pub fn worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    fn open_handle(&self, operation: &'static str) -> Result<DeviceHandle> {
        self.handle.ok_or(MidiError::InvalidState {
            operation,
            state: self.state.load(),
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
                pending = self.registry.len(),
                "Reclaim worker still running after close"
            );
        }
    }

    fn callback(&self) -> DriverCallback {
        let state = self.state.clone();
        let signal = self.signal.clone();
        Arc::new(move |handle: DeviceHandle, event: DriverEvent<'_>| {
            if let DriverEvent::OutputDone { buffer } = event {
                if state.is(SessionState::Open) {
                    signal.signal_completion();
                } else {
                    trace!(%handle, buffer = buffer.id(), "Ignoring late output completion");
                }
            }
        })
    }
}

impl Drop for OutputDevice {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close MIDI output device on drop");
        }
    }
}

impl std::fmt::Debug for OutputDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputDevice")
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
    use std::thread;
    use std::time::{Duration, Instant};
    use tracing_test::traced_test;

    #[test]
    fn test_open_failure_stops_worker() {
        let driver = Arc::new(MockDriver::new());
        let mut output = OutputDevice::new(driver.clone());
        driver.fail_next(MockOperation::Open, DriverStatus::Allocated);

        assert!(matches!(
            output.open(0).unwrap_err(),
            MidiError::DeviceOpen { .. }
        ));
        assert_eq!(output.state(), SessionState::Closed);
        assert!(!output.worker_running());
    }

    #[test]
    fn test_send_requires_open_device() {
        let driver = Arc::new(MockDriver::new());
        let output = OutputDevice::new(driver);
        let note = ShortMessage::pack(0x90, 64, 90);
        assert!(output.send_short(note).unwrap_err().is_invalid_state());
        let err = output.send_long(vec![0xF0, 0xF7]).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_send_short_reaches_driver() {
        let driver = Arc::new(MockDriver::new());
        let output = OutputDevice::open_device(driver.clone(), 0).unwrap();
        let message = ShortMessage::pack_channel(0xB0, 3, 7, 100).unwrap();
        output.send_short(message).unwrap();
        assert_eq!(driver.sent_short(), vec![message]);
    }

    #[test]
    fn test_send_short_busy() {
        let driver = Arc::new(MockDriver::new());
        let output = OutputDevice::open_device(driver.clone(), 0).unwrap();
        driver.fail_next(MockOperation::SendShort, DriverStatus::NotReady);
        let err = output
            .send_short(ShortMessage::pack(0xF8, 0, 0))
            .unwrap_err();
        assert!(err.is_busy());
    }

    #[test]
    #[traced_test]
    fn test_close_join_timeout_keeps_worker_attached() {
        let driver = Arc::new(MockDriver::new());
        let options = SessionOptions {
            worker_name: "slow-out-reclaim".into(),
            join_timeout: Duration::from_millis(1),
        };
        let mut output = OutputDevice::with_options(driver.clone(), options);
        output.open(0).unwrap();
        let handle = output.handle().unwrap();
        output.send_long(vec![0xF0, 0x01, 0xF7]).unwrap();
        output.send_long(vec![0xF0, 0x02, 0xF7]).unwrap();

        driver.stall_next(MockOperation::Unprepare, Duration::from_millis(200));
        assert!(driver.complete_output(handle));
        let deadline = Instant::now() + Duration::from_secs(2);
        while driver.stalled_calls() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(driver.stalled_calls(), 1);

        output.close().unwrap();

        assert!(logs_contain("Reclaim worker still running after close"));
        assert_eq!(output.pending_buffers(), 0);
        assert_eq!(output.stats().reclaimed, 2);
        let deadline = Instant::now() + Duration::from_secs(2);
        while output.worker_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!output.worker_running());
    }
}
