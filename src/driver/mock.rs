//! In-process MIDI driver for tests and the CLI.
//!
//! Behaves like a FIFO streaming driver:
//!
//! - Submitted buffers queue per handle and complete oldest-first.
//! - `reset` hands every queued buffer back through the callback (input
//!   buffers as `LongData` with zero bytes, output buffers as `OutputDone`),
//!   from the calling thread, the same way platform drivers do.
//! - Unpreparing a buffer that is still queued fails with
//!   [`DriverStatus::StillPlaying`].
//!
//! Events are injected with the `deliver_*` / `complete_*` methods, which
//! invoke the callback on the caller's thread, or with
//! [`MockDriver::spawn_input_completions`], which runs them on a separate
//! thread standing in for the driver callback context.
//!
//! Failures can be scripted with [`MockDriver::fail_next`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::{
    BufferId, DeviceCaps, DeviceHandle, DeviceId, Direction, DriverCallback, DriverEvent,
    DriverResult, MidiDriver, TransferBuffer,
};
use crate::error::{DriverError, DriverStatus};
use crate::message::ShortMessage;

/// Driver operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    /// [`MidiDriver::open`]
    Open,
    /// [`MidiDriver::close`]
    Close,
    /// [`MidiDriver::start`]
    Start,
    /// [`MidiDriver::stop`]
    Stop,
    /// [`MidiDriver::reset`]
    Reset,
    /// [`MidiDriver::prepare_buffer`]
    Prepare,
    /// [`MidiDriver::unprepare_buffer`]
    Unprepare,
    /// [`MidiDriver::submit_buffer`]
    Submit,
    /// [`MidiDriver::send_short`]
    SendShort,
}

struct MockPort {
    direction: Direction,
    device: DeviceId,
    callback: DriverCallback,
    started: bool,
    prepared: HashSet<BufferId>,
    pending: VecDeque<TransferBuffer>,
}

#[derive(Default)]
struct MockState {
    inputs: Vec<DeviceCaps>,
    outputs: Vec<DeviceCaps>,
    ports: HashMap<DeviceHandle, MockPort>,
    faults: HashMap<MockOperation, VecDeque<DriverStatus>>,
    stalls: HashMap<MockOperation, VecDeque<Duration>>,
    stalled_calls: usize,
    unprepared: Vec<BufferId>,
    sent_short: Vec<ShortMessage>,
    sent_long: Vec<Vec<u8>>,
}

impl MockState {
    fn take_fault(&mut self, operation: MockOperation) -> DriverResult<()> {
        match self.faults.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(status) => {
                trace!(?operation, %status, "Mock driver injecting failure");
                Err(DriverError::from_status(status))
            }
            None => Ok(()),
        }
    }

    fn take_stall(&mut self, operation: MockOperation) -> Option<Duration> {
        let delay = self.stalls.get_mut(&operation).and_then(VecDeque::pop_front)?;
        self.stalled_calls += 1;
        Some(delay)
    }

    fn port(&mut self, handle: DeviceHandle) -> DriverResult<&mut MockPort> {
        self.ports
            .get_mut(&handle)
            .ok_or_else(|| DriverError::from_status(DriverStatus::InvalidHandle))
    }
}

/// Simulated MIDI driver.
pub struct MockDriver {
    state: Mutex<MockState>,
    next_handle: AtomicU64,
}

impl MockDriver {
    /// Driver with one input and one output device.
    pub fn new() -> Self {
        Self::with_devices(1, 1)
    }

    /// Driver with the given number of input and output devices.
    pub fn with_devices(inputs: u32, outputs: u32) -> Self {
        let caps = |direction: Direction, index: u32| DeviceCaps {
            name: match direction {
                Direction::Input => format!("Mock MIDI In {}", index + 1),
                Direction::Output => format!("Mock MIDI Out {}", index + 1),
            },
            manufacturer_id: 0xFFFF,
            product_id: index as u16,
            driver_version: 0x0100,
            direction,
        };
        let state = MockState {
            inputs: (0..inputs).map(|i| caps(Direction::Input, i)).collect(),
            outputs: (0..outputs).map(|i| caps(Direction::Output, i)).collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            next_handle: AtomicU64::new(0x100),
        }
    }

    /// Fail the next call of `operation` with `status`.
    ///
    /// Calls queue up: scripting the same operation twice fails it twice.
    pub fn fail_next(&self, operation: MockOperation, status: DriverStatus) {
        self.state
            .lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(status);
    }

    /// Block the next call of `operation` for `delay` before it runs.
    ///
    /// The delay is spent without holding the driver lock, like a slow
    /// platform driver call.
    pub fn stall_next(&self, operation: MockOperation, delay: Duration) {
        self.state
            .lock()
            .stalls
            .entry(operation)
            .or_default()
            .push_back(delay);
    }

    /// Number of calls that have entered a scripted stall.
    pub fn stalled_calls(&self) -> usize {
        self.state.lock().stalled_calls
    }

    fn stall(&self, operation: MockOperation) {
        let delay = self.state.lock().take_stall(operation);
        if let Some(delay) = delay {
            trace!(?operation, ?delay, "Mock driver stalling");
            thread::sleep(delay);
        }
    }

    /// Deliver a valid short message. Returns false if `handle` is not open.
    pub fn deliver_short(
        &self,
        handle: DeviceHandle,
        message: ShortMessage,
        timestamp: u32,
    ) -> bool {
        self.dispatch(handle, |callback| {
            callback(handle, DriverEvent::ShortData { message, timestamp })
        })
    }

    /// Deliver an invalid short message. Returns false if `handle` is not open.
    pub fn deliver_short_error(
        &self,
        handle: DeviceHandle,
        message: ShortMessage,
        timestamp: u32,
    ) -> bool {
        self.dispatch(handle, |callback| {
            callback(handle, DriverEvent::ShortError { message, timestamp })
        })
    }

    /// Fill the oldest queued input buffer with `bytes` and report it.
    ///
    /// Returns false if the port is not streaming or has no queued buffer.
    pub fn complete_input(&self, handle: DeviceHandle, bytes: &[u8], timestamp: u32) -> bool {
        self.complete_input_with(handle, bytes, |buffer| DriverEvent::LongData {
            buffer,
            timestamp,
        })
    }

    /// Fill the oldest queued input buffer and report it as invalid.
    pub fn complete_input_error(&self, handle: DeviceHandle, bytes: &[u8], timestamp: u32) -> bool {
        self.complete_input_with(handle, bytes, |buffer| DriverEvent::LongError {
            buffer,
            timestamp,
        })
    }

    fn complete_input_with(
        &self,
        handle: DeviceHandle,
        bytes: &[u8],
        event: impl for<'a> FnOnce(&'a TransferBuffer) -> DriverEvent<'a>,
    ) -> bool {
        let (callback, buffer) = {
            let mut state = self.state.lock();
            let Ok(port) = state.port(handle) else {
                return false;
            };
            if port.direction != Direction::Input || !port.started {
                return false;
            }
            let Some(buffer) = port.pending.pop_front() else {
                return false;
            };
            (port.callback.clone(), buffer)
        };
        buffer.record(bytes);
        callback(handle, event(&buffer));
        true
    }

    /// Finish transmitting the oldest queued output buffer.
    pub fn complete_output(&self, handle: DeviceHandle) -> bool {
        let (callback, buffer) = {
            let mut state = self.state.lock();
            let Ok(port) = state.port(handle) else {
                return false;
            };
            if port.direction != Direction::Output {
                return false;
            }
            let Some(buffer) = port.pending.pop_front() else {
                return false;
            };
            (port.callback.clone(), buffer)
        };
        callback(handle, DriverEvent::OutputDone { buffer: &buffer });
        true
    }

    /// Complete one queued input buffer per payload from a separate thread.
    ///
    /// The thread returns how many completions it delivered; it stops early
    /// when no buffer is queued.
    pub fn spawn_input_completions(
        self: &Arc<Self>,
        handle: DeviceHandle,
        payloads: Vec<Vec<u8>>,
    ) -> std::io::Result<JoinHandle<usize>> {
        let driver = Arc::clone(self);
        std::thread::Builder::new()
            .name("mock-midi-driver".to_string())
            .spawn(move || {
                payloads
                    .iter()
                    .enumerate()
                    .take_while(|(i, payload)| driver.complete_input(handle, payload, *i as u32))
                    .count()
            })
    }

    /// Number of buffers queued on `handle`.
    pub fn pending_count(&self, handle: DeviceHandle) -> usize {
        self.state
            .lock()
            .ports
            .get(&handle)
            .map_or(0, |port| port.pending.len())
    }

    /// Number of buffers prepared on `handle`.
    pub fn prepared_count(&self, handle: DeviceHandle) -> usize {
        self.state
            .lock()
            .ports
            .get(&handle)
            .map_or(0, |port| port.prepared.len())
    }

    /// Number of open handles.
    pub fn open_handle_count(&self) -> usize {
        self.state.lock().ports.len()
    }

    /// Device index behind `handle`.
    pub fn device_of(&self, handle: DeviceHandle) -> Option<DeviceId> {
        self.state.lock().ports.get(&handle).map(|port| port.device)
    }

    /// Whether `handle` is streaming.
    pub fn is_started(&self, handle: DeviceHandle) -> bool {
        self.state
            .lock()
            .ports
            .get(&handle)
            .is_some_and(|port| port.started)
    }

    /// Buffers in the order they were unprepared.
    pub fn unprepared_log(&self) -> Vec<BufferId> {
        self.state.lock().unprepared.clone()
    }

    /// Short messages sent so far.
    pub fn sent_short(&self) -> Vec<ShortMessage> {
        self.state.lock().sent_short.clone()
    }

    /// Long-message payloads submitted on output ports so far.
    pub fn sent_long(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent_long.clone()
    }

    fn dispatch(&self, handle: DeviceHandle, f: impl FnOnce(&DriverCallback)) -> bool {
        let callback = match self.state.lock().ports.get(&handle) {
            Some(port) => port.callback.clone(),
            None => return false,
        };
        f(&callback);
        true
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiDriver for MockDriver {
    fn device_count(&self, direction: Direction) -> u32 {
        let state = self.state.lock();
        let count = match direction {
            Direction::Input => state.inputs.len(),
            Direction::Output => state.outputs.len(),
        };
        count as u32
    }

    fn capabilities(&self, direction: Direction, device: DeviceId) -> DriverResult<DeviceCaps> {
        let state = self.state.lock();
        let devices = match direction {
            Direction::Input => &state.inputs,
            Direction::Output => &state.outputs,
        };
        devices
            .get(device as usize)
            .cloned()
            .ok_or_else(|| DriverError::from_status(DriverStatus::BadDeviceId))
    }

    fn open(
        &self,
        direction: Direction,
        device: DeviceId,
        callback: DriverCallback,
    ) -> DriverResult<DeviceHandle> {
        let mut state = self.state.lock();
        state.take_fault(MockOperation::Open)?;
        let count = match direction {
            Direction::Input => state.inputs.len(),
            Direction::Output => state.outputs.len(),
        };
        if device as usize >= count {
            return Err(DriverError::from_status(DriverStatus::BadDeviceId));
        }
        let handle = DeviceHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        state.ports.insert(
            handle,
            MockPort {
                direction,
                device,
                callback,
                started: false,
                prepared: HashSet::new(),
                pending: VecDeque::new(),
            },
        );
        trace!(%handle, %direction, device, "Mock driver opened port");
        Ok(handle)
    }

    fn close(&self, handle: DeviceHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_fault(MockOperation::Close)?;
        if !state.port(handle)?.pending.is_empty() {
            return Err(DriverError::from_status(DriverStatus::StillPlaying));
        }
        state.ports.remove(&handle);
        Ok(())
    }

    fn start(&self, handle: DeviceHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_fault(MockOperation::Start)?;
        state.port(handle)?.started = true;
        Ok(())
    }

    fn stop(&self, handle: DeviceHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_fault(MockOperation::Stop)?;
        state.port(handle)?.started = false;
        Ok(())
    }

    fn reset(&self, handle: DeviceHandle) -> DriverResult<()> {
        let (callback, direction, returned) = {
            let mut state = self.state.lock();
            state.take_fault(MockOperation::Reset)?;
            let port = state.port(handle)?;
            port.started = false;
            let returned: Vec<_> = port.pending.drain(..).collect();
            (port.callback.clone(), port.direction, returned)
        };
        // Callback runs without the driver lock so receivers may query the mock.
        for buffer in &returned {
            let event = match direction {
                Direction::Input => {
                    buffer.record(&[]);
                    DriverEvent::LongData {
                        buffer,
                        timestamp: 0,
                    }
                }
                Direction::Output => DriverEvent::OutputDone { buffer },
            };
            callback(handle, event);
        }
        Ok(())
    }

    fn prepare_buffer(&self, handle: DeviceHandle, buffer: &TransferBuffer) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_fault(MockOperation::Prepare)?;
        state.port(handle)?.prepared.insert(buffer.id());
        Ok(())
    }

    fn unprepare_buffer(&self, handle: DeviceHandle, buffer: &TransferBuffer) -> DriverResult<()> {
        self.stall(MockOperation::Unprepare);
        let mut state = self.state.lock();
        state.take_fault(MockOperation::Unprepare)?;
        let port = state.port(handle)?;
        if port.pending.iter().any(|queued| queued.id() == buffer.id()) {
            return Err(DriverError::from_status(DriverStatus::StillPlaying));
        }
        port.prepared.remove(&buffer.id());
        state.unprepared.push(buffer.id());
        Ok(())
    }

    fn submit_buffer(&self, handle: DeviceHandle, buffer: &TransferBuffer) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_fault(MockOperation::Submit)?;
        let port = state.port(handle)?;
        if !port.prepared.contains(&buffer.id()) {
            return Err(DriverError::from_status(DriverStatus::Unprepared));
        }
        port.pending.push_back(buffer.clone());
        if port.direction == Direction::Output {
            let payload = buffer.to_vec();
            state.sent_long.push(payload);
        }
        Ok(())
    }

    fn send_short(&self, handle: DeviceHandle, message: ShortMessage) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_fault(MockOperation::SendShort)?;
        if state.port(handle)?.direction != Direction::Output {
            return Err(DriverError::from_status(DriverStatus::InvalidHandle));
        }
        state.sent_short.push(message);
        Ok(())
    }
}
