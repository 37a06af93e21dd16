//! Driver boundary.
//!
//! [`MidiDriver`] is the abstract contract a platform MIDI subsystem offers:
//! enumeration, open/close, start/stop/reset, buffer prepare/unprepare/submit
//! and short-message output. Sessions hold the driver as
//! `Arc<dyn MidiDriver>` and never see platform types.
//!
//! The driver reports asynchronous activity by calling the [`DriverCallback`]
//! registered at open time. That call happens on a thread the application
//! does not own, so callbacks must not block and must return quickly.

#[cfg(feature = "mock")]
pub mod mock;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::DriverError;
use crate::message::ShortMessage;

/// Result of a driver operation.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Index of a device in the driver's enumeration order.
pub type DeviceId = u32;

/// Opaque handle to an open device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    /// Wrap a raw driver handle value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw driver handle value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Transfer direction of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Device produces messages
    Input,
    /// Device consumes messages
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Capabilities reported for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCaps {
    /// Product name
    pub name: String,
    /// Manufacturer identifier
    pub manufacturer_id: u16,
    /// Product identifier
    pub product_id: u16,
    /// Driver version, major in the high byte
    pub driver_version: u32,
    /// Transfer direction
    pub direction: Direction,
}

/// Identifier of a [`TransferBuffer`], unique for the process lifetime.
pub type BufferId = u64;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

struct BufferInner {
    id: BufferId,
    data: Mutex<Vec<u8>>,
    capacity: usize,
    bytes_recorded: AtomicUsize,
}

/// Backing memory for one long-message transfer.
///
/// Cloning is cheap and shares the same memory: the application keeps one
/// reference inside its buffer descriptor, the driver keeps another while the
/// transfer is queued.
#[derive(Clone)]
pub struct TransferBuffer {
    inner: Arc<BufferInner>,
}

impl TransferBuffer {
    /// Wrap `data` as an outgoing payload; all bytes count as recorded.
    pub fn from_payload(data: Vec<u8>) -> Self {
        let len = data.len();
        Self::build(data, len)
    }

    /// Allocate a zeroed receive buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(vec![0; capacity], 0)
    }

    fn build(data: Vec<u8>, recorded: usize) -> Self {
        let capacity = data.len();
        Self {
            inner: Arc::new(BufferInner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                data: Mutex::new(data),
                capacity,
                bytes_recorded: AtomicUsize::new(recorded),
            }),
        }
    }

    /// Buffer identifier.
    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    /// Capacity in bytes.
    pub fn len(&self) -> usize {
        self.inner.capacity
    }

    /// True if the buffer has zero capacity.
    pub fn is_empty(&self) -> bool {
        self.inner.capacity == 0
    }

    /// Number of valid bytes.
    pub fn bytes_recorded(&self) -> usize {
        self.inner.bytes_recorded.load(Ordering::Acquire)
    }

    /// Overwrite the buffer contents with `bytes`, truncated to capacity.
    ///
    /// Called by drivers when a transfer completes. Returns the number of
    /// bytes stored.
    pub fn record(&self, bytes: &[u8]) -> usize {
        let mut data = self.inner.data.lock();
        let n = bytes.len().min(data.len());
        data[..n].copy_from_slice(&bytes[..n]);
        self.inner.bytes_recorded.store(n, Ordering::Release);
        n
    }

    /// Run `f` over the recorded bytes.
    pub fn with_recorded<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.inner.data.lock();
        let n = self.bytes_recorded().min(data.len());
        f(&data[..n])
    }

    /// Copy of the recorded bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_recorded(<[u8]>::to_vec)
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("id", &self.id())
            .field("len", &self.len())
            .field("bytes_recorded", &self.bytes_recorded())
            .finish()
    }
}

/// Event delivered by the driver to the callback registered at open time.
#[derive(Debug, Clone, Copy)]
pub enum DriverEvent<'a> {
    /// A valid short message arrived
    ShortData {
        /// Packed message
        message: ShortMessage,
        /// Driver timestamp in milliseconds since streaming started
        timestamp: u32,
    },
    /// An invalid short message arrived
    ShortError {
        /// Packed message
        message: ShortMessage,
        /// Driver timestamp
        timestamp: u32,
    },
    /// A queued input buffer was filled (or returned by a reset)
    LongData {
        /// Completed buffer
        buffer: &'a TransferBuffer,
        /// Driver timestamp
        timestamp: u32,
    },
    /// A queued input buffer was filled with an invalid message
    LongError {
        /// Completed buffer
        buffer: &'a TransferBuffer,
        /// Driver timestamp
        timestamp: u32,
    },
    /// An output buffer finished transmitting
    OutputDone {
        /// Completed buffer
        buffer: &'a TransferBuffer,
    },
}

/// Closure invoked by the driver from its own callback context.
///
/// Captures whatever session state it needs; the driver passes back only the
/// handle and the event.
pub type DriverCallback = Arc<dyn Fn(DeviceHandle, DriverEvent<'_>) + Send + Sync + 'static>;

/// Contract of the platform MIDI subsystem.
///
/// Buffer operations take the [`TransferBuffer`] by reference; a driver that
/// needs to hold on to a submitted buffer clones it.
pub trait MidiDriver: Send + Sync {
    /// Number of devices present for `direction`.
    fn device_count(&self, direction: Direction) -> u32;

    /// Capabilities of one device.
    fn capabilities(&self, direction: Direction, device: DeviceId) -> DriverResult<DeviceCaps>;

    /// Open a device, registering `callback` for its events.
    fn open(
        &self,
        direction: Direction,
        device: DeviceId,
        callback: DriverCallback,
    ) -> DriverResult<DeviceHandle>;

    /// Release a device handle.
    fn close(&self, handle: DeviceHandle) -> DriverResult<()>;

    /// Begin streaming input.
    fn start(&self, handle: DeviceHandle) -> DriverResult<()>;

    /// Pause streaming input; queued buffers stay queued.
    fn stop(&self, handle: DeviceHandle) -> DriverResult<()>;

    /// Stop streaming and return every queued buffer through the callback.
    fn reset(&self, handle: DeviceHandle) -> DriverResult<()>;

    /// Register a buffer with the driver.
    fn prepare_buffer(&self, handle: DeviceHandle, buffer: &TransferBuffer) -> DriverResult<()>;

    /// Deregister a buffer.
    fn unprepare_buffer(&self, handle: DeviceHandle, buffer: &TransferBuffer) -> DriverResult<()>;

    /// Queue a prepared buffer for asynchronous transfer.
    fn submit_buffer(&self, handle: DeviceHandle, buffer: &TransferBuffer) -> DriverResult<()>;

    /// Send one short message synchronously.
    fn send_short(&self, handle: DeviceHandle, message: ShortMessage) -> DriverResult<()>;
}
