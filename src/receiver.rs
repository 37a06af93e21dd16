//! Receivers for incoming MIDI events.
//!
//! A [`MidiReceiver`] is invoked synchronously from the driver callback
//! context. Implementations must not block and must not call back into the
//! session that is delivering to them.
//!
//! The session keeps its receiver in a [`ReceiverSlot`], an `ArcSwap`, so the
//! application can swap receivers while a callback is in flight: the callback
//! finishes against whichever receiver it loaded, and the next callback sees
//! the new one.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::driver::DriverEvent;
use crate::message::ShortMessage;

/// Sink for events delivered by an input device.
pub trait MidiReceiver: Send + Sync {
    /// A valid short message arrived.
    fn receive_short(&self, message: ShortMessage, timestamp: u32);

    /// A long (system exclusive) message arrived in a queued buffer.
    fn receive_long(&self, bytes: &[u8], timestamp: u32);

    /// An invalid short message arrived.
    fn on_error_short(&self, message: ShortMessage, timestamp: u32);

    /// An invalid long message arrived in a queued buffer.
    fn on_error_long(&self, bytes: &[u8], timestamp: u32);
}

/// Receiver that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReceiver;

impl MidiReceiver for NullReceiver {
    fn receive_short(&self, _message: ShortMessage, _timestamp: u32) {}
    fn receive_long(&self, _bytes: &[u8], _timestamp: u32) {}
    fn on_error_short(&self, _message: ShortMessage, _timestamp: u32) {}
    fn on_error_long(&self, _bytes: &[u8], _timestamp: u32) {}
}

/// One event captured by a [`RecordingReceiver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedEvent {
    /// From `receive_short`
    Short {
        /// Packed message
        message: ShortMessage,
        /// Driver timestamp
        timestamp: u32,
    },
    /// From `receive_long`
    Long {
        /// Message bytes
        bytes: Vec<u8>,
        /// Driver timestamp
        timestamp: u32,
    },
    /// From `on_error_short`
    ShortError {
        /// Packed message
        message: ShortMessage,
        /// Driver timestamp
        timestamp: u32,
    },
    /// From `on_error_long`
    LongError {
        /// Message bytes
        bytes: Vec<u8>,
        /// Driver timestamp
        timestamp: u32,
    },
}

/// Receiver that appends every event to an in-memory log.
///
/// Holds its lock only for the push, so it is usable from the callback
/// context. Meant for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingReceiver {
    events: Mutex<Vec<ReceivedEvent>>,
}

impl RecordingReceiver {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the events received so far.
    pub fn events(&self) -> Vec<ReceivedEvent> {
        self.events.lock().clone()
    }

    /// Number of events received so far.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True if nothing has been received.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Payloads of the long messages received so far, in arrival order.
    pub fn long_messages(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ReceivedEvent::Long { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }
}

impl MidiReceiver for RecordingReceiver {
    fn receive_short(&self, message: ShortMessage, timestamp: u32) {
        self.events
            .lock()
            .push(ReceivedEvent::Short { message, timestamp });
    }

    fn receive_long(&self, bytes: &[u8], timestamp: u32) {
        self.events.lock().push(ReceivedEvent::Long {
            bytes: bytes.to_vec(),
            timestamp,
        });
    }

    fn on_error_short(&self, message: ShortMessage, timestamp: u32) {
        self.events
            .lock()
            .push(ReceivedEvent::ShortError { message, timestamp });
    }

    fn on_error_long(&self, bytes: &[u8], timestamp: u32) {
        self.events.lock().push(ReceivedEvent::LongError {
            bytes: bytes.to_vec(),
            timestamp,
        });
    }
}

// `ArcSwap` needs a sized pointee.
struct Binding(Arc<dyn MidiReceiver>);

/// Atomically swappable receiver binding.
pub struct ReceiverSlot {
    current: ArcSwap<Binding>,
}

impl ReceiverSlot {
    /// Bind `receiver`.
    pub fn new(receiver: Arc<dyn MidiReceiver>) -> Self {
        Self {
            current: ArcSwap::from_pointee(Binding(receiver)),
        }
    }

    /// Currently bound receiver.
    pub fn get(&self) -> Arc<dyn MidiReceiver> {
        Arc::clone(&self.current.load().0)
    }

    /// Bind `receiver` and return the previous one.
    pub fn replace(&self, receiver: Arc<dyn MidiReceiver>) -> Arc<dyn MidiReceiver> {
        let previous = self.current.swap(Arc::new(Binding(receiver)));
        Arc::clone(&previous.0)
    }

    /// Route one driver event to the bound receiver.
    ///
    /// Returns true for long events (a buffer was handed back), which the
    /// caller must follow with a completion signal. `OutputDone` is not an
    /// input event and is ignored.
    pub fn dispatch(&self, event: DriverEvent<'_>) -> bool {
        let binding = self.current.load();
        let receiver = &binding.0;
        match event {
            DriverEvent::ShortData { message, timestamp } => {
                receiver.receive_short(message, timestamp);
                false
            }
            DriverEvent::ShortError { message, timestamp } => {
                receiver.on_error_short(message, timestamp);
                false
            }
            DriverEvent::LongData { buffer, timestamp } => {
                buffer.with_recorded(|bytes| receiver.receive_long(bytes, timestamp));
                true
            }
            DriverEvent::LongError { buffer, timestamp } => {
                buffer.with_recorded(|bytes| receiver.on_error_long(bytes, timestamp));
                true
            }
            DriverEvent::OutputDone { .. } => false,
        }
    }
}

impl fmt::Debug for ReceiverSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverSlot").finish_non_exhaustive()
    }
}
