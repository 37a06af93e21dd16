//! Error types for MIDI device sessions.
//!
//! Two layers are modelled here:
//!
//! - [`DriverError`]: a raw status code plus message text as reported by the
//!   driver boundary. Every [`MidiDriver`](crate::driver::MidiDriver) operation
//!   returns this type.
//! - [`MidiError`]: the crate-level error surfaced by sessions and devices. It
//!   records *which* transition failed (open, close, start, buffer submission)
//!   and keeps the originating `DriverError` as its source.
//!
//! Allocation failure inside the driver is always surfaced as
//! [`MidiError::ResourceExhausted`] for buffer operations, and can be detected
//! on any other variant with [`MidiError::is_resource_exhausted`].
//!
//! Errors raised inside the driver callback context are never returned from
//! here; they reach the application through the `on_error_*` methods of
//! [`MidiReceiver`](crate::receiver::MidiReceiver).

use std::fmt;

use thiserror::Error;

use crate::state::SessionState;

/// Result type alias for MIDI operations.
pub type Result<T> = std::result::Result<T, MidiError>;

/// Status codes reported by a MIDI driver.
///
/// Numbering follows the multimedia-system convention used by MIDI drivers
/// (`0` is success, `64..` are MIDI specific).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverStatus {
    /// Unspecified failure
    Error,
    /// Device identifier out of range
    BadDeviceId,
    /// Device already allocated to another client
    Allocated,
    /// Handle is not valid
    InvalidHandle,
    /// No driver installed for the device
    NoDriver,
    /// Driver could not allocate memory
    NoMemory,
    /// Invalid parameter passed to the driver
    InvalidParam,
    /// Buffer has not been prepared
    Unprepared,
    /// Buffers are still queued on the device
    StillPlaying,
    /// Device is not ready for more data
    NotReady,
    /// Any code not listed above
    Other(u32),
}

impl DriverStatus {
    /// Convert from a raw driver status code.
    ///
    /// Returns `None` for the success code `0`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::Error),
            2 => Some(Self::BadDeviceId),
            4 => Some(Self::Allocated),
            5 => Some(Self::InvalidHandle),
            6 => Some(Self::NoDriver),
            7 => Some(Self::NoMemory),
            11 => Some(Self::InvalidParam),
            64 => Some(Self::Unprepared),
            65 => Some(Self::StillPlaying),
            67 => Some(Self::NotReady),
            other => Some(Self::Other(other)),
        }
    }

    /// Raw status code.
    pub fn code(self) -> u32 {
        match self {
            Self::Error => 1,
            Self::BadDeviceId => 2,
            Self::Allocated => 4,
            Self::InvalidHandle => 5,
            Self::NoDriver => 6,
            Self::NoMemory => 7,
            Self::InvalidParam => 11,
            Self::Unprepared => 64,
            Self::StillPlaying => 65,
            Self::NotReady => 67,
            Self::Other(code) => code,
        }
    }

    /// Default message text for this status.
    pub fn description(self) -> &'static str {
        match self {
            Self::Error => "unspecified error",
            Self::BadDeviceId => "device ID out of range",
            Self::Allocated => "device already allocated",
            Self::InvalidHandle => "invalid device handle",
            Self::NoDriver => "no device driver present",
            Self::NoMemory => "unable to allocate or lock memory",
            Self::InvalidParam => "invalid parameter passed",
            Self::Unprepared => "header not prepared",
            Self::StillPlaying => "buffers are still in the queue",
            Self::NotReady => "hardware is busy",
            Self::Other(_) => "unknown driver error",
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// A failure reported by the driver boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("driver error {code}: {message}")]
pub struct DriverError {
    /// Raw status code
    pub code: u32,
    /// Driver-supplied message text
    pub message: String,
}

impl DriverError {
    /// Create an error from a raw code and message.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create an error carrying the default text for `status`.
    pub fn from_status(status: DriverStatus) -> Self {
        Self::new(status.code(), status.description())
    }

    /// Classified status, or `None` if the code is the success code.
    pub fn status(&self) -> Option<DriverStatus> {
        DriverStatus::from_code(self.code)
    }

    /// Check if the driver reported that it is busy.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.status(),
            Some(DriverStatus::StillPlaying | DriverStatus::NotReady)
        )
    }

    /// Check if the driver ran out of memory.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self.status(), Some(DriverStatus::NoMemory))
    }
}

impl From<DriverStatus> for DriverError {
    fn from(status: DriverStatus) -> Self {
        Self::from_status(status)
    }
}

/// Errors surfaced by [`DeviceSession`](crate::session::DeviceSession) and
/// [`OutputDevice`](crate::output::OutputDevice).
#[derive(Error, Debug)]
pub enum MidiError {
    /// The driver refused to open the device. The session stays closed.
    #[error("Failed to open MIDI device {device}: {source}")]
    DeviceOpen {
        /// Device identifier passed to open
        device: u32,
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// The driver reported a failure while releasing the device handle.
    #[error("Failed to close MIDI device: {0}")]
    DeviceClose(#[source] DriverError),

    /// The driver rejected a buffer or message operation.
    #[error("Driver rejected {operation}: {source}")]
    DriverRejected {
        /// Operation that failed
        operation: &'static str,
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// The driver cannot accept the operation right now.
    #[error("Driver busy during {operation}: {source}")]
    DriverBusy {
        /// Operation that failed
        operation: &'static str,
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// The driver refused to begin streaming. The session is back in Open.
    #[error("Driver failed to start streaming: {0}")]
    DriverStart(#[source] DriverError),

    /// The driver could not allocate memory for the operation.
    #[error("Resource exhausted during {operation}: {source}")]
    ResourceExhausted {
        /// Operation that failed
        operation: &'static str,
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// The completion signal could not be created.
    #[error("Unable to create a completion signal for the session")]
    SignalCreationFailed,

    /// The reclaim worker thread could not be spawned.
    #[error("Unable to spawn reclaim worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// The operation is not permitted in the current session state.
    #[error("Cannot {operation} while device is {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the session was in
        state: SessionState,
    },

    /// Generic driver failure not covered by a more specific variant.
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// A short message could not be packed.
    #[error("Invalid short message: {0}")]
    InvalidMessage(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl MidiError {
    /// Classify a driver failure on a buffer or message operation.
    pub(crate) fn from_transfer(operation: &'static str, source: DriverError) -> Self {
        if source.is_resource_exhausted() {
            Self::ResourceExhausted { operation, source }
        } else if source.is_busy() {
            Self::DriverBusy { operation, source }
        } else {
            Self::DriverRejected { operation, source }
        }
    }

    /// The driver error underlying this failure, if any.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::DeviceOpen { source, .. }
            | Self::DriverRejected { source, .. }
            | Self::DriverBusy { source, .. }
            | Self::ResourceExhausted { source, .. } => Some(source),
            Self::DeviceClose(source) | Self::DriverStart(source) | Self::Driver(source) => {
                Some(source)
            }
            _ => None,
        }
    }

    /// Check if this failure was caused by driver memory exhaustion.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
            || self
                .driver_error()
                .is_some_and(DriverError::is_resource_exhausted)
    }

    /// Check if the driver reported it was busy.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::DriverBusy { .. })
    }

    /// Check if the operation was refused because of the session state.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

impl From<figment::Error> for MidiError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
