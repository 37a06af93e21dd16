//! Session state shared between the control thread, the driver callback
//! context and the reclaim worker.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SessionState {
    /// No device handle is held
    #[default]
    Closed = 0,
    /// Device handle held, not streaming
    Open = 1,
    /// Device handle held and the driver is transferring buffers
    Streaming = 2,
}

impl SessionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::Streaming,
            _ => Self::Closed,
        }
    }

    /// True for Open and Streaming.
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// Atomically readable [`SessionState`].
///
/// Written only by the control thread; read from the callback context and the
/// reclaim worker without locking.
#[derive(Debug, Default)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    /// Create a cell holding `state`.
    pub fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Current state.
    pub fn load(&self) -> SessionState {
        SessionState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Replace the state.
    pub fn store(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Check whether the state currently equals `state`.
    pub fn is(&self, state: SessionState) -> bool {
        self.load() == state
    }
}
