//! # Rust MIDI
//!
//! Buffer-lifecycle coordination for streaming MIDI devices whose driver
//! reports activity from its own callback context.
//!
//! A streaming MIDI driver borrows application buffers: each system exclusive
//! buffer is prepared, submitted, filled by the driver, handed back through a
//! callback and must then be unprepared. The callback runs on a thread the
//! application does not own and may not block, so the unprepare cannot happen
//! there. This crate owns that hand-off:
//!
//! - **`session`**: [`DeviceSession`], the input device state machine
//!   (Closed, Open, Streaming).
//! - **`output`**: [`OutputDevice`], the output counterpart (Closed, Open).
//! - **`registry`**: FIFO of in-flight buffers, reclaimed oldest-first.
//! - **`worker`**: the background thread that reclaims one buffer per
//!   completion.
//! - **`signal`**: the non-blocking wake primitive between callback and worker.
//! - **`buffer`**: a prepared buffer that is unprepared exactly once.
//! - **`receiver`**: the application-facing event sink and its swappable binding.
//! - **`driver`**: the [`MidiDriver`] contract, plus an in-process mock
//!   (feature `mock`).
//! - **`message`**: short-message packing.
//! - **`config`** / **`logging`**: figment configuration and tracing setup.
//! - **`error`**: the [`MidiError`] taxonomy.
//!
//! # Example
//! ```
//! # #[cfg(feature = "mock")]
//! # fn main() -> Result<(), rust_midi::MidiError> {
//! use std::sync::Arc;
//! use rust_midi::driver::mock::MockDriver;
//! use rust_midi::{DeviceSession, RecordingReceiver};
//!
//! let driver = Arc::new(MockDriver::new());
//! let receiver = Arc::new(RecordingReceiver::new());
//! let mut session = DeviceSession::open_device(driver.clone(), 0, receiver.clone())?;
//! session.add_sysex_buffer(256)?;
//! session.start_streaming()?;
//! session.stop_streaming()?;
//! assert_eq!(session.pending_buffers(), 0);
//! session.close()?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "mock"))]
//! # fn main() {}
//! ```

pub mod buffer;
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod message;
pub mod output;
pub mod receiver;
pub mod registry;
pub mod session;
pub mod signal;
pub mod state;
pub mod worker;

pub use config::MidiConfig;
pub use driver::{DeviceCaps, DeviceHandle, DeviceId, Direction, MidiDriver, TransferBuffer};
pub use error::{DriverError, DriverStatus, MidiError, Result};
pub use message::ShortMessage;
pub use output::OutputDevice;
pub use receiver::{MidiReceiver, NullReceiver, RecordingReceiver};
pub use registry::RegistryStats;
pub use session::{DeviceSession, SessionOptions};
pub use state::SessionState;
