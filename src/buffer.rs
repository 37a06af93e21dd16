//! Prepared transfer buffers.
//!
//! A [`BufferDescriptor`] binds one [`TransferBuffer`] to an open device
//! handle. Construction prepares the buffer with the driver; destruction
//! unprepares it exactly once, whatever happened in between.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::driver::{BufferId, DeviceHandle, MidiDriver, TransferBuffer};
use crate::error::{DriverError, MidiError, Result};

/// One prepared (and possibly submitted) transfer buffer.
///
/// The device handle is borrowed from the owning session; the session keeps
/// it open until every descriptor has been released.
pub struct BufferDescriptor {
    driver: Arc<dyn MidiDriver>,
    handle: DeviceHandle,
    buffer: TransferBuffer,
    prepared: bool,
}

impl BufferDescriptor {
    /// Register `buffer` with the driver.
    ///
    /// # Errors
    ///
    /// Returns [`MidiError::DriverRejected`] (or `ResourceExhausted` /
    /// `DriverBusy`) if the driver refuses; nothing is left prepared.
    pub fn prepare(
        driver: Arc<dyn MidiDriver>,
        handle: DeviceHandle,
        buffer: TransferBuffer,
    ) -> Result<Self> {
        driver
            .prepare_buffer(handle, &buffer)
            .map_err(|e| MidiError::from_transfer("prepare buffer", e))?;
        debug!(%handle, buffer = buffer.id(), len = buffer.len(), "Prepared buffer");
        Ok(Self {
            driver,
            handle,
            buffer,
            prepared: true,
        })
    }

    /// Hand the prepared buffer to the driver for asynchronous transfer.
    ///
    /// On failure the descriptor is still prepared; dropping it unprepares.
    pub fn submit(&self) -> Result<()> {
        self.driver
            .submit_buffer(self.handle, &self.buffer)
            .map_err(|e| MidiError::from_transfer("submit buffer", e))
    }

    /// Identifier of the underlying buffer.
    pub fn id(&self) -> BufferId {
        self.buffer.id()
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &TransferBuffer {
        &self.buffer
    }

    /// Device handle the buffer is prepared against.
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Whether the buffer is still registered with the driver.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Unprepare now and report the driver's answer.
    ///
    /// The descriptor counts as released even if the driver fails.
    pub fn release(mut self) -> std::result::Result<(), DriverError> {
        self.unprepare()
    }

    fn unprepare(&mut self) -> std::result::Result<(), DriverError> {
        if !std::mem::replace(&mut self.prepared, false) {
            return Ok(());
        }
        self.driver.unprepare_buffer(self.handle, &self.buffer)
    }
}

impl Drop for BufferDescriptor {
    fn drop(&mut self) {
        if let Err(e) = self.unprepare() {
            warn!(
                handle = %self.handle,
                buffer = self.buffer.id(),
                error = %e,
                "Failed to unprepare buffer"
            );
        }
    }
}

impl fmt::Debug for BufferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferDescriptor")
            .field("handle", &self.handle)
            .field("buffer", &self.buffer)
            .field("prepared", &self.prepared)
            .finish()
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::driver::mock::{MockDriver, MockOperation};
    use crate::driver::{Direction, DriverEvent};
    use crate::error::DriverStatus;

    fn open_output(driver: &Arc<MockDriver>) -> DeviceHandle {
        driver
            .open(
                Direction::Output,
                0,
                Arc::new(|_: DeviceHandle, _: DriverEvent<'_>| {}),
            )
            .unwrap()
    }

    #[test]
    fn test_prepare_failure_leaves_nothing_prepared() {
        let driver = Arc::new(MockDriver::new());
        let handle = open_output(&driver);
        driver.fail_next(MockOperation::Prepare, DriverStatus::InvalidParam);

        let err = BufferDescriptor::prepare(
            driver.clone(),
            handle,
            TransferBuffer::from_payload(vec![0xF0, 0xF7]),
        )
        .unwrap_err();

        assert!(matches!(err, MidiError::DriverRejected { .. }));
        assert_eq!(driver.prepared_count(handle), 0);
        assert!(driver.unprepared_log().is_empty());
    }

    #[test]
    fn test_prepared_descriptor_exposes_buffer() {
        let driver = Arc::new(MockDriver::new());
        let handle = open_output(&driver);

        let descriptor = BufferDescriptor::prepare(
            driver.clone(),
            handle,
            TransferBuffer::from_payload(vec![0xF0, 0x41, 0xF7]),
        )
        .unwrap();

        assert!(descriptor.is_prepared());
        assert_eq!(descriptor.handle(), handle);
        assert_eq!(descriptor.buffer().id(), descriptor.id());
        assert_eq!(descriptor.buffer().to_vec(), vec![0xF0, 0x41, 0xF7]);
        assert_eq!(driver.prepared_count(handle), 1);
    }

    #[test]
    fn test_submit_failure_still_unprepares_on_drop() {
        let driver = Arc::new(MockDriver::new());
        let handle = open_output(&driver);
        driver.fail_next(MockOperation::Submit, DriverStatus::NotReady);

        let descriptor = BufferDescriptor::prepare(
            driver.clone(),
            handle,
            TransferBuffer::from_payload(vec![0xF0, 0xF7]),
        )
        .unwrap();
        let id = descriptor.id();
        assert!(descriptor.submit().unwrap_err().is_busy());
        drop(descriptor);

        assert_eq!(driver.unprepared_log(), vec![id]);
        assert_eq!(driver.prepared_count(handle), 0);
    }

    #[test]
    fn test_release_unprepares_exactly_once() {
        let driver = Arc::new(MockDriver::new());
        let handle = open_output(&driver);
        driver.fail_next(MockOperation::Unprepare, DriverStatus::Error);

        let descriptor = BufferDescriptor::prepare(
            driver.clone(),
            handle,
            TransferBuffer::from_payload(vec![0xF0, 0xF7]),
        )
        .unwrap();

        // The failed unprepare is not retried when the descriptor drops.
        assert!(descriptor.release().is_err());
        assert!(driver.unprepared_log().is_empty());
    }
}
