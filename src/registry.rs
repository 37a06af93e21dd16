//! FIFO registry of in-flight buffers.
//!
//! The registry owns every submitted [`BufferDescriptor`] until it is
//! reclaimed. Reclamation order equals submission order; this relies on the
//! driver completing transfers in FIFO order, which streaming MIDI drivers
//! do in practice but do not guarantee.
//!
//! All operations take a single `parking_lot` mutex. Reclamation unprepares
//! under that lock, so a worker and a control thread reclaiming at the same
//! time cannot reorder releases.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::buffer::BufferDescriptor;
use crate::driver::BufferId;
use crate::error::Result;

/// Counters describing registry activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Descriptors ever enqueued
    pub submitted: u64,
    /// Descriptors reclaimed
    pub reclaimed: u64,
    /// Reclamations whose unprepare call failed
    pub unprepare_failures: u64,
}

/// Thread-safe FIFO of submitted buffer descriptors.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    queue: Mutex<VecDeque<BufferDescriptor>>,
    submitted: AtomicU64,
    reclaimed: AtomicU64,
    unprepare_failures: AtomicU64,
}

impl BufferRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a submitted descriptor at the tail.
    pub fn add_buffer(&self, descriptor: BufferDescriptor) {
        let mut queue = self.queue.lock();
        trace!(
            buffer = descriptor.id(),
            pending = queue.len() + 1,
            "Registered buffer"
        );
        queue.push_back(descriptor);
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Submit a prepared descriptor to the driver and enqueue it.
    ///
    /// The lock is held across the driver call, so a completion racing the
    /// submission always finds the descriptor queued. On failure nothing is
    /// enqueued and the descriptor is dropped, which unprepares it.
    pub fn submit(&self, descriptor: BufferDescriptor) -> Result<BufferId> {
        let mut queue = self.queue.lock();
        descriptor.submit()?;
        let id = descriptor.id();
        trace!(buffer = id, pending = queue.len() + 1, "Submitted buffer");
        queue.push_back(descriptor);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Release the oldest descriptor. Returns false if the registry was empty.
    pub fn reclaim_one(&self) -> bool {
        let mut queue = self.queue.lock();
        match queue.pop_front() {
            Some(descriptor) => {
                self.release(descriptor);
                true
            }
            None => false,
        }
    }

    /// Release every descriptor, oldest first. Returns how many were released.
    pub fn reclaim_all(&self) -> usize {
        let mut queue = self.queue.lock();
        let count = queue.len();
        while let Some(descriptor) = queue.pop_front() {
            self.release(descriptor);
        }
        if count > 0 {
            debug!(count, "Reclaimed all buffers");
        }
        count
    }

    /// Snapshot: whether no descriptor is registered.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Snapshot: number of registered descriptors.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            unprepare_failures: self.unprepare_failures.load(Ordering::Relaxed),
        }
    }

    fn release(&self, descriptor: BufferDescriptor) {
        let id = descriptor.id();
        let handle = descriptor.handle();
        if let Err(e) = descriptor.release() {
            // Nothing left to act on: the descriptor is gone either way.
            self.unprepare_failures.fetch_add(1, Ordering::Relaxed);
            warn!(%handle, buffer = id, error = %e, "Unprepare failed during reclamation");
        } else {
            trace!(%handle, buffer = id, "Reclaimed buffer");
        }
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
    }
}
