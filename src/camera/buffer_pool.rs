//! Acquisition buffer pool and the requeue guard.
//!
//! The pool is allocated once per stream: N equally sized [`FrameBuffer`]s
//! handed to the driver at start. A [`BufferLedger`] tracks where each one is:
//!
//! ```text
//!   Free ──driver fills──▶ InFlight ──copied out──▶ Retired ──requeued──▶ Free
//!                                                        └──requeue failed──▶ Detached
//! ```
//!
//! Returning a buffer to the driver is done by dropping a [`RequeueGuard`].
//! Whatever happens while the callback inspects the buffer (early return,
//! copy failure, panic), the guard's `Drop` hands it back before the callback
//! unwinds, so the driver is never starved by a forgotten buffer.
//!
//! # Example
//!
//! ```ignore
//! let guard = RequeueGuard::new(buffer, device.as_ref(), &ledger, &|err| report(err));
//! publish(&guard);   // may fail; the buffer still goes back
//! // guard dropped here -> device.queue_buffer(buffer)
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use super::frame::FrameBuffer;
use crate::hardware::CameraDevice;

/// Default number of buffers queued while streaming.
pub const DEFAULT_BUFFER_COUNT: usize = 10;

/// Where a pool buffer currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferState {
    /// Queued to the driver, awaiting fill
    Free = 0,
    /// Filled and being consumed by the completion callback
    InFlight = 1,
    /// Copied out, about to be queued again
    Retired = 2,
    /// The driver refused it back; no longer part of the stream
    Detached = 3,
}

impl BufferState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Free,
            1 => Self::InFlight,
            2 => Self::Retired,
            _ => Self::Detached,
        }
    }
}

/// A driver refused to take a buffer back.
///
/// The buffer itself is gone (the driver dropped it); only its index remains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeueError {
    /// Pool index of the lost buffer
    pub buffer_index: usize,
    /// Driver-reported reason
    pub reason: String,
}

impl fmt::Display for RequeueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "requeue of buffer {} failed: {}", self.buffer_index, self.reason)
    }
}

impl std::error::Error for RequeueError {}

/// Per-stream bookkeeping of buffer states and requeue outcomes.
///
/// All updates are atomic; the completion callback never takes a lock here.
#[derive(Debug)]
pub struct BufferLedger {
    states: Vec<AtomicU8>,
    requeued: AtomicU64,
    requeue_failures: AtomicU64,
}

impl BufferLedger {
    /// Ledger for `count` buffers, all `Free`.
    pub fn new(count: usize) -> Self {
        Self {
            states: (0..count).map(|_| AtomicU8::new(BufferState::Free as u8)).collect(),
            requeued: AtomicU64::new(0),
            requeue_failures: AtomicU64::new(0),
        }
    }

    /// Allocate `count` buffers of `capacity` bytes with a fresh ledger.
    pub fn allocate(count: usize, capacity: usize) -> (Self, Vec<FrameBuffer>) {
        tracing::info!(
            pool_size = count,
            frame_capacity_mb = capacity as f64 / (1024.0 * 1024.0),
            total_mb = (count * capacity) as f64 / (1024.0 * 1024.0),
            "Allocating acquisition buffer pool"
        );
        let buffers = (0..count).map(|i| FrameBuffer::new(i, capacity)).collect();
        (Self::new(count), buffers)
    }

    /// Number of buffers tracked.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the ledger tracks no buffers.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Current state of buffer `index` (`Detached` for unknown indices).
    pub fn state(&self, index: usize) -> BufferState {
        self.states
            .get(index)
            .map_or(BufferState::Detached, |s| BufferState::from_u8(s.load(Ordering::Acquire)))
    }

    /// Record a state transition for buffer `index`.
    pub fn mark(&self, index: usize, state: BufferState) {
        if let Some(slot) = self.states.get(index) {
            slot.store(state as u8, Ordering::Release);
        }
    }

    /// Buffers currently in `state`.
    pub fn count(&self, state: BufferState) -> usize {
        self.states
            .iter()
            .filter(|s| BufferState::from_u8(s.load(Ordering::Acquire)) == state)
            .count()
    }

    /// Successful returns to the driver.
    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    /// Returns the driver refused.
    pub fn requeue_failures(&self) -> u64 {
        self.requeue_failures.load(Ordering::Relaxed)
    }
}

/// Owns a delivered buffer and returns it to the driver on drop.
pub struct RequeueGuard<'a> {
    buffer: FrameBuffer,
    device: &'a dyn CameraDevice,
    ledger: &'a BufferLedger,
    on_failure: &'a dyn Fn(&RequeueError),
}

impl<'a> RequeueGuard<'a> {
    /// Take ownership of `buffer`, marking it `InFlight`.
    pub fn new(
        buffer: FrameBuffer,
        device: &'a dyn CameraDevice,
        ledger: &'a BufferLedger,
        on_failure: &'a dyn Fn(&RequeueError),
    ) -> Self {
        ledger.mark(buffer.index(), BufferState::InFlight);
        Self {
            buffer,
            device,
            ledger,
            on_failure,
        }
    }
}

impl Deref for RequeueGuard<'_> {
    type Target = FrameBuffer;

    fn deref(&self) -> &FrameBuffer {
        &self.buffer
    }
}

impl Drop for RequeueGuard<'_> {
    fn drop(&mut self) {
        let index = self.buffer.index();
        // Zero-capacity placeholder; does not allocate.
        let mut buffer = std::mem::replace(&mut self.buffer, FrameBuffer::new(index, 0));
        self.ledger.mark(index, BufferState::Retired);
        buffer.reset();
        match self.device.queue_buffer(buffer) {
            Ok(()) => {
                self.ledger.mark(index, BufferState::Free);
                self.ledger.requeued.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.ledger.mark(index, BufferState::Detached);
                self.ledger.requeue_failures.fetch_add(1, Ordering::Relaxed);
                (self.on_failure)(&err);
            }
        }
    }
}
