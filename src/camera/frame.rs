//! Driver buffers and immutable frame snapshots.
//!
//! Two types cross the driver boundary in opposite directions:
//!
//! - [`FrameBuffer`] is a fixed-capacity region the engine lends to the
//!   driver. The driver fills it, sets a [`FillStatus`] and hands it back
//!   through the completion callback; the engine returns it to the driver
//!   before the callback ends.
//! - [`Frame`] is what consumers see: an owned copy of a completed buffer
//!   with its geometry and a timestamp. Pixel data is a [`Bytes`] so fan-out
//!   to several consumers clones a reference count, not the image.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::format::PixelFormat;
use crate::error::{AppResult, DaqError};
use crate::limits::validate_frame_size;

/// Fill outcome reported by the driver for one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillStatus {
    /// Not yet filled since it was queued
    Pending,
    /// Every byte of the payload arrived
    Complete,
    /// Transfer ended early (packet loss, bandwidth)
    Incomplete,
    /// Driver reported an error for this buffer
    Failed,
}

/// A reusable buffer lent to the driver.
///
/// Capacity is fixed at allocation; `len` marks how much of it the driver
/// filled for the current frame.
#[derive(Debug)]
pub struct FrameBuffer {
    index: usize,
    data: Vec<u8>,
    len: usize,
    status: FillStatus,
    driver_frame_id: u64,
}

impl FrameBuffer {
    /// Allocate buffer `index` with `capacity` zeroed bytes.
    #[must_use]
    pub fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            data: vec![0u8; capacity],
            len: 0,
            status: FillStatus::Pending,
            driver_frame_id: 0,
        }
    }

    /// Position of this buffer in its pool.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Allocated size in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes filled for the current frame.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been filled.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Driver fill status.
    #[inline]
    pub fn status(&self) -> FillStatus {
        self.status
    }

    /// Frame counter assigned by the driver.
    #[inline]
    pub fn driver_frame_id(&self) -> u64 {
        self.driver_frame_id
    }

    /// The filled bytes.
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Driver side: expose `len` bytes for writing and record the fill.
    ///
    /// `len` is clamped to capacity. Status stays `Pending` until
    /// [`FrameBuffer::complete`] or [`FrameBuffer::fail`] is called.
    pub fn fill(&mut self, len: usize, driver_frame_id: u64) -> &mut [u8] {
        self.len = len.min(self.data.len());
        self.driver_frame_id = driver_frame_id;
        &mut self.data[..self.len]
    }

    /// Driver side: mark the fill finished with `status`.
    pub fn complete(&mut self, status: FillStatus) {
        self.status = status;
    }

    /// Driver side: mark the fill as failed.
    pub fn fail(&mut self) {
        self.status = FillStatus::Failed;
    }

    /// Clear per-frame metadata before the buffer is queued again.
    ///
    /// Pixel bytes are left as they are; the next fill overwrites them.
    pub fn reset(&mut self) {
        self.len = 0;
        self.status = FillStatus::Pending;
        self.driver_frame_id = 0;
    }
}

/// Frame layout derived from sensor resolution and pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Active pixel format
    pub pixel_format: PixelFormat,
    /// Expected payload size in bytes
    pub frame_bytes: usize,
}

impl FrameGeometry {
    /// Validate dimensions and compute the payload size.
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> AppResult<Self> {
        let size = validate_frame_size(width, height, pixel_format)?;
        Ok(Self {
            width,
            height,
            pixel_format,
            frame_bytes: size.bytes,
        })
    }

    /// Channels per pixel.
    pub fn channel_count(&self) -> u8 {
        self.pixel_format.channel_count()
    }
}

/// A completed frame, owned and immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Engine-assigned sequence number, monotonically increasing per engine
    pub frame_id: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Channels per pixel
    pub channel_count: u8,
    /// Pixel layout
    pub pixel_format: PixelFormat,
    /// Time the engine took the snapshot
    pub timestamp: DateTime<Utc>,
    /// Pixel bytes, row-major, `width * height * bytes_per_pixel` long
    pub pixel_data: Bytes,
}

impl Frame {
    /// Copy a completed buffer into a new frame.
    ///
    /// Fails if the filled length disagrees with `geometry`, so a frame handed
    /// to consumers always matches the configured resolution and format.
    pub fn snapshot(buffer: &FrameBuffer, geometry: &FrameGeometry, frame_id: u64) -> AppResult<Self> {
        if buffer.len() != geometry.frame_bytes {
            return Err(DaqError::StreamFault(format!(
                "buffer {} holds {} bytes, expected {} for {}x{} {}",
                buffer.index(),
                buffer.len(),
                geometry.frame_bytes,
                geometry.width,
                geometry.height,
                geometry.pixel_format
            )));
        }
        Ok(Self {
            frame_id,
            width: geometry.width,
            height: geometry.height,
            channel_count: geometry.channel_count(),
            pixel_format: geometry.pixel_format,
            timestamp: Utc::now(),
            pixel_data: Bytes::copy_from_slice(buffer.filled()),
        })
    }

    /// Payload length in bytes.
    pub fn byte_len(&self) -> usize {
        self.pixel_data.len()
    }

    /// Basic intensity statistics over the first channel byte of each sample.
    pub fn stats(&self) -> FrameStats {
        let step = self.pixel_format.bytes_per_channel();
        let mut min = u8::MAX;
        let mut max = u8::MIN;
        let mut sum = 0u64;
        let mut count = 0u64;
        for &value in self.pixel_data.iter().step_by(step.max(1)) {
            min = min.min(value);
            max = max.max(value);
            sum += u64::from(value);
            count += 1;
        }
        if count == 0 {
            return FrameStats::default();
        }
        FrameStats {
            mean: sum as f64 / count as f64,
            min,
            max,
        }
    }
}

/// Summary statistics for a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    /// Mean sample value
    pub mean: f64,
    /// Smallest sample value
    pub min: u8,
    /// Largest sample value
    pub max: u8,
}
