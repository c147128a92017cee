//! Hardware boundary: the traits drivers implement.
//!
//! The camera side is synchronous. Vendor SDKs own their acquisition thread
//! and call back into us on it, so [`CameraDevice`] mirrors that model: the
//! engine lends buffers with [`CameraDevice::start_capture`] and the driver
//! returns each filled buffer through [`FrameHandler::on_frame_complete`].
//!
//! The actuator side is async. Every [`MotionAxis`] call is a command round
//! trip that may take seconds (a move completes when the stage settles), and
//! the sequence engine races these futures against its stop signal.
//!
//! Implementations:
//! - [`mock`]: in-process camera and axis with fault injection
//! - `serial_axis` (feature `instrument_serial`): line-protocol piezo stage over tokio-serial

pub mod axis_protocol;
pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial_axis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::camera::{
    FeatureDescriptor, FeatureName, FeatureValue, FrameBuffer, PixelFormat,
    PixelFormatDescriptor, RequeueError,
};
use crate::error::AppResult;
use crate::motion::{Direction, Unit};
use crate::session::{AccessMode, DeviceInfo};

/// Enumerates cameras and opens device handles.
pub trait CameraSystem: Send + Sync {
    /// Cameras currently attached, in driver order.
    fn cameras(&self) -> AppResult<Vec<DeviceInfo>>;

    /// Open a handle to `info` under `access_mode`.
    fn open_camera(&self, info: &DeviceInfo, access_mode: AccessMode) -> AppResult<Arc<dyn CameraDevice>>;
}

/// Completion callback registered with [`CameraDevice::start_capture`].
///
/// Called on a driver-owned thread, possibly back to back. Implementations
/// must hand the buffer back with [`CameraDevice::queue_buffer`] before
/// returning and must not block.
pub trait FrameHandler: Send + Sync {
    /// A buffer finished filling (successfully or not).
    fn on_frame_complete(&self, buffer: FrameBuffer);
}

/// An open camera handle.
pub trait CameraDevice: Send + Sync {
    /// Identity of the device.
    fn info(&self) -> &DeviceInfo;

    /// Pixel formats the device can output.
    fn pixel_formats(&self) -> AppResult<Vec<PixelFormatDescriptor>>;

    /// Active pixel format.
    fn pixel_format(&self) -> AppResult<PixelFormat>;

    /// Change the pixel format. Not allowed while capturing.
    fn set_pixel_format(&self, format: PixelFormat) -> AppResult<()>;

    /// Sensor output `(width, height)`.
    fn resolution(&self) -> AppResult<(u32, u32)>;

    /// Bytes the driver writes per frame.
    fn payload_size(&self) -> AppResult<usize>;

    /// Every feature the device publishes.
    fn feature_descriptors(&self) -> AppResult<Vec<FeatureDescriptor>>;

    /// Read one feature.
    fn read_feature(&self, name: &FeatureName) -> AppResult<FeatureValue>;

    /// Write one feature. The device may clamp or ignore the value without error.
    fn write_feature(&self, name: &FeatureName, value: &FeatureValue) -> AppResult<()>;

    /// Queue `buffers` and begin continuous acquisition, delivering to `handler`.
    fn start_capture(&self, buffers: Vec<FrameBuffer>, handler: Arc<dyn FrameHandler>) -> AppResult<()>;

    /// Return a delivered buffer to the acquisition queue.
    fn queue_buffer(&self, buffer: FrameBuffer) -> Result<(), RequeueError>;

    /// Halt acquisition and hand back every buffer still queued.
    ///
    /// When this returns the driver will not invoke the handler again.
    fn stop_capture(&self) -> AppResult<Vec<FrameBuffer>>;

    /// Fill `buffer` with one frame outside of streaming.
    ///
    /// Fails with [`crate::DaqError::Timeout`] if no frame arrives within `timeout`.
    fn acquire_single(&self, buffer: FrameBuffer, timeout: Duration) -> AppResult<FrameBuffer>;
}

/// A single positioning axis.
///
/// Motion calls complete when the stage has settled. Dropping a pending
/// future abandons the wait but does not stop the stage; callers that cancel
/// must follow up with [`MotionAxis::stop_motion`].
#[async_trait]
pub trait MotionAxis: Send + Sync {
    /// Identity of the axis.
    fn info(&self) -> DeviceInfo;

    /// Set the speed for subsequent moves, `unit`/s.
    async fn set_speed(&self, speed: f64, unit: Unit) -> AppResult<()>;

    /// Move to `position`.
    async fn move_absolute(&self, position: f64, unit: Unit) -> AppResult<()>;

    /// Move by `distance`.
    async fn move_relative(&self, distance: f64, unit: Unit) -> AppResult<()>;

    /// Search the index mark; position reads zero afterwards.
    async fn home(&self) -> AppResult<()>;

    /// Move continuously in `direction` for `duration`, then halt.
    async fn scan(&self, direction: Direction, duration: Duration) -> AppResult<()>;

    /// Halt any motion immediately.
    async fn stop_motion(&self) -> AppResult<()>;

    /// Current position.
    async fn position(&self, unit: Unit) -> AppResult<f64>;
}
