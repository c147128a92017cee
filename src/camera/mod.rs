//! Camera side of the device core.
//!
//! - [`acquisition`]: the frame acquisition engine (lifecycle, streaming, single capture)
//! - [`buffer_pool`]: driver buffer bookkeeping and the requeue guard
//! - [`features`]: verified feature access and settings persistence
//! - [`format`]: pixel formats and format selection
//! - [`frame`]: driver buffers and owned frames
//! - [`slot`]: latest-frame exchange

pub mod acquisition;
pub mod buffer_pool;
pub mod features;
pub mod format;
pub mod frame;
pub mod slot;

pub use acquisition::{
    AcquisitionHandle, AcquisitionState, FrameAcquisition, FrameCallback, InitSummary, StopOutcome,
    StreamStats,
};
pub use buffer_pool::{BufferLedger, BufferState, RequeueError, RequeueGuard, DEFAULT_BUFFER_COUNT};
pub use features::{
    FeatureAccess, FeatureControl, FeatureDescriptor, FeatureKind, FeatureName, FeatureValue,
    FeatureWarning, FeatureWrite, LoadReport, SettingsDevice, SettingsDocument,
};
pub use format::{select_pixel_format, FormatSelection, PixelFormat, PixelFormatDescriptor};
pub use frame::{FillStatus, Frame, FrameBuffer, FrameGeometry, FrameStats};
pub use slot::LatestFrameSlot;
