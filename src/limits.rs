//! Bounds on driver-reported geometry and pool sizes.
//!
//! Cameras report width, height and format separately and firmware gets them
//! wrong now and then; everything that sizes an allocation goes through here.

use crate::camera::PixelFormat;
use crate::error::DaqError;

/// Largest frame payload we will allocate (256 MiB).
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;
/// Largest width or height accepted from a driver.
pub const MAX_FRAME_DIMENSION: u32 = 65_536;
/// Largest acquisition buffer pool.
pub const MAX_BUFFER_COUNT: usize = 256;

/// Checked payload layout of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    /// Bytes per image row
    pub row_bytes: usize,
    /// Bytes per frame
    pub bytes: usize,
}

/// Compute the payload of a `width`×`height` frame in `format`.
///
/// Zero or oversized dimensions and payloads beyond [`MAX_FRAME_BYTES`] are
/// rejected; no multiplication can overflow.
pub fn validate_frame_size(width: u32, height: u32, format: PixelFormat) -> Result<FrameSize, DaqError> {
    if width == 0 || height == 0 {
        return Err(DaqError::InvalidState(format!(
            "driver reported an empty {width}x{height} frame"
        )));
    }
    if width.max(height) > MAX_FRAME_DIMENSION {
        return Err(DaqError::FrameDimensionsTooLarge {
            width,
            height,
            max_dimension: MAX_FRAME_DIMENSION,
        });
    }

    let row_bytes = usize::try_from(width)
        .ok()
        .and_then(|w| w.checked_mul(format.bytes_per_pixel()))
        .ok_or(DaqError::SizeOverflow { context: "row stride" })?;
    let bytes = usize::try_from(height)
        .ok()
        .and_then(|h| h.checked_mul(row_bytes))
        .ok_or(DaqError::SizeOverflow { context: "frame payload" })?;

    if bytes > MAX_FRAME_BYTES {
        return Err(DaqError::FrameTooLarge {
            bytes,
            max_bytes: MAX_FRAME_BYTES,
        });
    }
    Ok(FrameSize { row_bytes, bytes })
}

/// Check a configured buffer pool size.
pub fn validate_buffer_count(count: usize) -> Result<usize, DaqError> {
    if (1..=MAX_BUFFER_COUNT).contains(&count) {
        Ok(count)
    } else {
        Err(DaqError::Configuration(format!(
            "camera.buffer_count must be 1..={MAX_BUFFER_COUNT}, got {count}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_frame_layout() {
        let size = validate_frame_size(640, 480, PixelFormat::Bgr8).unwrap();
        assert_eq!(size.row_bytes, 1920);
        assert_eq!(size.bytes, 921_600);
    }

    #[test]
    fn mono12_uses_two_bytes_per_pixel() {
        let size = validate_frame_size(10, 3, PixelFormat::Mono12).unwrap();
        assert_eq!((size.row_bytes, size.bytes), (20, 60));
    }

    #[test]
    fn empty_and_oversized_frames_rejected() {
        assert!(matches!(
            validate_frame_size(0, 480, PixelFormat::Mono8),
            Err(DaqError::InvalidState(_))
        ));
        assert!(matches!(
            validate_frame_size(MAX_FRAME_DIMENSION + 1, 8, PixelFormat::Mono8),
            Err(DaqError::FrameDimensionsTooLarge { .. })
        ));
        assert!(matches!(
            validate_frame_size(MAX_FRAME_DIMENSION, MAX_FRAME_DIMENSION, PixelFormat::Rgba8),
            Err(DaqError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn buffer_count_bounds() {
        assert!(validate_buffer_count(0).is_err());
        assert_eq!(validate_buffer_count(1).unwrap(), 1);
        assert_eq!(validate_buffer_count(MAX_BUFFER_COUNT).unwrap(), MAX_BUFFER_COUNT);
        assert!(validate_buffer_count(MAX_BUFFER_COUNT + 1).is_err());
    }
}
