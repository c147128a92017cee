//! Pixel formats and display-compatible format selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DaqError;

/// Per-pixel memory layout produced by the sensor.
///
/// Formats wider than 8 bits are delivered unpacked, two bytes per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit monochrome
    Mono8,
    /// 10-bit monochrome in 16-bit words
    Mono10,
    /// 12-bit monochrome in 16-bit words
    Mono12,
    /// 16-bit monochrome
    Mono16,
    /// 8-bit blue/green/red
    Bgr8,
    /// 8-bit red/green/blue
    Rgb8,
    /// 8-bit blue/green/red/alpha
    Bgra8,
    /// 8-bit red/green/blue/alpha
    Rgba8,
    /// 8-bit Bayer mosaic, RG phase
    BayerRG8,
    /// 8-bit Bayer mosaic, GB phase
    BayerGB8,
    /// 12-bit Bayer mosaic, RG phase
    BayerRG12,
}

impl PixelFormat {
    /// All known formats, in the order drivers usually advertise them.
    pub const ALL: [PixelFormat; 11] = [
        PixelFormat::Mono8,
        PixelFormat::Mono10,
        PixelFormat::Mono12,
        PixelFormat::Mono16,
        PixelFormat::Bgr8,
        PixelFormat::Rgb8,
        PixelFormat::Bgra8,
        PixelFormat::Rgba8,
        PixelFormat::BayerRG8,
        PixelFormat::BayerGB8,
        PixelFormat::BayerRG12,
    ];

    /// GenICam feature-value name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mono8 => "Mono8",
            Self::Mono10 => "Mono10",
            Self::Mono12 => "Mono12",
            Self::Mono16 => "Mono16",
            Self::Bgr8 => "Bgr8",
            Self::Rgb8 => "Rgb8",
            Self::Bgra8 => "Bgra8",
            Self::Rgba8 => "Rgba8",
            Self::BayerRG8 => "BayerRG8",
            Self::BayerGB8 => "BayerGB8",
            Self::BayerRG12 => "BayerRG12",
        }
    }

    /// Channels per pixel after delivery (mosaic formats count as one).
    pub fn channel_count(self) -> u8 {
        match self {
            Self::Mono8
            | Self::Mono10
            | Self::Mono12
            | Self::Mono16
            | Self::BayerRG8
            | Self::BayerGB8
            | Self::BayerRG12 => 1,
            Self::Bgr8 | Self::Rgb8 => 3,
            Self::Bgra8 | Self::Rgba8 => 4,
        }
    }

    /// Bytes per channel sample.
    pub fn bytes_per_channel(self) -> usize {
        match self {
            Self::Mono10 | Self::Mono12 | Self::Mono16 | Self::BayerRG12 => 2,
            _ => 1,
        }
    }

    /// Bytes per pixel.
    pub fn bytes_per_pixel(self) -> usize {
        self.channel_count() as usize * self.bytes_per_channel()
    }

    /// Whether a frame in this format can be shown without conversion.
    pub fn is_display_compatible(self) -> bool {
        matches!(
            self,
            Self::Mono8 | Self::Bgr8 | Self::Rgb8 | Self::Bgra8 | Self::Rgba8
        )
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        PixelFormat::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| DaqError::Configuration(format!("unknown pixel format '{trimmed}'")))
    }
}

/// A format advertised by an open device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelFormatDescriptor {
    /// Format
    pub format: PixelFormat,
    /// Whether it can be displayed without conversion
    pub is_display_compatible: bool,
}

impl PixelFormatDescriptor {
    /// Describe `format`, deriving display compatibility from the layout.
    pub fn new(format: PixelFormat) -> Self {
        Self {
            format,
            is_display_compatible: format.is_display_compatible(),
        }
    }

    /// Feature-value name.
    pub fn name(&self) -> &'static str {
        self.format.as_str()
    }
}

/// Outcome of [`select_pixel_format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSelection {
    /// Format the caller asked for
    pub requested: PixelFormat,
    /// Format that will be used
    pub selected: PixelFormat,
}

impl FormatSelection {
    /// Whether `selected` differs from `requested`.
    pub fn is_substitution(&self) -> bool {
        self.requested != self.selected
    }
}

/// Choose the active format from an advertised set.
///
/// The preference wins if it is advertised and display-compatible; otherwise
/// the first advertised display-compatible format is used. `None` means the
/// device offers nothing displayable.
pub fn select_pixel_format(
    advertised: &[PixelFormatDescriptor],
    preferred: PixelFormat,
) -> Option<FormatSelection> {
    let preferred_ok = advertised
        .iter()
        .any(|d| d.format == preferred && d.is_display_compatible);
    let selected = if preferred_ok {
        preferred
    } else {
        advertised
            .iter()
            .find(|d| d.is_display_compatible)
            .map(|d| d.format)?
    };
    Some(FormatSelection {
        requested: preferred,
        selected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertised(formats: &[PixelFormat]) -> Vec<PixelFormatDescriptor> {
        formats.iter().copied().map(PixelFormatDescriptor::new).collect()
    }

    #[test]
    fn preferred_format_is_kept() {
        let formats = advertised(&[PixelFormat::Mono8, PixelFormat::Bgr8]);
        let sel = select_pixel_format(&formats, PixelFormat::Bgr8).unwrap();
        assert_eq!(sel.selected, PixelFormat::Bgr8);
        assert!(!sel.is_substitution());
    }

    #[test]
    fn unadvertised_preference_falls_back_to_first_displayable() {
        let formats = advertised(&[PixelFormat::Mono12, PixelFormat::Rgb8, PixelFormat::Mono8]);
        let sel = select_pixel_format(&formats, PixelFormat::Bgr8).unwrap();
        assert_eq!(sel.selected, PixelFormat::Rgb8);
        assert!(sel.is_substitution());
    }

    #[test]
    fn non_displayable_preference_falls_back() {
        let formats = advertised(&[PixelFormat::Mono12, PixelFormat::Mono8]);
        let sel = select_pixel_format(&formats, PixelFormat::Mono12).unwrap();
        assert_eq!(sel.selected, PixelFormat::Mono8);
    }

    #[test]
    fn nothing_displayable() {
        let formats = advertised(&[PixelFormat::Mono12, PixelFormat::BayerRG8]);
        assert!(select_pixel_format(&formats, PixelFormat::Mono8).is_none());
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(PixelFormat::Mono8.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::Mono12.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Bgr8.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Rgba8.channel_count(), 4);
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("bgr8".parse::<PixelFormat>().unwrap(), PixelFormat::Bgr8);
        assert_eq!("BayerRG8".parse::<PixelFormat>().unwrap(), PixelFormat::BayerRG8);
        assert!("YUV422".parse::<PixelFormat>().is_err());
    }
}
