//! Motion steps and their units.
//!
//! A step serializes as `{"type": "...", "params": {...}}` where `params`
//! holds exactly the variant's fields:
//!
//! ```json
//! {"type": "move_absolute", "params": {"position": 10.0, "speed": 1.0, "unit": "mm"}}
//! {"type": "pause", "params": {"duration": 0.2}}
//! {"type": "scan", "params": {"speed": 0.5, "direction": "positive", "duration": 2.0, "unit": "mm"}}
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

const NM_PER_MM: f64 = 1_000_000.0;
const NM_PER_UM: f64 = 1_000.0;
const NM_PER_INCH: f64 = 25_400_000.0;

/// Length unit for positions, distances and speeds (per second).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Unit {
    /// Millimetres
    #[default]
    #[serde(rename = "mm")]
    Millimeter,
    /// Micrometres
    #[serde(rename = "um", alias = "mu", alias = "µm")]
    Micrometer,
    /// Nanometres
    #[serde(rename = "nm")]
    Nanometer,
    /// Inches
    #[serde(rename = "inch")]
    Inch,
    /// Raw encoder counts
    #[serde(rename = "enc")]
    Encoder,
}

impl Unit {
    /// Short symbol.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Millimeter => "mm",
            Self::Micrometer => "um",
            Self::Nanometer => "nm",
            Self::Inch => "inch",
            Self::Encoder => "enc",
        }
    }

    /// Convert `value` in this unit to nanometres.
    pub fn to_nanometers(self, value: f64, encoder_resolution_nm: f64) -> f64 {
        match self {
            Self::Millimeter => value * NM_PER_MM,
            Self::Micrometer => value * NM_PER_UM,
            Self::Nanometer => value,
            Self::Inch => value * NM_PER_INCH,
            Self::Encoder => value * encoder_resolution_nm,
        }
    }

    /// Convert `nm` nanometres to this unit.
    pub fn from_nanometers(self, nm: f64, encoder_resolution_nm: f64) -> f64 {
        match self {
            Self::Millimeter => nm / NM_PER_MM,
            Self::Micrometer => nm / NM_PER_UM,
            Self::Nanometer => nm,
            Self::Inch => nm / NM_PER_INCH,
            Self::Encoder => nm / encoder_resolution_nm,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Unit {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "mm" => Ok(Self::Millimeter),
            "um" | "mu" | "µm" => Ok(Self::Micrometer),
            "nm" => Ok(Self::Nanometer),
            "inch" | "in" => Ok(Self::Inch),
            "enc" => Ok(Self::Encoder),
            other => Err(DaqError::InvalidStep(format!("unknown unit '{other}'"))),
        }
    }
}

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Towards increasing position
    Positive,
    /// Towards decreasing position
    Negative,
}

impl Direction {
    /// `1` or `-1`.
    pub fn sign(self) -> i8 {
        match self {
            Self::Positive => 1,
            Self::Negative => -1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
        })
    }
}

/// One instruction in a motion program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum MotionStep {
    /// Move to an absolute position.
    MoveAbsolute {
        /// Target position
        position: f64,
        /// Speed, `unit`/s
        speed: f64,
        /// Unit of position and speed
        unit: Unit,
    },
    /// Move by a signed distance.
    MoveRelative {
        /// Signed distance
        distance: f64,
        /// Speed, `unit`/s
        speed: f64,
        /// Unit of distance and speed
        unit: Unit,
    },
    /// Search the index mark and zero the position.
    Home {
        /// Speed, mm/s
        speed: f64,
    },
    /// Wait.
    Pause {
        /// Seconds
        duration: f64,
    },
    /// Change the axis speed without moving.
    SetSpeed {
        /// Speed, `unit`/s
        speed: f64,
        /// Unit of speed
        unit: Unit,
    },
    /// Move continuously in one direction for a fixed time.
    Scan {
        /// Speed, `unit`/s
        speed: f64,
        /// Direction
        direction: Direction,
        /// Seconds
        duration: f64,
        /// Unit of speed
        unit: Unit,
    },
}

impl MotionStep {
    /// Variant name as it appears in program documents.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MoveAbsolute { .. } => "move_absolute",
            Self::MoveRelative { .. } => "move_relative",
            Self::Home { .. } => "home",
            Self::Pause { .. } => "pause",
            Self::SetSpeed { .. } => "set_speed",
            Self::Scan { .. } => "scan",
        }
    }

    /// Check parameter ranges.
    ///
    /// Speeds must be finite and positive, positions and distances finite,
    /// durations finite and non-negative.
    pub fn validate(&self) -> AppResult<()> {
        match *self {
            Self::MoveAbsolute { position, speed, .. } => {
                finite("position", position)?;
                positive("speed", speed)
            }
            Self::MoveRelative { distance, speed, .. } => {
                finite("distance", distance)?;
                positive("speed", speed)
            }
            Self::Home { speed } | Self::SetSpeed { speed, .. } => positive("speed", speed),
            Self::Pause { duration } => seconds("duration", duration).map(|_| ()),
            Self::Scan { speed, duration, .. } => {
                positive("speed", speed)?;
                seconds("duration", duration).map(|_| ())
            }
        }
    }

    /// Pause or scan duration as a `Duration`.
    pub fn duration(&self) -> AppResult<Option<Duration>> {
        match *self {
            Self::Pause { duration } | Self::Scan { duration, .. } => {
                seconds("duration", duration).map(Some)
            }
            _ => Ok(None),
        }
    }
}

impl fmt::Display for MotionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MoveAbsolute { position, speed, unit } => {
                write!(f, "Move Absolute: {position} {unit} @ {speed} {unit}/s")
            }
            Self::MoveRelative { distance, speed, unit } => {
                write!(f, "Move Relative: {distance:+} {unit} @ {speed} {unit}/s")
            }
            Self::Home { speed } => write!(f, "Home @ {speed} mm/s"),
            Self::Pause { duration } => write!(f, "Pause: {duration} s"),
            Self::SetSpeed { speed, unit } => write!(f, "Set Speed: {speed} {unit}/s"),
            Self::Scan {
                speed,
                direction,
                duration,
                unit,
            } => write!(f, "Scan {direction}: {duration} s @ {speed} {unit}/s"),
        }
    }
}

fn finite(field: &str, value: f64) -> AppResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(DaqError::InvalidStep(format!("{field} must be finite, got {value}")))
    }
}

fn positive(field: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(DaqError::InvalidStep(format!("{field} must be positive, got {value}")))
    }
}

fn seconds(field: &str, value: f64) -> AppResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| DaqError::InvalidStep(format!("{field} must be a non-negative number of seconds, got {value}")))
}
