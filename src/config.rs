//! Configuration loading using Figment.
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults (the `default_*` functions below)
//! 2. A TOML file (`$TOSCA_CONFIG`, else `<config dir>/tosca/config.toml`)
//! 3. Environment variables prefixed with `TOSCA_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! TOSCA_LOGGING__LEVEL=debug
//! TOSCA_CAMERA__BUFFER_COUNT=16
//! TOSCA_CAMERA__CAPTURE_TIMEOUT="500ms"
//! TOSCA_ACTUATOR__PORT=/dev/ttyUSB0
//! ```
//!
//! # Example
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "pretty"
//!
//! [camera]
//! pixel_format = "Bgr8"
//! access_mode = "full"
//! buffer_count = 10
//! capture_timeout = "2s"
//! resolution = [1280, 960]
//!
//! [actuator]
//! port = "/dev/ttyUSB0"
//! tick_interval = "100ms"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::camera::PixelFormat;
use crate::error::{AppResult, DaqError};
use crate::limits::validate_buffer_count;
use crate::session::AccessMode;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "TOSCA_CONFIG";

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log output settings
    pub logging: LoggingConfig,
    /// Camera acquisition settings
    pub camera: CameraConfig,
    /// Actuator settings
    pub actuator: ActuatorConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-friendly
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter directive, e.g. `info` or `tosca_daq=debug,warn`
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Camera acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Device id, serial number or model; first enumerated camera when unset
    #[serde(default)]
    pub device_id: Option<String>,
    /// Preferred pixel format
    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,
    /// Access mode requested when opening the camera
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Number of frame buffers queued to the driver while streaming
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// Single-shot capture timeout
    #[serde(default = "default_capture_timeout", with = "humantime_serde")]
    pub capture_timeout: Duration,
    /// How long `stop_streaming` waits for an in-flight callback to return
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
    /// Requested sensor resolution `[width, height]`
    #[serde(default)]
    pub resolution: Option<[u32; 2]>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            pixel_format: default_pixel_format(),
            access_mode: AccessMode::default(),
            buffer_count: default_buffer_count(),
            capture_timeout: default_capture_timeout(),
            stop_timeout: default_stop_timeout(),
            resolution: None,
        }
    }
}

/// Actuator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Serial port (e.g., "/dev/ttyUSB0"); the CLI falls back to the mock axis when unset
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Device id, serial number or model
    #[serde(default)]
    pub device_id: Option<String>,
    /// Access mode requested for the motion session
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Scheduler cadence for `advance_tick`
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Per-command completion timeout
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Index search (home) timeout
    #[serde(default = "default_home_timeout", with = "humantime_serde")]
    pub home_timeout: Duration,
    /// Encoder resolution in nanometres per count
    #[serde(default = "default_encoder_resolution")]
    pub encoder_resolution_nm: f64,
    /// Speed used for manual moves, mm/s
    #[serde(default = "default_speed")]
    pub default_speed: f64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            device_id: None,
            access_mode: AccessMode::default(),
            tick_interval: default_tick_interval(),
            command_timeout: default_command_timeout(),
            home_timeout: default_home_timeout(),
            encoder_resolution_nm: default_encoder_resolution(),
            default_speed: default_speed(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pixel_format() -> PixelFormat {
    PixelFormat::Mono8
}

fn default_buffer_count() -> usize {
    10
}

fn default_capture_timeout() -> Duration {
    Duration::from_millis(2000)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_home_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_encoder_resolution() -> f64 {
    1250.0
}

fn default_speed() -> f64 {
    1.0
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from `path` (or the default location) plus environment overrides.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Config`] if a source cannot be parsed and
    /// [`DaqError::Configuration`] if validation fails.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = &path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Self = figment
            .merge(Env::prefixed("TOSCA_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// `$TOSCA_CONFIG`, else `<platform config dir>/tosca/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|dir| dir.join("tosca").join("config.toml")))
    }

    /// Validate semantic constraints that parsing cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Configuration`] describing the first violation.
    pub fn validate(&self) -> AppResult<()> {
        if self.logging.level.trim().is_empty() {
            return Err(DaqError::Configuration(
                "logging.level cannot be empty".to_string(),
            ));
        }

        validate_buffer_count(self.camera.buffer_count)?;

        if self.camera.capture_timeout.is_zero() {
            return Err(DaqError::Configuration(
                "camera.capture_timeout must be greater than zero".to_string(),
            ));
        }

        if let Some([width, height]) = self.camera.resolution {
            if width == 0 || height == 0 {
                return Err(DaqError::Configuration(format!(
                    "camera.resolution must be non-zero, got {width}x{height}"
                )));
            }
        }

        if self.actuator.tick_interval.is_zero() {
            return Err(DaqError::Configuration(
                "actuator.tick_interval must be greater than zero".to_string(),
            ));
        }

        if self.actuator.command_timeout.is_zero() || self.actuator.home_timeout.is_zero() {
            return Err(DaqError::Configuration(
                "actuator timeouts must be greater than zero".to_string(),
            ));
        }

        if !(self.actuator.encoder_resolution_nm.is_finite()
            && self.actuator.encoder_resolution_nm > 0.0)
        {
            return Err(DaqError::Configuration(format!(
                "Invalid actuator.encoder_resolution_nm {}. Must be a positive number",
                self.actuator.encoder_resolution_nm
            )));
        }

        if !(self.actuator.default_speed.is_finite() && self.actuator.default_speed > 0.0) {
            return Err(DaqError::Configuration(format!(
                "Invalid actuator.default_speed {}. Must be a positive number",
                self.actuator.default_speed
            )));
        }

        Ok(())
    }
}
