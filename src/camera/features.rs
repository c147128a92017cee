//! Camera feature control with read-back verification.
//!
//! Every write goes through [`FeatureControl::set_feature`], which writes the
//! value, immediately reads it back and compares the two with a per-feature
//! tolerance. Firmware routinely clamps out-of-range values or ignores writes
//! while an auto mode drives the feature; such a write succeeds with the
//! *actual* value and a [`FeatureWarning::ValueNotApplied`], it does not fail.
//!
//! | Kind          | Tolerance                                   |
//! |---------------|---------------------------------------------|
//! | Bool, Enum    | exact (auto modes: `On` ≡ `Continuous`)     |
//! | Int, Float    | device-reported increment, else ~1e-9 rel.  |
//!
//! Settings persistence writes every restorable feature to a TOML document and
//! restores it with the same verified writes, `PixelFormat` first.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::error::{AppResult, DaqError};
use crate::hardware::CameraDevice;
use crate::session::DeviceSession;

/// Auto-mode activation values accepted on read-back.
const AUTO_ON_VALUES: [&str; 2] = ["Continuous", "On"];
const AUTO_OFF_VALUE: &str = "Off";

/// Typed camera feature names.
///
/// Names the core relies on are variants; anything else the device exposes is
/// carried as [`FeatureName::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FeatureName {
    /// Exposure time, µs
    ExposureTime,
    /// Exposure auto mode
    ExposureAuto,
    /// Analog gain, dB
    Gain,
    /// Gain auto mode
    GainAuto,
    /// White balance auto mode
    BalanceWhiteAuto,
    /// Gamma correction
    Gamma,
    /// Frame rate limit, Hz
    AcquisitionFrameRate,
    /// Sensor ROI width
    Width,
    /// Sensor ROI height
    Height,
    /// Sensor ROI x offset
    OffsetX,
    /// Sensor ROI y offset
    OffsetY,
    /// Output pixel format
    PixelFormat,
    /// Horizontal flip
    ReverseX,
    /// Vertical flip
    ReverseY,
    /// Sensor temperature, °C
    DeviceTemperature,
    /// Any other device feature
    Other(String),
}

impl FeatureName {
    /// GenICam name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ExposureTime => "ExposureTime",
            Self::ExposureAuto => "ExposureAuto",
            Self::Gain => "Gain",
            Self::GainAuto => "GainAuto",
            Self::BalanceWhiteAuto => "BalanceWhiteAuto",
            Self::Gamma => "Gamma",
            Self::AcquisitionFrameRate => "AcquisitionFrameRate",
            Self::Width => "Width",
            Self::Height => "Height",
            Self::OffsetX => "OffsetX",
            Self::OffsetY => "OffsetY",
            Self::PixelFormat => "PixelFormat",
            Self::ReverseX => "ReverseX",
            Self::ReverseY => "ReverseY",
            Self::DeviceTemperature => "DeviceTemperature",
            Self::Other(name) => name,
        }
    }

    /// Whether this is an auto-mode selector (`...Auto`).
    pub fn is_auto_mode(&self) -> bool {
        self.as_str().ends_with("Auto")
    }

    /// Whether a write changes the frame layout.
    pub fn affects_layout(&self) -> bool {
        matches!(self, Self::Width | Self::Height | Self::PixelFormat)
    }

    fn apply_rank(&self) -> u8 {
        match self {
            Self::PixelFormat => 0,
            Self::Width | Self::Height => 1,
            Self::OffsetX | Self::OffsetY => 2,
            name if name.is_auto_mode() => 3,
            _ => 4,
        }
    }
}

impl From<&str> for FeatureName {
    fn from(name: &str) -> Self {
        match name {
            "ExposureTime" => Self::ExposureTime,
            "ExposureAuto" => Self::ExposureAuto,
            "Gain" => Self::Gain,
            "GainAuto" => Self::GainAuto,
            "BalanceWhiteAuto" => Self::BalanceWhiteAuto,
            "Gamma" => Self::Gamma,
            "AcquisitionFrameRate" => Self::AcquisitionFrameRate,
            "Width" => Self::Width,
            "Height" => Self::Height,
            "OffsetX" => Self::OffsetX,
            "OffsetY" => Self::OffsetY,
            "PixelFormat" => Self::PixelFormat,
            "ReverseX" => Self::ReverseX,
            "ReverseY" => Self::ReverseY,
            "DeviceTemperature" => Self::DeviceTemperature,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for FeatureName {
    fn from(name: String) -> Self {
        FeatureName::from(name.as_str())
    }
}

impl From<FeatureName> for String {
    fn from(name: FeatureName) -> Self {
        match name {
            FeatureName::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for FeatureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A feature value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Enumeration entry name
    Enum(String),
}

impl FeatureValue {
    /// Kind of this value.
    pub fn kind(&self) -> FeatureKind {
        match self {
            Self::Bool(_) => FeatureKind::Bool,
            Self::Int(_) => FeatureKind::Int,
            Self::Float(_) => FeatureKind::Float,
            Self::Enum(_) => FeatureKind::Enum,
        }
    }

    /// Numeric value, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Enumeration entry, if any.
    pub fn as_enum(&self) -> Option<&str> {
        match self {
            Self::Enum(v) => Some(v),
            _ => None,
        }
    }

    /// Convert to `kind` where lossless (integers widen to floats, integral floats narrow).
    pub fn coerce_to(&self, kind: FeatureKind) -> Option<FeatureValue> {
        match (self, kind) {
            (v, k) if v.kind() == k => Some(v.clone()),
            (Self::Int(v), FeatureKind::Float) => Some(Self::Float(*v as f64)),
            (Self::Float(v), FeatureKind::Int) if v.fract() == 0.0 && v.is_finite() => {
                Some(Self::Int(*v as i64))
            }
            _ => None,
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Enum(v) => f.write_str(v),
        }
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        Self::Enum(v.to_string())
    }
}

/// Value type a feature declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    /// Boolean
    Bool,
    /// Integer
    Int,
    /// Floating point
    Float,
    /// Enumeration
    Enum,
}

impl FeatureKind {
    /// Lowercase name for messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Enum => "enum",
        }
    }
}

/// Read/write capability of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureAccess {
    /// Readable only
    ReadOnly,
    /// Writable only
    WriteOnly,
    /// Readable and writable
    ReadWrite,
}

impl FeatureAccess {
    /// Whether reads are allowed.
    pub fn is_readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// Whether writes are allowed.
    pub fn is_writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// Metadata the device publishes for a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    /// Feature name
    pub name: FeatureName,
    /// Value type
    pub kind: FeatureKind,
    /// Access
    pub access: FeatureAccess,
    /// Lower bound for numeric features
    pub min: Option<f64>,
    /// Upper bound for numeric features
    pub max: Option<f64>,
    /// Step for numeric features
    pub increment: Option<f64>,
    /// Entries for enumerations
    pub entries: Vec<String>,
    /// Physical unit, if any
    pub unit: Option<String>,
}

impl FeatureDescriptor {
    fn new(name: FeatureName, kind: FeatureKind) -> Self {
        Self {
            name,
            kind,
            access: FeatureAccess::ReadWrite,
            min: None,
            max: None,
            increment: None,
            entries: Vec::new(),
            unit: None,
        }
    }

    /// Boolean feature.
    pub fn boolean(name: FeatureName) -> Self {
        Self::new(name, FeatureKind::Bool)
    }

    /// Bounded integer feature.
    pub fn integer(name: FeatureName, min: i64, max: i64, increment: i64) -> Self {
        Self {
            min: Some(min as f64),
            max: Some(max as f64),
            increment: Some(increment as f64),
            ..Self::new(name, FeatureKind::Int)
        }
    }

    /// Bounded float feature.
    pub fn float(name: FeatureName, min: f64, max: f64, increment: Option<f64>) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            increment,
            ..Self::new(name, FeatureKind::Float)
        }
    }

    /// Enumeration feature.
    pub fn enumeration<I, S>(name: FeatureName, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
            ..Self::new(name, FeatureKind::Enum)
        }
    }

    /// Mark read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.access = FeatureAccess::ReadOnly;
        self
    }

    /// Attach a unit.
    #[must_use]
    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    /// Whether `actual` counts as `requested` having been applied.
    pub fn accepts(&self, requested: &FeatureValue, actual: &FeatureValue) -> bool {
        match (requested, actual) {
            (FeatureValue::Bool(r), FeatureValue::Bool(a)) => r == a,
            (FeatureValue::Enum(r), FeatureValue::Enum(a)) => {
                r == a
                    || (self.name.is_auto_mode()
                        && AUTO_ON_VALUES.contains(&r.as_str())
                        && AUTO_ON_VALUES.contains(&a.as_str()))
            }
            _ => match (requested.as_f64(), actual.as_f64()) {
                (Some(r), Some(a)) => (r - a).abs() <= self.tolerance(r),
                _ => false,
            },
        }
    }

    fn tolerance(&self, requested: f64) -> f64 {
        match self.increment {
            Some(inc) if inc > 0.0 => inc + f64::EPSILON * requested.abs().max(1.0),
            _ => 1e-9 * requested.abs().max(1.0),
        }
    }
}

/// Non-fatal outcome of a verified write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureWarning {
    /// The device holds a different value than the one written.
    ValueNotApplied {
        /// Feature written
        feature: FeatureName,
        /// Value written
        requested: FeatureValue,
        /// Value read back
        actual: FeatureValue,
    },
}

impl fmt::Display for FeatureWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValueNotApplied {
                feature,
                requested,
                actual,
            } => write!(f, "{feature}: requested {requested}, device holds {actual}"),
        }
    }
}

/// Result of [`FeatureControl::set_feature`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWrite {
    /// Feature written
    pub name: FeatureName,
    /// Value written (after type coercion)
    pub requested: FeatureValue,
    /// Value read back
    pub actual: FeatureValue,
    /// Set when the read-back is outside tolerance
    pub warning: Option<FeatureWarning>,
}

impl FeatureWrite {
    /// Whether the read-back matched.
    pub fn is_applied(&self) -> bool {
        self.warning.is_none()
    }
}

/// Device identity recorded in a settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsDevice {
    /// Device id
    pub id: String,
    /// Model name
    pub model: String,
    /// Serial number
    pub serial: String,
}

/// On-disk feature set.
///
/// ```toml
/// saved_at = "2024-05-01T12:00:00Z"
///
/// [device]
/// id = "DEV_1"
/// model = "Mako G-040"
/// serial = "50-0503"
///
/// [features]
/// ExposureAuto = "Off"
/// ExposureTime = 5000.0
/// PixelFormat = "Bgr8"
/// Width = 640
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsDocument {
    /// When the document was written
    pub saved_at: DateTime<Utc>,
    /// Device the settings came from
    pub device: SettingsDevice,
    /// Feature name → value
    pub features: BTreeMap<String, FeatureValue>,
}

impl SettingsDocument {
    /// Parse TOML text.
    pub fn from_toml(text: &str) -> AppResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// What [`FeatureControl::apply`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Verified writes, in application order
    pub applied: Vec<FeatureWrite>,
    /// Names skipped as unknown or read-only
    pub skipped: Vec<String>,
    /// Names whose write failed, with the error text
    pub failed: Vec<(String, String)>,
}

impl LoadReport {
    /// Writes whose read-back differed.
    pub fn warnings(&self) -> impl Iterator<Item = &FeatureWarning> {
        self.applied.iter().filter_map(|w| w.warning.as_ref())
    }

    /// Whether `name` was written (successfully or with a warning).
    pub fn touched(&self, name: &FeatureName) -> bool {
        self.applied.iter().any(|w| &w.name == name)
    }
}

/// Feature access through an open device session.
pub struct FeatureControl<'a> {
    session: &'a DeviceSession,
    device: &'a dyn CameraDevice,
    diagnostics: &'a dyn DiagnosticsSink,
}

impl<'a> FeatureControl<'a> {
    /// Bind to a session and its device handle.
    pub fn new(
        session: &'a DeviceSession,
        device: &'a dyn CameraDevice,
        diagnostics: &'a dyn DiagnosticsSink,
    ) -> Self {
        Self {
            session,
            device,
            diagnostics,
        }
    }

    /// Every feature the device publishes.
    pub fn list_features(&self) -> AppResult<Vec<FeatureDescriptor>> {
        self.session.ensure_open()?;
        self.device.feature_descriptors()
    }

    /// Descriptor for `name`.
    pub fn descriptor(&self, name: &FeatureName) -> AppResult<FeatureDescriptor> {
        self.list_features()?
            .into_iter()
            .find(|d| &d.name == name)
            .ok_or_else(|| DaqError::UnknownFeature(name.to_string()))
    }

    /// Current value of `name`.
    pub fn get_feature(&self, name: &FeatureName) -> AppResult<FeatureValue> {
        self.session.ensure_readable()?;
        let descriptor = self.descriptor(name)?;
        if !descriptor.access.is_readable() {
            return Err(DaqError::FeatureNotReadable(name.to_string()));
        }
        self.device.read_feature(name)
    }

    /// Write `value`, read it back and compare.
    ///
    /// Returns the read-back value. A mismatch beyond tolerance is reported as
    /// a [`FeatureWarning::ValueNotApplied`] in the result and to the
    /// diagnostics sink; the call still succeeds.
    pub fn set_feature(&self, name: &FeatureName, value: FeatureValue) -> AppResult<FeatureWrite> {
        self.session.ensure_writable()?;
        let descriptor = self.descriptor(name)?;
        self.write_verified(&descriptor, value)
    }

    fn write_verified(&self, descriptor: &FeatureDescriptor, value: FeatureValue) -> AppResult<FeatureWrite> {
        let name = &descriptor.name;
        if !descriptor.access.is_writable() {
            return Err(DaqError::FeatureNotWritable(name.to_string()));
        }
        let requested = value
            .coerce_to(descriptor.kind)
            .ok_or_else(|| DaqError::FeatureTypeMismatch {
                name: name.to_string(),
                expected: descriptor.kind.name(),
                actual: value.kind().name(),
            })?;

        self.device.write_feature(name, &requested)?;
        let actual = if descriptor.access.is_readable() {
            self.device.read_feature(name)?
        } else {
            requested.clone()
        };

        let warning = if descriptor.accepts(&requested, &actual) {
            debug!(feature = %name, value = %actual, "Feature written");
            None
        } else {
            warn!(
                feature = %name,
                requested = %requested,
                actual = %actual,
                "Feature value not applied by device"
            );
            self.diagnostics.report(Diagnostic::ValueNotApplied {
                device_id: self.session.device_id().to_string(),
                feature: name.to_string(),
                requested: requested.clone(),
                actual: actual.clone(),
            });
            Some(FeatureWarning::ValueNotApplied {
                feature: name.clone(),
                requested: requested.clone(),
                actual: actual.clone(),
            })
        };

        Ok(FeatureWrite {
            name: name.clone(),
            requested,
            actual,
            warning,
        })
    }

    /// Enable or disable an auto mode.
    ///
    /// Enabling writes `Continuous` when the device lists it, else `On`;
    /// disabling writes `Off`.
    pub fn set_auto(&self, name: &FeatureName, enabled: bool) -> AppResult<FeatureWrite> {
        self.session.ensure_writable()?;
        let descriptor = self.descriptor(name)?;
        if descriptor.kind != FeatureKind::Enum {
            return Err(DaqError::FeatureTypeMismatch {
                name: name.to_string(),
                expected: FeatureKind::Enum.name(),
                actual: descriptor.kind.name(),
            });
        }

        let value = if enabled {
            let entry = AUTO_ON_VALUES
                .iter()
                .find(|v| descriptor.entries.iter().any(|e| e == *v))
                .ok_or_else(|| {
                    DaqError::Hardware(format!(
                        "{name} advertises no auto activation entry (have: {})",
                        descriptor.entries.join(", ")
                    ))
                })?;
            if *entry != AUTO_ON_VALUES[0] {
                self.diagnostics.report(Diagnostic::AutoModeFallback {
                    device_id: self.session.device_id().to_string(),
                    feature: name.to_string(),
                    value: (*entry).to_string(),
                });
            }
            *entry
        } else {
            AUTO_OFF_VALUE
        };

        self.write_verified(&descriptor, FeatureValue::from(value))
    }

    /// Read every readable and writable feature into a settings document.
    pub fn snapshot(&self) -> AppResult<SettingsDocument> {
        self.session.ensure_readable()?;
        let mut features = BTreeMap::new();
        for descriptor in self.list_features()? {
            if !descriptor.access.is_readable() || !descriptor.access.is_writable() {
                continue;
            }
            match self.device.read_feature(&descriptor.name) {
                Ok(value) => {
                    features.insert(descriptor.name.to_string(), value);
                }
                Err(e) => warn!(feature = %descriptor.name, error = %e, "Skipping unreadable feature"),
            }
        }
        let info = self.session.info();
        Ok(SettingsDocument {
            saved_at: Utc::now(),
            device: SettingsDevice {
                id: info.id.clone(),
                model: info.model.clone(),
                serial: info.serial.clone(),
            },
            features,
        })
    }

    /// Write the current feature set to `path`. Returns the number of features saved.
    pub fn save_settings(&self, path: &Path) -> AppResult<usize> {
        let document = self.snapshot()?;
        std::fs::write(path, document.to_toml()?)?;
        info!(
            path = %path.display(),
            features = document.features.len(),
            "Camera settings saved"
        );
        Ok(document.features.len())
    }

    /// Apply a settings document with verified writes.
    ///
    /// `PixelFormat` goes first, then ROI size and offset, then auto modes,
    /// then everything else. Unknown and read-only names are skipped; a
    /// failed write is recorded and the remaining features are still applied.
    pub fn apply(&self, document: &SettingsDocument) -> AppResult<LoadReport> {
        self.session.ensure_writable()?;
        if document.device.id != self.session.device_id() {
            warn!(
                saved_for = %document.device.id,
                device = %self.session.device_id(),
                "Settings document was saved for a different device"
            );
        }

        let descriptors: HashMap<FeatureName, FeatureDescriptor> = self
            .list_features()?
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        let mut ordered: Vec<(FeatureName, &FeatureValue)> = document
            .features
            .iter()
            .map(|(name, value)| (FeatureName::from(name.as_str()), value))
            .collect();
        ordered.sort_by_key(|(name, _)| name.apply_rank());

        let mut report = LoadReport::default();
        for (name, value) in ordered {
            let Some(descriptor) = descriptors.get(&name) else {
                debug!(feature = %name, "Skipping feature unknown to this device");
                report.skipped.push(name.to_string());
                continue;
            };
            if !descriptor.access.is_writable() {
                report.skipped.push(name.to_string());
                continue;
            }
            match self.write_verified(descriptor, value.clone()) {
                Ok(write) => report.applied.push(write),
                Err(e) => {
                    warn!(feature = %name, error = %e, "Failed to restore feature");
                    report.failed.push((name.to_string(), e.to_string()));
                }
            }
        }

        info!(
            applied = report.applied.len(),
            warnings = report.warnings().count(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Camera settings applied"
        );
        Ok(report)
    }

    /// Read a settings document from `path` and apply it.
    pub fn load_settings(&self, path: &Path) -> AppResult<LoadReport> {
        let text = std::fs::read_to_string(path)?;
        let document = SettingsDocument::from_toml(&text)?;
        self.apply(&document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_tolerance_uses_increment() {
        let gain = FeatureDescriptor::float(FeatureName::Gain, 0.0, 24.0, Some(0.1));
        assert!(gain.accepts(&5.0.into(), &5.0.into()));
        assert!(gain.accepts(&5.04.into(), &5.0.into()));
        assert!(!gain.accepts(&5.0.into(), &5.3.into()));
        assert!(!gain.accepts(&30.0.into(), &24.0.into()));
    }

    #[test]
    fn float_without_increment_is_near_exact() {
        let gamma = FeatureDescriptor::float(FeatureName::Gamma, 0.4, 2.4, None);
        assert!(gamma.accepts(&1.2.into(), &1.2.into()));
        assert!(!gamma.accepts(&1.2.into(), &1.21.into()));
    }

    #[test]
    fn auto_values_are_equivalent() {
        let auto = FeatureDescriptor::enumeration(FeatureName::ExposureAuto, ["Off", "On"]);
        assert!(auto.accepts(&"Continuous".into(), &"On".into()));
        assert!(auto.accepts(&"On".into(), &"Continuous".into()));
        assert!(!auto.accepts(&"Off".into(), &"On".into()));

        let format = FeatureDescriptor::enumeration(FeatureName::PixelFormat, ["Mono8", "Bgr8"]);
        assert!(!format.accepts(&"Mono8".into(), &"Bgr8".into()));
    }

    #[test]
    fn coercion_rules() {
        assert_eq!(
            FeatureValue::Int(5).coerce_to(FeatureKind::Float),
            Some(FeatureValue::Float(5.0))
        );
        assert_eq!(
            FeatureValue::Float(640.0).coerce_to(FeatureKind::Int),
            Some(FeatureValue::Int(640))
        );
        assert_eq!(FeatureValue::Float(1.5).coerce_to(FeatureKind::Int), None);
        assert_eq!(FeatureValue::Bool(true).coerce_to(FeatureKind::Enum), None);
    }

    #[test]
    fn names_round_trip_through_strings() {
        assert_eq!(FeatureName::from("Gain"), FeatureName::Gain);
        assert_eq!(
            FeatureName::from("TriggerMode"),
            FeatureName::Other("TriggerMode".into())
        );
        assert_eq!(String::from(FeatureName::ExposureTime), "ExposureTime");
        assert!(FeatureName::BalanceWhiteAuto.is_auto_mode());
        assert!(!FeatureName::Other("GainAuto2".into()).is_auto_mode());
    }

    #[test]
    fn apply_order_puts_pixel_format_first() {
        let mut names = vec![
            FeatureName::Gain,
            FeatureName::ExposureAuto,
            FeatureName::Width,
            FeatureName::PixelFormat,
        ];
        names.sort_by_key(FeatureName::apply_rank);
        assert_eq!(
            names,
            vec![
                FeatureName::PixelFormat,
                FeatureName::Width,
                FeatureName::ExposureAuto,
                FeatureName::Gain,
            ]
        );
    }

    #[test]
    fn settings_document_toml_round_trip() {
        let mut features = BTreeMap::new();
        features.insert("ExposureAuto".to_string(), FeatureValue::from("Off"));
        features.insert("ExposureTime".to_string(), FeatureValue::Float(5000.0));
        features.insert("ReverseX".to_string(), FeatureValue::Bool(true));
        features.insert("Width".to_string(), FeatureValue::Int(640));
        let document = SettingsDocument {
            saved_at: Utc::now(),
            device: SettingsDevice {
                id: "DEV_1".into(),
                model: "Mako".into(),
                serial: "SN".into(),
            },
            features,
        };

        let text = document.to_toml().unwrap();
        let parsed = SettingsDocument::from_toml(&text).unwrap();
        assert_eq!(parsed.features, document.features);
        assert_eq!(parsed.device, document.device);
    }
}
