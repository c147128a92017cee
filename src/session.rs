//! Device sessions and access-mode arbitration.
//!
//! A [`DeviceSession`] is the only way the engines touch a physical device.
//! Opening one selects a device from an enumeration and leases it from a
//! shared [`DeviceRegistry`] under an [`AccessMode`]; the lease is released
//! when the session is closed or dropped.
//!
//! Lease compatibility:
//!
//! | held \ requested | None | Read | Full | Exclusive |
//! |------------------|------|------|------|-----------|
//! | None             | ok   | ok   | ok   | ok        |
//! | Read             | ok   | ok   | ok   | denied    |
//! | Full             | ok   | ok   | denied | denied  |
//! | Exclusive        | ok   | denied | denied | denied |
//!
//! Sessions know nothing about streams or motion runs. The engine that owns a
//! session stops its own activity before closing it.
//!
//! # Example
//!
//! ```
//! use tosca_daq::session::{AccessMode, DeviceInfo, DeviceKind, DeviceRegistry, DeviceSession};
//!
//! let registry = DeviceRegistry::new();
//! let devices = vec![DeviceInfo::new("cam0", "Mako G-040", "50-0503", DeviceKind::Camera)];
//!
//! let session = DeviceSession::open(&registry, &devices, Some("50-0503"), AccessMode::Full).unwrap();
//! assert_eq!(session.device_id(), "cam0");
//! assert!(DeviceSession::open(&registry, &devices, None, AccessMode::Full).is_err());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppResult, DaqError};

/// Exclusivity level under which a device handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Enumerate only; no feature or stream access.
    None,
    /// Feature reads only.
    Read,
    /// Reads, writes and streaming; other readers allowed.
    #[default]
    Full,
    /// Full access with no other holders.
    Exclusive,
}

impl AccessMode {
    /// Whether feature reads are permitted.
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::Full | Self::Exclusive)
    }

    /// Whether feature writes, streaming and motion are permitted.
    pub fn can_write(self) -> bool {
        matches!(self, Self::Full | Self::Exclusive)
    }

    fn conflicts_with(self, held: AccessMode) -> bool {
        match (self, held) {
            (Self::None, _) | (_, Self::None) => false,
            (Self::Exclusive, _) | (_, Self::Exclusive) => true,
            (Self::Full, Self::Full) => true,
            _ => false,
        }
    }

    /// Lowercase name, matching the configuration vocabulary.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Read => "read",
            Self::Full => "full",
            Self::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "read" => Ok(Self::Read),
            "full" => Ok(Self::Full),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(DaqError::Configuration(format!(
                "unknown access mode '{other}' (expected none, read, full or exclusive)"
            ))),
        }
    }
}

/// Device class, used only for logging and enumeration filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Machine-vision camera.
    Camera,
    /// Positioning actuator.
    Actuator,
}

/// Identity of an enumerated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Driver-assigned identifier.
    pub id: String,
    /// Model name.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Device class.
    pub kind: DeviceKind,
}

impl DeviceInfo {
    /// Create a device identity.
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        serial: impl Into<String>,
        kind: DeviceKind,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            serial: serial.into(),
            kind,
        }
    }

    /// Whether `ident` names this device by id, serial number or model.
    pub fn matches(&self, ident: &str) -> bool {
        self.id == ident || self.serial == ident || self.model == ident
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, S/N {})", self.id, self.model, self.serial)
    }
}

/// Pick a device from an enumeration.
///
/// With no identifier the first enumerated device is chosen.
pub fn select_device<'a>(
    devices: &'a [DeviceInfo],
    ident: Option<&str>,
) -> AppResult<&'a DeviceInfo> {
    match ident {
        Some(ident) => devices
            .iter()
            .find(|d| d.matches(ident))
            .ok_or_else(|| DaqError::DeviceNotFound(ident.to_string())),
        None => devices
            .first()
            .ok_or_else(|| DaqError::DeviceNotFound("no devices enumerated".to_string())),
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    session_id: Uuid,
    mode: AccessMode,
}

/// Process-wide table of device leases, shared by `Arc`.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    leases: Mutex<HashMap<String, Vec<Lease>>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn acquire(&self, device_id: &str, session_id: Uuid, mode: AccessMode) -> AppResult<()> {
        let mut leases = self.leases.lock();
        let held = leases.entry(device_id.to_string()).or_default();
        if let Some(conflict) = held.iter().find(|l| mode.conflicts_with(l.mode)) {
            return Err(DaqError::AccessDenied {
                device_id: device_id.to_string(),
                requested: mode,
                reason: format!("device already held with {} access", conflict.mode),
            });
        }
        held.push(Lease { session_id, mode });
        Ok(())
    }

    fn release(&self, device_id: &str, session_id: Uuid) {
        let mut leases = self.leases.lock();
        if let Some(held) = leases.get_mut(device_id) {
            held.retain(|l| l.session_id != session_id);
            if held.is_empty() {
                leases.remove(device_id);
            }
        }
    }

    /// Access modes currently leased on a device.
    pub fn holders(&self, device_id: &str) -> Vec<AccessMode> {
        self.leases
            .lock()
            .get(device_id)
            .map(|held| held.iter().map(|l| l.mode).collect())
            .unwrap_or_default()
    }
}

/// An open (or closed) lease on one physical device.
#[derive(Debug)]
pub struct DeviceSession {
    id: Uuid,
    info: DeviceInfo,
    access_mode: AccessMode,
    registry: Arc<DeviceRegistry>,
    open: bool,
}

impl DeviceSession {
    /// Select a device from `devices` and lease it under `access_mode`.
    ///
    /// Fails with [`DaqError::DeviceNotFound`] if nothing matches `device_id`
    /// and [`DaqError::AccessDenied`] if the lease conflicts with a holder.
    pub fn open(
        registry: &Arc<DeviceRegistry>,
        devices: &[DeviceInfo],
        device_id: Option<&str>,
        access_mode: AccessMode,
    ) -> AppResult<Self> {
        let info = select_device(devices, device_id)?.clone();
        let id = Uuid::new_v4();
        registry.acquire(&info.id, id, access_mode)?;
        info!(
            session = %id,
            device = %info,
            access = %access_mode,
            "Device session opened"
        );
        Ok(Self {
            id,
            info,
            access_mode,
            registry: Arc::clone(registry),
            open: true,
        })
    }

    /// Release the lease. Idempotent.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.registry.release(&self.info.id, self.id);
        info!(session = %self.id, device = %self.info.id, "Device session closed");
    }

    /// Whether the lease is still held.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Fail with [`DaqError::SessionClosed`] once closed.
    pub fn ensure_open(&self) -> AppResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DaqError::SessionClosed(self.info.id.clone()))
        }
    }

    /// Require an open session that permits feature reads.
    pub fn ensure_readable(&self) -> AppResult<()> {
        self.ensure_open()?;
        if self.access_mode.can_read() {
            Ok(())
        } else {
            Err(self.denied("session does not permit reads"))
        }
    }

    /// Require an open session that permits writes, streaming and motion.
    pub fn ensure_writable(&self) -> AppResult<()> {
        self.ensure_open()?;
        if self.access_mode.can_write() {
            Ok(())
        } else {
            Err(self.denied("session does not permit writes"))
        }
    }

    fn denied(&self, reason: &str) -> DaqError {
        debug!(session = %self.id, device = %self.info.id, reason, "Access check failed");
        DaqError::AccessDenied {
            device_id: self.info.id.clone(),
            requested: self.access_mode,
            reason: reason.to_string(),
        }
    }

    /// Session identifier used for log correlation.
    pub fn session_id(&self) -> Uuid {
        self.id
    }

    /// Identity of the leased device.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Shorthand for `info().id`.
    pub fn device_id(&self) -> &str {
        &self.info.id
    }

    /// Mode the lease was granted under.
    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cameras() -> Vec<DeviceInfo> {
        vec![
            DeviceInfo::new("DEV_1", "Mako G-040", "SN-100", DeviceKind::Camera),
            DeviceInfo::new("DEV_2", "Alvium 1800", "SN-200", DeviceKind::Camera),
        ]
    }

    #[test]
    fn selects_by_id_serial_or_model() {
        let devices = cameras();
        assert_eq!(select_device(&devices, None).unwrap().id, "DEV_1");
        assert_eq!(select_device(&devices, Some("DEV_2")).unwrap().id, "DEV_2");
        assert_eq!(select_device(&devices, Some("SN-200")).unwrap().id, "DEV_2");
        assert_eq!(select_device(&devices, Some("Mako G-040")).unwrap().id, "DEV_1");
    }

    #[test]
    fn missing_device_is_not_found() {
        let devices = cameras();
        assert!(matches!(
            select_device(&devices, Some("nope")),
            Err(DaqError::DeviceNotFound(_))
        ));
        assert!(matches!(
            select_device(&[], None),
            Err(DaqError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn exclusive_blocks_everyone_but_none() {
        let registry = DeviceRegistry::new();
        let devices = cameras();
        let _held = DeviceSession::open(&registry, &devices, None, AccessMode::Exclusive).unwrap();

        for mode in [AccessMode::Read, AccessMode::Full, AccessMode::Exclusive] {
            let err = DeviceSession::open(&registry, &devices, None, mode).unwrap_err();
            assert!(matches!(err, DaqError::AccessDenied { .. }), "{mode}");
        }
        assert!(DeviceSession::open(&registry, &devices, None, AccessMode::None).is_ok());
    }

    #[test]
    fn readers_coexist_with_one_controller() {
        let registry = DeviceRegistry::new();
        let devices = cameras();
        let _full = DeviceSession::open(&registry, &devices, None, AccessMode::Full).unwrap();
        let _r1 = DeviceSession::open(&registry, &devices, None, AccessMode::Read).unwrap();
        let _r2 = DeviceSession::open(&registry, &devices, None, AccessMode::Read).unwrap();
        assert!(DeviceSession::open(&registry, &devices, None, AccessMode::Full).is_err());
        assert!(DeviceSession::open(&registry, &devices, None, AccessMode::Exclusive).is_err());
        assert_eq!(registry.holders("DEV_1").len(), 3);
    }

    #[test]
    fn leases_are_per_device() {
        let registry = DeviceRegistry::new();
        let devices = cameras();
        let _a = DeviceSession::open(&registry, &devices, Some("DEV_1"), AccessMode::Exclusive).unwrap();
        assert!(DeviceSession::open(&registry, &devices, Some("DEV_2"), AccessMode::Exclusive).is_ok());
    }

    #[test]
    fn close_is_idempotent_and_releases() {
        let registry = DeviceRegistry::new();
        let devices = cameras();
        let mut session = DeviceSession::open(&registry, &devices, None, AccessMode::Exclusive).unwrap();
        session.close();
        session.close();
        assert!(!session.is_open());
        assert!(matches!(session.ensure_open(), Err(DaqError::SessionClosed(_))));
        assert!(registry.holders("DEV_1").is_empty());
        assert!(DeviceSession::open(&registry, &devices, None, AccessMode::Exclusive).is_ok());
    }

    #[test]
    fn drop_releases_lease() {
        let registry = DeviceRegistry::new();
        let devices = cameras();
        {
            let _session = DeviceSession::open(&registry, &devices, None, AccessMode::Full).unwrap();
            assert_eq!(registry.holders("DEV_1"), vec![AccessMode::Full]);
        }
        assert!(registry.holders("DEV_1").is_empty());
    }

    #[test]
    fn access_checks_follow_mode() {
        let registry = DeviceRegistry::new();
        let devices = cameras();
        let reader = DeviceSession::open(&registry, &devices, None, AccessMode::Read).unwrap();
        assert!(reader.ensure_readable().is_ok());
        assert!(matches!(
            reader.ensure_writable(),
            Err(DaqError::AccessDenied { .. })
        ));

        let none = DeviceSession::open(&registry, &devices, None, AccessMode::None).unwrap();
        assert!(none.ensure_readable().is_err());
    }

    #[test]
    fn access_mode_parses_case_insensitively() {
        assert_eq!("Exclusive".parse::<AccessMode>().unwrap(), AccessMode::Exclusive);
        assert_eq!(" read ".parse::<AccessMode>().unwrap(), AccessMode::Read);
        assert!("shared".parse::<AccessMode>().is_err());
    }
}
