//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tosca_daq::camera::FrameAcquisition;
use tosca_daq::config::{ActuatorConfig, CameraConfig};
use tosca_daq::diagnostics::{BroadcastDiagnostics, Diagnostic};
use tosca_daq::hardware::mock::{MockAxis, MockCamera, MockCameraSpec, MockCameraSystem};
use tosca_daq::motion::SequenceEngine;
use tosca_daq::session::DeviceRegistry;

/// Id of the camera in [`MockCameraSystem::single`].
pub const CAMERA_ID: &str = "DEV_MOCK0";

/// Camera config with short timeouts for tests.
pub fn camera_config() -> CameraConfig {
    CameraConfig {
        buffer_count: 4,
        capture_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(500),
        ..CameraConfig::default()
    }
}

/// Acquisition engine over a single mock camera, plus the camera and diagnostics.
pub struct CameraRig {
    pub engine: FrameAcquisition,
    pub camera: MockCamera,
    pub system: MockCameraSystem,
    pub registry: Arc<DeviceRegistry>,
    pub diagnostics: Arc<BroadcastDiagnostics>,
}

pub fn camera_rig(config: CameraConfig) -> CameraRig {
    camera_rig_with(MockCameraSpec::new(CAMERA_ID), config)
}

pub fn camera_rig_with(spec: MockCameraSpec, config: CameraConfig) -> CameraRig {
    let id = spec_id(&spec);
    let system = MockCameraSystem::new(vec![spec]);
    let camera = system.camera(&id).expect("mock camera exists");
    let registry = DeviceRegistry::new();
    let diagnostics = Arc::new(BroadcastDiagnostics::new(1024));
    let engine = FrameAcquisition::new(
        Arc::new(system.clone()),
        Arc::clone(&registry),
        config,
        diagnostics.clone(),
    )
    .expect("engine construction");
    CameraRig {
        engine,
        camera,
        system,
        registry,
        diagnostics,
    }
}

fn spec_id(spec: &MockCameraSpec) -> String {
    spec.info.id.clone()
}

/// Poll `condition` every 5 ms until it holds or `limit` passes.
pub fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Everything reported so far on `rx`.
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<Diagnostic>) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    while let Ok(d) = rx.try_recv() {
        out.push(d);
    }
    out
}

/// Actuator config with a fast tick and short command timeout.
pub fn actuator_config() -> ActuatorConfig {
    ActuatorConfig {
        tick_interval: Duration::from_millis(5),
        command_timeout: Duration::from_millis(500),
        home_timeout: Duration::from_millis(500),
        ..ActuatorConfig::default()
    }
}

/// Sequence engine over `axis` with broadcast diagnostics.
pub fn motion_rig(
    axis: Arc<MockAxis>,
    config: &ActuatorConfig,
) -> (Arc<SequenceEngine>, Arc<BroadcastDiagnostics>) {
    let diagnostics = Arc::new(BroadcastDiagnostics::new(256));
    let engine = SequenceEngine::connect(&DeviceRegistry::new(), axis, config, diagnostics.clone())
        .expect("engine connects");
    (engine, diagnostics)
}
