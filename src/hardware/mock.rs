//! Mock Hardware Implementations
//!
//! Provides simulated devices for tests and for the CLI without hardware.
//!
//! # Available Mocks
//!
//! - [`MockCameraSystem`] / [`MockCamera`] - camera with its own acquisition
//!   thread, a GenICam-like feature set and fault injection ([`MockFaults`])
//! - [`MockAxis`] - linear stage with realistic move timing, a command log and
//!   failure/hang injection
//!
//! # Behaviour Worth Knowing
//!
//! - The camera calls the frame handler on its acquisition thread, exactly
//!   like a vendor SDK. Calling `stop_capture` from that thread fails, as it
//!   would deadlock against a real driver's stream lock.
//! - Writes to `ExposureTime`/`Gain` are silently ignored while the matching
//!   auto mode is active; numeric writes are clamped and quantized.
//! - Layout features (`Width`, `Height`, `PixelFormat`) are locked while capturing.
//! - MockAxis: 10 mm/s default speed; moves take `distance / speed * time_scale`
//!   and end early when `stop_motion` is called.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Notify, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use super::{CameraDevice, CameraSystem, FrameHandler, MotionAxis};
use crate::camera::{
    FeatureDescriptor, FeatureKind, FeatureName, FeatureValue, FillStatus, FrameBuffer, PixelFormat,
    PixelFormatDescriptor, RequeueError,
};
use crate::error::{AppResult, DaqError};
use crate::motion::{Direction, Unit};
use crate::session::{AccessMode, DeviceInfo, DeviceKind};

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Construction parameters for a [`MockCamera`].
#[derive(Debug, Clone)]
pub struct MockCameraSpec {
    /// Identity reported on enumeration
    pub info: DeviceInfo,
    /// Advertised pixel formats; the first is active at power-up
    pub formats: Vec<PixelFormat>,
    /// Full sensor size `(width, height)`
    pub sensor: (u32, u32),
    /// Time between frames while streaming
    pub frame_interval: Duration,
    /// Entries of the `*Auto` enumerations
    pub auto_entries: Vec<String>,
}

impl MockCameraSpec {
    /// 64×48 camera advertising Mono8, Mono12, Bgr8 and Rgb8 at ~200 fps.
    pub fn new(id: &str) -> Self {
        Self {
            info: DeviceInfo::new(id, "Mock Mako G-040", format!("MOCK-{id}"), DeviceKind::Camera),
            formats: vec![
                PixelFormat::Mono8,
                PixelFormat::Mono12,
                PixelFormat::Bgr8,
                PixelFormat::Rgb8,
            ],
            sensor: (64, 48),
            frame_interval: Duration::from_millis(5),
            auto_entries: vec!["Off".into(), "Once".into(), "Continuous".into()],
        }
    }

    /// Replace the advertised formats.
    #[must_use]
    pub fn with_formats(mut self, formats: &[PixelFormat]) -> Self {
        self.formats = formats.to_vec();
        self
    }

    /// Replace the sensor size.
    #[must_use]
    pub fn with_sensor(mut self, width: u32, height: u32) -> Self {
        self.sensor = (width, height);
        self
    }

    /// Replace the frame interval.
    #[must_use]
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Replace the auto-mode vocabulary (e.g. `["Off", "On"]`).
    #[must_use]
    pub fn with_auto_entries(mut self, entries: &[&str]) -> Self {
        self.auto_entries = entries.iter().map(|e| (*e).to_string()).collect();
        self
    }

    /// Replace model and serial number.
    #[must_use]
    pub fn with_identity(mut self, model: &str, serial: &str) -> Self {
        self.info.model = model.to_string();
        self.info.serial = serial.to_string();
        self
    }
}

/// Fault injection switches for a [`MockCamera`]. All default to off.
#[derive(Debug)]
pub struct MockFaults {
    incomplete_every: AtomicU64,
    short_every: AtomicU64,
    requeue_fail_after: AtomicI64,
    single_timeout: AtomicBool,
    single_incomplete: AtomicBool,
}

impl Default for MockFaults {
    fn default() -> Self {
        Self {
            incomplete_every: AtomicU64::new(0),
            short_every: AtomicU64::new(0),
            requeue_fail_after: AtomicI64::new(-1),
            single_timeout: AtomicBool::new(false),
            single_incomplete: AtomicBool::new(false),
        }
    }
}

impl MockFaults {
    /// Every `n`th streamed frame arrives incomplete (0 disables).
    pub fn incomplete_every(&self, n: u64) {
        self.incomplete_every.store(n, Ordering::Relaxed);
    }

    /// Every `n`th streamed frame is marked complete but one byte short (0 disables).
    pub fn short_frame_every(&self, n: u64) {
        self.short_every.store(n, Ordering::Relaxed);
    }

    /// Accept `n` more requeues, then refuse every one after.
    pub fn fail_requeue_after(&self, n: u64) {
        self.requeue_fail_after
            .store(i64::try_from(n).unwrap_or(i64::MAX), Ordering::Relaxed);
    }

    /// Stop refusing requeues.
    pub fn clear_requeue_failure(&self) {
        self.requeue_fail_after.store(-1, Ordering::Relaxed);
    }

    /// Single-frame capture waits out its timeout.
    pub fn single_capture_times_out(&self, enabled: bool) {
        self.single_timeout.store(enabled, Ordering::Relaxed);
    }

    /// Single-frame capture returns an incomplete buffer.
    pub fn single_capture_incomplete(&self, enabled: bool) {
        self.single_incomplete.store(enabled, Ordering::Relaxed);
    }

    fn hits(counter: &AtomicU64, frame_no: u64) -> bool {
        let n = counter.load(Ordering::Relaxed);
        n != 0 && frame_no % n == 0
    }

    /// Consume one requeue permit; `false` means refuse.
    fn permit_requeue(&self) -> bool {
        let remaining = self.requeue_fail_after.load(Ordering::Relaxed);
        if remaining < 0 {
            return true;
        }
        if remaining == 0 {
            return false;
        }
        self.requeue_fail_after.fetch_sub(1, Ordering::Relaxed);
        true
    }
}

struct CaptureThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    thread_id: ThreadId,
}

struct MockCameraInner {
    spec: MockCameraSpec,
    values: Mutex<BTreeMap<FeatureName, FeatureValue>>,
    free: SegQueue<FrameBuffer>,
    capture: Mutex<Option<CaptureThread>>,
    capturing: AtomicBool,
    faults: MockFaults,
    /// Per buffer index: whether the driver currently holds it.
    held: Mutex<Vec<bool>>,
    frame_counter: AtomicU64,
    delivered: AtomicU64,
    requeued: AtomicU64,
    requeue_refused: AtomicU64,
    double_requeues: AtomicU64,
    starved: AtomicU64,
}

/// Simulated camera. Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct MockCamera {
    inner: Arc<MockCameraInner>,
}

impl MockCamera {
    /// Power up a camera described by `spec`.
    pub fn new(spec: MockCameraSpec) -> Self {
        let initial_format = spec.formats.first().copied().unwrap_or(PixelFormat::Mono8);
        let (width, height) = spec.sensor;
        let mut values = BTreeMap::new();
        values.insert(FeatureName::ExposureTime, FeatureValue::Float(10_000.0));
        values.insert(FeatureName::ExposureAuto, FeatureValue::from("Off"));
        values.insert(FeatureName::Gain, FeatureValue::Float(0.0));
        values.insert(FeatureName::GainAuto, FeatureValue::from("Off"));
        values.insert(FeatureName::Gamma, FeatureValue::Float(1.0));
        values.insert(FeatureName::AcquisitionFrameRate, FeatureValue::Float(30.0));
        values.insert(FeatureName::Width, FeatureValue::Int(i64::from(width)));
        values.insert(FeatureName::Height, FeatureValue::Int(i64::from(height)));
        values.insert(FeatureName::PixelFormat, FeatureValue::from(initial_format.as_str()));
        values.insert(FeatureName::ReverseX, FeatureValue::Bool(false));
        values.insert(FeatureName::DeviceTemperature, FeatureValue::Float(36.5));

        Self {
            inner: Arc::new(MockCameraInner {
                spec,
                values: Mutex::new(values),
                free: SegQueue::new(),
                capture: Mutex::new(None),
                capturing: AtomicBool::new(false),
                faults: MockFaults::default(),
                held: Mutex::new(Vec::new()),
                frame_counter: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                requeued: AtomicU64::new(0),
                requeue_refused: AtomicU64::new(0),
                double_requeues: AtomicU64::new(0),
                starved: AtomicU64::new(0),
            }),
        }
    }

    /// Fault injection switches.
    pub fn faults(&self) -> &MockFaults {
        &self.inner.faults
    }

    /// Whether the acquisition thread is running.
    pub fn is_capturing(&self) -> bool {
        self.inner.capturing.load(Ordering::Acquire)
    }

    /// Buffers currently queued and waiting for a frame.
    pub fn queued_buffers(&self) -> usize {
        self.inner.free.len()
    }

    /// Buffers handed to the frame handler so far.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Buffers accepted back.
    pub fn requeued(&self) -> u64 {
        self.inner.requeued.load(Ordering::Relaxed)
    }

    /// Requeues refused by fault injection.
    pub fn requeue_refused(&self) -> u64 {
        self.inner.requeue_refused.load(Ordering::Relaxed)
    }

    /// Buffers queued while the driver already held them.
    pub fn double_requeues(&self) -> u64 {
        self.inner.double_requeues.load(Ordering::Relaxed)
    }

    /// Frame periods skipped because no buffer was queued.
    pub fn starved_frames(&self) -> u64 {
        self.inner.starved.load(Ordering::Relaxed)
    }

    fn geometry(&self) -> (PixelFormat, u32, u32) {
        let values = self.inner.values.lock();
        let format = values
            .get(&FeatureName::PixelFormat)
            .and_then(FeatureValue::as_enum)
            .and_then(|name| name.parse().ok())
            .unwrap_or(PixelFormat::Mono8);
        let dim = |name: &FeatureName| match values.get(name) {
            Some(FeatureValue::Int(v)) => u32::try_from(*v).unwrap_or(0),
            _ => 0,
        };
        (format, dim(&FeatureName::Width), dim(&FeatureName::Height))
    }

    fn descriptors(&self) -> Vec<FeatureDescriptor> {
        let spec = &self.inner.spec;
        let (sensor_w, sensor_h) = spec.sensor;
        vec![
            FeatureDescriptor::float(FeatureName::ExposureTime, 10.0, 1_000_000.0, None).with_unit("us"),
            FeatureDescriptor::enumeration(FeatureName::ExposureAuto, spec.auto_entries.clone()),
            FeatureDescriptor::float(FeatureName::Gain, 0.0, 24.0, Some(0.1)).with_unit("dB"),
            FeatureDescriptor::enumeration(FeatureName::GainAuto, spec.auto_entries.clone()),
            FeatureDescriptor::float(FeatureName::Gamma, 0.4, 2.4, None),
            FeatureDescriptor::float(FeatureName::AcquisitionFrameRate, 1.0, 200.0, None).with_unit("Hz"),
            FeatureDescriptor::integer(FeatureName::Width, 8, i64::from(sensor_w), 8),
            FeatureDescriptor::integer(FeatureName::Height, 8, i64::from(sensor_h), 2),
            FeatureDescriptor::enumeration(
                FeatureName::PixelFormat,
                spec.formats.iter().map(|f| f.as_str()),
            ),
            FeatureDescriptor::boolean(FeatureName::ReverseX),
            FeatureDescriptor::float(FeatureName::DeviceTemperature, -40.0, 120.0, None)
                .with_unit("C")
                .read_only(),
        ]
    }

    fn fill(&self, buffer: &mut FrameBuffer, force_incomplete: bool) {
        let (format, width, height) = self.geometry();
        let row = (width as usize * format.bytes_per_pixel()).max(1);
        let payload = row * height as usize;
        let frame_no = self.inner.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let faults = &self.inner.faults;
        let incomplete = force_incomplete || MockFaults::hits(&faults.incomplete_every, frame_no);
        let short = MockFaults::hits(&faults.short_every, frame_no);
        let len = if incomplete {
            payload / 2
        } else if short {
            payload.saturating_sub(1)
        } else {
            payload
        };

        let mut rng = rand::thread_rng();
        let data = buffer.fill(len, frame_no);
        for (i, byte) in data.iter_mut().enumerate() {
            let x = (i % row) as u64;
            let y = (i / row) as u64;
            *byte = (x + y + frame_no + rng.gen_range(0..3u64)) as u8;
        }
        buffer.complete(if incomplete {
            FillStatus::Incomplete
        } else {
            FillStatus::Complete
        });
    }

    fn run_capture(self, handler: Arc<dyn FrameHandler>, stop: Arc<AtomicBool>) {
        let interval = self.inner.spec.frame_interval;
        while !stop.load(Ordering::Acquire) {
            std::thread::sleep(interval);
            if stop.load(Ordering::Acquire) {
                break;
            }
            let Some(mut buffer) = self.inner.free.pop() else {
                self.inner.starved.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if let Some(held) = self.inner.held.lock().get_mut(buffer.index()) {
                *held = false;
            }
            self.fill(&mut buffer, false);
            self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            handler.on_frame_complete(buffer);
        }
        trace!(device = %self.inner.spec.info.id, "Mock acquisition thread exiting");
    }

    fn drain_queue(&self) -> Vec<FrameBuffer> {
        let mut buffers = Vec::with_capacity(self.inner.free.len());
        while let Some(buffer) = self.inner.free.pop() {
            buffers.push(buffer);
        }
        self.inner.held.lock().iter_mut().for_each(|h| *h = false);
        buffers
    }

    fn ensure_layout_unlocked(&self, name: &FeatureName) -> AppResult<()> {
        if name.affects_layout() && self.is_capturing() {
            return Err(DaqError::Hardware(format!("{name} is locked while acquiring")));
        }
        Ok(())
    }
}

fn quantize(value: f64, min: f64, max: f64, increment: Option<f64>) -> f64 {
    let clamped = value.clamp(min, max);
    match increment {
        Some(inc) if inc > 0.0 => min + ((clamped - min) / inc).round() * inc,
        _ => clamped,
    }
}

impl CameraDevice for MockCamera {
    fn info(&self) -> &DeviceInfo {
        &self.inner.spec.info
    }

    fn pixel_formats(&self) -> AppResult<Vec<PixelFormatDescriptor>> {
        Ok(self
            .inner
            .spec
            .formats
            .iter()
            .copied()
            .map(PixelFormatDescriptor::new)
            .collect())
    }

    fn pixel_format(&self) -> AppResult<PixelFormat> {
        Ok(self.geometry().0)
    }

    fn set_pixel_format(&self, format: PixelFormat) -> AppResult<()> {
        self.write_feature(&FeatureName::PixelFormat, &FeatureValue::from(format.as_str()))
    }

    fn resolution(&self) -> AppResult<(u32, u32)> {
        let (_, width, height) = self.geometry();
        Ok((width, height))
    }

    fn payload_size(&self) -> AppResult<usize> {
        let (format, width, height) = self.geometry();
        Ok(width as usize * height as usize * format.bytes_per_pixel())
    }

    fn feature_descriptors(&self) -> AppResult<Vec<FeatureDescriptor>> {
        Ok(self.descriptors())
    }

    fn read_feature(&self, name: &FeatureName) -> AppResult<FeatureValue> {
        self.inner
            .values
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| DaqError::UnknownFeature(name.to_string()))
    }

    fn write_feature(&self, name: &FeatureName, value: &FeatureValue) -> AppResult<()> {
        let descriptor = self
            .descriptors()
            .into_iter()
            .find(|d| &d.name == name)
            .ok_or_else(|| DaqError::UnknownFeature(name.to_string()))?;
        if !descriptor.access.is_writable() {
            return Err(DaqError::Hardware(format!("{name} is read-only")));
        }
        self.ensure_layout_unlocked(name)?;

        let mut values = self.inner.values.lock();
        let auto_active = |auto: &FeatureName| {
            values
                .get(auto)
                .and_then(FeatureValue::as_enum)
                .is_some_and(|v| v != "Off")
        };

        let stored = match (descriptor.kind, value) {
            (FeatureKind::Float, FeatureValue::Float(v)) => {
                let driven_by_auto = match name {
                    FeatureName::ExposureTime => auto_active(&FeatureName::ExposureAuto),
                    FeatureName::Gain => auto_active(&FeatureName::GainAuto),
                    _ => false,
                };
                if driven_by_auto {
                    debug!(feature = %name, "Mock camera ignoring write while auto mode is active");
                    return Ok(());
                }
                FeatureValue::Float(quantize(
                    *v,
                    descriptor.min.unwrap_or(f64::MIN),
                    descriptor.max.unwrap_or(f64::MAX),
                    descriptor.increment,
                ))
            }
            (FeatureKind::Int, FeatureValue::Int(v)) => {
                let min = descriptor.min.unwrap_or(i64::MIN as f64);
                let inc = descriptor.increment.unwrap_or(1.0).max(1.0);
                let max = descriptor.max.unwrap_or(i64::MAX as f64);
                let clamped = (*v as f64).clamp(min, max);
                FeatureValue::Int((min + ((clamped - min) / inc).floor() * inc) as i64)
            }
            (FeatureKind::Enum, FeatureValue::Enum(entry)) => {
                if !descriptor.entries.iter().any(|e| e == entry) {
                    return Err(DaqError::Hardware(format!(
                        "{name}: '{entry}' is not a valid entry"
                    )));
                }
                value.clone()
            }
            (FeatureKind::Bool, FeatureValue::Bool(_)) => value.clone(),
            (kind, other) => {
                return Err(DaqError::FeatureTypeMismatch {
                    name: name.to_string(),
                    expected: kind.name(),
                    actual: other.kind().name(),
                })
            }
        };
        values.insert(name.clone(), stored);
        Ok(())
    }

    fn start_capture(&self, buffers: Vec<FrameBuffer>, handler: Arc<dyn FrameHandler>) -> AppResult<()> {
        let mut capture = self.inner.capture.lock();
        if capture.is_some() {
            return Err(DaqError::Hardware("acquisition already running".to_string()));
        }
        {
            let mut held = self.inner.held.lock();
            held.clear();
            held.resize(buffers.len(), true);
        }
        for buffer in buffers {
            self.inner.free.push(buffer);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let camera = self.clone();
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("mock-acq-{}", self.inner.spec.info.id))
            .spawn(move || camera.run_capture(handler, thread_stop))?;
        let thread_id = handle.thread().id();
        self.inner.capturing.store(true, Ordering::Release);
        *capture = Some(CaptureThread {
            stop,
            handle,
            thread_id,
        });
        debug!(device = %self.inner.spec.info.id, "Mock acquisition started");
        Ok(())
    }

    fn queue_buffer(&self, buffer: FrameBuffer) -> Result<(), RequeueError> {
        let index = buffer.index();
        if !self.inner.faults.permit_requeue() {
            self.inner.requeue_refused.fetch_add(1, Ordering::Relaxed);
            return Err(RequeueError {
                buffer_index: index,
                reason: "driver rejected buffer (injected fault)".to_string(),
            });
        }
        {
            let mut held = self.inner.held.lock();
            if held.len() <= index {
                held.resize(index + 1, false);
            }
            if held[index] {
                self.inner.double_requeues.fetch_add(1, Ordering::Relaxed);
            }
            held[index] = true;
        }
        self.inner.free.push(buffer);
        self.inner.requeued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stop_capture(&self) -> AppResult<Vec<FrameBuffer>> {
        let mut slot = self.inner.capture.lock();
        let Some(capture) = slot.take() else {
            return Ok(self.drain_queue());
        };
        if std::thread::current().id() == capture.thread_id {
            *slot = Some(capture);
            return Err(DaqError::Hardware(
                "stop_capture called on the acquisition thread".to_string(),
            ));
        }
        drop(slot);

        capture.stop.store(true, Ordering::Release);
        capture
            .handle
            .join()
            .map_err(|_| DaqError::Hardware("mock acquisition thread panicked".to_string()))?;
        self.inner.capturing.store(false, Ordering::Release);
        debug!(device = %self.inner.spec.info.id, "Mock acquisition stopped");
        Ok(self.drain_queue())
    }

    fn acquire_single(&self, mut buffer: FrameBuffer, timeout: Duration) -> AppResult<FrameBuffer> {
        if self.is_capturing() {
            return Err(DaqError::Hardware("acquisition in progress".to_string()));
        }
        if self.inner.faults.single_timeout.load(Ordering::Relaxed) {
            std::thread::sleep(timeout);
            return Err(DaqError::Timeout {
                operation: "acquire_single".to_string(),
                timeout,
            });
        }
        std::thread::sleep(self.inner.spec.frame_interval.min(timeout));
        let incomplete = self.inner.faults.single_incomplete.load(Ordering::Relaxed);
        self.fill(&mut buffer, incomplete);
        Ok(buffer)
    }
}

/// A set of mock cameras presented as one vendor system.
#[derive(Clone)]
pub struct MockCameraSystem {
    cameras: Vec<MockCamera>,
    opened: Arc<AtomicUsize>,
}

impl MockCameraSystem {
    /// System with one camera per spec.
    pub fn new(specs: Vec<MockCameraSpec>) -> Self {
        Self {
            cameras: specs.into_iter().map(MockCamera::new).collect(),
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// System with a single default camera `"DEV_MOCK0"`.
    pub fn single() -> Self {
        Self::new(vec![MockCameraSpec::new("DEV_MOCK0")])
    }

    /// Handle to the camera with `id`.
    pub fn camera(&self, id: &str) -> Option<MockCamera> {
        self.cameras.iter().find(|c| c.inner.spec.info.id == id).cloned()
    }

    /// Number of successful `open_camera` calls.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

impl CameraSystem for MockCameraSystem {
    fn cameras(&self) -> AppResult<Vec<DeviceInfo>> {
        Ok(self.cameras.iter().map(|c| c.inner.spec.info.clone()).collect())
    }

    fn open_camera(&self, info: &DeviceInfo, access_mode: AccessMode) -> AppResult<Arc<dyn CameraDevice>> {
        let camera = self
            .camera(&info.id)
            .ok_or_else(|| DaqError::DeviceNotFound(info.id.clone()))?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(device = %info.id, access = %access_mode, "Mock camera opened");
        Ok(Arc::new(camera))
    }
}

// =============================================================================
// MockAxis - Simulated Linear Stage
// =============================================================================

/// A call received by [`MockAxis`].
#[derive(Debug, Clone, PartialEq)]
pub enum AxisCall {
    /// `set_speed`
    SetSpeed {
        /// Speed
        speed: f64,
        /// Unit
        unit: Unit,
    },
    /// `move_absolute`
    MoveAbsolute {
        /// Target
        position: f64,
        /// Unit
        unit: Unit,
    },
    /// `move_relative`
    MoveRelative {
        /// Distance
        distance: f64,
        /// Unit
        unit: Unit,
    },
    /// `home`
    Home,
    /// `scan`
    Scan {
        /// Direction
        direction: Direction,
        /// Duration
        duration: Duration,
    },
    /// `stop_motion`
    Stop,
}

impl AxisCall {
    fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

/// Mock linear stage with realistic timing.
///
/// # Example
///
/// ```rust,ignore
/// let axis = MockAxis::new("AXIS0").with_time_scale(0.01);
/// axis.set_speed(5.0, Unit::Millimeter).await?;
/// axis.move_absolute(10.0, Unit::Millimeter).await?; // ~20 ms
/// assert_eq!(axis.position(Unit::Millimeter).await?, 10.0);
/// ```
pub struct MockAxis {
    info: DeviceInfo,
    encoder_resolution_nm: f64,
    position_nm: RwLock<f64>,
    speed_nm_per_sec: RwLock<f64>,
    time_scale: f64,
    calls: Mutex<Vec<AxisCall>>,
    command_count: AtomicUsize,
    fail_on: Mutex<Option<usize>>,
    hang_on: Mutex<Option<usize>>,
    abort: Notify,
}

impl MockAxis {
    /// Stage at 0 mm, 10 mm/s, 1250 nm encoder.
    pub fn new(id: &str) -> Self {
        Self {
            info: DeviceInfo::new(id, "Mock XLS-1", format!("MOCK-{id}"), DeviceKind::Actuator),
            encoder_resolution_nm: 1250.0,
            position_nm: RwLock::new(0.0),
            speed_nm_per_sec: RwLock::new(10.0 * 1_000_000.0),
            time_scale: 1.0,
            calls: Mutex::new(Vec::new()),
            command_count: AtomicUsize::new(0),
            fail_on: Mutex::new(None),
            hang_on: Mutex::new(None),
            abort: Notify::new(),
        }
    }

    /// Use an encoder with `nm` nanometres per count for [`Unit::Encoder`].
    #[must_use]
    pub fn with_encoder_resolution(mut self, nm: f64) -> Self {
        self.encoder_resolution_nm = nm;
        self
    }

    /// Multiply all motion durations by `scale` (e.g. 0.01 for fast tests).
    #[must_use]
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(0.0);
        self
    }

    /// Fail the `n`th command (1-based, `stop_motion` and `position` not counted).
    pub fn fail_on_command(&self, n: usize) {
        *self.fail_on.lock() = Some(n);
    }

    /// Never complete the `n`th command (1-based).
    pub fn hang_on_command(&self, n: usize) {
        *self.hang_on.lock() = Some(n);
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<AxisCall> {
        self.calls.lock().clone()
    }

    /// Number of `stop_motion` calls.
    pub fn stop_count(&self) -> usize {
        self.calls.lock().iter().filter(|c| c.is_stop()).count()
    }

    /// Record a command and apply injected faults.
    async fn command(&self, call: AxisCall) -> AppResult<()> {
        let n = self.command_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(axis = %self.info.id, ?call, n, "MockAxis command");
        self.calls.lock().push(call);
        let fail = *self.fail_on.lock() == Some(n);
        let hang = *self.hang_on.lock() == Some(n);
        if fail {
            return Err(DaqError::Hardware(format!("injected failure on command {n}")));
        }
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn scaled(&self, secs: f64) -> Duration {
        Duration::try_from_secs_f64(secs * self.time_scale).unwrap_or(Duration::ZERO)
    }

    /// Move towards `target_nm`, ending early on `stop_motion`.
    async fn travel(&self, target_nm: f64) -> AppResult<()> {
        let start_nm = *self.position_nm.read().await;
        let speed = *self.speed_nm_per_sec.read().await;
        let duration = self.scaled((target_nm - start_nm).abs() / speed);
        let begun = Instant::now();

        let aborted = tokio::select! {
            () = sleep(duration) => false,
            () = self.abort.notified() => true,
        };

        let fraction = if aborted && !duration.is_zero() {
            (begun.elapsed().as_secs_f64() / duration.as_secs_f64()).min(1.0)
        } else {
            1.0
        };
        *self.position_nm.write().await = start_nm + (target_nm - start_nm) * fraction;
        if aborted {
            return Err(DaqError::Hardware("motion aborted by stop".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MotionAxis for MockAxis {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    async fn set_speed(&self, speed: f64, unit: Unit) -> AppResult<()> {
        self.command(AxisCall::SetSpeed { speed, unit }).await?;
        if !(speed.is_finite() && speed > 0.0) {
            return Err(DaqError::Hardware(format!("invalid speed {speed}")));
        }
        *self.speed_nm_per_sec.write().await =
            unit.to_nanometers(speed, self.encoder_resolution_nm);
        Ok(())
    }

    async fn move_absolute(&self, position: f64, unit: Unit) -> AppResult<()> {
        self.command(AxisCall::MoveAbsolute { position, unit }).await?;
        let target = unit.to_nanometers(position, self.encoder_resolution_nm);
        self.travel(target).await
    }

    async fn move_relative(&self, distance: f64, unit: Unit) -> AppResult<()> {
        self.command(AxisCall::MoveRelative { distance, unit }).await?;
        let current = *self.position_nm.read().await;
        let target = current + unit.to_nanometers(distance, self.encoder_resolution_nm);
        self.travel(target).await
    }

    async fn home(&self) -> AppResult<()> {
        self.command(AxisCall::Home).await?;
        self.travel(0.0).await?;
        *self.position_nm.write().await = 0.0;
        Ok(())
    }

    async fn scan(&self, direction: Direction, duration: Duration) -> AppResult<()> {
        self.command(AxisCall::Scan { direction, duration }).await?;
        let speed = *self.speed_nm_per_sec.read().await;
        let current = *self.position_nm.read().await;
        let target = current + f64::from(direction.sign()) * speed * duration.as_secs_f64();
        // Travel time equals the scan duration at the current speed.
        self.travel(target).await
    }

    async fn stop_motion(&self) -> AppResult<()> {
        self.calls.lock().push(AxisCall::Stop);
        self.abort.notify_waiters();
        debug!(axis = %self.info.id, "MockAxis stop");
        Ok(())
    }

    async fn position(&self, unit: Unit) -> AppResult<f64> {
        let nm = *self.position_nm.read().await;
        Ok(unit.from_nanometers(nm, self.encoder_resolution_nm))
    }
}
