//! Frame acquisition engine.
//!
//! [`FrameAcquisition`] owns one camera from discovery to release:
//!
//! ```text
//!   Uninitialized ──initialize──▶ Initialized ──start_streaming──▶ Streaming
//!         │                          ▲   │                            │
//!         │                          │   └──capture_single            │
//!         │                          └────────stop_streaming──────────┘
//!         └──────────────release (from any state)──────────▶ Released
//! ```
//!
//! # Threading
//!
//! While streaming, the driver calls back on its own thread. That path never
//! takes the engine's control lock: it copies the buffer into an owned
//! [`Frame`], publishes it to the [`LatestFrameSlot`], broadcast subscribers
//! and the optional frame callback, and hands the buffer back to the driver
//! through a [`RequeueGuard`].
//!
//! Stopping from inside the callback would deadlock against the driver's
//! stream lock, so such requests are queued to a `stream-control` thread and
//! carried out once the callback has returned. Requeue failures take the same
//! path: the stream is stopped rather than left to run dry.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::buffer_pool::{BufferLedger, BufferState, RequeueError, RequeueGuard};
use super::features::{FeatureControl, FeatureDescriptor, FeatureName, FeatureValue, FeatureWrite, LoadReport};
use super::format::{select_pixel_format, FormatSelection, PixelFormat, PixelFormatDescriptor};
use super::frame::{FillStatus, Frame, FrameBuffer, FrameGeometry};
use super::slot::LatestFrameSlot;
use crate::config::CameraConfig;
use crate::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::error::{AppResult, DaqError};
use crate::hardware::{CameraDevice, CameraSystem, FrameHandler};
use crate::limits::validate_buffer_count;
use crate::session::{DeviceInfo, DeviceRegistry, DeviceSession};

/// Frames retained per broadcast subscriber before it starts lagging.
const FRAME_CHANNEL_CAPACITY: usize = 16;

thread_local! {
    static IN_FRAME_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

fn in_frame_callback() -> bool {
    IN_FRAME_CALLBACK.with(Cell::get)
}

/// Marks the current thread as running a frame callback until dropped.
struct CallbackScope {
    previous: bool,
}

impl CallbackScope {
    fn enter() -> Self {
        Self {
            previous: IN_FRAME_CALLBACK.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        let previous = self.previous;
        IN_FRAME_CALLBACK.with(|flag| flag.set(previous));
    }
}

/// Lifecycle state of a [`FrameAcquisition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcquisitionState {
    /// Created; no device open
    Uninitialized = 0,
    /// Device open and configured
    Initialized = 1,
    /// Continuous acquisition running
    Streaming = 2,
    /// Device released; terminal
    Released = 3,
}

impl AcquisitionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Initialized,
            2 => Self::Streaming,
            _ => Self::Released,
        }
    }
}

/// What [`FrameAcquisition::initialize`] settled on.
#[derive(Debug, Clone, PartialEq)]
pub struct InitSummary {
    /// Camera in use
    pub device: DeviceInfo,
    /// Requested and selected pixel format
    pub format: FormatSelection,
    /// Frame layout in effect
    pub geometry: FrameGeometry,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Acquisition halted and buffers reclaimed
    Stopped,
    /// Requested from the frame callback; carried out after it returns
    Deferred,
    /// Nothing was streaming
    AlreadyStopped,
}

/// Counters for the current (or last) stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Frames published
    pub frames_completed: u64,
    /// Incomplete or failed buffers discarded
    pub frames_dropped: u64,
    /// Complete buffers with the wrong payload size
    pub frames_rejected: u64,
    /// Buffers handed back to the driver
    pub requeued: u64,
    /// Buffers the driver refused to take back
    pub requeue_failures: u64,
    /// Buffers queued to the driver
    pub buffers_free: usize,
    /// Buffers being consumed by the callback
    pub buffers_in_flight: usize,
}

/// Callback invoked on the driver thread for every published frame.
///
/// Must return quickly. Apart from [`AcquisitionHandle`] and
/// [`FrameAcquisition::get_current_frame`], engine operations fail with
/// [`DaqError::InvalidState`] when called from here.
pub type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

#[derive(Debug)]
enum DeferredCommand {
    StopStreaming { generation: u64, reason: String },
}

struct ActiveStream {
    ledger: Arc<BufferLedger>,
    generation: u64,
}

#[derive(Default)]
struct Control {
    session: Option<DeviceSession>,
    device: Option<Arc<dyn CameraDevice>>,
    geometry: Option<FrameGeometry>,
    stream: Option<ActiveStream>,
}

impl Control {
    fn opened(&self) -> AppResult<(&DeviceSession, &Arc<dyn CameraDevice>)> {
        match (&self.session, &self.device) {
            (Some(session), Some(device)) => Ok((session, device)),
            _ => Err(DaqError::InvalidState("camera is not initialized".to_string())),
        }
    }

    fn geometry(&self) -> AppResult<FrameGeometry> {
        self.geometry
            .ok_or_else(|| DaqError::InvalidState("camera is not initialized".to_string()))
    }
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    requeue_failures: AtomicU64,
    frame_seq: AtomicU64,
}

impl Counters {
    fn reset_stream(&self) {
        self.completed.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.requeue_failures.store(0, Ordering::Relaxed);
    }
}

struct Shared {
    system: Arc<dyn CameraSystem>,
    registry: Arc<DeviceRegistry>,
    config: CameraConfig,
    diagnostics: Arc<dyn DiagnosticsSink>,
    control: Mutex<Control>,
    state: AtomicU8,
    slot: LatestFrameSlot,
    counters: Counters,
    in_flight: Mutex<usize>,
    idle: Condvar,
    streaming: AtomicBool,
    generation: AtomicU64,
    stop_requested_for: AtomicU64,
    frames_tx: broadcast::Sender<Frame>,
    callback: RwLock<Option<FrameCallback>>,
    last_ledger: RwLock<Option<Arc<BufferLedger>>>,
    deferred_tx: mpsc::UnboundedSender<DeferredCommand>,
}

/// Counts a callback as in flight until dropped.
struct InFlight<'a> {
    shared: &'a Shared,
}

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        *shared.in_flight.lock() += 1;
        Self { shared }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut count = self.shared.in_flight.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.shared.idle.notify_all();
        }
    }
}

/// Per-stream context registered with the driver.
struct StreamContext {
    shared: Weak<Shared>,
    device: Arc<dyn CameraDevice>,
    ledger: Arc<BufferLedger>,
    geometry: FrameGeometry,
    generation: u64,
}

impl FrameHandler for StreamContext {
    fn on_frame_complete(&self, buffer: FrameBuffer) {
        let _scope = CallbackScope::enter();
        let Some(shared) = self.shared.upgrade() else {
            // Engine gone; the driver still gets its buffer back.
            if let Err(e) = self.device.queue_buffer(buffer) {
                warn!(
                    device = %self.device.info().id,
                    error = %e,
                    "Buffer requeue failed after engine shutdown"
                );
            }
            return;
        };

        let _in_flight = InFlight::enter(&shared);
        let on_failure = |err: &RequeueError| shared.requeue_failed(self, err);
        // Declared after `_in_flight`: the buffer is requeued before the
        // callback stops counting as in flight.
        let guard = RequeueGuard::new(buffer, self.device.as_ref(), &self.ledger, &on_failure);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| shared.consume(self, &guard)));
        if outcome.is_err() {
            error!(
                device = %self.device.info().id,
                buffer = guard.index(),
                "Frame consumer panicked; buffer returned to driver"
            );
        }
    }
}

impl Shared {
    fn device_id(&self, ctx: &StreamContext) -> String {
        ctx.device.info().id.clone()
    }

    fn state(&self) -> AcquisitionState {
        AcquisitionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: AcquisitionState) {
        let previous = AcquisitionState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            debug!(from = ?previous, to = ?state, "Acquisition state changed");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.streaming.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    fn lock_control(&self) -> AppResult<parking_lot::MutexGuard<'_, Control>> {
        if in_frame_callback() {
            return Err(DaqError::InvalidState(
                "operation not allowed from the frame callback".to_string(),
            ));
        }
        Ok(self.control.lock())
    }

    fn consume(&self, ctx: &StreamContext, buffer: &FrameBuffer) {
        if !self.is_current(ctx.generation) {
            return;
        }
        if buffer.status() != FillStatus::Complete {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            self.diagnostics.report(Diagnostic::FrameDropped {
                device_id: self.device_id(ctx),
                driver_frame_id: buffer.driver_frame_id(),
            });
            return;
        }
        if buffer.len() != ctx.geometry.frame_bytes {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            self.diagnostics.report(Diagnostic::FrameRejected {
                device_id: self.device_id(ctx),
                expected_bytes: ctx.geometry.frame_bytes,
                actual_bytes: buffer.len(),
            });
            return;
        }

        let frame_id = self.counters.frame_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = match Frame::snapshot(buffer, &ctx.geometry, frame_id) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Frame snapshot failed");
                return;
            }
        };
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.slot.publish(frame.clone());
        // Lagging or absent subscribers are not our problem.
        let _ = self.frames_tx.send(frame.clone());

        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(&frame);
        }
    }

    fn requeue_failed(&self, ctx: &StreamContext, err: &RequeueError) {
        self.counters.requeue_failures.fetch_add(1, Ordering::Relaxed);
        if !self.is_current(ctx.generation) {
            // The stream is already stopping; its buffers are reclaimed there.
            debug!(
                device = %self.device_id(ctx),
                generation = ctx.generation,
                error = %err,
                "Requeue failed while stream was stopping"
            );
            return;
        }
        self.diagnostics.report(Diagnostic::StreamFault {
            device_id: self.device_id(ctx),
            reason: err.to_string(),
        });
        self.defer_stop(
            self.device_id(ctx),
            ctx.generation,
            format!("buffer requeue failed: {err}"),
        );
    }

    /// Queue a stop for `generation`. Only the first request per stream is sent.
    fn defer_stop(&self, device_id: String, generation: u64, reason: String) -> StopOutcome {
        if self.stop_requested_for.swap(generation, Ordering::AcqRel) == generation {
            return StopOutcome::Deferred;
        }
        // Nothing further is published from this stream.
        self.streaming.store(false, Ordering::Release);
        self.diagnostics.report(Diagnostic::StopDeferred { device_id });
        if self
            .deferred_tx
            .send(DeferredCommand::StopStreaming { generation, reason })
            .is_err()
        {
            warn!("Stream control thread is gone; deferred stop dropped");
        }
        StopOutcome::Deferred
    }

    fn stop_streaming(&self) -> AppResult<StopOutcome> {
        if in_frame_callback() {
            if !self.streaming.load(Ordering::Acquire) {
                return Ok(StopOutcome::Deferred);
            }
            let generation = self.generation.load(Ordering::Acquire);
            // The driver thread must not wait on the control lock.
            let device_id = self
                .control
                .try_lock()
                .and_then(|c| c.session.as_ref().map(|s| s.device_id().to_string()))
                .unwrap_or_default();
            return Ok(self.defer_stop(device_id, generation, "requested from frame callback".to_string()));
        }
        let mut control = self.lock_control()?;
        match self.state() {
            AcquisitionState::Streaming => {
                self.stop_locked(&mut control);
                Ok(StopOutcome::Stopped)
            }
            AcquisitionState::Initialized | AcquisitionState::Released => Ok(StopOutcome::AlreadyStopped),
            AcquisitionState::Uninitialized => Err(DaqError::InvalidState(
                "cannot stop streaming before initialize".to_string(),
            )),
        }
    }

    fn stop_locked(&self, control: &mut Control) {
        self.streaming.store(false, Ordering::Release);
        if let Some(device) = &control.device {
            match device.stop_capture() {
                Ok(returned) => debug!(buffers = returned.len(), "Driver returned queued buffers"),
                Err(e) => {
                    self.diagnostics.report(Diagnostic::StreamFault {
                        device_id: device.info().id.clone(),
                        reason: format!("stop_capture failed: {e}"),
                    });
                }
            }
        }
        self.wait_idle();

        if let Some(stream) = control.stream.take() {
            info!(
                generation = stream.generation,
                completed = self.counters.completed.load(Ordering::Relaxed),
                dropped = self.counters.dropped.load(Ordering::Relaxed),
                rejected = self.counters.rejected.load(Ordering::Relaxed),
                requeued = stream.ledger.requeued(),
                requeue_failures = stream.ledger.requeue_failures(),
                "Streaming stopped"
            );
        }
        self.slot.clear();
        self.set_state(AcquisitionState::Initialized);
    }

    /// Wait for in-flight callbacks to return, up to the configured stop timeout.
    fn wait_idle(&self) {
        let deadline = Instant::now() + self.config.stop_timeout;
        let mut count = self.in_flight.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                warn!(
                    in_flight = *count,
                    timeout = ?self.config.stop_timeout,
                    "Frame callback still running after stop timeout"
                );
                break;
            }
        }
    }

    fn handle_deferred(&self, command: DeferredCommand) {
        match command {
            DeferredCommand::StopStreaming { generation, reason } => {
                let mut control = self.control.lock();
                let current = control.stream.as_ref().map(|s| s.generation);
                if self.state() == AcquisitionState::Streaming && current == Some(generation) {
                    info!(generation, %reason, "Carrying out deferred stop");
                    self.stop_locked(&mut control);
                } else {
                    debug!(generation, "Deferred stop is stale; ignoring");
                }
            }
        }
    }
}

/// Weak handle for use inside frame callbacks.
#[derive(Clone)]
pub struct AcquisitionHandle {
    shared: Weak<Shared>,
}

impl AcquisitionHandle {
    /// Stop streaming. Deferred when called from the frame callback.
    pub fn stop_streaming(&self) -> AppResult<StopOutcome> {
        match self.shared.upgrade() {
            Some(shared) => shared.stop_streaming(),
            None => Err(DaqError::InvalidState("acquisition engine dropped".to_string())),
        }
    }

    /// Latest published frame.
    pub fn get_current_frame(&self) -> Option<Frame> {
        self.shared.upgrade().and_then(|shared| shared.slot.latest())
    }
}

/// Camera acquisition engine.
///
/// # Example
///
/// ```rust,ignore
/// let engine = FrameAcquisition::new(system, registry, config.camera, diagnostics)?;
/// engine.initialize()?;
/// engine.start_streaming()?;
/// if let Some(frame) = engine.get_current_frame() {
///     println!("frame {} ({}x{})", frame.frame_id, frame.width, frame.height);
/// }
/// engine.stop_streaming()?;
/// engine.release()?;
/// ```
pub struct FrameAcquisition {
    shared: Arc<Shared>,
}

impl FrameAcquisition {
    /// Create an engine for the camera selected by `config.device_id`.
    ///
    /// Nothing is opened until [`initialize`](Self::initialize).
    pub fn new(
        system: Arc<dyn CameraSystem>,
        registry: Arc<DeviceRegistry>,
        config: CameraConfig,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> AppResult<Self> {
        let (deferred_tx, mut deferred_rx) = mpsc::unbounded_channel();
        let (frames_tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            system,
            registry,
            config,
            diagnostics,
            control: Mutex::new(Control::default()),
            state: AtomicU8::new(AcquisitionState::Uninitialized as u8),
            slot: LatestFrameSlot::new(),
            counters: Counters::default(),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
            streaming: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            stop_requested_for: AtomicU64::new(0),
            frames_tx,
            callback: RwLock::new(None),
            last_ledger: RwLock::new(None),
            deferred_tx,
        });

        let weak = Arc::downgrade(&shared);
        std::thread::Builder::new()
            .name("stream-control".to_string())
            .spawn(move || {
                while let Some(command) = deferred_rx.blocking_recv() {
                    let Some(shared) = weak.upgrade() else { break };
                    shared.handle_deferred(command);
                }
                debug!("Stream control thread exiting");
            })?;

        Ok(Self { shared })
    }

    /// Handle usable from the frame callback without keeping the engine alive.
    pub fn handle(&self) -> AcquisitionHandle {
        AcquisitionHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AcquisitionState {
        self.shared.state()
    }

    /// Open the camera, select a pixel format and apply the configured resolution.
    ///
    /// The configured format is used when advertised and display-compatible;
    /// otherwise the first display-compatible format is substituted and a
    /// [`Diagnostic::FormatSubstituted`] is reported. Fails with
    /// [`DaqError::NoCompatibleFormat`] when nothing is displayable.
    pub fn initialize(&self) -> AppResult<InitSummary> {
        let shared = &self.shared;
        let mut control = shared.lock_control()?;
        match shared.state() {
            AcquisitionState::Uninitialized => {}
            AcquisitionState::Released => {
                return Err(DaqError::InvalidState("engine has been released".to_string()))
            }
            _ => return Err(DaqError::InvalidState("camera is already initialized".to_string())),
        }

        let config = &shared.config;
        let devices = shared.system.cameras()?;
        let session = DeviceSession::open(
            &shared.registry,
            &devices,
            config.device_id.as_deref(),
            config.access_mode,
        )?;
        session.ensure_readable()?;
        let device = shared.system.open_camera(session.info(), session.access_mode())?;
        let device_id = session.device_id().to_string();

        let advertised = device.pixel_formats()?;
        let writable = session.access_mode().can_write();
        let format = if writable {
            let selection = select_pixel_format(&advertised, config.pixel_format)
                .ok_or_else(|| DaqError::NoCompatibleFormat(device_id.clone()))?;
            if device.pixel_format()? != selection.selected {
                device.set_pixel_format(selection.selected)?;
            }
            selection
        } else {
            // Read-only sessions adopt whatever the device is set to.
            let current = device.pixel_format()?;
            if !current.is_display_compatible() {
                return Err(DaqError::NoCompatibleFormat(device_id));
            }
            FormatSelection {
                requested: config.pixel_format,
                selected: current,
            }
        };
        if format.is_substitution() {
            shared.diagnostics.report(Diagnostic::FormatSubstituted {
                device_id: device_id.clone(),
                requested: format.requested,
                selected: format.selected,
            });
        }

        if let (Some([width, height]), true) = (config.resolution, writable) {
            let features = FeatureControl::new(&session, device.as_ref(), shared.diagnostics.as_ref());
            features.set_feature(&FeatureName::Width, FeatureValue::Int(i64::from(width)))?;
            features.set_feature(&FeatureName::Height, FeatureValue::Int(i64::from(height)))?;
            let actual = device.resolution()?;
            if actual != (width, height) {
                shared.diagnostics.report(Diagnostic::ResolutionNotApplied {
                    device_id: device_id.clone(),
                    requested: (width, height),
                    actual,
                });
            }
        }

        let (width, height) = device.resolution()?;
        let geometry = FrameGeometry::new(width, height, format.selected)?;
        let summary = InitSummary {
            device: session.info().clone(),
            format,
            geometry,
        };

        control.session = Some(session);
        control.device = Some(device);
        control.geometry = Some(geometry);
        shared.set_state(AcquisitionState::Initialized);
        info!(
            device = %summary.device,
            format = %geometry.pixel_format,
            width,
            height,
            frame_bytes = geometry.frame_bytes,
            "Camera initialized"
        );
        Ok(summary)
    }

    /// Allocate the buffer pool and begin continuous acquisition. Idempotent.
    pub fn start_streaming(&self) -> AppResult<()> {
        let shared = &self.shared;
        let mut control = shared.lock_control()?;
        match shared.state() {
            AcquisitionState::Streaming => return Ok(()),
            AcquisitionState::Initialized => {}
            state => {
                return Err(DaqError::InvalidState(format!(
                    "cannot start streaming in state {state:?}"
                )))
            }
        }
        let (session, device) = control.opened()?;
        session.ensure_writable()?;
        let device = Arc::clone(device);
        let geometry = control.geometry()?;

        let count = validate_buffer_count(shared.config.buffer_count)?;
        let capacity = device.payload_size()?.max(geometry.frame_bytes);
        let (ledger, buffers) = BufferLedger::allocate(count, capacity);
        let ledger = Arc::new(ledger);

        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        shared.counters.reset_stream();
        shared.streaming.store(true, Ordering::Release);

        let context = Arc::new(StreamContext {
            shared: Arc::downgrade(shared),
            device: Arc::clone(&device),
            ledger: Arc::clone(&ledger),
            geometry,
            generation,
        });
        if let Err(e) = device.start_capture(buffers, context) {
            shared.streaming.store(false, Ordering::Release);
            return Err(e);
        }

        *shared.last_ledger.write() = Some(Arc::clone(&ledger));
        control.stream = Some(ActiveStream { ledger, generation });
        shared.set_state(AcquisitionState::Streaming);
        info!(
            device = %device.info().id,
            generation,
            buffers = count,
            "Streaming started"
        );
        Ok(())
    }

    /// Halt acquisition and reclaim every buffer.
    ///
    /// Blocks until in-flight callbacks return (bounded by the configured
    /// stop timeout) and clears the latest-frame slot. From the frame callback
    /// the stop is deferred and [`StopOutcome::Deferred`] is returned.
    pub fn stop_streaming(&self) -> AppResult<StopOutcome> {
        self.shared.stop_streaming()
    }

    /// Most recent frame, or `None` if nothing has been published since the
    /// stream started.
    pub fn get_current_frame(&self) -> Option<Frame> {
        self.shared.slot.latest()
    }

    /// Receive every published frame.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.shared.frames_tx.subscribe()
    }

    /// Install `callback` for every published frame, replacing any previous one.
    pub fn set_frame_callback<F>(&self, callback: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        *self.shared.callback.write() = Some(Arc::new(callback));
    }

    /// Remove the frame callback.
    pub fn clear_frame_callback(&self) {
        *self.shared.callback.write() = None;
    }

    /// Acquire one frame outside of streaming.
    ///
    /// Fails with [`DaqError::StreamActive`] while streaming,
    /// [`DaqError::CaptureTimeout`] when the driver does not deliver within
    /// the configured capture timeout, and [`DaqError::CaptureIncomplete`]
    /// when it delivers a partial frame.
    pub fn capture_single(&self) -> AppResult<Frame> {
        let shared = &self.shared;
        let control = shared.lock_control()?;
        match shared.state() {
            AcquisitionState::Streaming => return Err(DaqError::StreamActive),
            AcquisitionState::Initialized => {}
            state => {
                return Err(DaqError::InvalidState(format!(
                    "cannot capture in state {state:?}"
                )))
            }
        }
        let (session, device) = control.opened()?;
        session.ensure_writable()?;
        let geometry = control.geometry()?;

        let timeout = shared.config.capture_timeout;
        let capacity = device.payload_size()?.max(geometry.frame_bytes);
        let buffer = match device.acquire_single(FrameBuffer::new(0, capacity), timeout) {
            Ok(buffer) => buffer,
            Err(DaqError::Timeout { .. }) => return Err(DaqError::CaptureTimeout(timeout)),
            Err(e) => return Err(e),
        };

        if buffer.status() != FillStatus::Complete {
            return Err(DaqError::CaptureIncomplete(format!(
                "driver reported {:?} after {} of {} bytes",
                buffer.status(),
                buffer.len(),
                geometry.frame_bytes
            )));
        }
        if buffer.len() != geometry.frame_bytes {
            return Err(DaqError::CaptureIncomplete(format!(
                "expected {} bytes, got {}",
                geometry.frame_bytes,
                buffer.len()
            )));
        }

        let frame_id = shared.counters.frame_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Frame::snapshot(&buffer, &geometry, frame_id)?;
        debug!(frame_id, bytes = frame.byte_len(), "Single frame captured");
        Ok(frame)
    }

    /// Stop streaming if needed and close the device. Idempotent.
    pub fn release(&self) -> AppResult<()> {
        let shared = &self.shared;
        let mut control = shared.lock_control()?;
        match shared.state() {
            AcquisitionState::Released => return Ok(()),
            AcquisitionState::Streaming => shared.stop_locked(&mut control),
            _ => {}
        }
        control.device = None;
        control.geometry = None;
        if let Some(mut session) = control.session.take() {
            session.close();
        }
        shared.set_state(AcquisitionState::Released);
        info!("Camera released");
        Ok(())
    }

    /// Counters for the current or most recent stream.
    pub fn stream_stats(&self) -> StreamStats {
        let counters = &self.shared.counters;
        let mut stats = StreamStats {
            frames_completed: counters.completed.load(Ordering::Relaxed),
            frames_dropped: counters.dropped.load(Ordering::Relaxed),
            frames_rejected: counters.rejected.load(Ordering::Relaxed),
            requeue_failures: counters.requeue_failures.load(Ordering::Relaxed),
            ..StreamStats::default()
        };
        if let Some(ledger) = self.shared.last_ledger.read().as_ref() {
            stats.requeued = ledger.requeued();
            stats.buffers_free = ledger.count(BufferState::Free);
            stats.buffers_in_flight = ledger.count(BufferState::InFlight);
        }
        stats
    }

    /// Frame layout in effect, once initialized.
    pub fn geometry(&self) -> AppResult<FrameGeometry> {
        self.shared.lock_control()?.geometry()
    }

    /// Active pixel format.
    pub fn pixel_format(&self) -> AppResult<PixelFormat> {
        Ok(self.geometry()?.pixel_format)
    }

    /// Formats the device advertises.
    pub fn available_pixel_formats(&self) -> AppResult<Vec<PixelFormatDescriptor>> {
        let control = self.shared.lock_control()?;
        let (session, device) = control.opened()?;
        session.ensure_readable()?;
        device.pixel_formats()
    }

    /// Switch the pixel format. Not allowed while streaming.
    ///
    /// Falls back to the first display-compatible format exactly like
    /// [`initialize`](Self::initialize) does.
    pub fn set_pixel_format(&self, format: PixelFormat) -> AppResult<FormatSelection> {
        let shared = &self.shared;
        let mut control = shared.lock_control()?;
        self.ensure_not_streaming("change the pixel format")?;
        let (session, device) = control.opened()?;
        session.ensure_writable()?;
        let selection = select_pixel_format(&device.pixel_formats()?, format)
            .ok_or_else(|| DaqError::NoCompatibleFormat(session.device_id().to_string()))?;
        if selection.is_substitution() {
            shared.diagnostics.report(Diagnostic::FormatSubstituted {
                device_id: session.device_id().to_string(),
                requested: selection.requested,
                selected: selection.selected,
            });
        }
        device.set_pixel_format(selection.selected)?;
        Self::resync_geometry(&mut control)?;
        Ok(selection)
    }

    /// Every feature the camera publishes.
    pub fn list_features(&self) -> AppResult<Vec<FeatureDescriptor>> {
        let control = self.shared.lock_control()?;
        let (session, device) = control.opened()?;
        self.features(session, device).list_features()
    }

    /// Read one feature.
    pub fn get_feature(&self, name: &FeatureName) -> AppResult<FeatureValue> {
        let control = self.shared.lock_control()?;
        let (session, device) = control.opened()?;
        self.features(session, device).get_feature(name)
    }

    /// Write one feature with read-back verification.
    ///
    /// Layout features (`Width`, `Height`, `PixelFormat`) are rejected while
    /// streaming and refresh the frame geometry otherwise.
    pub fn set_feature(&self, name: &FeatureName, value: FeatureValue) -> AppResult<FeatureWrite> {
        let mut control = self.shared.lock_control()?;
        if name.affects_layout() {
            self.ensure_not_streaming(&format!("change {name}"))?;
        }
        let (session, device) = control.opened()?;
        let write = self.features(session, device).set_feature(name, value)?;
        if name.affects_layout() {
            Self::resync_geometry(&mut control)?;
        }
        Ok(write)
    }

    /// Enable or disable an auto mode (`ExposureAuto`, `GainAuto`, ...).
    pub fn set_auto(&self, name: &FeatureName, enabled: bool) -> AppResult<FeatureWrite> {
        let control = self.shared.lock_control()?;
        let (session, device) = control.opened()?;
        self.features(session, device).set_auto(name, enabled)
    }

    /// Save the readable and writable features to `path`.
    pub fn save_settings(&self, path: &Path) -> AppResult<usize> {
        let control = self.shared.lock_control()?;
        let (session, device) = control.opened()?;
        self.features(session, device).save_settings(path)
    }

    /// Restore features from `path`. Not allowed while streaming.
    pub fn load_settings(&self, path: &Path) -> AppResult<LoadReport> {
        let mut control = self.shared.lock_control()?;
        self.ensure_not_streaming("load settings")?;
        let (session, device) = control.opened()?;
        let report = self.features(session, device).load_settings(path)?;
        Self::resync_geometry(&mut control)?;
        Ok(report)
    }

    fn features<'a>(
        &'a self,
        session: &'a DeviceSession,
        device: &'a Arc<dyn CameraDevice>,
    ) -> FeatureControl<'a> {
        FeatureControl::new(session, device.as_ref(), self.shared.diagnostics.as_ref())
    }

    fn ensure_not_streaming(&self, what: &str) -> AppResult<()> {
        if self.shared.state() == AcquisitionState::Streaming {
            return Err(DaqError::InvalidState(format!("cannot {what} while streaming")));
        }
        Ok(())
    }

    fn resync_geometry(control: &mut Control) -> AppResult<FrameGeometry> {
        let (_, device) = control.opened()?;
        let format = device.pixel_format()?;
        let (width, height) = device.resolution()?;
        let geometry = FrameGeometry::new(width, height, format)?;
        if control.geometry != Some(geometry) {
            info!(
                format = %format,
                width,
                height,
                frame_bytes = geometry.frame_bytes,
                "Frame geometry updated"
            );
        }
        control.geometry = Some(geometry);
        Ok(geometry)
    }
}

impl Drop for FrameAcquisition {
    fn drop(&mut self) {
        if in_frame_callback() {
            return;
        }
        if let Err(e) = self.release() {
            warn!(error = %e, "Release on drop failed");
        }
    }
}
