//! Motion sequence execution engine.
//!
//! [`SequenceEngine`] holds an editable [`MotionProgram`] and, while a run is
//! active, an [`ExecutionCursor`]. An external scheduler calls
//! [`SequenceEngine::advance_tick`] at a fixed cadence; each tick executes
//! exactly one step and advances the cursor.
//!
//! ```text
//!   Idle ──run──▶ Running ──last step of last pass──▶ Idle      (ProgramComplete)
//!                    │ └────step failed / timed out──▶ Faulted  (StepFailed)
//!                    └──────stop / disconnect────────▶ Idle      (Stopped)
//! ```
//!
//! `stop()` never waits for the tick in progress. It destroys the cursor and
//! bumps an abort epoch, which the running tick races its hardware future
//! against, then sends a hardware stop to the axis.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::document;
use super::program::MotionProgram;
use super::step::{MotionStep, Unit};
use crate::config::ActuatorConfig;
use crate::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::error::{AppResult, DaqError};
use crate::hardware::MotionAxis;
use crate::session::{DeviceRegistry, DeviceSession};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No run active
    Idle,
    /// A run is active
    Running,
    /// The last run ended with a failed step
    Faulted,
}

/// Progress of an active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionCursor {
    /// Identifies the run
    pub run_id: Uuid,
    /// Next step to execute
    pub step_index: usize,
    /// Current pass, from 0
    pub loop_index: u32,
    /// Passes the run will make
    pub loop_total: u32,
    /// Cleared once the run is stopped
    pub running: bool,
}

/// Progress notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotionEvent {
    /// Step `index` is about to execute in pass `loop_index`.
    StepStarted {
        /// Step index
        index: usize,
        /// Pass
        loop_index: u32,
    },
    /// Step `index` failed; the run is over.
    StepFailed {
        /// Step index
        index: usize,
        /// Failure description
        cause: String,
    },
    /// Every pass finished.
    ProgramComplete,
    /// The run was stopped.
    Stopped,
}

/// Result of one [`SequenceEngine::advance_tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No run active; nothing done
    Idle,
    /// Step executed; the run continues
    Executed {
        /// Step index
        index: usize,
        /// Pass
        loop_index: u32,
    },
    /// Final step executed; the run is over
    Completed,
    /// The run was stopped while the step executed
    Stopped,
    /// The step failed; the run is over
    Failed {
        /// Step index
        index: usize,
        /// Failure description
        cause: String,
    },
}

impl TickOutcome {
    /// Whether the run has ended (or there was none).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Executed { .. })
    }
}

struct Run {
    program: MotionProgram,
    cursor: ExecutionCursor,
}

struct Inner {
    state: EngineState,
    program: MotionProgram,
    run: Option<Run>,
}

/// Clears the re-entrancy flag when the tick ends or is cancelled.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives motion programs on one axis.
pub struct SequenceEngine {
    axis: Arc<dyn MotionAxis>,
    session: Mutex<DeviceSession>,
    inner: Mutex<Inner>,
    abort_tx: watch::Sender<u64>,
    events: broadcast::Sender<MotionEvent>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    ticking: AtomicBool,
    command_timeout: Duration,
    home_timeout: Duration,
}

impl SequenceEngine {
    /// Lease `axis` and build an idle engine with an empty program.
    pub fn connect(
        registry: &Arc<DeviceRegistry>,
        axis: Arc<dyn MotionAxis>,
        config: &ActuatorConfig,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> AppResult<Arc<Self>> {
        let info = axis.info();
        let session = DeviceSession::open(registry, std::slice::from_ref(&info), None, config.access_mode)?;
        session.ensure_writable()?;
        let (abort_tx, _) = watch::channel(0u64);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(axis = %info, "Motion engine connected");
        Ok(Arc::new(Self {
            axis,
            session: Mutex::new(session),
            inner: Mutex::new(Inner {
                state: EngineState::Idle,
                program: MotionProgram::new(),
                run: None,
            }),
            abort_tx,
            events,
            diagnostics,
            ticking: AtomicBool::new(false),
            command_timeout: config.command_timeout,
            home_timeout: config.home_timeout,
        }))
    }

    /// Receive progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<MotionEvent> {
        self.events.subscribe()
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    /// Cursor of the active run.
    pub fn cursor(&self) -> Option<ExecutionCursor> {
        self.inner.lock().run.as_ref().map(|run| run.cursor)
    }

    /// Copy of the editable program.
    pub fn program(&self) -> MotionProgram {
        self.inner.lock().program.clone()
    }

    fn emit(&self, event: MotionEvent) {
        debug!(?event, "Motion event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn edit<T>(&self, f: impl FnOnce(&mut MotionProgram) -> AppResult<T>) -> AppResult<T> {
        self.session.lock().ensure_open()?;
        let mut inner = self.inner.lock();
        if inner.run.is_some() {
            return Err(DaqError::ProgramBusy);
        }
        f(&mut inner.program)
    }

    // =========================================================================
    // Program editing
    // =========================================================================

    /// Append a step to the editable program.
    pub fn append_step(&self, step: MotionStep) -> AppResult<()> {
        self.edit(|program| program.append(step))
    }

    /// Remove the step at `index`.
    pub fn remove_step(&self, index: usize) -> AppResult<MotionStep> {
        self.edit(|program| program.remove(index))
    }

    /// Move the step at `from` to `to`.
    pub fn reorder(&self, from: usize, to: usize) -> AppResult<()> {
        self.edit(|program| program.reorder(from, to))
    }

    /// Remove every step.
    pub fn clear(&self) -> AppResult<()> {
        self.edit(|program| {
            program.clear();
            Ok(())
        })
    }

    /// Set loop settings of the editable program.
    pub fn set_looping(&self, enabled: bool, count: u32) -> AppResult<()> {
        self.edit(|program| program.set_looping(enabled, count))
    }

    /// Replace the editable program.
    pub fn replace_program(&self, replacement: MotionProgram) -> AppResult<()> {
        replacement.validate()?;
        self.edit(|program| {
            *program = replacement;
            Ok(())
        })
    }

    /// Save the editable program. See [`document::save_program`].
    pub fn save_program(&self, path: &Path) -> AppResult<PathBuf> {
        document::save_program(&self.program(), path)
    }

    /// Load a program document into the editable program.
    pub fn load_program(&self, path: &Path) -> AppResult<()> {
        let program = document::load_program(path)?;
        self.replace_program(program)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Start running `program` with the given loop settings.
    ///
    /// `program` also becomes the editable program. Fails with
    /// [`DaqError::ProgramBusy`] if a run is active.
    pub fn run(&self, mut program: MotionProgram, loop_enabled: bool, loop_count: u32) -> AppResult<ExecutionCursor> {
        self.session.lock().ensure_writable()?;
        program.set_looping(loop_enabled, loop_count)?;
        program.validate()?;
        if program.is_empty() {
            return Err(DaqError::InvalidProgram("program has no steps".to_string()));
        }

        let mut inner = self.inner.lock();
        if inner.run.is_some() {
            return Err(DaqError::ProgramBusy);
        }
        let cursor = ExecutionCursor {
            run_id: Uuid::new_v4(),
            step_index: 0,
            loop_index: 0,
            loop_total: program.effective_loops(),
            running: true,
        };
        info!(
            run = %cursor.run_id,
            steps = program.len(),
            loops = cursor.loop_total,
            "Motion program started"
        );
        inner.program = program.clone();
        inner.run = Some(Run { program, cursor });
        inner.state = EngineState::Running;
        Ok(cursor)
    }

    /// Run the editable program with its own loop settings.
    pub fn run_current(&self) -> AppResult<ExecutionCursor> {
        let program = self.program();
        let (enabled, count) = (program.loop_enabled(), program.loop_count());
        self.run(program, enabled, count)
    }

    /// Execute one step of the active run.
    ///
    /// Returns [`TickOutcome::Idle`] when no run is active and fails with
    /// [`DaqError::TickInProgress`] if another tick is still executing.
    /// Step failures are reported as [`MotionEvent::StepFailed`] and
    /// [`TickOutcome::Failed`], not as errors.
    #[instrument(skip(self), level = "trace")]
    pub async fn advance_tick(&self) -> AppResult<TickOutcome> {
        if self.ticking.swap(true, Ordering::AcqRel) {
            return Err(DaqError::TickInProgress);
        }
        let _tick = TickGuard(&self.ticking);
        let mut abort_rx = self.abort_tx.subscribe();

        let (run_id, index, loop_index, step) = {
            let inner = self.inner.lock();
            let Some(run) = inner.run.as_ref() else {
                return Ok(TickOutcome::Idle);
            };
            let cursor = run.cursor;
            let Some(step) = run.program.get(cursor.step_index).cloned() else {
                return Err(DaqError::InvalidState(format!(
                    "cursor at step {} of a {}-step program",
                    cursor.step_index,
                    run.program.len()
                )));
            };
            // Under the lock so no StepStarted can follow a Stopped.
            self.emit(MotionEvent::StepStarted {
                index: cursor.step_index,
                loop_index: cursor.loop_index,
            });
            (cursor.run_id, cursor.step_index, cursor.loop_index, step)
        };

        let limit = self.step_timeout(&step)?;
        debug!(index, loop_index, %step, ?limit, "Executing motion step");
        let result = tokio::select! {
            biased;
            _ = abort_rx.changed() => {
                debug!(index, "Step aborted by stop");
                return Ok(TickOutcome::Stopped);
            }
            result = tokio::time::timeout(limit, self.execute(&step)) => result,
        };

        let (outcome, timed_out) = {
            let mut inner = self.inner.lock();
            let current = inner.run.as_ref().map(|run| run.cursor.run_id);
            if current != Some(run_id) {
                return Ok(TickOutcome::Stopped);
            }
            match result {
                Ok(Ok(())) => (self.advance_cursor(&mut inner), false),
                Ok(Err(e)) => (self.fail_run(&mut inner, index, e.to_string()), false),
                Err(_) => {
                    let cause = DaqError::Timeout {
                        operation: step.kind().to_string(),
                        timeout: limit,
                    }
                    .to_string();
                    (self.fail_run(&mut inner, index, cause), true)
                }
            }
        };

        if timed_out {
            self.abort_axis().await;
        }
        Ok(outcome)
    }

    fn advance_cursor(&self, inner: &mut Inner) -> TickOutcome {
        let Some(run) = inner.run.as_mut() else {
            return TickOutcome::Stopped;
        };
        let cursor = &mut run.cursor;
        let executed = (cursor.step_index, cursor.loop_index);
        cursor.step_index += 1;
        if cursor.step_index >= run.program.len() {
            cursor.step_index = 0;
            cursor.loop_index += 1;
            if cursor.loop_index >= cursor.loop_total {
                info!(run = %cursor.run_id, loops = cursor.loop_total, "Motion program complete");
                inner.run = None;
                inner.state = EngineState::Idle;
                self.emit(MotionEvent::ProgramComplete);
                return TickOutcome::Completed;
            }
            debug!(run = %cursor.run_id, pass = cursor.loop_index, "Starting next pass");
        }
        TickOutcome::Executed {
            index: executed.0,
            loop_index: executed.1,
        }
    }

    fn fail_run(&self, inner: &mut Inner, index: usize, cause: String) -> TickOutcome {
        inner.run = None;
        inner.state = EngineState::Faulted;
        self.diagnostics.report(Diagnostic::StepFailed {
            device_id: self.axis.info().id,
            index,
            cause: cause.clone(),
        });
        self.emit(MotionEvent::StepFailed {
            index,
            cause: cause.clone(),
        });
        TickOutcome::Failed { index, cause }
    }

    fn step_timeout(&self, step: &MotionStep) -> AppResult<Duration> {
        Ok(match step {
            MotionStep::Home { .. } => self.home_timeout,
            MotionStep::Pause { .. } | MotionStep::Scan { .. } => {
                step.duration()?.unwrap_or_default() + self.command_timeout
            }
            _ => self.command_timeout,
        })
    }

    async fn execute(&self, step: &MotionStep) -> AppResult<()> {
        let axis = &self.axis;
        match *step {
            MotionStep::MoveAbsolute { position, speed, unit } => {
                axis.set_speed(speed, unit).await?;
                axis.move_absolute(position, unit).await
            }
            MotionStep::MoveRelative { distance, speed, unit } => {
                axis.set_speed(speed, unit).await?;
                axis.move_relative(distance, unit).await
            }
            MotionStep::Home { speed } => {
                axis.set_speed(speed, Unit::Millimeter).await?;
                axis.home().await
            }
            MotionStep::Pause { .. } => {
                tokio::time::sleep(step.duration()?.unwrap_or_default()).await;
                Ok(())
            }
            MotionStep::SetSpeed { speed, unit } => axis.set_speed(speed, unit).await,
            MotionStep::Scan {
                speed,
                direction,
                unit,
                ..
            } => {
                axis.set_speed(speed, unit).await?;
                axis.scan(direction, step.duration()?.unwrap_or_default()).await
            }
        }
    }

    // =========================================================================
    // Stopping
    // =========================================================================

    /// End the active run without waiting for the step in progress.
    ///
    /// Returns whether a run was active. Does not touch the hardware.
    fn request_stop(&self) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut run) = inner.run.take() else {
            return false;
        };
        run.cursor.running = false;
        inner.state = EngineState::Idle;
        self.abort_tx.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        info!(
            run = %run.cursor.run_id,
            step = run.cursor.step_index,
            pass = run.cursor.loop_index,
            "Motion program stopped"
        );
        self.emit(MotionEvent::Stopped);
        true
    }

    async fn abort_axis(&self) -> bool {
        match self.axis.stop_motion().await {
            Ok(()) => true,
            Err(e) => {
                self.diagnostics.report(Diagnostic::AbortFailed {
                    device_id: self.axis.info().id,
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// Stop the active run and halt the axis.
    ///
    /// Safe to call while a tick is executing: the tick returns
    /// [`TickOutcome::Stopped`] without waiting for its hardware command. The
    /// hardware stop is sent whether or not a run was active.
    pub async fn stop(&self) -> AppResult<bool> {
        let was_running = self.request_stop();
        if self.abort_axis().await {
            Ok(was_running)
        } else {
            Err(DaqError::Hardware("stop command failed".to_string()))
        }
    }

    /// Handle for stopping from threads without an async context.
    ///
    /// Must be called inside a tokio runtime; the hardware stop is spawned on it.
    pub fn stop_handle(self: &Arc<Self>) -> AppResult<StopHandle> {
        let runtime = Handle::try_current()
            .map_err(|e| DaqError::InvalidState(format!("stop handle needs a tokio runtime: {e}")))?;
        Ok(StopHandle {
            engine: Arc::downgrade(self),
            runtime,
        })
    }

    /// Stop any run and release the axis. Later operations fail with
    /// [`DaqError::SessionClosed`].
    pub async fn disconnect(&self) {
        if self.request_stop() {
            self.abort_axis().await;
        }
        self.session.lock().close();
    }

    // =========================================================================
    // Manual control
    // =========================================================================

    fn ensure_manual(&self, write: bool) -> AppResult<()> {
        {
            let session = self.session.lock();
            if write {
                session.ensure_writable()?;
            } else {
                session.ensure_readable()?;
            }
        }
        if self.inner.lock().run.is_some() {
            return Err(DaqError::ProgramBusy);
        }
        Ok(())
    }

    async fn manual<F>(&self, operation: &str, limit: Duration, command: F) -> AppResult<()>
    where
        F: std::future::Future<Output = AppResult<()>>,
    {
        match tokio::time::timeout(limit, command).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, ?limit, "Manual axis command timed out");
                self.abort_axis().await;
                Err(DaqError::Timeout {
                    operation: operation.to_string(),
                    timeout: limit,
                })
            }
        }
    }

    /// Move to `position` while idle.
    pub async fn move_to(&self, position: f64, unit: Unit) -> AppResult<()> {
        self.ensure_manual(true)?;
        self.manual("move_to", self.command_timeout, self.axis.move_absolute(position, unit))
            .await
    }

    /// Move by `distance` while idle.
    pub async fn jog(&self, distance: f64, unit: Unit) -> AppResult<()> {
        self.ensure_manual(true)?;
        self.manual("jog", self.command_timeout, self.axis.move_relative(distance, unit))
            .await
    }

    /// Home the axis while idle.
    pub async fn home(&self) -> AppResult<()> {
        self.ensure_manual(true)?;
        self.manual("home", self.home_timeout, self.axis.home()).await
    }

    /// Set the axis speed while idle.
    pub async fn set_speed(&self, speed: f64, unit: Unit) -> AppResult<()> {
        self.ensure_manual(true)?;
        MotionStep::SetSpeed { speed, unit }.validate()?;
        self.manual("set_speed", self.command_timeout, self.axis.set_speed(speed, unit))
            .await
    }

    /// Axis position while idle.
    pub async fn position(&self, unit: Unit) -> AppResult<f64> {
        self.ensure_manual(false)?;
        match tokio::time::timeout(self.command_timeout, self.axis.position(unit)).await {
            Ok(result) => result,
            Err(_) => Err(DaqError::Timeout {
                operation: "position".to_string(),
                timeout: self.command_timeout,
            }),
        }
    }
}

/// Stops a [`SequenceEngine`] from synchronous code.
#[derive(Clone)]
pub struct StopHandle {
    engine: Weak<SequenceEngine>,
    runtime: Handle,
}

impl StopHandle {
    /// End the active run now and send the hardware stop on the engine's runtime.
    ///
    /// Returns whether a run was active.
    pub fn stop(&self) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };
        let was_running = engine.request_stop();
        self.runtime.spawn(async move {
            engine.abort_axis().await;
        });
        was_running
    }
}
