//! Motion side of the device core.
//!
//! - [`step`]: typed steps and units
//! - [`program`]: ordered programs with loop settings
//! - [`document`]: JSON program documents
//! - [`engine`]: the tick-driven sequence engine
//! - [`scheduler`]: tokio tick driver

pub mod document;
pub mod engine;
pub mod program;
pub mod scheduler;
pub mod step;

pub use document::{load_program, save_program, ProgramDocument};
pub use engine::{EngineState, ExecutionCursor, MotionEvent, SequenceEngine, StopHandle, TickOutcome};
pub use program::MotionProgram;
pub use scheduler::{run_to_completion, spawn_ticker};
pub use step::{Direction, MotionStep, Unit};
