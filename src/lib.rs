//! Core library for the TOSCA device layer.
//!
//! Two engines turn asynchronous, possibly-failing device interfaces into
//! observable, cancellable state machines:
//!
//! - [`camera::FrameAcquisition`] drives a machine-vision camera whose driver
//!   delivers completed buffers on its own thread, keeps the most recent frame
//!   in a single slot and exposes feature control and settings persistence.
//! - [`motion::SequenceEngine`] executes programs of typed motion steps on a
//!   positioning actuator, one step per scheduler tick, with looping and
//!   immediate stop.
//!
//! Both engines hold a [`session::DeviceSession`] leased from a shared
//! [`session::DeviceRegistry`] and report anomalies through a
//! [`diagnostics::DiagnosticsSink`] passed in at construction.

pub mod camera;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod hardware;
pub mod limits;
pub mod logging;
pub mod motion;
pub mod session;

pub use error::{AppResult, DaqError};
