//! Structured diagnostics reported by the engines.
//!
//! Engines take a `Arc<dyn DiagnosticsSink>` at construction instead of
//! reaching for a global logger. Three sinks are provided:
//!
//! - [`TracingDiagnostics`] logs each event at a level that fits it
//! - [`BroadcastDiagnostics`] fans events out over a `tokio::sync::broadcast`
//!   channel (GUI status bars, tests) and also logs them
//! - [`NullDiagnostics`] discards everything
//!
//! `report` is called from the frame callback thread, so sinks must not block.

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::camera::{FeatureValue, PixelFormat};

/// An anomaly or notable event inside an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The preferred pixel format was unavailable and another was chosen.
    FormatSubstituted {
        /// Camera
        device_id: String,
        /// Format asked for
        requested: PixelFormat,
        /// Format in use
        selected: PixelFormat,
    },
    /// The requested resolution was not accepted as-is.
    ResolutionNotApplied {
        /// Camera
        device_id: String,
        /// Requested `(width, height)`
        requested: (u32, u32),
        /// Resolution in effect
        actual: (u32, u32),
    },
    /// The driver delivered an incomplete or failed buffer.
    FrameDropped {
        /// Camera
        device_id: String,
        /// Driver frame counter
        driver_frame_id: u64,
    },
    /// A complete buffer did not match the configured frame size.
    FrameRejected {
        /// Camera
        device_id: String,
        /// Expected payload
        expected_bytes: usize,
        /// Delivered payload
        actual_bytes: usize,
    },
    /// Buffer requeue or driver failure during streaming.
    StreamFault {
        /// Camera
        device_id: String,
        /// Failure description
        reason: String,
    },
    /// A stop was requested on the callback thread and queued for later.
    StopDeferred {
        /// Camera
        device_id: String,
    },
    /// A feature write was not reflected by read-back.
    ValueNotApplied {
        /// Camera
        device_id: String,
        /// Feature name
        feature: String,
        /// Written value
        requested: FeatureValue,
        /// Read-back value
        actual: FeatureValue,
    },
    /// An auto mode was enabled with `On` because the device lacks `Continuous`.
    AutoModeFallback {
        /// Camera
        device_id: String,
        /// Feature name
        feature: String,
        /// Value written
        value: String,
    },
    /// A motion step failed and the run was halted.
    StepFailed {
        /// Actuator
        device_id: String,
        /// Step index
        index: usize,
        /// Failure description
        cause: String,
    },
    /// The hardware stop command issued by `stop()` failed.
    AbortFailed {
        /// Actuator
        device_id: String,
        /// Failure description
        reason: String,
    },
}

impl Diagnostic {
    /// Emit this diagnostic as a tracing event.
    pub fn log(&self) {
        match self {
            Self::FormatSubstituted {
                device_id,
                requested,
                selected,
            } => warn!(device = %device_id, %requested, %selected, "Pixel format substituted"),
            Self::ResolutionNotApplied {
                device_id,
                requested,
                actual,
            } => warn!(device = %device_id, ?requested, ?actual, "Requested resolution not applied"),
            Self::FrameDropped {
                device_id,
                driver_frame_id,
            } => debug!(device = %device_id, driver_frame_id, "Dropped incomplete frame"),
            Self::FrameRejected {
                device_id,
                expected_bytes,
                actual_bytes,
            } => warn!(
                device = %device_id,
                expected_bytes,
                actual_bytes,
                "Rejected frame with unexpected size"
            ),
            Self::StreamFault { device_id, reason } => {
                error!(device = %device_id, %reason, "Stream fault")
            }
            Self::StopDeferred { device_id } => {
                info!(device = %device_id, "Stop requested from frame callback; deferred")
            }
            Self::ValueNotApplied {
                device_id,
                feature,
                requested,
                actual,
            } => warn!(
                device = %device_id,
                %feature,
                %requested,
                %actual,
                "Feature value not applied"
            ),
            Self::AutoModeFallback {
                device_id,
                feature,
                value,
            } => debug!(device = %device_id, %feature, %value, "Auto mode enabled with fallback value"),
            Self::StepFailed {
                device_id,
                index,
                cause,
            } => error!(device = %device_id, index, %cause, "Motion step failed"),
            Self::AbortFailed { device_id, reason } => {
                error!(device = %device_id, %reason, "Hardware stop failed")
            }
        }
    }
}

/// Receiver of engine diagnostics.
pub trait DiagnosticsSink: Send + Sync {
    /// Handle one diagnostic. Must not block.
    fn report(&self, diagnostic: Diagnostic);
}

/// Logs diagnostics through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        diagnostic.log();
    }
}

/// Discards diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDiagnostics;

impl DiagnosticsSink for NullDiagnostics {
    fn report(&self, _diagnostic: Diagnostic) {}
}

/// Logs diagnostics and republishes them to subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastDiagnostics {
    tx: broadcast::Sender<Diagnostic>,
}

impl BroadcastDiagnostics {
    /// Sink retaining up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to diagnostics reported after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastDiagnostics {
    fn default() -> Self {
        Self::new(256)
    }
}

impl DiagnosticsSink for BroadcastDiagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        diagnostic.log();
        // No subscribers is fine.
        let _ = self.tx.send(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn broadcast_reaches_subscribers() {
        let sink = BroadcastDiagnostics::new(8);
        let mut rx = sink.subscribe();
        sink.report(Diagnostic::StopDeferred {
            device_id: "cam0".into(),
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            Diagnostic::StopDeferred {
                device_id: "cam0".into()
            }
        );
    }

    #[test]
    fn broadcast_without_subscribers_is_silent() {
        let sink = BroadcastDiagnostics::default();
        sink.report(Diagnostic::FrameDropped {
            device_id: "cam0".into(),
            driver_frame_id: 3,
        });
    }

    #[traced_test]
    #[test]
    fn tracing_sink_logs_substitution() {
        TracingDiagnostics.report(Diagnostic::FormatSubstituted {
            device_id: "cam0".into(),
            requested: PixelFormat::Bgr8,
            selected: PixelFormat::Mono8,
        });
        assert!(logs_contain("Pixel format substituted"));
        assert!(logs_contain("Mono8"));
    }
}
