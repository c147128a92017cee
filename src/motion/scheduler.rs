//! Fixed-cadence tick driver for [`SequenceEngine`].
//!
//! A tick that runs long (a pause, a slow move) delays the following ticks
//! instead of producing a burst of catch-up ticks, and ticks never overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::engine::{SequenceEngine, TickOutcome};
use crate::error::AppResult;

/// Call `advance_tick` every `period` until the run ends.
///
/// Returns the terminal outcome: `Completed`, `Stopped`, `Failed`, or `Idle`
/// if no run was active (or it was stopped between ticks).
pub async fn run_to_completion(engine: &SequenceEngine, period: Duration) -> AppResult<TickOutcome> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = 0u64;
    loop {
        ticker.tick().await;
        let outcome = engine.advance_tick().await?;
        ticks += 1;
        if outcome.is_terminal() {
            info!(ticks, ?outcome, "Motion ticker finished");
            return Ok(outcome);
        }
        debug!(ticks, ?outcome, "Motion tick");
    }
}

/// Spawn [`run_to_completion`] on the current runtime.
///
/// Call after [`SequenceEngine::run`]; with no active run the task ends on
/// its first tick.
pub fn spawn_ticker(engine: Arc<SequenceEngine>, period: Duration) -> JoinHandle<AppResult<TickOutcome>> {
    tokio::spawn(async move { run_to_completion(&engine, period).await })
}
