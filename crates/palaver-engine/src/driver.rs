//! Async driver that runs the event loop on a fixed cadence.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::EngineResult;
use crate::event_queue::EventQueue;

/// Default time between two passes of the event loop.
pub const PROCESS_INTERVAL: Duration = Duration::from_millis(200);

/// Something with a non-blocking `process()` pass.
pub trait Pump {
    fn process(&mut self) -> EngineResult<()>;
}

impl Pump for EventQueue {
    fn process(&mut self) -> EngineResult<()> {
        EventQueue::process(self)
    }
}

/// Calls `process()` every `period` until `shutdown` completes.
///
/// Must run on a current-thread runtime or inside a `LocalSet`: the event
/// queue is not `Send`.
///
/// # Errors
///
/// Stops at the first error `process()` returns.
pub async fn drive<P, S>(pump: &mut P, period: Duration, shutdown: S) -> EngineResult<()>
where
    P: Pump,
    S: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    debug!(period_ms = period.as_millis() as u64, "event loop driver started");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                return Ok(());
            }
            _ = ticker.tick() => pump.process()?,
        }
    }
}
