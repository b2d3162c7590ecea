//! Shared plumbing for the palaver protocol engine: tracing setup and clocks.

pub mod time;
pub mod tracing;

pub use time::{Clock, ManualClock, SharedClock, SystemClock};
pub use tracing::{LogFormat, TracingConfig, TracingError, init_tracing};
