//! Timers and time-based combinators.

mod interval;
mod sleep;
mod timeout;
pub(crate) mod timer;
mod yield_now;

pub use interval::{interval, interval_at, Interval, MissedTickBehavior};
pub use sleep::{sleep, sleep_until, Sleep};
pub use timeout::{timeout, timeout_at, Elapsed, Timeout};
pub use yield_now::yield_now;

pub(crate) use timer::{Timer, TimerHandle};
