//! Task-suspending synchronization primitives.
//!
//! These mirror their threaded counterparts but suspend the task instead of
//! blocking the worker, so a parked waiter costs nothing but its node.

mod channel;
mod condvar;
mod latch;
mod mutex;
mod semaphore;
pub(crate) mod waiter;

pub use channel::{channel, ChannelClosed, Receiver, SendError, Sender};
pub use condvar::Condvar;
pub use latch::{Latch, LatchWait};
pub use mutex::{Lock, Mutex, MutexGuard};
pub use semaphore::{Acquire, Semaphore, SemaphorePermit};
