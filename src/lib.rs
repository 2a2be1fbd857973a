//! An io_uring-backed, work-stealing asynchronous task runtime.
//!
//! Riptide runs futures on a fixed pool of worker threads. Each worker owns
//! an io_uring instance and a timer set; tasks are balanced across workers
//! by stealing, and a task that suspends on IO, a timer, or one of the
//! [`sync`] primitives costs nothing until its completion arrives.
//!
//! ```no_run
//! use riptide::{block_on, spawn};
//!
//! block_on(async {
//!     let handle = spawn(async { 1 + 1 });
//!     assert_eq!(handle.await.unwrap(), 2);
//! });
//! ```

mod context;
mod driver;
pub mod io;
pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use runtime::{block_on, spawn, Builder, Runtime};
pub use task::{JoinError, JoinHandle};
