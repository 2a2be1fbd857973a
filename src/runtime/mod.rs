//! Scheduler: worker threads, run queues, and idle coordination.

mod builder;
mod idle;
pub(crate) mod queue;
#[allow(clippy::module_inception)]
mod runtime;
mod shared;
mod spawn;
mod ticker;
mod worker;

pub use builder::Builder;
pub use runtime::Runtime;
pub use spawn::spawn;

pub(crate) use builder::RuntimeConfig;
pub(crate) use shared::Shared;
pub(crate) use spawn::spawn_on;

use std::future::Future;

/// Runs `future` on a freshly built default runtime and shuts it down when
/// the future completes.
///
/// # Panics
///
/// Panics if the runtime cannot be built; use [`Builder`] for fallible
/// setup.
pub fn block_on<F>(future: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Builder::new()
        .build()
        .expect("failed to build the default runtime")
        .block_on(future)
}
