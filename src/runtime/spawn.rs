use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use super::shared::Shared;
use crate::task::{JoinCell, JoinError, JoinHandle, Task};

/// Spawns a task onto the current runtime.
///
/// The task starts on this worker's run-next slot when called from a worker
/// thread, and through the injection queue otherwise.
///
/// # Panics
///
/// Panics when called from a thread that is not driven by a runtime. Use
/// [`Runtime::spawn`](crate::runtime::Runtime::spawn) from the outside.
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    crate::context::with_shared(|shared| spawn_on(shared, future))
        .expect("spawn called outside a runtime worker thread")
}

/// Spawns onto a specific runtime's shared state.
pub(crate) fn spawn_on<F>(shared: &Arc<Shared>, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let cell = Arc::new(JoinCell::new());
    let completion = cell.clone();
    let id = shared.next_task_id();
    let wrapped = async move {
        let result = AssertUnwindSafe(future).catch_unwind().await;
        let result = result.map_err(|payload| {
            log::error!("task {id} panicked");
            JoinError::panic(payload)
        });
        completion.complete(result);
    };

    let task = Task::new(shared.clone(), Box::pin(wrapped), id);
    crate::context::schedule(task);
    JoinHandle::new(cell)
}
