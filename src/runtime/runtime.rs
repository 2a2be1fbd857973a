use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use anyhow::{Context as _, Result};
use futures::FutureExt;

use super::builder::RuntimeConfig;
use super::shared::Shared;
use super::{spawn_on, worker};
use crate::task::JoinHandle;

/// A running scheduler: worker threads, their rings, and the shared queues.
///
/// Dropping the runtime shuts it down: the injection queue closes, workers
/// finish the task they are on, drop the rest, and exit.
pub struct Runtime {
    shared: Arc<Shared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Runtime {
    pub(crate) fn start(config: RuntimeConfig) -> Result<Runtime> {
        let shared = Shared::try_new(config)?;
        let mut threads = Vec::with_capacity(shared.config.worker_threads);
        for index in 0..shared.config.worker_threads {
            let shared = shared.clone();
            let name = shared.config.thread_name();
            threads.push(
                thread::Builder::new()
                    .name(name)
                    .spawn(move || worker::run(shared, index))
                    .context("spawning runtime worker thread")?,
            );
        }
        log::debug!("runtime started: {:?}", shared.config);
        Ok(Runtime {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Spawns a task onto the runtime from any thread.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_on(&self.shared, future)
    }

    /// Runs `future` to completion on the runtime, then shuts it down.
    ///
    /// The calling thread blocks until the root task finishes. A panic in
    /// the root task is resumed on the caller after an orderly shutdown.
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        type RootResult<T> = std::result::Result<T, Box<dyn std::any::Any + Send>>;

        let done = Arc::new((Mutex::new(None::<RootResult<F::Output>>), Condvar::new()));
        let done2 = done.clone();
        let root = async move {
            let result = AssertUnwindSafe(future).catch_unwind().await;
            let (slot, cvar) = &*done2;
            *slot.lock().unwrap() = Some(result);
            cvar.notify_one();
        };

        assert!(
            !self.shared.global.is_closed(),
            "block_on called on a runtime that has already shut down"
        );
        let id = self.shared.next_task_id();
        let task = crate::task::Task::new(self.shared.clone(), Box::pin(root), id);
        self.shared.push_remote_task(task);

        let (slot, cvar) = &*done;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = cvar.wait(guard).unwrap();
        }
        let result = guard.take().unwrap();
        drop(guard);

        self.shutdown();
        match result {
            Ok(output) => output,
            Err(payload) => {
                log::error!("root task panicked; runtime shut down");
                resume_unwind(payload)
            }
        }
    }

    /// Closes the injection queue and joins every worker. Idempotent.
    pub fn shutdown(&self) {
        self.shared.close();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            if handle.join().is_err() {
                log::error!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
