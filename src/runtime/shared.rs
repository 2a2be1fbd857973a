use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};

use super::builder::RuntimeConfig;
use super::idle::Idle;
use super::queue::{GlobalQueue, LocalQueue};
use crate::driver::Unpark;
use crate::task::{Id, Task};

/// Handles other workers may touch: the stealable queue and the wakeup fd.
pub(crate) struct Remote {
    pub(crate) queue: LocalQueue,
    pub(crate) unpark: Unpark,
}

/// State shared by every worker of a runtime.
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) global: GlobalQueue,
    pub(crate) idle: Idle,
    pub(crate) remotes: Box<[Remote]>,
    next_task_id: AtomicU64,
}

impl Shared {
    pub(crate) fn try_new(config: RuntimeConfig) -> Result<Arc<Self>> {
        let remotes = (0..config.worker_threads)
            .map(|i| {
                Ok(Remote {
                    queue: LocalQueue::new(),
                    unpark: Unpark::try_new()
                        .with_context(|| format!("creating wakeup eventfd for worker {i}"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?
            .into_boxed_slice();
        Ok(Arc::new(Self {
            idle: Idle::new(config.worker_threads),
            global: GlobalQueue::new(),
            remotes,
            config,
            next_task_id: AtomicU64::new(1),
        }))
    }

    pub(crate) fn next_task_id(&self) -> Id {
        Id(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Injects a task from outside any worker of this runtime.
    pub(crate) fn push_remote_task(&self, task: Task) {
        if self.global.push(task) {
            self.wake_up_one();
        }
    }

    pub(crate) fn next_global_task(&self) -> Option<Task> {
        self.global.pop()
    }

    pub(crate) fn wake_up_one(&self) {
        if let Some(index) = self.idle.worker_to_notify() {
            self.remotes[index].unpark.unpark();
        }
    }

    pub(crate) fn wake_up_all(&self) {
        for remote in self.remotes.iter() {
            remote.unpark.unpark();
        }
    }

    /// Re-check run by the last searching worker before it sleeps: any
    /// queued work left behind must wake somebody.
    pub(crate) fn wake_up_if_work_pending(&self) {
        if !self.global.is_empty() || self.remotes.iter().any(|r| !r.queue.is_empty()) {
            self.wake_up_one();
        }
    }

    /// Closes the runtime. The first closer wakes every worker so they can
    /// observe the closed queue and exit.
    pub(crate) fn close(&self) -> bool {
        if self.global.close() {
            self.wake_up_all();
            return true;
        }
        false
    }
}
