//! Task cell and lifecycle.
//!
//! A task owns its future behind an atomic state machine that guarantees a
//! task is never queued twice: wakes arriving while the task runs collapse
//! into a single notification, and wakes on an already scheduled task are
//! no-ops.

mod id;
mod join;

pub use id::Id;
pub use join::{JoinError, JoinHandle};

pub(crate) use join::JoinCell;

use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

/// Not in any queue; a wake must reschedule it.
const IDLE: u8 = 0;
/// In a run queue (or a worker's run-next slot).
const SCHEDULED: u8 = 1;
/// Being polled by a worker.
const RUNNING: u8 = 2;
/// Woken while running; the worker requeues it after the poll.
const NOTIFIED: u8 = 3;
/// Future finished; all further wakes are no-ops.
const COMPLETE: u8 = 4;

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Stage {
    Pending(TaskFuture),
    Done,
}

pub(crate) struct Core {
    id: Id,
    shared: Arc<crate::runtime::Shared>,
    state: AtomicU8,
    stage: UnsafeCell<Stage>,
}

// Safety: `stage` is only touched by the worker that holds the RUNNING
// state, and by Drop of the last Arc.
unsafe impl Sync for Core {}

/// Handle representing queue ownership of a task. Exactly one `Task` value
/// for a given core exists while its state is SCHEDULED.
pub(crate) struct Task {
    core: Arc<Core>,
}

impl Task {
    pub(crate) fn new(
        shared: Arc<crate::runtime::Shared>,
        future: TaskFuture,
        id: Id,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                id,
                shared,
                state: AtomicU8::new(SCHEDULED),
                stage: UnsafeCell::new(Stage::Pending(future)),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn stub(shared: Arc<crate::runtime::Shared>) -> Self {
        let id = shared.next_task_id();
        Self::new(shared, Box::pin(async {}), id)
    }

    pub(crate) fn id(&self) -> Id {
        self.core.id
    }

    pub(crate) fn shared(&self) -> &Arc<crate::runtime::Shared> {
        &self.core.shared
    }

    /// Polls the task once. Consumes queue ownership; if the future yields
    /// and was notified meanwhile, the task is rescheduled here.
    pub(crate) fn run(self) {
        let core = self.core;
        if core
            .state
            .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            unreachable!("ran a task that was not scheduled");
        }

        let waker = Waker::from(core.clone());
        let mut cx = Context::from_waker(&waker);
        // Safety: RUNNING grants exclusive access to the stage.
        let poll = unsafe {
            match &mut *core.stage.get() {
                Stage::Pending(future) => future.as_mut().poll(&mut cx),
                Stage::Done => unreachable!("polled a completed task"),
            }
        };

        match poll {
            Poll::Ready(()) => {
                unsafe { *core.stage.get() = Stage::Done };
                core.state.store(COMPLETE, Ordering::Release);
            }
            Poll::Pending => {
                match core.state.compare_exchange(
                    RUNNING,
                    IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {}
                    Err(NOTIFIED) => {
                        core.state.store(SCHEDULED, Ordering::Release);
                        crate::context::schedule(Task { core });
                    }
                    Err(state) => unreachable!("task in state {state} after poll"),
                }
            }
        }
    }
}

impl Core {
    fn wake_task(self: Arc<Self>) {
        loop {
            match self.state.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .state
                        .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        crate::context::schedule(Task { core: self });
                        return;
                    }
                }
                RUNNING => {
                    if self
                        .state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                // Already queued, already notified, or finished.
                SCHEDULED | NOTIFIED | COMPLETE => return,
                state => unreachable!("task in state {state}"),
            }
        }
    }
}

impl Wake for Core {
    fn wake(self: Arc<Self>) {
        self.wake_task();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().wake_task();
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Task: Send);
    assert_impl_all!(JoinHandle<usize>: Send, Sync);
}
