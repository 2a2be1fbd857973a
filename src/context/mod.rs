//! Per-worker thread-local state.
//!
//! Each worker thread owns a reactor and a timer wheel and exposes them to
//! futures through scoped accessors. Scheduling consults the same context to
//! decide between the local fast path and the shared injection queue.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::task::Waker;

use crate::driver::Driver;
use crate::runtime::Shared;
use crate::task::Task;
use crate::time::Timer;

pub(crate) struct Context {
    pub(crate) shared: Arc<Shared>,
    pub(crate) index: usize,
    /// Slot for the most recently woken local task; polled before the queue.
    run_next: RefCell<Option<Task>>,
    /// Wakers parked by an explicit yield, flushed by the worker between
    /// polls so a yielding task lands behind its peers.
    yielded: RefCell<Vec<Waker>>,
    /// Set while flushing yields; reroutes those wakes past the run-next
    /// slot to the back of the local queue.
    flushing_yields: Cell<bool>,
    driver: RefCell<Option<Driver>>,
    timer: RefCell<Timer>,
}

thread_local! {
    static CONTEXT: RefCell<Option<Rc<Context>>> = const { RefCell::new(None) };
}

pub(crate) fn init_worker(shared: Arc<Shared>, index: usize, driver: Driver) -> Rc<Context> {
    let ctx = Rc::new(Context {
        shared,
        index,
        run_next: RefCell::new(None),
        yielded: RefCell::new(Vec::new()),
        flushing_yields: Cell::new(false),
        driver: RefCell::new(Some(driver)),
        timer: RefCell::new(Timer::new()),
    });
    CONTEXT.with(|cell| {
        let mut cell = cell.borrow_mut();
        assert!(cell.is_none(), "worker context initialized twice");
        *cell = Some(ctx.clone());
    });
    ctx
}

pub(crate) fn clear_worker() {
    CONTEXT.with(|cell| cell.borrow_mut().take());
}

fn current() -> Option<Rc<Context>> {
    CONTEXT.with(|cell| cell.borrow().clone())
}

/// Runs `f` with the current runtime's shared state; `None` off-worker.
pub(crate) fn with_shared<R>(f: impl FnOnce(&Arc<Shared>) -> R) -> Option<R> {
    current().map(|ctx| f(&ctx.shared))
}

/// Runs `f` with the current worker's driver and timer. Panics outside a
/// runtime worker thread; IO and timer futures are only pollable there.
pub(crate) fn with_driver_and_timer<R>(f: impl FnOnce(&mut Driver, &mut Timer) -> R) -> R {
    let ctx = current().expect("not running on a runtime worker thread");
    let mut driver = ctx.driver.borrow_mut();
    let driver = driver
        .as_mut()
        .expect("reactor already shut down on this worker");
    let mut timer = ctx.timer.borrow_mut();
    f(driver, &mut timer)
}

pub(crate) fn with_timer<R>(f: impl FnOnce(&mut Timer) -> R) -> R {
    let ctx = current().expect("not running on a runtime worker thread");
    let r = f(&mut ctx.timer.borrow_mut());
    r
}

/// Like [`with_driver_and_timer`] but a no-op off-worker or after reactor
/// teardown. Used from Drop impls, which must not panic.
pub(crate) fn try_with_driver(f: impl FnOnce(&mut Driver)) {
    if let Some(ctx) = current() {
        if let Some(driver) = ctx.driver.borrow_mut().as_mut() {
            f(driver);
        }
    }
}

/// Routes a woken task: onto this worker's run-next slot when waking from
/// the owning runtime's own worker, otherwise through the injection queue.
pub(crate) fn schedule(task: Task) {
    match current() {
        Some(ctx) if Arc::ptr_eq(&ctx.shared, task.shared()) => ctx.schedule_local(task),
        _ => {
            let shared = task.shared().clone();
            shared.push_remote_task(task);
        }
    }
}

/// Parks a yield waker on the current worker; woken after the next poll.
/// Off-worker the waker fires immediately.
pub(crate) fn defer_yield(waker: Waker) {
    match current() {
        Some(ctx) => ctx.yielded.borrow_mut().push(waker),
        None => waker.wake(),
    }
}

impl Context {
    fn schedule_local(&self, task: Task) {
        if self.flushing_yields.get() {
            // A yielding task goes behind its peers, not in front.
            let remote = &self.shared.remotes[self.index];
            remote.queue.push_back_or_overflow(task, &self.shared.global);
            return;
        }
        let prev = self.run_next.borrow_mut().replace(task);
        if let Some(prev) = prev {
            let remote = &self.shared.remotes[self.index];
            remote.queue.push_back_or_overflow(prev, &self.shared.global);
            self.shared.wake_up_one();
        }
    }

    pub(crate) fn take_run_next(&self) -> Option<Task> {
        self.run_next.borrow_mut().take()
    }

    pub(crate) fn has_run_next(&self) -> bool {
        self.run_next.borrow().is_some()
    }

    pub(crate) fn flush_yielded(&self) {
        let wakers = std::mem::take(&mut *self.yielded.borrow_mut());
        if wakers.is_empty() {
            return;
        }
        self.flushing_yields.set(true);
        for waker in wakers {
            waker.wake();
        }
        self.flushing_yields.set(false);
    }

    /// Takes the reactor out for teardown. Subsequent driver access on this
    /// thread becomes a no-op through [`try_with_driver`].
    pub(crate) fn take_driver(&self) -> Option<Driver> {
        self.driver.borrow_mut().take()
    }
}
