use std::cell::UnsafeCell;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use futures::task::AtomicWaker;
use io_uring::squeue;

use crate::time::TimerHandle;

/// Completion token for an unpark eventfd read.
pub(crate) const TOKEN_UNPARK: u64 = u64::MAX;
/// Completion token whose result is discarded (cancellation requests).
pub(crate) const TOKEN_IGNORE: u64 = u64::MAX - 1;

const PENDING: u8 = 0;
const COMPLETE: u8 = 1;
/// Future dropped mid-flight; the record stays alive until the CQE arrives.
const DETACHED: u8 = 2;

/// One submitted operation's resources and outcome.
///
/// The kernel reads and writes buffers owned by `payload`, so the record
/// must outlive the operation: the reactor holds a second `Arc` in its slab
/// until the completion arrives, keeping the memory pinned even if the
/// submitting future is dropped.
pub(crate) struct OpCell<P> {
    state: AtomicU8,
    result: AtomicI32,
    waker: AtomicWaker,
    payload: UnsafeCell<Option<P>>,
    /// Slab key under which the reactor tracks this operation.
    key: usize,
    issuer: ThreadId,
    deadline_timer: Option<TimerHandle>,
}

// Safety: `payload` is written by the issuing worker before the record is
// shared, and read back only after the state reaches COMPLETE.
unsafe impl<P: Send> Send for OpCell<P> {}
unsafe impl<P: Send> Sync for OpCell<P> {}

impl<P> OpCell<P> {
    pub(crate) fn new(payload: P, key: usize, deadline_timer: Option<TimerHandle>) -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            result: AtomicI32::new(0),
            waker: AtomicWaker::new(),
            payload: UnsafeCell::new(Some(payload)),
            key,
            issuer: thread::current().id(),
            deadline_timer,
        }
    }

    /// Safety: caller must be the issuing worker, before the record is
    /// shared with the reactor.
    pub(crate) unsafe fn payload_mut(&self) -> &mut P {
        (*self.payload.get()).as_mut().unwrap()
    }
}

/// Type-erased view the reactor keeps of an in-flight operation.
pub(crate) trait OpComplete: Send + Sync {
    fn complete(&self, res: i32);
}

impl<P: Send> OpComplete for OpCell<P> {
    fn complete(&self, res: i32) {
        self.result.store(res, Ordering::Release);
        if let Some(timer) = &self.deadline_timer {
            timer.cancel();
        }
        let prev = self.state.swap(COMPLETE, Ordering::AcqRel);
        if prev != DETACHED {
            self.waker.wake();
        }
    }
}

/// Converts a typed operation into a submission entry and back out of its
/// raw completion result.
pub trait Payload: Send + 'static {
    type Output;

    /// Builds the submission entry. Any pointers must reference memory owned
    /// by `self`, which stays pinned inside the shared record for the whole
    /// flight.
    fn entry(&mut self) -> squeue::Entry;

    fn output(self, res: i32) -> io::Result<Self::Output>;
}

enum OpState<P: Payload> {
    Unsubmitted {
        payload: Option<P>,
        deadline: Option<Duration>,
    },
    InFlight {
        cell: Arc<OpCell<P>>,
        has_deadline: bool,
    },
    Done,
}

/// Future for a single ring operation. Submission is lazy: the entry is
/// pushed on first poll, on whichever worker runs the task at that point.
pub struct Op<P: Payload> {
    state: OpState<P>,
}

impl<P: Payload> Op<P> {
    pub(crate) fn new(payload: P) -> Self {
        Self {
            state: OpState::Unsubmitted {
                payload: Some(payload),
                deadline: None,
            },
        }
    }

    /// Arms a kernel-side deadline: if the operation has not completed when
    /// it expires, a cancellation is pushed and the operation resolves to
    /// [`io::ErrorKind::TimedOut`]. No effect once submitted.
    pub fn deadline(mut self, timeout: Duration) -> Self {
        if let OpState::Unsubmitted { deadline, .. } = &mut self.state {
            *deadline = Some(timeout);
        }
        self
    }
}

impl<P: Payload> Future for Op<P> {
    type Output = io::Result<P::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // No self-referential fields; the pinned buffers live in the OpCell.
        let this = unsafe { self.get_unchecked_mut() };
        loop {
            match &mut this.state {
                OpState::Unsubmitted { payload, deadline } => {
                    let payload = payload.take().unwrap();
                    let deadline = deadline.take();
                    let has_deadline = deadline.is_some();
                    let cell = crate::context::with_driver_and_timer(|driver, timer| {
                        driver.submit(payload, deadline.map(|d| Instant::now() + d), timer)
                    });
                    match cell {
                        Ok(cell) => this.state = OpState::InFlight { cell, has_deadline },
                        Err(err) => {
                            this.state = OpState::Done;
                            return Poll::Ready(Err(err));
                        }
                    }
                }
                OpState::InFlight { cell, has_deadline } => {
                    cell.waker.register(cx.waker());
                    if cell.state.load(Ordering::Acquire) != COMPLETE {
                        return Poll::Pending;
                    }
                    let res = cell.result.load(Ordering::Acquire);
                    // Safety: COMPLETE means the kernel is done with the
                    // buffers and the reactor dropped its reference.
                    let payload = unsafe { (*cell.payload.get()).take().unwrap() };
                    let timed_out = *has_deadline && res == -libc::ECANCELED;
                    this.state = OpState::Done;
                    return Poll::Ready(if timed_out {
                        Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            crate::time::Elapsed::new(),
                        ))
                    } else if res < 0 {
                        Err(io::Error::from_raw_os_error(-res))
                    } else {
                        payload.output(res)
                    });
                }
                OpState::Done => panic!("operation polled after completion"),
            }
        }
    }
}

impl<P: Payload> Drop for Op<P> {
    fn drop(&mut self) {
        if let OpState::InFlight { cell, .. } = &self.state {
            if cell
                .state
                .compare_exchange(PENDING, DETACHED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Best effort: only the issuing worker's ring can cancel.
                // A detached record on another thread just lingers until
                // its completion arrives and the reactor reaps it.
                if thread::current().id() == cell.issuer {
                    let key = cell.key;
                    crate::context::try_with_driver(|driver| driver.push_cancel(key));
                }
            }
        }
    }
}
