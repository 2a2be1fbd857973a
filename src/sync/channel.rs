//! Bounded multi-producer multi-consumer channel.
//!
//! A ring buffer plus two waiter queues, all guarded by the asynchronous
//! [`Mutex`]. The guard is never held across a suspension point: a task that
//! must park enqueues a waiter, drops the guard, and awaits a direct
//! handoff. Values move exactly once, either through the buffer or straight
//! from a parked sender to a receiver.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use super::mutex::{Mutex, MutexGuard};
use super::waiter::{WaitNode, GRANTED};

/// Receiving on a channel with no values left and no live senders, or
/// sending on a channel with no live receivers.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("channel closed")]
pub struct ChannelClosed;

/// Failed send; gives the value back.
#[derive(PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sending on a closed channel")
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Creates a bounded channel. A capacity of zero makes every send a
/// rendezvous with a receiver.
pub fn channel<T: Send>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let chan = Arc::new(Chan {
        state: Mutex::new(State {
            buffer: VecDeque::with_capacity(capacity),
            send_waiters: VecDeque::new(),
            recv_waiters: VecDeque::new(),
            closed: false,
        }),
        capacity,
        senders: AtomicUsize::new(1),
        receivers: AtomicUsize::new(1),
    });
    (Sender { chan: chan.clone() }, Receiver { chan })
}

struct SendWaiter<T> {
    node: Arc<WaitNode>,
    /// Taken by the receiving side; still present on a closed wakeup.
    value: parking_lot::Mutex<Option<T>>,
}

struct RecvWaiter<T> {
    node: Arc<WaitNode>,
    /// Filled by the sending side; empty on a closed wakeup.
    slot: parking_lot::Mutex<Option<T>>,
}

struct State<T> {
    buffer: VecDeque<T>,
    send_waiters: VecDeque<Arc<SendWaiter<T>>>,
    recv_waiters: VecDeque<Arc<RecvWaiter<T>>>,
    closed: bool,
}

struct Chan<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    senders: AtomicUsize,
    receivers: AtomicUsize,
}

impl<T: Send> Chan<T> {
    /// Takes the state lock without ever parking on it. The lock is only
    /// held within a single poll, so a failed `try_lock` means another
    /// worker is mid-section and will release momentarily; yielding keeps
    /// this worker useful meanwhile. Never parking also means the lock is
    /// never handed off to a descheduled task, which keeps the synchronous
    /// close path below free of lock-order deadlocks.
    async fn lock_cooperatively(&self) -> MutexGuard<'_, State<T>> {
        loop {
            if let Some(guard) = self.state.try_lock() {
                return guard;
            }
            crate::time::yield_now().await;
        }
    }

    /// Takes the state lock from synchronous code (drop paths). Bounded by
    /// another worker finishing its critical section, per the invariant
    /// that the lock is never held across a suspension point.
    fn lock_sync(&self) -> MutexGuard<'_, State<T>> {
        loop {
            if let Some(guard) = self.state.try_lock() {
                return guard;
            }
            std::hint::spin_loop();
        }
    }

    /// Closes the channel, failing every parked sender and receiver.
    /// Buffered values stay receivable.
    fn close(&self) {
        let mut state = self.lock_sync();
        if state.closed {
            return;
        }
        state.closed = true;
        for waiter in state.send_waiters.drain(..) {
            waiter.node.grant();
        }
        for waiter in state.recv_waiters.drain(..) {
            waiter.node.grant();
        }
    }

    async fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut state = self.lock_cooperatively().await;
        if state.closed {
            return Err(SendError(value));
        }

        // A parked receiver takes the value directly.
        let mut value = value;
        while let Some(waiter) = state.recv_waiters.pop_front() {
            *waiter.slot.lock() = Some(value);
            if waiter.node.grant() {
                return Ok(());
            }
            // Receiver cancelled between parking and handoff; take the
            // value back and try the next one.
            value = waiter.slot.lock().take().expect("handoff slot emptied");
        }

        if state.buffer.len() < self.capacity {
            state.buffer.push_back(value);
            return Ok(());
        }

        // Buffer full (or rendezvous): park until a receiver drains us.
        let waiter = Arc::new(SendWaiter {
            node: WaitNode::new(),
            value: parking_lot::Mutex::new(Some(value)),
        });
        state.send_waiters.push_back(waiter.clone());
        drop(state);

        SendWait {
            waiter,
            done: false,
        }
        .await
    }

    async fn recv(&self) -> Result<T, ChannelClosed> {
        let mut state = self.lock_cooperatively().await;

        // Buffered values drain before a closed channel reports failure.
        if let Some(value) = state.buffer.pop_front() {
            // A freed slot unparks the oldest sender into the buffer.
            while let Some(waiter) = state.send_waiters.pop_front() {
                if waiter.node.is_cancelled() {
                    continue;
                }
                if let Some(v) = waiter.value.lock().take() {
                    state.buffer.push_back(v);
                    waiter.node.grant();
                    break;
                }
            }
            return Ok(value);
        }

        // Empty buffer: take directly from a parked sender (rendezvous).
        while let Some(waiter) = state.send_waiters.pop_front() {
            if waiter.node.is_cancelled() {
                continue;
            }
            if let Some(value) = waiter.value.lock().take() {
                waiter.node.grant();
                return Ok(value);
            }
        }

        if state.closed {
            return Err(ChannelClosed);
        }

        let waiter = Arc::new(RecvWaiter {
            node: WaitNode::new(),
            slot: parking_lot::Mutex::new(None),
        });
        state.recv_waiters.push_back(waiter.clone());
        drop(state);

        RecvWait {
            chan: self,
            waiter,
            done: false,
        }
        .await
    }

    /// Puts back a value whose receiver cancelled after the grant. It goes
    /// to another parked receiver if one exists, else to the front of the
    /// buffer since it was logically delivered first. The buffer may exceed
    /// capacity by one until the next receive drains it.
    fn requeue(&self, mut value: T) {
        let mut state = self.lock_sync();
        while let Some(waiter) = state.recv_waiters.pop_front() {
            *waiter.slot.lock() = Some(value);
            if waiter.node.grant() {
                return;
            }
            value = waiter.slot.lock().take().expect("handoff slot emptied");
        }
        state.buffer.push_front(value);
    }
}

struct SendWait<T> {
    waiter: Arc<SendWaiter<T>>,
    done: bool,
}

impl<T> std::future::Future for SendWait<T> {
    type Output = Result<(), SendError<T>>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.waiter.node.register(cx.waker());
        if !self.waiter.node.is_granted() {
            return std::task::Poll::Pending;
        }
        self.done = true;
        // Value gone means it was delivered; still present means the
        // channel closed under us.
        match self.waiter.value.lock().take() {
            None => std::task::Poll::Ready(Ok(())),
            Some(value) => std::task::Poll::Ready(Err(SendError(value))),
        }
    }
}

impl<T> Drop for SendWait<T> {
    fn drop(&mut self) {
        if !self.done {
            // If a receiver granted us concurrently it already took the
            // value; the send then counts as delivered.
            self.waiter.node.cancel();
        }
    }
}

struct RecvWait<'a, T: Send> {
    chan: &'a Chan<T>,
    waiter: Arc<RecvWaiter<T>>,
    done: bool,
}

impl<T: Send> std::future::Future for RecvWait<'_, T> {
    type Output = Result<T, ChannelClosed>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.waiter.node.register(cx.waker());
        if !self.waiter.node.is_granted() {
            return std::task::Poll::Pending;
        }
        self.done = true;
        match self.waiter.slot.lock().take() {
            Some(value) => std::task::Poll::Ready(Ok(value)),
            None => std::task::Poll::Ready(Err(ChannelClosed)),
        }
    }
}

impl<T: Send> Drop for RecvWait<'_, T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.waiter.node.cancel() == GRANTED {
            // A sender already handed us a value; put it back so the
            // delivery it observed is not lost.
            if let Some(value) = self.waiter.slot.lock().take() {
                self.chan.requeue(value);
            }
        }
    }
}

/// Sending half. Cloneable; the channel closes when the last sender or the
/// last receiver drops.
pub struct Sender<T: Send> {
    chan: Arc<Chan<T>>,
}

impl<T: Send> Sender<T> {
    /// Sends a value, suspending while the buffer is full. Fails once the
    /// channel is closed, handing the value back.
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.chan.send(value).await
    }
}

impl<T: Send> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            chan: self.chan.clone(),
        }
    }
}

impl<T: Send> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.chan.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.chan.close();
        }
    }
}

/// Receiving half. Cloneable; each value is delivered to exactly one
/// receiver.
pub struct Receiver<T: Send> {
    chan: Arc<Chan<T>>,
}

impl<T: Send> Receiver<T> {
    /// Receives the next value, suspending while the channel is empty.
    /// After close, drains remaining buffered values before failing.
    pub async fn recv(&self) -> Result<T, ChannelClosed> {
        self.chan.recv().await
    }
}

impl<T: Send> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.chan.receivers.fetch_add(1, Ordering::Relaxed);
        Self {
            chan: self.chan.clone(),
        }
    }
}

impl<T: Send> Drop for Receiver<T> {
    fn drop(&mut self) {
        if self.chan.receivers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.chan.close();
        }
    }
}
