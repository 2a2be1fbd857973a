use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::mutex::MutexGuard;
use super::waiter::{WaitNode, WaitQueue, GRANTED};

/// An asynchronous condition variable, used together with [`Mutex`].
///
/// [`Mutex`]: super::Mutex
pub struct Condvar {
    waiters: WaitQueue,
}

impl Condvar {
    pub fn new() -> Self {
        Self {
            waiters: WaitQueue::new(),
        }
    }

    /// Wakes the longest-waiting task, if any.
    pub fn notify_one(&self) {
        self.waiters.grant_one();
    }

    /// Wakes every task currently waiting.
    pub fn notify_all(&self) {
        self.waiters.grant_all();
    }

    /// Atomically releases the guard and waits for a notification, then
    /// reacquires the lock. The waiter is registered before the lock is
    /// released, so a notification between release and suspension is never
    /// lost. As with any condition variable, wakeups can be spurious from
    /// the caller's point of view; re-check the condition.
    pub async fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        let node = WaitNode::new();
        self.waiters.push(&node);
        drop(guard);
        Notified {
            condvar: self,
            node,
            done: false,
        }
        .await;
        mutex.lock().await
    }

    /// Waits until `condition` holds, rechecking it after every wakeup.
    pub async fn wait_until<'a, T, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        T: ?Sized,
        F: FnMut(&mut T) -> bool,
    {
        while !condition(&mut guard) {
            guard = self.wait(guard).await;
        }
        guard
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

struct Notified<'a> {
    condvar: &'a Condvar,
    node: Arc<WaitNode>,
    done: bool,
}

impl Future for Notified<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.node.register(cx.waker());
        if self.node.is_granted() {
            self.done = true;
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Notified<'_> {
    fn drop(&mut self) {
        if !self.done && self.node.cancel() == GRANTED {
            // We consumed a notify_one without acting on it; pass it on so
            // another waiter is not left asleep.
            self.condvar.notify_one();
        }
    }
}
