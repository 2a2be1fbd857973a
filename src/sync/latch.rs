use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use super::waiter::{WaitNode, WaitStack};

/// A single-use countdown barrier.
///
/// The count starts at `n` and only decreases. Every waiter suspends until
/// the count reaches zero; the count-down that lands exactly on zero wakes
/// them all in one sweep. The latch cannot be reset.
pub struct Latch {
    count: AtomicIsize,
    waiters: WaitStack,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicIsize::new(count as isize),
            waiters: WaitStack::new(),
        }
    }

    /// Decrements the count by `n`. The call that reaches zero releases
    /// every waiter, current and future.
    pub fn count_down(&self, n: usize) {
        let n = n as isize;
        let prev = self.count.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "latch counted down past zero");
        if prev == n {
            for node in self.waiters.take_reversed() {
                node.grant();
            }
        }
    }

    /// Returns true once the count has reached zero.
    pub fn try_wait(&self) -> bool {
        self.count.load(Ordering::Acquire) <= 0
    }

    /// Suspends until the count reaches zero. Returns immediately if it
    /// already has.
    pub fn wait(&self) -> LatchWait<'_> {
        LatchWait {
            latch: self,
            node: None,
        }
    }

    /// Decrements by one and waits for the rest.
    pub async fn arrive_and_wait(&self) {
        self.count_down(1);
        self.wait().await;
    }
}

/// Future returned by [`Latch::wait`].
pub struct LatchWait<'a> {
    latch: &'a Latch,
    node: Option<Arc<WaitNode>>,
}

impl Future for LatchWait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        match &this.node {
            None => {
                if this.latch.try_wait() {
                    return Poll::Ready(());
                }
                let node = WaitNode::new();
                node.register(cx.waker());
                this.latch.waiters.push(&node);
                this.node = Some(node);
                // The final count-down may have drained the stack between
                // the check and the push; the node is then stranded but the
                // count says we are done.
                if this.latch.try_wait() {
                    return Poll::Ready(());
                }
                Poll::Pending
            }
            Some(node) => {
                node.register(cx.waker());
                if node.is_granted() || this.latch.try_wait() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for LatchWait<'_> {
    fn drop(&mut self) {
        if let Some(node) = &self.node {
            node.cancel();
        }
    }
}
