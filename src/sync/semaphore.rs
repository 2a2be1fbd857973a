use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use super::waiter::{WaitNode, WaitQueue, GRANTED};

/// An asynchronous counting semaphore.
///
/// `permits` counts available permits while non-negative; a negative value
/// counts parked waiters. A waiter publishes its node before decrementing,
/// so a concurrent release observing the debt always finds the node.
pub struct Semaphore {
    permits: AtomicIsize,
    waiters: WaitQueue,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: AtomicIsize::new(permits as isize),
            waiters: WaitQueue::new(),
        }
    }

    /// Acquires one permit, suspending while none is available. The permit
    /// is returned to the semaphore when the guard drops.
    pub fn acquire(&self) -> Acquire<'_> {
        Acquire {
            semaphore: self,
            node: None,
        }
    }

    /// Acquires one permit only if one is available right now.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut permits = self.permits.load(Ordering::Relaxed);
        while permits > 0 {
            match self.permits.compare_exchange(
                permits,
                permits - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(SemaphorePermit { semaphore: self }),
                Err(actual) => permits = actual,
            }
        }
        None
    }

    /// Returns `n` permits, waking one parked waiter per permit that pays
    /// off a debt.
    pub fn release(&self, n: usize) {
        for _ in 0..n {
            let prev = self.permits.fetch_add(1, Ordering::AcqRel);
            if prev < 0 {
                self.waiters.grant_one();
            }
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.load(Ordering::Acquire).max(0) as usize
    }

    /// Undoes a waiter's decrement without handing a permit to anyone; used
    /// when the waiter withdraws rather than returns a real permit.
    fn forget_waiter(&self) {
        self.permits.fetch_add(1, Ordering::AcqRel);
    }
}

/// Future returned by [`Semaphore::acquire`].
pub struct Acquire<'a> {
    semaphore: &'a Semaphore,
    node: Option<Arc<WaitNode>>,
}

impl<'a> Future for Acquire<'a> {
    type Output = SemaphorePermit<'a>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let semaphore = this.semaphore;

        if let Some(node) = &this.node {
            node.register(cx.waker());
            if node.is_granted() {
                this.node = None;
                return Poll::Ready(SemaphorePermit { semaphore });
            }
            return Poll::Pending;
        }

        if let Some(permit) = semaphore.try_acquire() {
            return Poll::Ready(permit);
        }

        // Publish the node first so a release cannot miss us, then record
        // the debt.
        let node = WaitNode::new();
        node.register(cx.waker());
        semaphore.waiters.push(&node);
        let prev = semaphore.permits.fetch_sub(1, Ordering::AcqRel);
        if prev > 0 {
            // A permit freed up between the fast path and the decrement; we
            // just took it, so withdraw the queued node.
            if node.cancel() == GRANTED {
                // A release granted us a second permit in the meantime;
                // give it back.
                semaphore.release(1);
            }
            return Poll::Ready(SemaphorePermit { semaphore });
        }

        this.node = Some(node);
        Poll::Pending
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            if node.cancel() == GRANTED {
                // Granted after we stopped waiting: return the real permit.
                self.semaphore.release(1);
            } else {
                self.semaphore.forget_waiter();
            }
        }
    }
}

/// Permit held while working inside the semaphore's limit.
#[must_use]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl SemaphorePermit<'_> {
    /// Leaks the permit, permanently shrinking the semaphore's capacity.
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_respects_capacity() {
        let sem = Semaphore::new(2);
        let a = sem.try_acquire().unwrap();
        let b = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());
        drop(a);
        assert!(sem.try_acquire().is_some());
        drop(b);
    }

    #[test]
    fn forget_shrinks_capacity() {
        let sem = Semaphore::new(1);
        sem.try_acquire().unwrap().forget();
        assert!(sem.try_acquire().is_none());
        sem.release(1);
        assert_eq!(sem.available_permits(), 1);
    }
}
