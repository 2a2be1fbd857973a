use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use super::waiter::{WaitNode, GRANTED};

/// Sentinel address distinguishing the unlocked state from a waiter list.
/// The lock word is null when held with no waiters, this sentinel when free,
/// and otherwise the head of a LIFO list of waiters.
static UNLOCKED: u8 = 0;

fn unlocked() -> *mut WaitNode {
    &UNLOCKED as *const u8 as *mut WaitNode
}

/// An asynchronous mutual exclusion lock.
///
/// Contended acquisition suspends the task instead of blocking the worker.
/// Release hands the lock directly to the longest-waiting task, so grants
/// are strictly first-come-first-served and a stream of fresh acquirers
/// cannot barge past parked waiters.
pub struct Mutex<T: ?Sized> {
    state: AtomicPtr<WaitNode>,
    /// Waiters already drained into FIFO order. Only the lock holder
    /// touches this, during unlock.
    handoff: UnsafeCell<std::collections::VecDeque<Arc<WaitNode>>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: AtomicPtr::new(unlocked()),
            handoff: UnsafeCell::new(std::collections::VecDeque::new()),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, suspending until it is granted.
    pub fn lock(&self) -> Lock<'_, T> {
        Lock {
            mutex: self,
            node: None,
        }
    }

    /// Acquires the lock if it is free right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .state
            .compare_exchange(
                unlocked(),
                std::ptr::null_mut(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return Some(MutexGuard { mutex: self });
        }
        None
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Releases the lock, handing it to the oldest waiter if any.
    /// Must only be called while holding the lock.
    fn unlock(&self) {
        loop {
            // Safety: only the holder touches the handoff cache, and we are
            // the holder until a grant succeeds or the state goes unlocked.
            let next = unsafe { (*self.handoff.get()).pop_front() };
            if let Some(node) = next {
                if node.grant() {
                    // Ownership moved to the granted waiter; the lock word
                    // is untouched and stays "held".
                    return;
                }
                // Waiter cancelled between parking and handoff.
                continue;
            }

            let mut state = self.state.load(Ordering::Relaxed);
            loop {
                debug_assert!(state != unlocked(), "unlock of unlocked mutex");
                if state.is_null() {
                    // No waiters: release for real.
                    match self.state.compare_exchange(
                        state,
                        unlocked(),
                        Ordering::Release,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return,
                        Err(actual) => state = actual,
                    }
                } else {
                    // Detach the waiter list, leaving "held, no waiters",
                    // and reverse it into the FIFO cache.
                    let mut raw =
                        self.state.swap(std::ptr::null_mut(), Ordering::Acquire) as *const WaitNode;
                    unsafe {
                        let handoff = &mut *self.handoff.get();
                        while !raw.is_null() {
                            let next = (*raw).next_ptr();
                            handoff.push_front(Arc::from_raw(raw));
                            raw = next;
                        }
                    }
                    break;
                }
            }
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

/// Future returned by [`Mutex::lock`].
pub struct Lock<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    node: Option<Arc<WaitNode>>,
}

impl<'a, T: ?Sized> Future for Lock<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Some(node) = &this.node {
            node.register(cx.waker());
            if node.is_granted() {
                // Consume the grant so Drop does not pass the lock on.
                this.node = None;
                return Poll::Ready(MutexGuard { mutex: this.mutex });
            }
            return Poll::Pending;
        }

        let mut state = this.mutex.state.load(Ordering::Relaxed);
        let mut raw: *mut WaitNode = std::ptr::null_mut();
        loop {
            if state == unlocked() {
                match this.mutex.state.compare_exchange(
                    state,
                    std::ptr::null_mut(),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        if !raw.is_null() {
                            // Queued node never published; reclaim it.
                            drop(unsafe { Arc::from_raw(raw) });
                            this.node = None;
                        }
                        return Poll::Ready(MutexGuard { mutex: this.mutex });
                    }
                    Err(actual) => state = actual,
                }
            } else {
                if raw.is_null() {
                    let node = WaitNode::new();
                    node.register(cx.waker());
                    raw = Arc::into_raw(node.clone()) as *mut WaitNode;
                    this.node = Some(node);
                }
                unsafe { (*raw).set_next_ptr(state as *const WaitNode) };
                match this.mutex.state.compare_exchange(
                    state,
                    raw,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Poll::Pending,
                    Err(actual) => state = actual,
                }
            }
        }
    }
}

impl<T: ?Sized> Drop for Lock<'_, T> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            if node.cancel() == GRANTED {
                // The lock was handed to us after we stopped waiting; pass
                // it along instead of leaking a held lock.
                self.mutex.unlock();
            }
        }
    }
}

/// RAII guard; the lock is released (or handed off) on drop.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(super) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

unsafe impl<T: ?Sized + Send> Send for MutexGuard<'_, T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for MutexGuard<'_, T> {}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Mutex<usize>: Send, Sync);
    assert_impl_all!(MutexGuard<'static, usize>: Send, Sync);

    #[test]
    fn try_lock_excludes() {
        let mutex = Mutex::new(1);
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert_eq!(*mutex.try_lock().unwrap(), 1);
    }

    #[test]
    fn into_inner_returns_data() {
        let mutex = Mutex::new(vec![1, 2]);
        assert_eq!(mutex.into_inner(), vec![1, 2]);
    }
}
