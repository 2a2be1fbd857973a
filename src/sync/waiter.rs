//! Waiter nodes shared by the suspension-based primitives.
//!
//! A suspended task is represented by a reference-counted node holding its
//! waker. Nodes are published through a lock-free LIFO stack; whoever hands
//! out a resource drains the stack once, reversing it into FIFO order, so
//! grants happen in arrival order without a lock on the wait path.

use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::Waker;

use futures::task::AtomicWaker;
use parking_lot::Mutex;

pub(crate) const WAITING: u8 = 0;
pub(crate) const GRANTED: u8 = 1;
pub(crate) const CANCELLED: u8 = 2;

pub(crate) struct WaitNode {
    state: AtomicU8,
    waker: AtomicWaker,
    /// Intrusive link, valid only while the node sits in a stack.
    next: AtomicPtr<WaitNode>,
}

impl WaitNode {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(WAITING),
            waker: AtomicWaker::new(),
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    pub(crate) fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    /// Hands the resource to this waiter. Returns false if it cancelled
    /// first, in which case the grantor must pick another waiter.
    pub(crate) fn grant(&self) -> bool {
        if self
            .state
            .compare_exchange(WAITING, GRANTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.waker.wake();
            return true;
        }
        false
    }

    pub(crate) fn is_granted(&self) -> bool {
        self.state.load(Ordering::Acquire) == GRANTED
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Marks the node cancelled, returning the previous state. A `GRANTED`
    /// return means a grant raced in first and the caller now owns the
    /// resource and must dispose of it.
    pub(crate) fn cancel(&self) -> u8 {
        self.state.swap(CANCELLED, Ordering::AcqRel)
    }

    /// Raw link accessors for primitives that maintain their own lists.
    pub(crate) fn next_ptr(&self) -> *const WaitNode {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next_ptr(&self, next: *const WaitNode) {
        self.next.store(next as *mut WaitNode, Ordering::Relaxed);
    }
}

/// Lock-free LIFO stack of waiter nodes.
pub(crate) struct WaitStack {
    head: AtomicPtr<WaitNode>,
}

impl WaitStack {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publishes a node; the stack holds one strong reference until drained.
    pub(crate) fn push(&self, node: &Arc<WaitNode>) {
        let raw = Arc::into_raw(node.clone()) as *mut WaitNode;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*raw).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Detaches the whole stack and returns the nodes oldest-first.
    pub(crate) fn take_reversed(&self) -> VecDeque<Arc<WaitNode>> {
        let mut raw = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut nodes = VecDeque::new();
        while !raw.is_null() {
            // Safety: we own the detached list; each pointer came from
            // Arc::into_raw in push.
            let next = unsafe { (*raw).next.load(Ordering::Relaxed) };
            nodes.push_front(unsafe { Arc::from_raw(raw) });
            raw = next;
        }
        nodes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Drop for WaitStack {
    fn drop(&mut self) {
        drop(self.take_reversed());
    }
}

/// FIFO wait queue: a LIFO publication stack plus a drain cache holding the
/// reversed remainder, so concurrent grantors keep arrival order.
pub(crate) struct WaitQueue {
    stack: WaitStack,
    drained: Mutex<VecDeque<Arc<WaitNode>>>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            stack: WaitStack::new(),
            drained: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, node: &Arc<WaitNode>) {
        self.stack.push(node);
    }

    /// Grants the oldest live waiter. Returns false when no waiter is left.
    pub(crate) fn grant_one(&self) -> bool {
        loop {
            let node = {
                let mut drained = self.drained.lock();
                if drained.is_empty() {
                    drained.extend(self.stack.take_reversed());
                }
                drained.pop_front()
            };
            match node {
                Some(node) => {
                    if node.grant() {
                        return true;
                    }
                    // Cancelled; try the next one.
                }
                None => return false,
            }
        }
    }

    /// Grants every waiter registered so far.
    pub(crate) fn grant_all(&self) {
        let mut drained = self.drained.lock();
        drained.extend(self.stack.take_reversed());
        for node in drained.drain(..) {
            node.grant();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_restores_arrival_order() {
        let stack = WaitStack::new();
        let nodes: Vec<_> = (0..4).map(|_| WaitNode::new()).collect();
        for node in &nodes {
            stack.push(node);
        }
        let drained = stack.take_reversed();
        assert_eq!(drained.len(), 4);
        for (drained, original) in drained.iter().zip(&nodes) {
            assert!(Arc::ptr_eq(drained, original));
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn grant_one_skips_cancelled_waiters() {
        let queue = WaitQueue::new();
        let first = WaitNode::new();
        let second = WaitNode::new();
        queue.push(&first);
        queue.push(&second);

        assert_eq!(first.cancel(), WAITING);
        assert!(queue.grant_one());
        assert!(!first.is_granted());
        assert!(second.is_granted());
        assert!(!queue.grant_one());
    }

    #[test]
    fn cancel_after_grant_reports_the_grant() {
        let node = WaitNode::new();
        assert!(node.grant());
        assert_eq!(node.cancel(), GRANTED);
        // A second grant must fail either way.
        assert!(!node.grant());
    }
}
