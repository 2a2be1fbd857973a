use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::task::Task;

pub(crate) const LOCAL_QUEUE_CAPACITY: usize = 256;
const MASK: u32 = LOCAL_QUEUE_CAPACITY as u32 - 1;

/// Fixed-capacity single-producer work queue with lock-free stealing.
///
/// The owning worker pushes and pops; other workers may steal up to half of
/// the entries at a time. `head` packs two `u32` indices into one word:
/// `steal` (high half) marks the start of a range currently being copied out
/// by a stealer, `real` (low half) is the logical head. While no steal is in
/// flight the two halves are equal.
pub(crate) struct LocalQueue {
    head: AtomicU64,
    /// Written only by the owning worker.
    tail: AtomicU32,
    buffer: Box<[UnsafeCell<MaybeUninit<Task>>]>,
}

unsafe impl Send for LocalQueue {}
unsafe impl Sync for LocalQueue {}

fn pack(steal: u32, real: u32) -> u64 {
    ((steal as u64) << 32) | real as u64
}

fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

impl LocalQueue {
    pub(crate) fn new() -> Self {
        let buffer = (0..LOCAL_QUEUE_CAPACITY)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            head: AtomicU64::new(0),
            tail: AtomicU32::new(0),
            buffer,
        }
    }

    pub(crate) fn len(&self) -> u32 {
        let (_, real) = unpack(self.head.load(Ordering::Acquire));
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(real)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn remaining_slots(&self) -> usize {
        let (steal, _) = unpack(self.head.load(Ordering::Acquire));
        let tail = self.tail.load(Ordering::Acquire);
        LOCAL_QUEUE_CAPACITY - tail.wrapping_sub(steal) as usize
    }

    /// Safety: slot must hold an initialized task that no other thread will
    /// read, per the head/tail protocol.
    unsafe fn read_slot(&self, idx: u32) -> Task {
        (*self.buffer[(idx & MASK) as usize].get()).assume_init_read()
    }

    unsafe fn write_slot(&self, idx: u32, task: Task) {
        (*self.buffer[(idx & MASK) as usize].get()).write(task);
    }

    /// Pushes a task, spilling half the queue to `global` when full.
    /// Owner only.
    pub(crate) fn push_back_or_overflow(&self, mut task: Task, global: &GlobalQueue) {
        let tail = loop {
            let head = self.head.load(Ordering::Acquire);
            let (steal, real) = unpack(head);
            let tail = self.tail.load(Ordering::Relaxed);

            if tail.wrapping_sub(steal) < LOCAL_QUEUE_CAPACITY as u32 {
                break tail;
            }
            if steal != real {
                // Queue is full but a stealer is mid-copy and will free
                // slots; hand this one task to the global queue instead.
                global.push(task);
                return;
            }
            match self.push_overflow(task, real, tail, global) {
                Ok(()) => return,
                // Lost the head race to a stealer, retry.
                Err(t) => task = t,
            }
        };

        unsafe { self.write_slot(tail, task) };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
    }

    /// Moves the older half of the queue plus `task` to the global queue.
    fn push_overflow(
        &self,
        task: Task,
        head: u32,
        tail: u32,
        global: &GlobalQueue,
    ) -> Result<(), Task> {
        const BATCH: u32 = LOCAL_QUEUE_CAPACITY as u32 / 2;
        debug_assert_eq!(tail.wrapping_sub(head), LOCAL_QUEUE_CAPACITY as u32);

        let claimed = head.wrapping_add(BATCH);
        if self
            .head
            .compare_exchange(
                pack(head, head),
                pack(claimed, claimed),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return Err(task);
        }

        let mut batch = VecDeque::with_capacity(BATCH as usize + 1);
        for i in 0..BATCH {
            batch.push_back(unsafe { self.read_slot(head.wrapping_add(i)) });
        }
        batch.push_back(task);
        global.push_batch(batch);
        Ok(())
    }

    /// Pushes a batch of tasks. Owner only; the caller must have checked
    /// `remaining_slots`.
    pub(crate) fn push_batch(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut tail = self.tail.load(Ordering::Relaxed);
        for task in tasks {
            let (steal, _) = unpack(self.head.load(Ordering::Acquire));
            assert!(
                tail.wrapping_sub(steal) < LOCAL_QUEUE_CAPACITY as u32,
                "push_batch overflowed the local queue"
            );
            unsafe { self.write_slot(tail, task) };
            tail = tail.wrapping_add(1);
        }
        self.tail.store(tail, Ordering::Release);
    }

    /// Pops from the head. Owner only, but races with stealers on `head`.
    pub(crate) fn pop(&self) -> Option<Task> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (steal, real) = unpack(head);
            let tail = self.tail.load(Ordering::Relaxed);
            if real == tail {
                return None;
            }

            let next_real = real.wrapping_add(1);
            let next = if steal == real {
                pack(next_real, next_real)
            } else {
                pack(steal, next_real)
            };
            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(unsafe { self.read_slot(real) }),
                Err(actual) => head = actual,
            }
        }
    }

    /// Steals roughly half of this queue into `dst`, returning the last
    /// stolen task for the thief to run directly. Fails when `dst` is more
    /// than half full or this queue is already being stolen from.
    pub(crate) fn steal_into(&self, dst: &LocalQueue) -> Option<Task> {
        let (dst_steal, _) = unpack(dst.head.load(Ordering::Acquire));
        let dst_tail = dst.tail.load(Ordering::Relaxed);
        if dst_tail.wrapping_sub(dst_steal) > LOCAL_QUEUE_CAPACITY as u32 / 2 {
            return None;
        }

        let mut n = self.steal_half(dst, dst_tail);
        if n == 0 {
            return None;
        }

        n -= 1;
        let task = unsafe { dst.read_slot(dst_tail.wrapping_add(n)) };
        if n > 0 {
            dst.tail.store(dst_tail.wrapping_add(n), Ordering::Release);
        }
        Some(task)
    }

    /// Reserves half of the queue by advancing `real` while leaving `steal`
    /// behind, copies the range into `dst`, then publishes `steal = real`.
    fn steal_half(&self, dst: &LocalQueue, dst_tail: u32) -> u32 {
        let mut prev = self.head.load(Ordering::Acquire);
        let (n, next) = loop {
            let (steal, real) = unpack(prev);
            if steal != real {
                // Another thief is mid-copy.
                return 0;
            }

            let tail = self.tail.load(Ordering::Acquire);
            let len = tail.wrapping_sub(real);
            let n = len - len / 2;
            if n == 0 {
                return 0;
            }

            let next = pack(steal, real.wrapping_add(n));
            match self
                .head
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break (n, next),
                Err(actual) => prev = actual,
            }
        };

        let (first, _) = unpack(next);
        for i in 0..n {
            let task = unsafe { self.read_slot(first.wrapping_add(i)) };
            unsafe { dst.write_slot(dst_tail.wrapping_add(i), task) };
        }

        // Release the reserved range.
        let mut prev = next;
        loop {
            let (_, real) = unpack(prev);
            match self.head.compare_exchange(
                prev,
                pack(real, real),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return n,
                Err(actual) => prev = actual,
            }
        }
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

/// Unbounded shared injection queue. `len` mirrors the deque length so hot
/// paths can check emptiness without taking the lock.
pub(crate) struct GlobalQueue {
    inner: Mutex<GlobalInner>,
    len: AtomicUsize,
}

struct GlobalInner {
    tasks: VecDeque<Task>,
    closed: bool,
}

impl GlobalQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(GlobalInner {
                tasks: VecDeque::new(),
                closed: false,
            }),
            len: AtomicUsize::new(0),
        }
    }

    /// Returns false if the queue is closed; the task is dropped.
    pub(crate) fn push(&self, task: Task) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.tasks.push_back(task);
        self.len.fetch_add(1, Ordering::Release);
        true
    }

    pub(crate) fn push_batch(&self, tasks: VecDeque<Task>) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let n = tasks.len();
        inner.tasks.extend(tasks);
        self.len.fetch_add(n, Ordering::Release);
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        if self.is_empty() {
            return None;
        }
        let mut inner = self.inner.lock();
        let task = inner.tasks.pop_front();
        if task.is_some() {
            self.len.fetch_sub(1, Ordering::Release);
        }
        task
    }

    /// Pops up to `n` tasks in one lock acquisition.
    pub(crate) fn pop_n(&self, n: usize) -> VecDeque<Task> {
        let mut inner = self.inner.lock();
        let n = n.min(inner.tasks.len());
        let batch = inner.tasks.drain(..n).collect();
        self.len.fetch_sub(n, Ordering::Release);
        batch
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue. Returns true for the first caller only, so shutdown
    /// runs once even when racing workers observe it together.
    pub(crate) fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::runtime::{Builder, Shared};

    fn test_shared() -> Arc<Shared> {
        Shared::try_new(Builder::new().worker_threads(2).into_config()).unwrap()
    }

    fn stub_tasks(shared: &Arc<Shared>, n: usize) -> Vec<Task> {
        (0..n).map(|_| Task::stub(shared.clone())).collect()
    }

    #[test]
    fn local_push_pop_fifo() {
        let shared = test_shared();
        let queue = LocalQueue::new();
        let global = GlobalQueue::new();

        let tasks = stub_tasks(&shared, 10);
        let ids: Vec<_> = tasks.iter().map(|t| t.id()).collect();
        for task in tasks {
            queue.push_back_or_overflow(task, &global);
        }
        assert_eq!(queue.len(), 10);

        let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|t| t.id()).collect();
        assert_eq!(popped, ids);
        assert!(queue.is_empty());
        assert!(global.is_empty());
    }

    #[test]
    fn overflow_spills_half_to_global() {
        let shared = test_shared();
        let queue = LocalQueue::new();
        let global = GlobalQueue::new();

        for task in stub_tasks(&shared, LOCAL_QUEUE_CAPACITY + 1) {
            queue.push_back_or_overflow(task, &global);
        }

        // Half the queue plus the overflowing task moved out.
        assert_eq!(global.len(), LOCAL_QUEUE_CAPACITY / 2 + 1);
        assert_eq!(queue.len() as usize, LOCAL_QUEUE_CAPACITY / 2);

        let mut total = global.len();
        while queue.pop().is_some() {
            total += 1;
        }
        assert_eq!(total, LOCAL_QUEUE_CAPACITY + 1);
    }

    #[test]
    fn steal_takes_half_and_returns_one() {
        let shared = test_shared();
        let victim = LocalQueue::new();
        let thief = LocalQueue::new();
        let global = GlobalQueue::new();

        for task in stub_tasks(&shared, 8) {
            victim.push_back_or_overflow(task, &global);
        }

        let stolen = victim.steal_into(&thief).unwrap();
        drop(stolen);
        // 4 reserved, one handed back directly.
        assert_eq!(thief.len(), 3);
        assert_eq!(victim.len(), 4);
    }

    #[test]
    fn steal_respects_destination_occupancy() {
        let shared = test_shared();
        let victim = LocalQueue::new();
        let thief = LocalQueue::new();
        let global = GlobalQueue::new();

        for task in stub_tasks(&shared, LOCAL_QUEUE_CAPACITY / 2 + 1) {
            thief.push_back_or_overflow(task, &global);
        }
        for task in stub_tasks(&shared, 4) {
            victim.push_back_or_overflow(task, &global);
        }
        assert!(victim.steal_into(&thief).is_none());
        assert_eq!(victim.len(), 4);
    }

    #[test]
    fn concurrent_steal_conserves_tasks() {
        let shared = test_shared();
        let victim = Arc::new(LocalQueue::new());
        let global = Arc::new(GlobalQueue::new());
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let tasks = stub_tasks(&shared, LOCAL_QUEUE_CAPACITY);
        let expected: HashSet<_> = tasks.iter().map(|t| t.id()).collect();
        for task in tasks {
            victim.push_back_or_overflow(task, &global);
        }

        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let victim = victim.clone();
                let seen = seen.clone();
                std::thread::spawn(move || {
                    let local = LocalQueue::new();
                    loop {
                        match victim.steal_into(&local) {
                            Some(task) => {
                                seen.lock().insert(task.id());
                                while let Some(t) = local.pop() {
                                    seen.lock().insert(t.id());
                                }
                            }
                            None if victim.is_empty() => break,
                            None => std::hint::spin_loop(),
                        }
                    }
                })
            })
            .collect();

        while let Some(task) = victim.pop() {
            seen.lock().insert(task.id());
        }
        for handle in thieves {
            handle.join().unwrap();
        }

        assert_eq!(*seen.lock(), expected);
    }

    #[test]
    fn global_close_is_idempotent_and_drops_pushes() {
        let shared = test_shared();
        let global = GlobalQueue::new();

        assert!(global.push(Task::stub(shared.clone())));
        assert!(global.close());
        assert!(!global.close());
        assert!(!global.push(Task::stub(shared.clone())));
        // The pre-close task is still drainable.
        assert!(global.pop().is_some());
        assert!(global.pop().is_none());
    }
}
