use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::Instant;

use futures::task::AtomicWaker;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

struct TimerState {
    state: AtomicU8,
    waker: AtomicWaker,
}

/// Handle to a registered timer entry. Cancellation is lazy: the entry is
/// marked and skipped when the worker reaches it.
#[derive(Clone)]
pub(crate) struct TimerHandle {
    state: Arc<TimerState>,
}

impl TimerHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(TimerState {
                state: AtomicU8::new(PENDING),
                waker: AtomicWaker::new(),
            }),
        }
    }

    pub(crate) fn register(&self, waker: &Waker) {
        self.state.waker.register(waker);
    }

    pub(crate) fn is_elapsed(&self) -> bool {
        self.state.state.load(Ordering::Acquire) == FIRED
    }

    /// Marks the entry cancelled unless it already fired.
    pub(crate) fn cancel(&self) {
        let _ = self.state.state.compare_exchange(
            PENDING,
            CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Fires the entry. Returns false if it was cancelled first.
    fn fire(&self) -> bool {
        if self
            .state
            .state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.state.waker.wake();
            return true;
        }
        false
    }
}

enum Entry {
    /// Wakes a suspended future at the deadline.
    Wake(TimerHandle),
    /// Pushes a cancellation for an in-flight ring operation at the
    /// deadline. Skipped when the operation completed first.
    CancelOp { handle: TimerHandle, key: usize },
}

impl Entry {
    fn handle(&self) -> &TimerHandle {
        match self {
            Entry::Wake(handle) => handle,
            Entry::CancelOp { handle, .. } => handle,
        }
    }
}

/// Per-worker timer set, ordered by deadline. The sequence number breaks
/// ties between entries sharing an instant.
pub(crate) struct Timer {
    entries: BTreeMap<(Instant, u64), Entry>,
    next_seq: u64,
}

impl Timer {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn insert_entry(&mut self, deadline: Instant, entry: Entry) -> TimerHandle {
        let handle = entry.handle().clone();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), entry);
        handle
    }

    pub(crate) fn insert(&mut self, deadline: Instant) -> TimerHandle {
        self.insert_entry(deadline, Entry::Wake(TimerHandle::new()))
    }

    pub(crate) fn insert_cancel(&mut self, deadline: Instant, key: usize) -> TimerHandle {
        self.insert_entry(
            deadline,
            Entry::CancelOp {
                handle: TimerHandle::new(),
                key,
            },
        )
    }

    /// Earliest live deadline, pruning cancelled entries from the front.
    pub(crate) fn next_expiry(&mut self) -> Option<Instant> {
        while let Some((&(deadline, seq), entry)) = self.entries.first_key_value() {
            if entry.handle().state.state.load(Ordering::Acquire) == CANCELLED {
                self.entries.remove(&(deadline, seq));
                continue;
            }
            return Some(deadline);
        }
        None
    }

    /// Fires every entry whose deadline has passed, in deadline order.
    pub(crate) fn process_expired(
        &mut self,
        now: Instant,
        driver: &mut crate::driver::Driver,
    ) -> usize {
        let mut fired = 0;
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            match entry.remove() {
                Entry::Wake(handle) => {
                    if handle.fire() {
                        fired += 1;
                    }
                }
                Entry::CancelOp { handle, key } => {
                    if handle.fire() {
                        driver.push_cancel(key);
                        fired += 1;
                    }
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn expiry_skips_cancelled_entries() {
        let mut timer = Timer::new();
        let now = Instant::now();
        let early = timer.insert(now + Duration::from_millis(1));
        let late = timer.insert(now + Duration::from_millis(5));

        early.cancel();
        assert_eq!(
            timer.next_expiry(),
            Some(now + Duration::from_millis(5))
        );
        assert!(!early.is_elapsed());
        drop(late);
    }

    #[test]
    fn ties_preserve_insertion_order() {
        let mut timer = Timer::new();
        let at = Instant::now();
        let first = timer.insert(at);
        let second = timer.insert(at);
        assert!(!first.is_elapsed() && !second.is_elapsed());
        assert_eq!(timer.next_expiry(), Some(at));
    }
}
