use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Packed counters: number of workers not sleeping in the high bits, number
/// of workers currently searching for work in the low bits.
struct State(AtomicUsize);

const WORKING_SHIFT: usize = 16;
const SEARCHING_MASK: usize = (1 << WORKING_SHIFT) - 1;

impl State {
    fn new(num_workers: usize) -> Self {
        // All workers start out working, none searching.
        Self(AtomicUsize::new(num_workers << WORKING_SHIFT))
    }

    fn num_searching(&self, order: Ordering) -> usize {
        self.0.load(order) & SEARCHING_MASK
    }

    fn num_working(&self, order: Ordering) -> usize {
        self.0.load(order) >> WORKING_SHIFT
    }

    fn inc_num_searching(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true if this was the last searching worker.
    fn dec_num_searching(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::SeqCst);
        (prev & SEARCHING_MASK) == 1
    }

    /// A sleeping worker is brought back as working, optionally already
    /// counted as searching.
    fn inc_num_working(&self, becomes_searching: bool) {
        let delta = (1 << WORKING_SHIFT) + usize::from(becomes_searching);
        self.0.fetch_add(delta, Ordering::SeqCst);
    }

    /// Returns true if this was the last searching worker going to sleep.
    fn dec_num_working(&self, was_searching: bool) -> bool {
        let delta = (1 << WORKING_SHIFT) + usize::from(was_searching);
        let prev = self.0.fetch_sub(delta, Ordering::SeqCst);
        was_searching && (prev & SEARCHING_MASK) == 1
    }
}

/// Tracks which workers are asleep and throttles how many search for work at
/// once, so wakeups are neither lost nor stampeded.
pub(crate) struct Idle {
    state: State,
    num_workers: usize,
    sleepers: Mutex<VecDeque<usize>>,
}

impl Idle {
    pub(crate) fn new(num_workers: usize) -> Self {
        Self {
            state: State::new(num_workers),
            num_workers,
            sleepers: Mutex::new(VecDeque::with_capacity(num_workers)),
        }
    }

    fn notify_should_wakeup(&self) -> bool {
        self.state.num_searching(Ordering::SeqCst) == 0
            && self.state.num_working(Ordering::SeqCst) < self.num_workers
    }

    /// Picks a sleeping worker to wake for new work. Returns `None` when a
    /// searching worker already exists or everyone is busy; the check is
    /// repeated under the lock to close the race with workers going to sleep.
    pub(crate) fn worker_to_notify(&self) -> Option<usize> {
        if !self.notify_should_wakeup() {
            return None;
        }

        let mut sleepers = self.sleepers.lock();
        if !self.notify_should_wakeup() {
            return None;
        }

        let index = sleepers.pop_front()?;
        self.state.inc_num_working(true);
        Some(index)
    }

    /// Returns true if the worker may transition to searching. At most half
    /// the pool searches at once.
    pub(crate) fn transition_worker_to_searching(&self) -> bool {
        if 2 * self.state.num_searching(Ordering::SeqCst) >= self.num_workers {
            return false;
        }
        self.state.inc_num_searching();
        true
    }

    /// Returns true if this was the last searching worker, in which case the
    /// caller must re-check the queues and wake a peer if work is pending.
    pub(crate) fn transition_worker_from_searching(&self) -> bool {
        self.state.dec_num_searching()
    }

    /// Returns true if this was the last searching worker going to sleep.
    pub(crate) fn transition_worker_to_sleeping(&self, index: usize, was_searching: bool) -> bool {
        let mut sleepers = self.sleepers.lock();
        let last_searcher = self.state.dec_num_working(was_searching);
        sleepers.push_back(index);
        last_searcher
    }

    /// Removes a worker that woke on its own (timer or IO completion rather
    /// than a notification). Returns true if it was still registered asleep.
    pub(crate) fn remove(&self, index: usize) -> bool {
        let mut sleepers = self.sleepers.lock();
        if let Some(pos) = sleepers.iter().position(|&i| i == index) {
            sleepers.remove(pos);
            self.state.inc_num_working(false);
            return true;
        }
        false
    }

    pub(crate) fn contains(&self, index: usize) -> bool {
        self.sleepers.lock().iter().any(|&i| i == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn searching_is_throttled_to_half_the_pool() {
        let idle = Idle::new(4);
        assert!(idle.transition_worker_to_searching());
        assert!(idle.transition_worker_to_searching());
        // 2 of 4 already searching.
        assert!(!idle.transition_worker_to_searching());
        assert!(!idle.transition_worker_from_searching());
        assert!(idle.transition_worker_from_searching());
    }

    #[test]
    fn notify_prefers_no_wakeup_while_someone_searches() {
        let idle = Idle::new(2);
        idle.transition_worker_to_sleeping(0, false);
        assert!(idle.transition_worker_to_searching());
        // Worker 1 is searching, so no wakeup is needed.
        assert!(idle.worker_to_notify().is_none());
        idle.transition_worker_from_searching();
        assert_eq!(idle.worker_to_notify(), Some(0));
        // Everyone is working again.
        assert!(idle.worker_to_notify().is_none());
    }

    #[test]
    fn self_wakeup_deregisters_sleeper() {
        let idle = Idle::new(2);
        idle.transition_worker_to_sleeping(1, false);
        assert!(idle.contains(1));
        assert!(idle.remove(1));
        assert!(!idle.remove(1));
        assert!(idle.worker_to_notify().is_none());
    }

    #[test]
    fn last_searching_sleeper_is_flagged() {
        let idle = Idle::new(2);
        assert!(idle.transition_worker_to_searching());
        assert!(idle.transition_worker_to_sleeping(0, true));
        assert!(!idle.transition_worker_to_sleeping(1, false));
    }
}
