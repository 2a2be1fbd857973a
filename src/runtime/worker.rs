use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use super::queue::{LocalQueue, LOCAL_QUEUE_CAPACITY};
use super::shared::Shared;
use super::ticker::{Ticker, TickerEvents};
use crate::context::{self, Context};
use crate::driver::Driver;
use crate::task::Task;

/// Entry point of a worker thread.
pub(crate) fn run(shared: Arc<Shared>, index: usize) {
    let unpark = shared.remotes[index].unpark.clone();
    let driver = Driver::try_new(&shared.config, unpark)
        .expect("failed to create the io_uring reactor for a worker");
    let ticker = Ticker::new(
        shared.config.check_io_interval,
        shared.config.check_global_interval,
        shared.config.submit_interval,
    );
    let ctx = context::init_worker(shared, index, driver);

    let mut worker = Worker {
        ctx,
        index,
        ticker,
        is_searching: false,
        is_shutdown: false,
        rand: fastrand::Rng::new(),
    };
    worker.run_loop();
    worker.cleanup();
    context::clear_worker();
}

struct Worker {
    ctx: Rc<Context>,
    index: usize,
    ticker: Ticker,
    is_searching: bool,
    is_shutdown: bool,
    rand: fastrand::Rng,
}

impl Worker {
    fn shared(&self) -> &Arc<Shared> {
        &self.ctx.shared
    }

    fn local_queue(&self) -> &LocalQueue {
        &self.shared().remotes[self.index].queue
    }

    fn run_loop(&mut self) {
        log::trace!("worker {} started", self.index);
        while !self.is_shutdown {
            let events = self.ticker.tick();
            self.maintenance(events);

            if let Some(task) = self.get_next_task(events) {
                self.run_task(task);
                continue;
            }
            if let Some(task) = self.steal_work() {
                self.run_task(task);
                continue;
            }
            if self.poll_reactor() {
                continue;
            }
            self.sleep();
        }
        log::trace!("worker {} stopped at tick {}", self.index, self.ticker.value());
    }

    fn maintenance(&mut self, events: TickerEvents) {
        if events.contains(TickerEvents::POLL_IO) {
            self.poll_reactor();
            self.check_shutdown();
            return;
        }
        // A submission batch is flushed on its interval, or eagerly once it
        // grows past the configured threshold.
        let submit = events.contains(TickerEvents::SUBMIT);
        let max = self.shared().config.max_unsubmitted;
        context::with_driver_and_timer(|driver, _| {
            let pending = driver.num_unsubmitted();
            if pending > 0 && (submit || pending >= max) {
                if let Err(err) = driver.flush() {
                    log::error!("submission flush failed: {err}");
                }
            }
        });
    }

    fn check_shutdown(&mut self) {
        if !self.is_shutdown {
            self.is_shutdown = self.shared().global.is_closed();
        }
    }

    fn get_next_task(&mut self, events: TickerEvents) -> Option<Task> {
        if events.contains(TickerEvents::CHECK_GLOBAL) {
            // Periodically look at the global queue first for fairness.
            self.shared()
                .next_global_task()
                .or_else(|| self.next_local_task())
        } else {
            if let Some(task) = self.next_local_task() {
                return Some(task);
            }
            if self.shared().global.is_empty() {
                return None;
            }

            // Local queue is dry: pull a fair share of the global queue
            // over in one batch.
            let room = self
                .local_queue()
                .remaining_slots()
                .min(LOCAL_QUEUE_CAPACITY / 2);
            if room == 0 {
                return self.shared().next_global_task();
            }
            let share = self.shared().global.len() / self.shared().config.worker_threads + 1;
            let mut batch = self.shared().global.pop_n(share.min(room));
            let first = batch.pop_front();
            if !batch.is_empty() {
                self.local_queue().push_batch(batch);
            }
            first
        }
    }

    fn next_local_task(&mut self) -> Option<Task> {
        self.ctx.take_run_next().or_else(|| self.local_queue().pop())
    }

    /// Tries to steal from a random victim. Gated by the idle coordinator
    /// so at most half the workers burn cycles searching.
    fn steal_work(&mut self) -> Option<Task> {
        if !self.transition_to_searching() {
            return None;
        }
        let num_workers = self.shared().config.worker_threads;
        let start = self.rand.usize(0..num_workers);
        for i in 0..num_workers {
            let victim = (start + i) % num_workers;
            if victim == self.index {
                continue;
            }
            if let Some(task) = self.shared().remotes[victim]
                .queue
                .steal_into(self.local_queue())
            {
                return Some(task);
            }
        }
        // Nothing stealable; the global queue is the last resort.
        self.shared().next_global_task()
    }

    fn run_task(&mut self, task: Task) {
        self.transition_from_searching();
        task.run();
        self.ctx.flush_yielded();
    }

    /// Flushes submissions and dispatches completions and expired timers.
    /// Returns true if any progress was made.
    fn poll_reactor(&mut self) -> bool {
        let progress = context::with_driver_and_timer(|driver, timer| {
            let io = match driver.poll() {
                Ok(found) => found,
                Err(err) => {
                    log::error!("reactor poll failed: {err}");
                    false
                }
            };
            let timers = timer.process_expired(Instant::now(), driver);
            io || timers > 0
        });
        if progress && self.should_notify_others() {
            self.shared().wake_up_one();
        }
        progress
    }

    /// Completions may have queued more work than this worker can chew
    /// through alone.
    fn should_notify_others(&self) -> bool {
        !self.is_searching && self.local_queue().len() > 1
    }

    fn transition_to_searching(&mut self) -> bool {
        if !self.is_searching {
            self.is_searching = self.shared().idle.transition_worker_to_searching();
        }
        self.is_searching
    }

    fn transition_from_searching(&mut self) {
        if self.is_searching {
            self.is_searching = false;
            if self.shared().idle.transition_worker_from_searching() {
                // Last searcher found work; someone else should keep
                // looking.
                self.shared().wake_up_one();
            }
        }
    }

    fn has_tasks(&self) -> bool {
        self.ctx.has_run_next() || !self.local_queue().is_empty()
    }

    /// Parks on the reactor until a completion, a timer deadline, or an
    /// unpark from another thread.
    fn sleep(&mut self) {
        self.check_shutdown();
        if self.is_shutdown {
            return;
        }
        self.ctx.flush_yielded();
        if !self.transition_to_sleeping() {
            return;
        }

        log::trace!("worker {} sleeping at tick {}", self.index, self.ticker.value());
        while !self.is_shutdown {
            context::with_driver_and_timer(|driver, timer| {
                let timeout = timer
                    .next_expiry()
                    .map(|at| at.saturating_duration_since(Instant::now()));
                if let Err(err) = driver.park(timeout) {
                    log::error!("reactor park failed: {err}");
                }
                timer.process_expired(Instant::now(), driver);
            });
            self.check_shutdown();
            if self.transition_from_sleeping() {
                log::trace!("worker {} awoken", self.index);
                break;
            }
        }
    }

    /// Returns false if work appeared at the last moment.
    fn transition_to_sleeping(&mut self) -> bool {
        if self.has_tasks() {
            return false;
        }
        let was_last_searcher = self
            .shared()
            .idle
            .transition_worker_to_sleeping(self.index, self.is_searching);
        self.is_searching = false;
        if was_last_searcher {
            self.shared().wake_up_if_work_pending();
        }
        true
    }

    /// Returns true once the worker should resume running tasks.
    fn transition_from_sleeping(&mut self) -> bool {
        if self.is_shutdown {
            self.shared().idle.remove(self.index);
            return true;
        }
        if self.has_tasks() {
            // Woken by a local completion or timer rather than a
            // notification; deregister unless someone already popped us.
            self.is_searching = !self.shared().idle.remove(self.index);
            return true;
        }
        if self.shared().idle.contains(self.index) {
            // Spurious wakeup; go back to sleep.
            return false;
        }
        // Popped by a notifier; we are already counted as searching.
        self.is_searching = true;
        true
    }

    /// Drops everything still queued locally, then tears the reactor down.
    fn cleanup(&mut self) {
        self.ctx.flush_yielded();
        while let Some(task) = self.next_local_task() {
            drop(task);
        }
        if let Some(driver) = self.ctx.take_driver() {
            driver.shutdown();
        }
    }
}
