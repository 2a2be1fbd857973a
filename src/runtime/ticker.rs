use bitflags::bitflags;

bitflags! {
    /// Periodic duties owed by a worker at a given tick.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TickerEvents: u8 {
        /// Poll the reactor, fire timers, and check for shutdown.
        const POLL_IO      = 1 << 0;
        /// Pull from the global queue ahead of the local one, so injected
        /// tasks cannot starve behind a busy local queue.
        const CHECK_GLOBAL = 1 << 1;
        /// Flush batched submissions to the kernel.
        const SUBMIT       = 1 << 2;
    }
}

/// Derives per-tick duties from the configured intervals.
pub(crate) struct Ticker {
    tick: u32,
    check_io_interval: u32,
    check_global_interval: u32,
    submit_interval: u32,
}

impl Ticker {
    pub(crate) fn new(
        check_io_interval: u32,
        check_global_interval: u32,
        submit_interval: u32,
    ) -> Self {
        Self {
            tick: 0,
            check_io_interval,
            check_global_interval,
            submit_interval,
        }
    }

    pub(crate) fn tick(&mut self) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        let mut events = TickerEvents::empty();
        if self.tick % self.check_io_interval == 0 {
            events |= TickerEvents::POLL_IO;
        }
        if self.tick % self.check_global_interval == 0 {
            events |= TickerEvents::CHECK_GLOBAL;
        }
        if self.tick % self.submit_interval == 0 {
            events |= TickerEvents::SUBMIT;
        }
        events
    }

    pub(crate) fn value(&self) -> u32 {
        self.tick
    }
}
