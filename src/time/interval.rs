use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use super::sleep::{sleep_until, Sleep};

/// Policy for rescheduling when a tick is observed late.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissedTickBehavior {
    /// Fire the backlog of missed ticks as fast as possible, then return to
    /// the original cadence.
    #[default]
    Burst,
    /// Forget the backlog; next tick is one period from now.
    Delay,
    /// Skip the backlog; next tick is at the next multiple of the period
    /// after now, staying phase-aligned.
    Skip,
}

impl MissedTickBehavior {
    fn next_timeout(&self, missed: Instant, now: Instant, period: Duration) -> Instant {
        match self {
            Self::Burst => missed + period,
            Self::Delay => now + period,
            Self::Skip => {
                let since = now.duration_since(missed);
                let periods = since.as_nanos() / period.as_nanos().max(1) + 1;
                missed + period * periods as u32
            }
        }
    }
}

/// Ticks at a fixed period. The first tick fires one period after creation.
pub fn interval(period: Duration) -> Interval {
    interval_at(Instant::now() + period, period)
}

/// Ticks at a fixed period, with the first tick at `start`.
pub fn interval_at(start: Instant, period: Duration) -> Interval {
    assert!(!period.is_zero(), "interval period must be non-zero");
    Interval {
        delay: sleep_until(start),
        period,
        missed_tick_behavior: MissedTickBehavior::default(),
    }
}

pub struct Interval {
    delay: Sleep,
    period: Duration,
    missed_tick_behavior: MissedTickBehavior,
}

impl Interval {
    /// Completes at the next tick, returning its scheduled instant.
    pub async fn tick(&mut self) -> Instant {
        poll_fn(|cx| self.poll_tick(cx)).await
    }

    pub fn poll_tick(&mut self, cx: &mut Context<'_>) -> Poll<Instant> {
        ready!(Pin::new(&mut self.delay).poll(cx));

        let timeout = self.delay.deadline();
        let now = Instant::now();
        let next = if now > timeout {
            self.missed_tick_behavior
                .next_timeout(timeout, now, self.period)
        } else {
            timeout + self.period
        };
        self.delay.reset(next);
        Poll::Ready(timeout)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn missed_tick_behavior(&self) -> MissedTickBehavior {
        self.missed_tick_behavior
    }

    pub fn set_missed_tick_behavior(&mut self, behavior: MissedTickBehavior) {
        self.missed_tick_behavior = behavior;
    }

    /// Re-arms so the next tick is one full period from now.
    pub fn reset(&mut self) {
        self.delay.reset(Instant::now() + self.period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_replays_missed_ticks() {
        let period = Duration::from_millis(10);
        let missed = Instant::now();
        let now = missed + Duration::from_millis(35);
        // Backlog is replayed one period at a time.
        assert_eq!(
            MissedTickBehavior::Burst.next_timeout(missed, now, period),
            missed + period
        );
    }

    #[test]
    fn delay_restarts_from_now() {
        let period = Duration::from_millis(10);
        let missed = Instant::now();
        let now = missed + Duration::from_millis(35);
        assert_eq!(
            MissedTickBehavior::Delay.next_timeout(missed, now, period),
            now + period
        );
    }

    #[test]
    fn skip_stays_phase_aligned() {
        let period = Duration::from_millis(10);
        let missed = Instant::now();
        let now = missed + Duration::from_millis(35);
        // 3 full periods missed; next aligned tick is at +40ms.
        assert_eq!(
            MissedTickBehavior::Skip.next_timeout(missed, now, period),
            missed + period * 4
        );
    }
}
