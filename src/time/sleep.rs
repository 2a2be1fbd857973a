use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use super::timer::TimerHandle;

/// Suspends the current task for at least `duration`.
pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

/// Suspends the current task until `deadline`.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        handle: None,
    }
}

/// Future returned by [`sleep`] and [`sleep_until`].
///
/// Registers with the timer of whichever worker first polls it. Dropping an
/// unfired `Sleep` cancels the entry; a cancelled timer never wakes anyone.
pub struct Sleep {
    deadline: Instant,
    handle: Option<TimerHandle>,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_elapsed(&self) -> bool {
        self.handle.as_ref().is_some_and(TimerHandle::is_elapsed)
    }

    /// Re-arms the future for a new deadline, cancelling any registration
    /// made for the old one.
    pub fn reset(&mut self, deadline: Instant) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
        self.deadline = deadline;
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &self.handle {
            Some(handle) => {
                handle.register(cx.waker());
                if handle.is_elapsed() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
            None => {
                if Instant::now() >= self.deadline {
                    return Poll::Ready(());
                }
                let handle = crate::context::with_timer(|timer| timer.insert(self.deadline));
                handle.register(cx.waker());
                self.handle = Some(handle);
                Poll::Pending
            }
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }
}
