use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Yields once, letting other runnable tasks on this worker go first.
pub async fn yield_now() {
    YieldNow { yielded: false }.await
}

struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        // Deferred until after the worker's next poll, so the wake does not
        // just put this task straight back into the run-next slot.
        crate::context::defer_yield(cx.waker().clone());
        Poll::Pending
    }
}
