use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use riptide::spawn;
use riptide::time::{interval, sleep, timeout, yield_now, MissedTickBehavior};

mod common;

#[test]
fn sleep_waits_at_least_its_duration() {
    let rt = common::runtime(2);
    let elapsed = rt.block_on(async {
        let start = Instant::now();
        sleep(Duration::from_millis(30)).await;
        start.elapsed()
    });
    assert!(elapsed >= Duration::from_millis(30), "woke after {elapsed:?}");
}

#[test]
fn zero_sleep_completes_immediately() {
    let rt = common::runtime(1);
    rt.block_on(async {
        sleep(Duration::ZERO).await;
    });
}

#[test]
fn timers_fire_in_deadline_order() {
    let rt = common::runtime(1);
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let o = order.clone();
    rt.block_on(async move {
        // Registered shortest-last on purpose.
        let handles: Vec<_> = [40u64, 25, 10]
            .into_iter()
            .map(|ms| {
                let order = o.clone();
                spawn(async move {
                    sleep(Duration::from_millis(ms)).await;
                    order.lock().push(ms);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
    });

    assert_eq!(*order.lock(), vec![10, 25, 40]);
}

#[test]
fn dropped_timer_never_fires() {
    let rt = common::runtime(2);
    let fired = Arc::new(AtomicBool::new(false));

    let f = fired.clone();
    rt.block_on(async move {
        let result = timeout(Duration::from_millis(20), async {
            sleep(Duration::from_secs(5)).await;
            f.store(true, Ordering::SeqCst);
        })
        .await;
        assert!(result.is_err());
        // Give a stray wakeup a chance to surface.
        sleep(Duration::from_millis(50)).await;
    });
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn timeout_lets_a_fast_future_win() {
    let rt = common::runtime(2);
    let value = rt.block_on(async {
        timeout(Duration::from_secs(5), async {
            sleep(Duration::from_millis(1)).await;
            "fast"
        })
        .await
    });
    assert_eq!(value.unwrap(), "fast");
}

#[test]
fn timeout_of_a_ready_future_is_suppressed() {
    let rt = common::runtime(1);
    let value = rt.block_on(async {
        // Even with an already expired deadline the inner result wins,
        // because the inner future is polled first.
        timeout(Duration::ZERO, async { 5 }).await
    });
    assert_eq!(value.unwrap(), 5);
}

#[test]
fn interval_ticks_repeatedly() {
    let rt = common::runtime(1);
    let (ticks, elapsed) = rt.block_on(async {
        let start = Instant::now();
        let mut interval = interval(Duration::from_millis(10));
        let mut ticks = 0;
        for _ in 0..5 {
            interval.tick().await;
            ticks += 1;
        }
        (ticks, start.elapsed())
    });
    assert_eq!(ticks, 5);
    assert!(elapsed >= Duration::from_millis(50), "ticked early: {elapsed:?}");
}

#[test]
fn interval_delay_behavior_skips_backlog() {
    let rt = common::runtime(1);
    rt.block_on(async {
        let mut interval = interval(Duration::from_millis(5));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        // Miss several ticks, then confirm no burst follows.
        sleep(Duration::from_millis(30)).await;
        interval.tick().await;
        let start = Instant::now();
        interval.tick().await;
        assert!(start.elapsed() >= Duration::from_millis(4));
    });
}

#[test]
fn yield_now_completes() {
    let rt = common::runtime(1);
    rt.block_on(async {
        for _ in 0..100 {
            yield_now().await;
        }
    });
}
