use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use riptide::spawn;
use riptide::sync::{Condvar, Latch, Mutex, Semaphore};
use riptide::time::sleep;

mod common;

#[test]
fn mutex_serializes_increments() {
    const TASKS: usize = 8;
    const INCREMENTS: usize = 500;

    let rt = common::runtime(4);
    let counter = Arc::new(Mutex::new(0usize));
    let c = counter.clone();

    rt.block_on(async move {
        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let counter = c.clone();
                spawn(async move {
                    for _ in 0..INCREMENTS {
                        let mut guard = counter.lock().await;
                        *guard += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*c.lock().await, TASKS * INCREMENTS);
    });
}

#[test]
fn mutex_grants_in_request_order() {
    const WAITERS: usize = 6;

    let rt = common::runtime(1);
    let mutex = Arc::new(Mutex::new(()));
    let requests = Arc::new(AtomicUsize::new(0));
    let grants = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let (m, r, g) = (mutex.clone(), requests.clone(), grants.clone());
    rt.block_on(async move {
        let held = m.lock().await;
        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                let mutex = m.clone();
                let requests = r.clone();
                let grants = g.clone();
                spawn(async move {
                    // On a single worker there is no suspension between
                    // taking a sequence number and parking on the lock.
                    let seq = requests.fetch_add(1, Ordering::Relaxed);
                    let _guard = mutex.lock().await;
                    grants.lock().push(seq);
                })
            })
            .collect();
        // Let every waiter park behind the held lock.
        sleep(Duration::from_millis(50)).await;
        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
    });

    let grants = grants.lock();
    let expected: Vec<_> = (0..WAITERS).collect();
    assert_eq!(*grants, expected, "grants left request order");
}

#[test]
fn latch_releases_all_waiters_only_at_zero() {
    const COUNT: usize = 4;
    const WAITERS: usize = COUNT + 1;

    let rt = common::runtime(3);
    let latch = Arc::new(Latch::new(COUNT));
    let released = Arc::new(AtomicUsize::new(0));

    let (l, r) = (latch.clone(), released.clone());
    rt.block_on(async move {
        let waiters: Vec<_> = (0..WAITERS)
            .map(|_| {
                let latch = l.clone();
                let released = r.clone();
                spawn(async move {
                    latch.wait().await;
                    released.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        for _ in 0..COUNT - 1 {
            l.count_down(1);
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            r.load(Ordering::Relaxed),
            0,
            "waiters released before the count hit zero"
        );

        l.count_down(1);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(r.load(Ordering::Relaxed), WAITERS);
        // Late waiters pass straight through.
        l.wait().await;
    });
}

#[test]
fn latch_arrive_and_wait_rendezvous() {
    const PARTIES: usize = 4;

    let rt = common::runtime(4);
    let latch = Arc::new(Latch::new(PARTIES));
    let done = Arc::new(AtomicUsize::new(0));

    let (l, d) = (latch.clone(), done.clone());
    rt.block_on(async move {
        let handles: Vec<_> = (0..PARTIES)
            .map(|_| {
                let latch = l.clone();
                let done = d.clone();
                spawn(async move {
                    latch.arrive_and_wait().await;
                    done.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(d.load(Ordering::Relaxed), PARTIES);
    });
}

#[test]
fn semaphore_bounds_concurrency() {
    const PERMITS: usize = 3;
    const TASKS: usize = 20;

    let rt = common::runtime(4);
    let semaphore = Arc::new(Semaphore::new(PERMITS));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (s, c, p) = (semaphore.clone(), current.clone(), peak.clone());
    rt.block_on(async move {
        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let semaphore = s.clone();
                let current = c.clone();
                let peak = p.clone();
                spawn(async move {
                    let _permit = semaphore.acquire().await;
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(2)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
    });

    assert!(peak.load(Ordering::SeqCst) <= PERMITS);
    assert_eq!(semaphore.available_permits(), PERMITS);
}

#[test]
fn condvar_wait_until_observes_the_predicate() {
    let rt = common::runtime(2);
    let state = Arc::new((Mutex::new(0usize), Condvar::new()));

    let s = state.clone();
    let observed = rt.block_on(async move {
        let waiter = {
            let state = s.clone();
            spawn(async move {
                let (mutex, condvar) = &*state;
                let guard = mutex.lock().await;
                let guard = condvar.wait_until(guard, |v| *v == 3).await;
                *guard
            })
        };

        for _ in 0..3 {
            sleep(Duration::from_millis(5)).await;
            let (mutex, condvar) = &*s;
            let mut guard = mutex.lock().await;
            *guard += 1;
            condvar.notify_one();
        }
        waiter.await.unwrap()
    });
    assert_eq!(observed, 3);
}

#[test]
fn condvar_notify_all_wakes_everyone() {
    const WAITERS: usize = 5;

    let rt = common::runtime(3);
    let state = Arc::new((Mutex::new(false), Condvar::new()));
    let woken = Arc::new(AtomicUsize::new(0));

    let (s, w) = (state.clone(), woken.clone());
    rt.block_on(async move {
        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                let state = s.clone();
                let woken = w.clone();
                spawn(async move {
                    let (mutex, condvar) = &*state;
                    let guard = mutex.lock().await;
                    let _guard = condvar.wait_until(guard, |ready| *ready).await;
                    woken.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        sleep(Duration::from_millis(20)).await;
        {
            let (mutex, condvar) = &*s;
            let mut guard = mutex.lock().await;
            *guard = true;
            condvar.notify_all();
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(w.load(Ordering::Relaxed), WAITERS);
    });
}
