use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use riptide::{spawn, time};

mod common;

#[test]
fn block_on_returns_the_root_value() {
    let rt = common::runtime(2);
    let value = rt.block_on(async { 6 * 7 });
    assert_eq!(value, 42);
}

#[test]
fn many_tasks_all_run() {
    const TASKS: usize = 1000;
    let rt = common::runtime(4);
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();

    rt.block_on(async move {
        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let c = c.clone();
                spawn(async move {
                    c.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
    });

    assert_eq!(counter.load(Ordering::Relaxed), TASKS);
}

#[test]
fn tasks_spawn_tasks() {
    let rt = common::runtime(3);
    let total = rt.block_on(async {
        let outer: Vec<_> = (0..10)
            .map(|_| {
                spawn(async {
                    let inner: Vec<_> = (0..10).map(|i| spawn(async move { i })).collect();
                    let mut sum = 0;
                    for handle in inner {
                        sum += handle.await.unwrap();
                    }
                    sum
                })
            })
            .collect();
        let mut total = 0;
        for handle in outer {
            total += handle.await.unwrap();
        }
        total
    });
    assert_eq!(total, 10 * 45);
}

#[test]
fn spawn_from_outside_the_runtime() {
    let rt = common::runtime(2);
    let handle = rt.spawn(async { "remote" });
    assert_eq!(rt.block_on(async move { handle.await.unwrap() }), "remote");
}

#[test]
fn panicked_task_reports_through_its_handle() {
    let rt = common::runtime(2);
    rt.block_on(async {
        let handle = spawn(async {
            panic!("boom");
        });
        let err = handle.await.unwrap_err();
        assert!(err.is_panic());
        let payload = err.into_panic();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    });
}

#[test]
fn panicked_task_does_not_take_down_the_runtime() {
    let rt = common::runtime(2);
    let survived = rt.block_on(async {
        let _ = spawn(async { panic!("ignored") }).await;
        spawn(async { true }).await.unwrap()
    });
    assert!(survived);
}

#[test]
fn yield_now_lets_peers_interleave() {
    let rt = common::runtime(1);
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let (a, b) = (log.clone(), log.clone());
    rt.block_on(async move {
        let first = spawn(async move {
            for _ in 0..3 {
                a.lock().push('a');
                time::yield_now().await;
            }
        });
        let second = spawn(async move {
            for _ in 0..3 {
                b.lock().push('b');
                time::yield_now().await;
            }
        });
        first.await.unwrap();
        second.await.unwrap();
    });

    let log = log.lock();
    // Both tasks made progress before either finished.
    let first_b = log.iter().position(|&c| c == 'b').unwrap();
    let last_a = log.iter().rposition(|&c| c == 'a').unwrap();
    assert!(first_b < last_a, "yield never interleaved: {log:?}");
}

#[test]
fn single_worker_runtime_completes() {
    let rt = common::runtime(1);
    let sum = rt.block_on(async {
        let handles: Vec<_> = (0..100).map(|i| spawn(async move { i })).collect();
        let mut sum = 0;
        for handle in handles {
            sum += handle.await.unwrap();
        }
        sum
    });
    assert_eq!(sum, 4950);
}
