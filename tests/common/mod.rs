use riptide::runtime::Builder;
use riptide::Runtime;

pub fn runtime(workers: usize) -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    Builder::new()
        .worker_threads(workers)
        .build()
        .expect("failed to build test runtime")
}
