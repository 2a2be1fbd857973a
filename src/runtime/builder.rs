use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Result};

use super::runtime::Runtime;

const DEFAULT_RING_ENTRIES: u32 = 1024;
const DEFAULT_CHECK_IO_INTERVAL: u32 = 61;
const DEFAULT_CHECK_GLOBAL_INTERVAL: u32 = 61;
const DEFAULT_SUBMIT_INTERVAL: u32 = 16;

type ThreadNameFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Configures and builds a [`Runtime`].
///
/// ```no_run
/// use riptide::runtime::Builder;
///
/// let rt = Builder::new().worker_threads(4).build().unwrap();
/// rt.block_on(async { /* ... */ });
/// ```
pub struct Builder {
    worker_threads: Option<usize>,
    ring_entries: u32,
    check_io_interval: u32,
    check_global_interval: u32,
    submit_interval: u32,
    max_unsubmitted: Option<usize>,
    thread_name: ThreadNameFn,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            ring_entries: DEFAULT_RING_ENTRIES,
            check_io_interval: DEFAULT_CHECK_IO_INTERVAL,
            check_global_interval: DEFAULT_CHECK_GLOBAL_INTERVAL,
            submit_interval: DEFAULT_SUBMIT_INTERVAL,
            max_unsubmitted: None,
            thread_name: Arc::new(default_thread_name),
        }
    }

    /// Number of worker threads. Defaults to the available parallelism.
    #[track_caller]
    pub fn worker_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "worker_threads must be at least 1");
        self.worker_threads = Some(n);
        self
    }

    /// Submission queue depth of each worker's ring. Must be a power of
    /// two; the completion queue is sized at twice this.
    #[track_caller]
    pub fn ring_entries(mut self, entries: u32) -> Self {
        assert!(
            entries.is_power_of_two(),
            "ring_entries must be a power of two"
        );
        self.ring_entries = entries;
        self
    }

    /// Ticks between reactor polls on a busy worker.
    #[track_caller]
    pub fn check_io_interval(mut self, ticks: u32) -> Self {
        assert!(ticks > 0, "check_io_interval must be non-zero");
        self.check_io_interval = ticks;
        self
    }

    /// Ticks between forced global-queue checks on a busy worker.
    #[track_caller]
    pub fn check_global_interval(mut self, ticks: u32) -> Self {
        assert!(ticks > 0, "check_global_interval must be non-zero");
        self.check_global_interval = ticks;
        self
    }

    /// Ticks between submission flushes on a busy worker.
    #[track_caller]
    pub fn submit_interval(mut self, ticks: u32) -> Self {
        assert!(ticks > 0, "submit_interval must be non-zero");
        self.submit_interval = ticks;
        self
    }

    /// Batched submissions that force an eager flush regardless of the
    /// submit interval. Defaults to a third of `ring_entries`.
    pub fn max_unsubmitted(mut self, n: usize) -> Self {
        self.max_unsubmitted = Some(n);
        self
    }

    /// Name generator for worker threads.
    pub fn thread_name(mut self, f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.thread_name = Arc::new(f);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let config = self.into_config();
        check_fd_rlimit(&config)?;
        Runtime::start(config)
    }

    pub(crate) fn into_config(self) -> RuntimeConfig {
        let worker_threads = self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        RuntimeConfig {
            worker_threads,
            ring_entries: self.ring_entries,
            check_io_interval: self.check_io_interval,
            check_global_interval: self.check_global_interval,
            submit_interval: self.submit_interval,
            max_unsubmitted: self
                .max_unsubmitted
                .unwrap_or(self.ring_entries as usize / 3),
            thread_name: self.thread_name,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_thread_name() -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!("riptide-worker-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Each worker holds a ring fd and an eventfd, and accepted sockets come on
/// top; refuse configurations the fd limit cannot possibly satisfy.
fn check_fd_rlimit(config: &RuntimeConfig) -> Result<()> {
    let mut rlimit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlimit) };
    ensure!(ret == 0, "getrlimit(RLIMIT_NOFILE) failed");
    let needed = (config.worker_threads * 2 + 16) as u64;
    ensure!(
        rlimit.rlim_cur >= needed,
        "file descriptor limit {} too low for {} workers (need at least {})",
        rlimit.rlim_cur,
        config.worker_threads,
        needed,
    );
    Ok(())
}

#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) ring_entries: u32,
    pub(crate) check_io_interval: u32,
    pub(crate) check_global_interval: u32,
    pub(crate) submit_interval: u32,
    pub(crate) max_unsubmitted: usize,
    pub(crate) thread_name: ThreadNameFn,
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("worker_threads", &self.worker_threads)
            .field("ring_entries", &self.ring_entries)
            .field("check_io_interval", &self.check_io_interval)
            .field("check_global_interval", &self.check_global_interval)
            .field("submit_interval", &self.submit_interval)
            .field("max_unsubmitted", &self.max_unsubmitted)
            .finish_non_exhaustive()
    }
}

impl RuntimeConfig {
    pub(crate) fn thread_name(&self) -> String {
        (self.thread_name)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_coherent() {
        let config = Builder::new().into_config();
        assert!(config.worker_threads >= 1);
        assert_eq!(config.ring_entries, DEFAULT_RING_ENTRIES);
        assert_eq!(config.max_unsubmitted, DEFAULT_RING_ENTRIES as usize / 3);
    }

    #[test]
    #[should_panic(expected = "worker_threads must be at least 1")]
    fn zero_workers_is_rejected() {
        let _ = Builder::new().worker_threads(0);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn odd_ring_size_is_rejected() {
        let _ = Builder::new().ring_entries(1000);
    }
}
