use crate::error::Error;
use crate::runtime::{Builder, RuntimeHooks};
use crate::sync::FeLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;

/// Small enough that a thousand started tasks stay cheap.
pub(crate) const TEST_STACK_SIZE: usize = 256 * 1024;

/// Logs to the test harness' captured output, filtered by `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Hooks that turn fatal errors into panics, so `#[should_panic]` tests can
/// observe them. Nothing is read from the environment.
#[derive(Debug, Default)]
pub(crate) struct PanicHooks {
    threads_per_locale: Option<usize>,
    comm_polling_tasks: usize,
    comm_max_threads: Option<usize>,
    running: AtomicUsize,
}

impl PanicHooks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn threads_per_locale(mut self, n: usize) -> Self {
        self.threads_per_locale = Some(n);
        self
    }

    pub(crate) fn comm_polling_tasks(mut self, n: usize) -> Self {
        self.comm_polling_tasks = n;
        self
    }

    pub(crate) fn comm_max_threads(mut self, n: usize) -> Self {
        self.comm_max_threads = Some(n);
        self
    }

    pub(crate) fn running_tasks(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

impl RuntimeHooks for PanicHooks {
    fn num_threads_per_locale(&self) -> Option<usize> {
        self.threads_per_locale
    }

    fn comm_polling_tasks(&self) -> usize {
        self.comm_polling_tasks
    }

    fn comm_max_threads(&self) -> Option<usize> {
        self.comm_max_threads
    }

    fn running_task_inc(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    fn running_task_dec(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn fatal(&self, err: &Error) -> ! {
        panic!("{err}")
    }
}

#[must_use]
pub(crate) fn test_builder(worker_threads: usize) -> Builder {
    init_tracing();

    Builder::new()
        .worker_threads(worker_threads)
        .stack_size(TEST_STACK_SIZE)
        .hooks(Arc::new(PanicHooks::new()))
}

/// Opens once `count` tasks have called [`Latch::count_down`].
#[derive(Debug)]
pub(crate) struct Latch {
    remaining: AtomicUsize,
    open: FeLock,
}

impl Latch {
    pub(crate) fn new(count: usize) -> Arc<Self> {
        assert!(count > 0, "a latch needs at least one count");

        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            open: FeLock::new(),
        })
    }

    pub(crate) fn count_down(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.open.wait_until_empty_then_lock();
            self.open.signal_full_and_unlock();
        }
    }

    pub(crate) fn wait(&self) {
        self.open.wait_until_full_then_lock();
        self.open.unlock();
    }
}
