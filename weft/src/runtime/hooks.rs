use crate::error::Error;
use std::env;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default per-task call stack size: 8 MiB.
pub const DEFAULT_CALL_STACK_SIZE: usize = 8 * 1024 * 1024;

pub const ENV_NUM_THREADS_PER_LOCALE: &str = "WEFT_NUM_THREADS_PER_LOCALE";
pub const ENV_WORKER_NUM: &str = "WEFT_WORKER_NUM";
pub const ENV_CALL_STACK_SIZE: &str = "WEFT_CALL_STACK_SIZE";

/// Services the runtime consumes from the language runtime embedding it.
///
/// Every method has a default, so an embedder only overrides what it
/// actually provides.
pub trait RuntimeHooks: fmt::Debug + Send + Sync + 'static {
    /// Configured worker count, if any. Overridden by
    /// [`Builder::worker_threads`](crate::runtime::Builder::worker_threads).
    fn num_threads_per_locale(&self) -> Option<usize> {
        None
    }

    /// Configured call stack size, if any. Zero means unset.
    fn call_stack_size(&self) -> Option<usize> {
        None
    }

    fn default_call_stack_size(&self) -> usize {
        DEFAULT_CALL_STACK_SIZE
    }

    /// Worker slots reserved for communication tasks.
    fn comm_polling_tasks(&self) -> usize {
        0
    }

    /// Upper bound on workers imposed by the communication layer.
    fn comm_max_threads(&self) -> Option<usize> {
        None
    }

    fn running_task_inc(&self) {}

    fn running_task_dec(&self) {}

    /// Reports an unrecoverable condition. Must not return.
    fn fatal(&self, err: &Error) -> ! {
        tracing::error!(%err, "fatal tasking error");
        std::process::abort()
    }
}

/// Hooks backed by environment variables, with a process-wide running-task
/// counter.
#[derive(Debug, Default)]
pub struct DefaultHooks {
    running: AtomicUsize,
}

impl DefaultHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counted tasks currently running.
    pub fn running_tasks(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }
}

impl RuntimeHooks for DefaultHooks {
    fn num_threads_per_locale(&self) -> Option<usize> {
        parse_positive(env::var(ENV_NUM_THREADS_PER_LOCALE).ok().as_deref())
            .or_else(|| parse_positive(env::var(ENV_WORKER_NUM).ok().as_deref()))
    }

    fn call_stack_size(&self) -> Option<usize> {
        parse_positive(env::var(ENV_CALL_STACK_SIZE).ok().as_deref())
    }

    fn running_task_inc(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    fn running_task_dec(&self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Parses a strictly positive integer setting. Unset, empty, zero or
/// malformed values all count as unset.
pub(crate) fn parse_positive(raw: Option<&str>) -> Option<usize> {
    raw.map(str::trim)
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
