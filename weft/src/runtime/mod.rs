// Public API
mod hooks;
pub use hooks::{DEFAULT_CALL_STACK_SIZE, DefaultHooks, RuntimeHooks};
pub use hooks::{ENV_CALL_STACK_SIZE, ENV_NUM_THREADS_PER_LOCALE, ENV_WORKER_NUM};

pub mod query;

mod runtime;
pub use runtime::{Builder, Runtime};

// Exports
pub(crate) use runtime::RuntimeConfig;

mod pool;
pub(crate) use pool::ThreadPool;

mod ticker;

mod timer;
pub(crate) use timer::{TimerQueue, earliest};

mod worker;
pub(crate) use worker::Worker;


/// Where a task lands when a worker queues it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AddMode {
    /// Behind every other runnable task.
    Fifo,

    /// Next to run on this worker, stealable by the others.
    Lifo,
}
