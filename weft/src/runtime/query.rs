//! Introspection of the runtime active on the calling thread.
//!
//! Every query is O(1) and never blocks. Idle, queued and blocked counts are
//! not tracked and always read zero. The running-task count is not available
//! at all: asking for it is a fatal error.

use crate::context::{self, Shared};
use crate::error::{Error, Result};
use crate::task::SubLoc;
use std::sync::Arc;

fn with_shared<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<Shared>) -> R,
{
    match context::with_context(|ctx| f(ctx.shared())) {
        Some(res) => res,
        None => context::fatal(Error::NotInitialized),
    }
}

/// Configured worker count, the main thread included. Communication slots
/// are not counted.
pub fn thread_count() -> usize {
    with_shared(|shared| shared.cfg.worker_threads)
}

pub fn idle_thread_count() -> usize {
    0
}

pub fn queued_task_count() -> usize {
    0
}

pub fn blocked_task_count() -> usize {
    0
}

/// Not supported. Always fatal, see [`try_running_task_count`].
pub fn running_task_count() -> usize {
    match try_running_task_count() {
        Ok(count) => count,
        Err(err) => context::fatal(err),
    }
}

pub fn try_running_task_count() -> Result<usize> {
    Err(Error::Unsupported("running_task_count"))
}

/// How many tasks can make progress at the same time: the worker count,
/// bounded by the physical cores the process may use.
pub fn max_parallelism() -> usize {
    with_shared(|shared| shared.cfg.worker_threads.min(shared.cfg.physical_cores))
}

/// Resolved call stack size of every task, in bytes.
pub fn call_stack_size() -> usize {
    with_shared(|shared| shared.cfg.stack_size)
}

/// This layer runs a single sublocale.
pub fn num_sublocales() -> SubLoc {
    0
}
