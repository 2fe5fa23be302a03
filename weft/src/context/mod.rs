use crate::error::{Error, Result};
use crate::runtime::Worker;
use crate::task::Header;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;
use std::thread_local;

// Exports
mod critical;
pub(crate) use critical::{CriticalSections, pre_init_depth};
pub use critical::{
    critical_section_depth, enter_critical_section, exit_critical_section,
    is_in_critical_section,
};

mod shared;
pub(crate) use shared::Shared;

/// Per-thread state of a worker: the worker itself and the task it is
/// currently running.
#[derive(Debug)]
pub(crate) struct Context {
    worker: Worker,

    /// Header of the task running on this worker. The main thread points at
    /// the main task's header whenever it is not resuming another task.
    current: Cell<Option<NonNull<Header>>>,
}

impl Context {
    pub(crate) fn new(worker: Worker) -> Self {
        Self {
            worker,
            current: Cell::new(None),
        }
    }

    pub(crate) fn worker(&self) -> &Worker {
        &self.worker
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        self.worker.shared()
    }

    pub(crate) fn rank(&self) -> usize {
        self.worker.rank()
    }

    pub(crate) fn replace_current(&self, header: Option<NonNull<Header>>) -> Option<NonNull<Header>> {
        self.current.replace(header)
    }

    pub(crate) fn is_in_critical_section(&self) -> bool {
        self.shared().critical.is_held(self.rank())
    }
}

// A task may resume on a different thread than the one it suspended on. Every
// access below goes through a non-inlined function so that the compiler can
// never reuse a thread-local address computed before a suspension point.
thread_local! {
    static CONTEXT: RefCell<Option<Rc<Context>>> = const { RefCell::new(None) };
}

/// Installs `ctx` as the calling thread's context.
pub(crate) fn enter(ctx: Rc<Context>) -> Result<()> {
    CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(Error::AlreadyActive);
        }
        *slot = Some(ctx);
        Ok(())
    })
}

/// Removes the calling thread's context, if any.
#[inline(never)]
pub(crate) fn exit() -> Option<Rc<Context>> {
    CONTEXT.with(|slot| slot.borrow_mut().take())
}

#[inline(never)]
pub(crate) fn is_active() -> bool {
    CONTEXT.with(|slot| slot.borrow().is_some())
}

/// Runs `f` with the calling thread's context, or returns `None` on a thread
/// that is not a worker.
///
/// `f` must not suspend the current task: the context belongs to the thread,
/// and the task may come back on another one.
#[inline(never)]
pub(crate) fn with_context<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Context) -> R,
{
    // Clone out of the cell so `f` may re-enter.
    let ctx = CONTEXT.with(|slot| slot.borrow().clone());
    ctx.map(|ctx| f(&ctx))
}

/// Header of the task running on the calling thread.
///
/// The pointer stays valid for as long as that task runs, across suspension
/// points, since headers are boxed and move with their task.
#[inline(never)]
pub(crate) fn current_header() -> Option<NonNull<Header>> {
    CONTEXT.with(|slot| slot.borrow().as_ref().and_then(|ctx| ctx.current.get()))
}

/// Reports `err` through the hooks of the runtime on this thread, or aborts
/// directly when there is none.
#[cold]
pub(crate) fn fatal(err: Error) -> ! {
    match with_context(|ctx| Arc::clone(&ctx.shared().cfg.hooks)) {
        Some(hooks) => hooks.fatal(&err),
        None => {
            tracing::error!(%err, "fatal tasking error outside of a runtime");
            std::process::abort()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crate::test_utils::test_builder;
    use anyhow::Result;
    use std::thread;

    #[test]
    fn test_context_is_thread_local() -> Result<()> {
        let runtime = test_builder(1).try_init()?;
        assert!(is_active());
        assert_eq!(with_context(|ctx| ctx.rank()), Some(0));

        let other = thread::spawn(|| (is_active(), current_header().is_none()))
            .join()
            .expect("probe thread panicked");
        assert_eq!(other, (false, true));

        runtime.teardown();
        assert!(!is_active());
        Ok(())
    }

    #[test]
    fn test_nested_runtime_rejected() -> Result<()> {
        let runtime = test_builder(1).try_init()?;

        let nested = Builder::new().worker_threads(1).try_init();
        assert!(nested.is_err());

        runtime.teardown();
        Ok(())
    }

    #[test]
    fn test_context_allows_reentrant_access() -> Result<()> {
        let runtime = test_builder(1).try_init()?;

        let rank = with_context(|outer| with_context(|inner| outer.rank() + inner.rank()));
        assert_eq!(rank, Some(Some(0)));

        runtime.teardown();
        Ok(())
    }
}
