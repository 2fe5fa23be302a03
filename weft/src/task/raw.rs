use crate::context::Shared;
use crate::error::Result;
use crate::sync::felock::Parked;
use crate::task::stack::StackPool;
use crate::task::{Id, MAIN_TASK_ID, TaskDescriptor};
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::Cell;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Owned handle to a task. Exactly one queue, waiter list or worker holds it
/// at any time.
pub(crate) type TaskRef = Box<Task>;

pub(crate) type CommBody = Box<dyn FnOnce() + Send + 'static>;

type TaskCoroutine = Coroutine<(), Suspend, (), DefaultStack>;

/// Why a task handed control back to its worker. The worker decides where
/// the task goes next.
pub(crate) enum Suspend {
    /// Requeue behind other runnable work.
    Yield,

    /// Run this freshly created task right away and requeue the parent.
    SwitchTo(TaskRef),

    /// Wait on a full/empty lock.
    Park(Parked),

    /// Wake up again once the deadline passes.
    Sleep(Instant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    /// The thread that initialized the runtime. Not a coroutine: it runs
    /// other tasks itself whenever it waits.
    Main,
    User,
    Comm,
}

/// Task-private storage: everything about a task that must follow it across
/// workers.
pub(crate) struct Header {
    id: Id,

    kind: TaskKind,

    descriptor: TaskDescriptor,

    comm_body: Cell<Option<CommBody>>,

    /// Set when the coroutine first runs, null for the main task.
    yielder: Cell<*const Yielder<(), Suspend>>,

    /// Worker this task has to resume on, if it suspended inside a critical
    /// section.
    pinned_to: Cell<Option<usize>>,

    shared: Weak<Shared>,
}

impl Header {
    fn new(kind: TaskKind, id: Id, descriptor: TaskDescriptor, shared: &Arc<Shared>) -> Self {
        Self {
            id,
            kind,
            descriptor,
            comm_body: Cell::new(None),
            yielder: Cell::new(ptr::null()),
            pinned_to: Cell::new(None),
            shared: Arc::downgrade(shared),
        }
    }

    /// Storage for the main task, owned by the runtime handle.
    pub(crate) fn main(shared: &Arc<Shared>) -> Box<Self> {
        Box::new(Self::new(
            TaskKind::Main,
            MAIN_TASK_ID,
            TaskDescriptor::default(),
            shared,
        ))
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn kind(&self) -> TaskKind {
        self.kind
    }

    pub(crate) fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    /// Whether this task runs on its own stack and can therefore suspend.
    pub(crate) fn is_coroutine(&self) -> bool {
        !self.yielder.get().is_null()
    }

    /// Hands control back to the worker. Returns once a worker resumes the
    /// task, possibly on another thread.
    pub(crate) fn suspend(&self, reason: Suspend) {
        let yielder = self.yielder.get();
        debug_assert!(!yielder.is_null(), "only coroutine tasks can suspend");

        // Safety: the yielder lives on the coroutine's stack for as long as
        // the coroutine runs, and we are running on it.
        unsafe { &*yielder }.suspend(reason);
    }

    fn run(&self) {
        if let Some(body) = self.comm_body.take() {
            return body();
        }

        let desc = &self.descriptor;
        let Some(entry) = desc.entry_fn() else {
            return;
        };

        let counted = desc
            .count_running()
            .then(|| self.shared.upgrade())
            .flatten();

        if let Some(shared) = &counted {
            shared.cfg.hooks.running_task_inc();
        }

        entry(desc);

        if let Some(shared) = &counted {
            shared.cfg.hooks.running_task_dec();
        }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("descriptor", &self.descriptor)
            .field("pinned_to", &self.pinned_to.get())
            .finish()
    }
}

/// A stackful task. The stack is only allocated when a worker first runs
/// the task, so creating one is a couple of small allocations.
pub(crate) struct Task {
    // Dropped before `header`: the coroutine borrows it.
    coroutine: Option<TaskCoroutine>,
    header: Box<Header>,
}

// Safety: a task is only ever touched by the worker currently holding its
// `TaskRef`, and it only changes hands while suspended. Task code reaches the
// thread-local context exclusively through non-inlined accessors, so nothing
// thread-specific is cached across a suspension. Tasks that suspend inside a
// critical section are pinned to their worker.
unsafe impl Send for Task {}

impl Task {
    pub(crate) fn new(kind: TaskKind, descriptor: TaskDescriptor, shared: &Arc<Shared>) -> TaskRef {
        Box::new(Self {
            coroutine: None,
            header: Box::new(Header::new(kind, Id::next(), descriptor, shared)),
        })
    }

    /// Communication task running `body` instead of a descriptor entry point.
    pub(crate) fn new_comm(body: CommBody, shared: &Arc<Shared>) -> TaskRef {
        let task = Self::new(TaskKind::Comm, TaskDescriptor::default(), shared);
        task.header.comm_body.set(Some(body));
        task
    }

    pub(crate) fn id(&self) -> Id {
        self.header.id
    }

    pub(crate) fn header_ptr(&self) -> NonNull<Header> {
        NonNull::from(&*self.header)
    }

    /// Runtime the task was spawned on, if it is still up.
    pub(crate) fn shared(&self) -> Option<Arc<Shared>> {
        self.header.shared.upgrade()
    }

    pub(crate) fn pinned_to(&self) -> Option<usize> {
        self.header.pinned_to.get()
    }

    pub(crate) fn set_pinned_to(&self, rank: Option<usize>) {
        self.header.pinned_to.set(rank);
    }

    /// Runs the task until it suspends or returns. The caller must have made
    /// this task current on its worker.
    pub(crate) fn resume(&mut self, stacks: &StackPool) -> Result<CoroutineResult<Suspend, ()>> {
        let coroutine = match self.coroutine.take() {
            Some(coroutine) => coroutine,
            None => self.start(stacks.get()?),
        };

        Ok(self.coroutine.insert(coroutine).resume(()))
    }

    fn start(&self, stack: DefaultStack) -> TaskCoroutine {
        let header = self.header_ptr();

        Coroutine::with_stack(stack, move |yielder: &Yielder<(), Suspend>, ()| {
            // Safety: the header is boxed, never moves, and outlives the
            // coroutine (see field order on `Task`).
            let header = unsafe { header.as_ref() };
            header.yielder.set(yielder);
            header.run();
        })
    }

    /// Gives the stack of a finished task back to the pool.
    pub(crate) fn recycle(mut self: Box<Self>, stacks: &StackPool) {
        if let Some(coroutine) = self.coroutine.take() {
            debug_assert!(coroutine.done());
            stacks.put(coroutine.into_stack());
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // Dropping a suspended coroutine would unwind its stack on whatever
        // thread drops it, running task code outside of any worker. Leak it.
        if let Some(coroutine) = self.coroutine.take()
            && coroutine.started()
            && !coroutine.done()
        {
            tracing::warn!(
                task = self.header.id.as_u64(),
                "dropping a suspended task, its stack is leaked"
            );
            mem::forget(coroutine);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("header", &self.header)
            .field("started", &self.coroutine.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    assert_impl_all!(Task: Send);
    assert_not_impl_any!(Task: Sync);
    assert_not_impl_any!(Header: Send, Sync);
}
