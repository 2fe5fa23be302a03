use crate::context;
use crate::error::Error;
use crate::task::descriptor::is_local_subloc;
use crate::task::{FnId, SubLoc, Suspend, Task, TaskDescriptor, TaskFn, TaskKind, local};
use std::sync::atomic::Ordering;

/// Spawns the function registered under `fid` in the runtime's
/// [`FnTable`](crate::task::FnTable).
///
/// See [`spawn_fn`]. An unknown id is fatal.
pub fn spawn(fid: FnId, descriptor: TaskDescriptor, subloc: SubLoc) {
    let entry = context::with_context(|ctx| ctx.shared().cfg.fn_table.get(fid))
        .unwrap_or_else(|| context::fatal(Error::NotInitialized))
        .unwrap_or_else(|| context::fatal(Error::UnknownFn(fid)));

    spawn_fn(entry, descriptor, subloc);
}

/// Starts a detached task running `entry` with `descriptor`.
///
/// Inside a serial region (see [`set_serial_state`](crate::task::set_serial_state))
/// no task is created: `entry` runs right here, before this returns.
///
/// Otherwise the new task may run before this returns: unless the calling
/// worker is inside a critical section, the caller switches to it right
/// away and is requeued.
pub fn spawn_fn(entry: TaskFn, mut descriptor: TaskDescriptor, subloc: SubLoc) {
    if local::serial_state() {
        entry(&descriptor);
        return;
    }

    descriptor.prepare(entry, subloc, false, false, false);
    start(descriptor);
}

/// Starts a task on behalf of an `on` statement targeting this locale. The
/// task takes part in the running-task count once the embedding program has
/// called [`Runtime::std_modules_initialized`](crate::runtime::Runtime::std_modules_initialized).
///
/// Serial state does not apply. `subloc` must be `0` or [`SUBLOC_ANY`](crate::task::SUBLOC_ANY).
pub fn execute_on(entry: TaskFn, descriptor: TaskDescriptor, subloc: SubLoc) {
    start_cross_locality(entry, descriptor, subloc, false);
}

/// Starts a task that was moved here from another locale, keeping the
/// serial state it had there.
pub fn start_moved_task(entry: TaskFn, descriptor: TaskDescriptor, subloc: SubLoc, serial_state: bool) {
    start_cross_locality(entry, descriptor, subloc, serial_state);
}

fn start_cross_locality(entry: TaskFn, mut descriptor: TaskDescriptor, subloc: SubLoc, serial_state: bool) {
    if !is_local_subloc(subloc) {
        context::fatal(Error::InvalidSubloc(subloc));
    }

    let count_running = context::with_context(|ctx| ctx.shared().can_count_running.load(Ordering::Acquire))
        .unwrap_or_else(|| context::fatal(Error::NotInitialized));

    descriptor.prepare(entry, subloc, count_running, true, serial_state);
    start(descriptor);
}

/// Starts a communication task running `body`. Serial state does not apply,
/// and the caller never switches to it.
pub fn spawn_comm_task<F>(body: F)
where
    F: FnOnce() + Send + 'static,
{
    let queued = context::with_context(|ctx| {
        let shared = ctx.shared();
        shared.task_created();
        ctx.worker().push_new(Task::new_comm(Box::new(body), shared));
    });

    if queued.is_none() {
        context::fatal(Error::NotInitialized);
    }
}

fn start(descriptor: TaskDescriptor) {
    let current = context::current_header();

    // Nothing in here may suspend: the context belongs to this thread.
    let switch_to = context::with_context(|ctx| {
        let shared = ctx.shared();
        let task = Task::new(TaskKind::User, descriptor, shared);
        shared.task_created();

        // Safety: the header of the running task outlives this call.
        let may_switch = current
            .map(|header| unsafe { header.as_ref() })
            .is_some_and(|header| header.is_coroutine() && header.kind() != TaskKind::Comm)
            && !ctx.is_in_critical_section();

        if may_switch {
            Some(task)
        } else {
            ctx.worker().push_new(task);
            None
        }
    })
    .unwrap_or_else(|| context::fatal(Error::NotInitialized));

    if let (Some(task), Some(header)) = (switch_to, current) {
        // Safety: as above, we are that task.
        unsafe { header.as_ref() }.suspend(Suspend::SwitchTo(task));
    }
}
