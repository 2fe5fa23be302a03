//! Accessors for the running task's private storage.
//!
//! Everything here follows the *task*, not the thread: a task that migrates
//! to another worker keeps its descriptor. Code that is not running as a
//! task (a thread outside the runtime, or before init) sees a read-only
//! default descriptor instead.

use crate::context;
use crate::error::Error;
use crate::task::descriptor::is_local_subloc;
use crate::task::{PrivateData, SubLoc, TaskDescriptor};

thread_local! {
    static FALLBACK: TaskDescriptor = TaskDescriptor::new();
}

/// Runs `f` with the descriptor of the calling task.
pub fn with_current_descriptor<F, R>(f: F) -> R
where
    F: FnOnce(&TaskDescriptor) -> R,
{
    match context::current_header() {
        // Safety: the header of the running task outlives this call, and
        // moves with the task if `f` suspends.
        Some(header) => f(unsafe { header.as_ref() }.descriptor()),
        None => FALLBACK.with(f),
    }
}

/// Runs `f` on the caller-defined private data slot of the calling task.
///
/// # Panics
///
/// Panics on a nested call, the slot is already borrowed.
pub fn with_private_data<F, R>(f: F) -> R
where
    F: FnOnce(&mut PrivateData) -> R,
{
    with_current_descriptor(|desc| f(&mut desc.private_data()))
}

/// Whether the calling task is in a serial region, where spawning runs the
/// task body in place.
pub fn serial_state() -> bool {
    with_current_descriptor(TaskDescriptor::serial_state)
}

/// Ignored outside of a task.
pub fn set_serial_state(serial: bool) {
    with_task_descriptor("set_serial_state", |desc| desc.set_serial_state(serial));
}

pub fn requested_subloc() -> SubLoc {
    with_current_descriptor(TaskDescriptor::requested_subloc)
}

/// Ignored outside of a task.
pub fn set_requested_subloc(subloc: SubLoc) {
    with_task_descriptor("set_requested_subloc", |desc| desc.set_requested_subloc(subloc));
}

/// Sublocale the calling task runs on. There is only one.
pub fn get_subloc() -> SubLoc {
    0
}

/// Records where the calling task wants to run. Only `0` and
/// [`SUBLOC_ANY`](crate::task::SUBLOC_ANY) exist, anything else is fatal.
pub fn set_subloc(subloc: SubLoc) {
    if !is_local_subloc(subloc) {
        context::fatal(Error::InvalidSubloc(subloc));
    }
    set_requested_subloc(subloc);
}

fn with_task_descriptor(op: &'static str, f: impl FnOnce(&TaskDescriptor)) {
    match context::current_header() {
        // Safety: the header of the running task outlives this call.
        Some(header) => f(unsafe { header.as_ref() }.descriptor()),
        None => tracing::debug!(op, "not running as a task, ignored"),
    }
}
