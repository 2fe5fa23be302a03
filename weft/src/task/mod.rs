//! Tasks: creation, identity, private storage and suspension.
//!
//! A task is a plain function run on its own stack. It keeps running until
//! it returns, yields, sleeps, or waits on a [`FeLock`](crate::sync::FeLock),
//! and may resume on a different worker after each of those, unless it
//! suspended inside a critical section.

// Public API
mod descriptor;
pub use descriptor::{
    DescriptorFields, FnId, FnTable, PrivateData, SUBLOC_ANY, SubLoc, TaskDescriptor, TaskFn,
};

pub mod id;
pub use id::{Id, MAIN_TASK_ID, id, try_id};

mod local;
pub use local::{
    get_subloc, requested_subloc, serial_state, set_requested_subloc, set_serial_state,
    set_subloc, with_current_descriptor, with_private_data,
};

mod spawn;
pub use spawn::{execute_on, spawn, spawn_comm_task, spawn_fn, start_moved_task};

mod suspend;
pub use suspend::{sleep, sleep_secs, yield_now};

// Exports
mod raw;
pub(crate) use raw::{Header, Suspend, Task, TaskKind, TaskRef};

pub(crate) mod stack;
