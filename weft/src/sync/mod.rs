//! Synchronization that composes with task migration.
//!
//! [`FeLock`] is the task-level primitive: waiting on it suspends the task,
//! not the worker. [`CsMutex`] and [`critical_section`] cover OS-level locks,
//! which must keep their holder on one worker.

pub(crate) mod felock;
pub use felock::FeLock;

mod cs_mutex;
pub use cs_mutex::{CriticalSection, CsMutex, CsMutexGuard, critical_section};

pub use crate::context::{
    critical_section_depth, enter_critical_section, exit_critical_section,
    is_in_critical_section,
};
