use crate::context;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identity of a task, stable for the task's whole life including
/// migrations between workers.
///
/// Ids are only meant to be compared for equality. They are never reused
/// within a process.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Id(NonZeroU64);

const MAIN_TASK_ID_VAL: u64 = 1;

/// Identity of the main task, the thread that initialized the runtime.
pub static MAIN_TASK_ID: Id = Id(NonZeroU64::new(MAIN_TASK_ID_VAL).unwrap());

/// Returns the [`Id`] of the calling task.
///
/// # Panics
///
/// Panics when called from a thread that is not running a task, e.g. before
/// the runtime is initialized. See [`try_id`].
#[track_caller]
pub fn id() -> Id {
    try_id().expect("can't get a task id when not inside a task")
}

/// Returns the [`Id`] of the calling task, or `None` outside of a task.
pub fn try_id() -> Option<Id> {
    // Safety: the header of the running task outlives this call.
    context::current_header().map(|header| unsafe { header.as_ref() }.id())
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Id {
    pub(crate) fn next() -> Self {
        // Id 1 belongs to the main task.
        static COUNTER: AtomicU64 = AtomicU64::new(MAIN_TASK_ID_VAL + 1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Wrapping a u64 at a billion tasks per second takes centuries.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_new_task_id_unique() {
        let n = 64;
        let ids = (0..4)
            .map(|_| thread::spawn(move || (0..n).map(|_| Id::next()).collect::<Vec<_>>()))
            .collect::<Vec<_>>()
            .into_iter()
            .flat_map(|h| h.join().expect("id thread panicked"))
            .collect::<HashSet<_>>();

        assert_eq!(ids.len(), 4 * n);
        assert!(!ids.contains(&MAIN_TASK_ID));
        assert!(ids.iter().all(|id| id.as_u64() > MAIN_TASK_ID_VAL));
    }

    #[test]
    fn test_no_id_outside_runtime() {
        let id = thread::spawn(try_id).join().expect("probe thread panicked");
        assert!(id.is_none());
    }
}
