use crate::task::{FnId, SubLoc};
use std::io;

/// Every condition the tasking layer treats as unrecoverable.
///
/// Most of these never reach a caller as a value: the runtime hands them to
/// [`RuntimeHooks::fatal`](crate::runtime::RuntimeHooks::fatal), which by
/// default logs and aborts the process. The `try_*` entry points return them
/// instead so the checks can be exercised without tearing the process down.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to query process CPU affinity: {0}")]
    Affinity(#[source] io::Error),

    #[error("process affinity mask does not permit any CPU")]
    NoAvailableCores,

    #[error("failed to pin worker {rank} to cpu {cpu}: {source}")]
    Pin {
        rank: usize,
        cpu: usize,
        #[source]
        source: io::Error,
    },

    #[error("task call stack size resolved to zero")]
    ZeroStackSize,

    #[error("failed to allocate a {size} byte task stack: {source}")]
    StackAlloc {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn worker thread {rank}: {source}")]
    WorkerSpawn {
        rank: usize,
        #[source]
        source: io::Error,
    },

    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),

    #[error("teardown while worker {rank} holds {depth} critical section(s)")]
    CriticalSectionHeld { rank: usize, depth: usize },

    #[error("init while the calling thread holds {0} critical section(s)")]
    InitInCriticalSection(usize),

    #[error("`{0}` is not supported by this tasking layer")]
    Unsupported(&'static str),

    #[error("tasking layer is not initialized on this thread")]
    NotInitialized,

    #[error("a runtime is already active on this thread")]
    AlreadyActive,

    #[error("no task function registered under id {0}")]
    UnknownFn(FnId),

    #[error("sublocale {0} is not addressable from this locale")]
    InvalidSubloc(SubLoc),

    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
