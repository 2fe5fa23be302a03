//! A cooperative user-level tasking runtime.
//!
//! A fixed pool of worker threads multiplexes many stackful tasks. Tasks are
//! fire-and-forget: they synchronize through full/empty locks
//! ([`sync::FeLock`]), and any lock that must keep a task on its worker goes
//! through a critical-section guard ([`sync::CsMutex`]).
//!
//! ```no_run
//! use weft::sync::FeLock;
//! use weft::task::{self, TaskDescriptor, SUBLOC_ANY};
//! use std::sync::Arc;
//!
//! fn producer(desc: &TaskDescriptor) {
//!     let slot = desc.args::<Arc<FeLock>>().expect("slot argument");
//!     slot.wait_until_empty_then_lock();
//!     slot.signal_full_and_unlock();
//! }
//!
//! #[weft::main(worker_threads = 4)]
//! fn main() {
//!     let slot = Arc::new(FeLock::new());
//!     task::spawn_fn(producer, TaskDescriptor::with_args(Arc::clone(&slot)), SUBLOC_ANY);
//!
//!     slot.wait_until_full_then_lock();
//!     slot.unlock();
//! }
//! ```

#[doc(inline)]
pub use weft_macros::main;

#[doc(inline)]
pub use weft_macros::test;

mod context;

mod error;
pub use error::{Error, Result};

pub mod runtime;

pub mod sync;

pub mod task;

mod utils;
pub use utils::affinity::{available_cores, discover_available_cores, physical_cores};

#[cfg(test)]
mod test_utils;
