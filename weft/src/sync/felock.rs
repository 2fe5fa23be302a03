use crate::context::{self, is_in_critical_section};
use crate::task::{Suspend, TaskRef};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

/// A mutex paired with a full/empty flag, the building block of
/// single-assignment and producer/consumer variables.
///
/// Waiting suspends only the calling task: its worker goes on running other
/// tasks. The main thread keeps running tasks while it waits, and threads
/// outside the runtime simply block.
///
/// Releasing the lock hands it directly to the first waiter whose condition
/// holds, so a waiter that is woken up always owns the lock. A signal
/// happens-before the return of the wait it releases.
///
/// The flag starts out empty and the lock unlocked.
///
/// # Examples
///
/// ```no_run
/// use weft::sync::FeLock;
///
/// let slot = FeLock::new();
///
/// // producer
/// slot.wait_until_empty_then_lock();
/// slot.signal_full_and_unlock();
///
/// // consumer
/// slot.wait_until_full_then_lock();
/// assert!(slot.is_full());
/// slot.signal_empty_and_unlock();
/// ```
pub struct FeLock {
    state: Mutex<FeState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Want {
    Any,
    Full,
    Empty,
}

impl Want {
    fn admits(self, full: bool) -> bool {
        match self {
            Want::Any => true,
            Want::Full => full,
            Want::Empty => !full,
        }
    }
}

struct FeState {
    locked: bool,
    full: bool,
    waiters: VecDeque<Waiter>,
}

impl FeState {
    fn try_take(&mut self, want: Want) -> bool {
        if !self.locked && want.admits(self.full) {
            self.locked = true;
            true
        } else {
            false
        }
    }

    /// Gives the (just released) lock to the first eligible waiter.
    fn hand_off(&mut self) -> Option<Waiter> {
        let full = self.full;
        let pos = self.waiters.iter().position(|w| w.want().admits(full))?;

        self.locked = true;
        self.waiters.remove(pos)
    }
}

enum Waiter {
    Task { task: TaskRef, want: Want },
    Thread { grant: Arc<Grant>, want: Want },
}

impl Waiter {
    fn want(&self) -> Want {
        match self {
            Waiter::Task { want, .. } | Waiter::Thread { want, .. } => *want,
        }
    }

    fn wake(self) {
        match self {
            Waiter::Task { task, .. } => match task.shared() {
                Some(shared) => shared.schedule(task),
                None => tracing::warn!(
                    task = task.id().as_u64(),
                    "full/empty lock released after its runtime was torn down"
                ),
            },
            Waiter::Thread { grant, .. } => grant.grant(),
        }
    }
}

/// Ownership hand-off to a thread blocked outside of a coroutine.
struct Grant {
    granted: AtomicBool,
    thread: Thread,
}

impl Grant {
    fn new() -> Self {
        Self {
            granted: AtomicBool::new(false),
            thread: thread::current(),
        }
    }

    fn is_granted(&self) -> bool {
        self.granted.load(Ordering::Acquire)
    }

    fn grant(&self) {
        self.granted.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// Sent by a task that has to wait on a lock. The worker queues the task on
/// the lock once the task is off its stack.
pub(crate) struct Parked {
    lock: NonNull<FeLock>,
    want: Want,
}

impl Parked {
    /// Queues `task` as a waiter, or gives it back if the lock became
    /// available in the meantime.
    ///
    /// # Safety
    ///
    /// The lock must still be alive. It is, as long as `task` is the task
    /// that sent this value: its suspended frame borrows the lock.
    pub(crate) unsafe fn enqueue_or_grant(self, task: TaskRef) -> Option<TaskRef> {
        let lock = unsafe { self.lock.as_ref() };
        let mut state = lock.state.lock();

        if state.try_take(self.want) {
            return Some(task);
        }

        state.waiters.push_back(Waiter::Task {
            task,
            want: self.want,
        });
        None
    }
}

impl FeLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FeState {
                locked: false,
                full: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquires the lock regardless of the flag.
    #[track_caller]
    pub fn lock(&self) {
        self.acquire(Want::Any);
    }

    /// Releases the lock, leaving the flag as is.
    #[track_caller]
    pub fn unlock(&self) {
        debug_assert!(
            !is_in_critical_section(),
            "full/empty lock used inside a critical section"
        );
        self.release(None);
    }

    /// Blocks the calling task until the flag is full, then acquires the
    /// lock. Returns immediately if the lock is free and the flag full.
    #[track_caller]
    pub fn wait_until_full_then_lock(&self) {
        self.acquire(Want::Full);
    }

    /// Blocks the calling task until the flag is empty, then acquires the
    /// lock.
    #[track_caller]
    pub fn wait_until_empty_then_lock(&self) {
        self.acquire(Want::Empty);
    }

    /// Sets the flag to full and releases the lock in one step.
    pub fn signal_full_and_unlock(&self) {
        self.release(Some(true));
    }

    /// Sets the flag to empty and releases the lock in one step.
    pub fn signal_empty_and_unlock(&self) {
        self.release(Some(false));
    }

    /// Snapshot of the flag.
    pub fn is_full(&self) -> bool {
        self.state.lock().full
    }

    #[track_caller]
    fn acquire(&self, want: Want) {
        debug_assert!(
            !is_in_critical_section(),
            "full/empty lock used inside a critical section"
        );

        if self.state.lock().try_take(want) {
            return;
        }

        match context::current_header() {
            // Safety: the header of the running task outlives this call.
            Some(header) if unsafe { header.as_ref() }.is_coroutine() => {
                let parked = Parked {
                    lock: NonNull::from(self),
                    want,
                };
                // On return a releaser handed the lock over to us.
                unsafe { header.as_ref() }.suspend(Suspend::Park(parked));
            }
            _ => self.block_thread(want),
        }
    }

    fn block_thread(&self, want: Want) {
        let grant = Arc::new(Grant::new());

        {
            let mut state = self.state.lock();
            if state.try_take(want) {
                return;
            }
            state.waiters.push_back(Waiter::Thread {
                grant: Arc::clone(&grant),
                want,
            });
        }

        // The main thread is a worker too: it keeps running tasks until the
        // lock is handed over.
        let helped = context::with_context(|ctx| {
            ctx.worker().run_until(ctx, &|| grant.is_granted());
        });

        if helped.is_none() {
            while !grant.is_granted() {
                thread::park();
            }
        }
    }

    fn release(&self, full: Option<bool>) {
        let next = {
            let mut state = self.state.lock();
            debug_assert!(state.locked, "releasing a full/empty lock that is not held");

            if let Some(full) = full {
                state.full = full;
            }
            state.locked = false;
            state.hand_off()
        };

        // Wake outside of the state lock.
        if let Some(waiter) = next {
            waiter.wake();
        }
    }
}

impl Default for FeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FeLock {
    fn drop(&mut self) {
        let waiters = self.state.get_mut().waiters.len();
        if waiters > 0 {
            tracing::warn!(waiters, "full/empty lock destroyed with blocked waiters");
        }
    }
}

impl fmt::Debug for FeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FeLock")
            .field("locked", &state.locked)
            .field("full", &state.full)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    assert_impl_all!(FeLock: Send, Sync);

    #[rstest]
    #[case::any_empty(Want::Any, false, true)]
    #[case::any_full(Want::Any, true, true)]
    #[case::full_on_full(Want::Full, true, true)]
    #[case::full_on_empty(Want::Full, false, false)]
    #[case::empty_on_empty(Want::Empty, false, true)]
    #[case::empty_on_full(Want::Empty, true, false)]
    fn test_want_admits(#[case] want: Want, #[case] full: bool, #[case] expected: bool) {
        assert_eq!(want.admits(full), expected);
    }

    #[test]
    fn test_starts_empty_and_unlocked() {
        let lock = FeLock::new();

        assert!(!lock.is_full());
        lock.lock();
        lock.unlock();
        lock.wait_until_empty_then_lock();
        lock.unlock();
    }

    #[test]
    fn test_wait_full_returns_immediately_when_full() {
        let lock = FeLock::new();

        lock.wait_until_empty_then_lock();
        lock.signal_full_and_unlock();
        assert!(lock.is_full());

        // No signaler involved.
        lock.wait_until_full_then_lock();
        assert!(lock.is_full());
        lock.signal_empty_and_unlock();
        assert!(!lock.is_full());
    }

    #[test]
    fn test_signal_releases_thread_waiter() {
        let lock = Arc::new(FeLock::new());
        let value = Arc::new(AtomicU64::new(0));

        let consumer = {
            let lock = Arc::clone(&lock);
            let value = Arc::clone(&value);
            thread::spawn(move || {
                lock.wait_until_full_then_lock();
                let full = lock.is_full();
                let seen = value.load(Ordering::Relaxed);
                lock.signal_empty_and_unlock();
                (full, seen)
            })
        };

        // Give the consumer a chance to block first; correctness does not
        // depend on it.
        thread::sleep(Duration::from_millis(20));

        lock.wait_until_empty_then_lock();
        value.store(42, Ordering::Relaxed);
        lock.signal_full_and_unlock();

        let (full, seen) = consumer.join().expect("consumer panicked");
        assert!(full);
        assert_eq!(seen, 42);

        // Consumer emptied it again.
        lock.wait_until_empty_then_lock();
        lock.unlock();
    }

    #[test]
    fn test_hand_off_skips_ineligible_waiters() {
        let mut state = FeState {
            locked: true,
            full: false,
            waiters: VecDeque::new(),
        };

        let full_waiter = Arc::new(Grant::new());
        let empty_waiter = Arc::new(Grant::new());
        state.waiters.push_back(Waiter::Thread {
            grant: Arc::clone(&full_waiter),
            want: Want::Full,
        });
        state.waiters.push_back(Waiter::Thread {
            grant: Arc::clone(&empty_waiter),
            want: Want::Empty,
        });

        state.locked = false;
        let next = state.hand_off().expect("empty waiter is eligible");
        assert_eq!(next.want(), Want::Empty);
        assert!(state.locked);
        assert_eq!(state.waiters.len(), 1);

        next.wake();
        assert!(empty_waiter.is_granted());
        assert!(!full_waiter.is_granted());
    }
}
