use crate::context::{enter_critical_section, exit_critical_section};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

/// A blocking mutex that keeps its holder on the current worker.
///
/// Locking marks the calling worker as inside a critical section *before*
/// waiting for the lock, so the mark covers the wait as well. A task that
/// suspends while holding the guard resumes on the same worker, which is
/// where the guard will be dropped.
///
/// Waiting on this mutex blocks the whole worker thread, like any OS lock.
pub struct CsMutex<T: ?Sized> {
    inner: Mutex<T>,
}

/// Guard of a [`CsMutex`]. Releases the lock, then leaves the critical
/// section.
#[must_use = "if unused the CsMutex will immediately unlock"]
pub struct CsMutexGuard<'a, T: ?Sized> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
}

impl<T> CsMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> CsMutex<T> {
    pub fn lock(&self) -> CsMutexGuard<'_, T> {
        enter_critical_section();
        CsMutexGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
        }
    }

    /// Acquires the lock if it is free. A failed attempt leaves the critical
    /// section depth untouched.
    pub fn try_lock(&self) -> Option<CsMutexGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        enter_critical_section();
        Some(CsMutexGuard {
            guard: ManuallyDrop::new(guard),
        })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for CsMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for CsMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsMutex").field("inner", &&self.inner).finish()
    }
}

impl<T: ?Sized> Deref for CsMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for CsMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized> Drop for CsMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Safety: dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        exit_critical_section();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for CsMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Scoped critical-section mark for locks that do not go through
/// [`CsMutex`].
///
/// Take it right before acquiring the foreign lock and declare it first, so
/// it outlives the lock's guard:
///
/// ```no_run
/// let foreign = std::sync::Mutex::new(0);
///
/// let _cs = weft::sync::critical_section();
/// let mut value = foreign.lock().unwrap();
/// *value += 1;
/// ```
#[must_use = "the critical section ends when the guard is dropped"]
pub struct CriticalSection {
    // Leaves the section on the worker that entered it.
    _not_send: PhantomData<*const ()>,
}

pub fn critical_section() -> CriticalSection {
    enter_critical_section();
    CriticalSection {
        _not_send: PhantomData,
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        exit_critical_section();
    }
}

impl fmt::Debug for CriticalSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalSection").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as weft;
    use crate::context::critical_section_depth;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    assert_impl_all!(CsMutex<u32>: Send, Sync);
    assert_not_impl_any!(CsMutexGuard<'static, u32>: Send);
    assert_not_impl_any!(CriticalSection: Send);

    #[weft::test]
    fn test_lock_unlock_restores_depth() {
        let mutex = CsMutex::new(0_u32);
        assert_eq!(critical_section_depth(), 0);

        {
            let mut outer = mutex.lock();
            *outer += 1;
            assert_eq!(critical_section_depth(), 1);

            let _cs = critical_section();
            assert_eq!(critical_section_depth(), 2);
        }

        assert_eq!(critical_section_depth(), 0);
        assert_eq!(mutex.into_inner(), 1);
    }

    #[weft::test]
    fn test_failed_try_lock_leaves_depth() {
        let mutex = CsMutex::new(());

        let held = mutex.lock();
        assert_eq!(critical_section_depth(), 1);

        assert!(mutex.try_lock().is_none());
        assert_eq!(critical_section_depth(), 1);

        drop(held);
        let again = mutex.try_lock();
        assert!(again.is_some());
        assert_eq!(critical_section_depth(), 1);

        drop(again);
        assert_eq!(critical_section_depth(), 0);
    }

    #[weft::test]
    fn test_nested_guards_balance() {
        let mutexes = (0..5).map(CsMutex::new).collect::<Vec<_>>();

        let guards = mutexes.iter().map(CsMutex::lock).collect::<Vec<_>>();
        assert_eq!(critical_section_depth(), 5);
        assert_eq!(guards.iter().map(|g| **g).sum::<i32>(), 10);

        drop(guards);
        assert_eq!(critical_section_depth(), 0);
    }
}
