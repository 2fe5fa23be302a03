use crate::context::{self, CriticalSections};
use crate::error::Error;
use crate::runtime::{AddMode, RuntimeConfig, TimerQueue, earliest};
use crate::task::TaskRef;
use crossbeam_deque::{Injector, Stealer};
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, Thread};
use std::time::Instant;

/// State shared by every worker of one runtime.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cfg: RuntimeConfig,

    pub(crate) shutdown: AtomicBool,

    /// Global FIFO queue. New tasks spawned from outside a worker loop and
    /// yielded tasks land here.
    pub(crate) injector: Injector<TaskRef>,

    /// One queue per worker for tasks that must resume on that worker: they
    /// suspended while the worker was inside a critical section. Only the
    /// owning worker pops from its queue.
    pub(crate) pinned: Box<[Injector<TaskRef>]>,

    /// Stealers of every worker's local deque, indexed by rank. Used to
    /// decide whether there is any work left before parking.
    pub(crate) stealers: Box<[Stealer<TaskRef>]>,

    pub(crate) critical: CriticalSections,

    /// LIFO collection of parked workers. We unpark in LIFO order as the
    /// latest parked thread is the one where CPU cache will be the hottest.
    pub(crate) parked_threads: RwLock<VecDeque<(usize, Thread)>>,

    should_unpark: Box<[CachePadded<AtomicBool>]>,

    /// Sleepers free to resume on any worker.
    timers: Mutex<TimerQueue>,

    /// Tasks created and not yet returned.
    live_tasks: AtomicUsize,

    /// Set once the caller's standard modules are up, from then on
    /// `execute_on` tasks take part in the running-task count.
    pub(crate) can_count_running: AtomicBool,
}

impl Shared {
    pub(crate) fn new(cfg: RuntimeConfig, stealers: Vec<Stealer<TaskRef>>) -> Self {
        let total = cfg.total_workers();
        debug_assert_eq!(stealers.len(), total);

        Self {
            shutdown: AtomicBool::new(false),
            injector: Injector::new(),
            pinned: (0..total).map(|_| Injector::new()).collect(),
            stealers: stealers.into_boxed_slice(),
            critical: CriticalSections::new(total),
            parked_threads: RwLock::new(VecDeque::with_capacity(total)),
            should_unpark: (0..total)
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect(),
            timers: Mutex::new(TimerQueue::new()),
            live_tasks: AtomicUsize::new(0),
            can_count_running: AtomicBool::new(false),
            cfg,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Reports an unrecoverable condition through the configured hooks.
    #[cold]
    pub(crate) fn fatal(&self, err: Error) -> ! {
        self.cfg.hooks.fatal(&err)
    }

    pub(crate) fn push_global(&self, task: TaskRef) {
        self.injector.push(task);
        self.unpark_one_thread();
    }

    pub(crate) fn push_pinned(&self, rank: usize, task: TaskRef) {
        self.pinned[rank].push(task);
        self.unpark_worker(rank);
    }

    /// Makes a task that was blocked runnable again, from whatever thread
    /// released it.
    pub(crate) fn schedule(&self, task: TaskRef) {
        if let Some(rank) = task.pinned_to() {
            return self.push_pinned(rank, task);
        }

        // Keep the task local when the waker is one of our own workers.
        let mut task = Some(task);
        context::with_context(|ctx| {
            if ptr::eq(Arc::as_ptr(ctx.shared()), self)
                && let Some(task) = task.take()
            {
                ctx.worker().add_task(task, AddMode::Lifo);
            }
        });

        if let Some(task) = task {
            self.push_global(task);
        }
    }

    /// Puts a sleeper on the shared timer queue. A parked worker is woken
    /// when the new deadline comes first, so that it parks again with the
    /// right timeout.
    pub(crate) fn add_timer(&self, task: TaskRef, deadline: Instant) {
        let earliest = self.timers.lock().push(task, deadline);
        if earliest {
            self.unpark_one_thread();
        }
    }

    pub(crate) fn pop_expired_timer(&self, now: Instant) -> Option<TaskRef> {
        self.timers.lock().pop_expired(now)
    }

    pub(crate) fn task_created(&self) {
        self.live_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_finished(&self) {
        self.live_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn live_tasks(&self) -> usize {
        self.live_tasks.load(Ordering::Relaxed)
    }

    fn has_work(&self, rank: usize) -> bool {
        !self.injector.is_empty()
            || !self.pinned[rank].is_empty()
            || self.stealers.iter().any(|s| !s.is_empty())
    }

    /// Parks the calling worker until there is work for it, `deadline` or
    /// the earliest shared timer passes, or `ready` turns true. `ready` lets
    /// the main thread wait on a condition of its own while it helps run
    /// tasks.
    pub(crate) fn park_worker(&self, rank: usize, deadline: Option<Instant>, ready: &dyn Fn() -> bool) {
        let should_unpark = &self.should_unpark[rank];

        let deadline = {
            let mut parked_threads = self.parked_threads.write();

            // Checked *while holding the lock*: anyone pushing work or an
            // earlier timer after this point has to take the lock to unpark
            // us, and will find us in the list.
            if self.has_work(rank) || self.is_shutdown() || ready() {
                return;
            }

            should_unpark.store(false, Ordering::Release);
            parked_threads.push_back((rank, thread::current()));

            earliest(deadline, self.timers.lock().next_deadline())
        };

        tracing::trace!(rank, "worker parked");

        // Loop to account for spurious wakeups.
        while !should_unpark.load(Ordering::Acquire) && !ready() && !self.is_shutdown() {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }

        // We may have woken up on our own (timer or condition), in which case
        // nobody removed us from the list.
        self.parked_threads.write().retain(|(r, _)| *r != rank);
        tracing::trace!(rank, "worker unparked");
    }

    pub(crate) fn unpark_one_thread(&self) -> bool {
        let parked = self.parked_threads.write().pop_back();

        match parked {
            Some((rank, thread)) => {
                self.should_unpark[rank].store(true, Ordering::Release);
                thread.unpark();
                true
            }
            None => false,
        }
    }

    pub(crate) fn unpark_worker(&self, rank: usize) -> bool {
        let parked = {
            let mut parked_threads = self.parked_threads.write();
            parked_threads
                .iter()
                .position(|(r, _)| *r == rank)
                .and_then(|pos| parked_threads.remove(pos))
        };

        match parked {
            Some((rank, thread)) => {
                self.should_unpark[rank].store(true, Ordering::Release);
                thread.unpark();
                true
            }
            None => false,
        }
    }

    pub(crate) fn unpark_all_threads(&self) -> usize {
        let mut parked_threads = self.parked_threads.write();
        let num_unparked = parked_threads.len();

        while let Some((rank, thread)) = parked_threads.pop_back() {
            self.should_unpark[rank].store(true, Ordering::Release);
            thread.unpark();
        }

        num_unparked
    }

    /// Pops every task left in the shared queues. Used at teardown.
    pub(crate) fn drain_queues(&self) -> Vec<TaskRef> {
        let mut tasks = self.timers.lock().drain().collect::<Vec<_>>();

        for queue in std::iter::once(&self.injector).chain(self.pinned.iter()) {
            loop {
                match queue.steal() {
                    crossbeam_deque::Steal::Success(task) => tasks.push(task),
                    crossbeam_deque::Steal::Retry => continue,
                    crossbeam_deque::Steal::Empty => break,
                }
            }
        }

        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskDescriptor, TaskKind};
    use crate::test_utils::test_builder;
    use anyhow::Result;
    use static_assertions::assert_impl_all;
    use std::time::Duration;

    assert_impl_all!(Shared: Send, Sync);

    fn new_task(shared: &Arc<Shared>) -> TaskRef {
        Task::new(TaskKind::User, TaskDescriptor::default(), shared)
    }

    #[test]
    fn test_schedule_keeps_own_wakeups_local() -> Result<()> {
        let runtime = test_builder(1).try_init()?;
        let shared = Arc::clone(runtime.shared());

        // The calling thread is worker 0 of this runtime.
        shared.schedule(new_task(&shared));
        assert!(shared.injector.is_empty());
        assert_eq!(shared.stealers[0].len(), 1);

        let remote = Arc::clone(&shared);
        thread::spawn(move || remote.schedule(new_task(&remote)))
            .join()
            .map_err(|_| anyhow::anyhow!("waker thread panicked"))?;
        assert_eq!(shared.injector.len(), 1);

        runtime.teardown();
        Ok(())
    }

    #[test]
    fn test_shared_timers_fire_and_drain() -> Result<()> {
        let runtime = test_builder(1).try_init()?;
        let shared = Arc::clone(runtime.shared());

        let now = Instant::now();
        shared.add_timer(new_task(&shared), now);
        shared.add_timer(new_task(&shared), now + Duration::from_secs(3600));

        assert!(shared.pop_expired_timer(now).is_some());
        assert!(shared.pop_expired_timer(now).is_none());
        assert_eq!(shared.drain_queues().len(), 1);

        runtime.teardown();
        Ok(())
    }
}
