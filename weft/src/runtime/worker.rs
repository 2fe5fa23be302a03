use crate::context::{Context, Shared};
use crate::error::Error;
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::runtime::{AddMode, RuntimeConfig, TimerQueue, earliest};
use crate::task::stack::StackPool;
use crate::task::{Suspend, TaskRef};
use corosensei::CoroutineResult;
use crossbeam_deque::{Steal, Stealer, Worker as CbWorker};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// One worker of the pool. Rank 0 is the thread that initialized the
/// runtime: it only runs tasks while its main task waits, yields or sleeps.
/// Every other rank runs [`Worker::event_loop`] on its own thread.
#[derive(Debug)]
pub(crate) struct Worker {
    rank: usize,

    /// Determines how we run the event loop.
    cfg: RefCell<EventLoopConfig>,

    /// Event loop ticker.
    ticker: RefCell<Ticker>,

    /// Whether we should try to find our next task in the global queue.
    pop_global_queue: Cell<bool>,

    /// Tasks that must resume on this worker because they suspended inside a
    /// critical section. Pushed at the back for LIFO, at the front for FIFO.
    sticky: RefCell<VecDeque<TaskRef>>,

    /// Local LIFO queue other workers steal from.
    stealable: CbWorker<TaskRef>,

    /// Handle to all of the other worker's stealable queues. If there are N
    /// workers we will have N-1 queues to steal from.
    stealers: Vec<Stealer<TaskRef>>,

    /// Sleeping tasks pinned to this worker. Other sleepers go to the
    /// shared queue so that any idle worker can wake them.
    timers: RefCell<TimerQueue>,

    stacks: StackPool,

    shared: Arc<Shared>,
}

impl Worker {
    pub(crate) fn new(rank: usize, shared: Arc<Shared>, stealable: CbWorker<TaskRef>) -> Self {
        let mut stealers = shared
            .stealers
            .iter()
            .enumerate()
            .filter(|(other, _)| *other != rank)
            .map(|(_, s)| s.clone())
            .collect::<Vec<_>>();

        // Shuffle the stealers so that each worker's search order when trying to
        // steal work is different and hopefully unique to reduce contention.
        fastrand::shuffle(&mut stealers);

        Self {
            rank,
            cfg: RefCell::new((&shared.cfg).into()),
            ticker: RefCell::new(Ticker::new()),
            pop_global_queue: Cell::new(false),
            sticky: RefCell::new(VecDeque::new()),
            stealable,
            stealers,
            timers: RefCell::new(TimerQueue::new()),
            stacks: StackPool::new(shared.cfg.stack_size),
            shared,
        }
    }

    pub(crate) fn rank(&self) -> usize {
        self.rank
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    fn tick<T: TickerData>(&self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.ticker.borrow_mut().tick(ctx, data)
    }

    pub(crate) fn add_task(&self, task: TaskRef, mode: AddMode) {
        if task.pinned_to() == Some(self.rank) {
            let mut sticky = self.sticky.borrow_mut();
            match mode {
                AddMode::Lifo => sticky.push_back(task),
                AddMode::Fifo => sticky.push_front(task),
            }
            return;
        }

        match mode {
            AddMode::Lifo => {
                self.stealable.push(task);
                self.notify_parked();
            }
            // Crossbeam workers are LIFO, the global queue is our only FIFO
            // that other workers drain as well.
            AddMode::Fifo => self.shared.push_global(task),
        }
    }

    /// Queues a task that was just created. The main thread only runs tasks
    /// while it waits, so its new tasks go where any worker will pick them
    /// up.
    pub(crate) fn push_new(&self, task: TaskRef) {
        if self.rank == 0 {
            self.shared.push_global(task);
        } else {
            self.add_task(task, AddMode::Lifo);
        }
    }

    /// Wakes a parked worker so it can steal what we just queued. A worker
    /// about to park checks for work under the same lock, so nothing is lost
    /// when the list looks empty here.
    fn notify_parked(&self) {
        if !self.shared.parked_threads.read().is_empty() {
            self.shared.unpark_one_thread();
        }
    }

    pub(crate) fn find_task(&self) -> Option<TaskRef> {
        // Enforce scheduler fairness by force-checking the global queue with
        // frequency `global_queue_interval`.
        if self.pop_global_queue.replace(false)
            && let Some(task) = self
                .shared
                .injector
                .steal_batch_and_pop(&self.stealable)
                .success()
        {
            return Some(task);
        }

        // 1. Tasks bound to this worker, then tasks sent here by other
        //    workers for that same reason.
        self.sticky
            .borrow_mut()
            .pop_back()
            .or_else(|| self.pop_pinned())
            // 2. Our own stealable queue, LIFO for a hot cache.
            .or_else(|| self.stealable.pop())
            .or_else(|| {
                // 3. No local work, repeatedly try the global injector and other
                //    workers stealable queues.
                iter::repeat_with(|| {
                    self.shared
                        .injector
                        .steal_batch_and_pop(&self.stealable)
                        // The behavior of collect here is to return the first Success(T) so
                        // *we are not* iterating through all stealers everytime.
                        .or_else(|| self.stealers.iter().map(Stealer::steal).collect())
                })
                .take(self.cfg.borrow().max_steal_retries)
                .find(|s| !s.is_retry())
                .and_then(Steal::success)
            })
    }

    fn pop_pinned(&self) -> Option<TaskRef> {
        let queue = &self.shared.pinned[self.rank];
        loop {
            match queue.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        }
    }

    /// Runs `task` until it blocks or returns, then follows any task it
    /// switched to.
    pub(crate) fn run_task(&self, ctx: &Context, task: TaskRef) {
        let mut next = Some(task);

        while let Some(mut task) = next.take() {
            let prev = ctx.replace_current(Some(task.header_ptr()));
            let res = panic::catch_unwind(AssertUnwindSafe(|| task.resume(&self.stacks)));
            ctx.replace_current(prev);

            match res {
                Ok(Ok(CoroutineResult::Yield(reason))) => {
                    next = self.suspended(ctx, task, reason);
                }
                Ok(Ok(CoroutineResult::Return(()))) => {
                    task.recycle(&self.stacks);
                    self.shared.task_finished();
                }
                Ok(Err(err)) => self.shared.fatal(err),
                Err(payload) => self.shared.fatal(Error::TaskPanicked(panic_message(&*payload))),
            }
        }
    }

    /// Decides where a task that just handed control back goes. Returns the
    /// task to run next on this worker, if any.
    fn suspended(&self, ctx: &Context, task: TaskRef, reason: Suspend) -> Option<TaskRef> {
        // A task suspending inside a critical section resumes on this worker,
        // where the section will end.
        task.set_pinned_to(ctx.is_in_critical_section().then_some(self.rank));

        match reason {
            Suspend::Yield => {
                self.add_task(task, AddMode::Fifo);
                None
            }
            Suspend::SwitchTo(child) => {
                self.add_task(task, AddMode::Lifo);
                Some(child)
            }
            // Safety: `task` sent this value and is still suspended inside
            // the wait that borrows the lock.
            Suspend::Park(parked) => unsafe { parked.enqueue_or_grant(task) },
            Suspend::Sleep(deadline) => {
                if task.pinned_to() == Some(self.rank) {
                    self.timers.borrow_mut().push(task, deadline);
                } else {
                    self.shared.add_timer(task, deadline);
                }
                None
            }
        }
    }

    /// Requeues every sleeper whose deadline has passed, ours and the shared
    /// ones.
    fn fire_timers(&self) {
        let now = Instant::now();

        loop {
            let expired = self.timers.borrow_mut().pop_expired(now);
            match expired {
                Some(task) => self.add_task(task, AddMode::Fifo),
                None => break,
            }
        }

        while let Some(task) = self.shared.pop_expired_timer(now) {
            self.add_task(task, AddMode::Fifo);
        }
    }

    /// Earliest deadline among our pinned sleepers. [`Shared::park_worker`]
    /// accounts for the shared ones.
    fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().next_deadline()
    }

    /// Main loop of the pool threads, until the runtime shuts down.
    pub(crate) fn event_loop(&self, ctx: &Context) {
        tracing::trace!(rank = self.rank, "worker started");

        loop {
            self.fire_timers();

            match self.find_task() {
                Some(task) => self.run_task(ctx, task),
                None => self
                    .shared
                    .park_worker(self.rank, self.next_deadline(), &|| false),
            }

            let events = self.tick(&self.shared, &mut *self.cfg.borrow_mut());
            if events.contains(TickerEvents::SHUTDOWN) {
                break;
            } else if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
                self.pop_global_queue.set(true);
            }
        }

        self.abandon_remaining();
        tracing::trace!(rank = self.rank, "worker stopped");
    }

    /// Runs tasks on the calling thread until `ready` holds. Used by the main
    /// thread whenever its own task has to wait.
    pub(crate) fn run_until(&self, ctx: &Context, ready: &dyn Fn() -> bool) {
        self.drive(ctx, None, ready);
    }

    /// Runs tasks on the calling thread until `deadline` passes.
    pub(crate) fn sleep_until(&self, ctx: &Context, deadline: Instant) {
        self.drive(ctx, Some(deadline), &|| Instant::now() >= deadline);
    }

    /// Runs at most one ready task. Returns whether one ran.
    pub(crate) fn run_once(&self, ctx: &Context) -> bool {
        self.fire_timers();

        match self.find_task() {
            Some(task) => {
                self.run_task(ctx, task);
                true
            }
            None => false,
        }
    }

    fn drive(&self, ctx: &Context, deadline: Option<Instant>, ready: &dyn Fn() -> bool) {
        while !ready() {
            if !self.run_once(ctx) {
                let wake_at = earliest(deadline, self.next_deadline());
                self.shared.park_worker(self.rank, wake_at, ready);
            }

            // Shutdown is only ever requested by this thread, never while it
            // waits here.
            let events = self.tick(&self.shared, &mut *self.cfg.borrow_mut());
            if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
                self.pop_global_queue.set(true);
            }
        }
    }

    /// Drops every task still queued on this worker. Suspended ones are
    /// leaked, see [`Task`](crate::task::Task). Returns how many there were.
    pub(crate) fn abandon_remaining(&self) -> usize {
        let sticky = self.sticky.take();
        let timers = self.timers.take();
        let stealable = iter::from_fn(|| self.stealable.pop()).count();

        let abandoned = sticky.len() + timers.len() + stealable;
        if abandoned > 0 {
            tracing::warn!(rank = self.rank, abandoned, "worker stopped with queued tasks");
        }
        abandoned
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

#[derive(Debug, Clone)]
struct EventLoopConfig {
    global_queue_interval: u32,

    max_steal_retries: usize,
}

impl EventLoopConfig {
    #[inline(always)]
    fn should_pop_global_queue(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.global_queue_interval)
    }
}

impl From<&RuntimeConfig> for EventLoopConfig {
    fn from(cfg: &RuntimeConfig) -> EventLoopConfig {
        EventLoopConfig {
            global_queue_interval: cfg.global_queue_interval,
            max_steal_retries: cfg.max_steal_retries,
        }
    }
}

impl TickerData for EventLoopConfig {
    type Context = Arc<Shared>;

    #[inline(always)]
    fn update_and_check(&mut self, shared: &Self::Context, tick: u32) -> TickerEvents {
        // Fast-path to enforce shutdown
        if shared.is_shutdown() {
            return TickerEvents::SHUTDOWN;
        }

        if self.should_pop_global_queue(tick) {
            TickerEvents::POP_GLOBAL_QUEUE
        } else {
            TickerEvents::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_queue_interval() {
        let mut cfg = EventLoopConfig {
            global_queue_interval: 4,
            max_steal_retries: 1,
        };
        assert!(!cfg.should_pop_global_queue(3));
        assert!(cfg.should_pop_global_queue(4));
        assert!(cfg.should_pop_global_queue(8));

        cfg.global_queue_interval = 1;
        assert!(cfg.should_pop_global_queue(7));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*payload), "<non-string panic payload>");
    }
}
