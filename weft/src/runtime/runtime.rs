use crate::context::{self, Context, Shared};
use crate::error::{Error, Result};
use crate::runtime::{DefaultHooks, RuntimeHooks, ThreadPool, Worker};
use crate::task::{FnTable, Header};
use crate::utils::ScopeGuard;
use crate::utils::affinity::{available_cores, physical_cores};
use crossbeam_deque::Worker as CbWorker;
use std::convert::TryFrom;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Global queue interval default value.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn(usize) -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    pub(crate) fn name(&self, rank: usize) -> String {
        (self.0)(rank)
    }
}

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|rank| format!("weft-{rank}")))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // We print a placeholder since the closure itself isn't printable.
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and starts the tasking layer on the calling thread.
///
/// The calling thread becomes worker 0 and its code becomes the *main task*.
/// The runtime spawns the remaining workers as OS threads named `weft-{rank}`.
///
/// ```no_run
/// use weft::runtime::Builder;
///
/// let runtime = Builder::new().worker_threads(4).init();
/// runtime.call_main(|| {
///     // spawn tasks, wait on full/empty locks, ...
/// });
/// runtime.teardown();
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Explicit worker count. Takes precedence over whatever the hooks
    /// report. Includes the main thread.
    worker_threads: Option<usize>,

    /// Task call stack size in bytes, zero meaning unset.
    stack_size: usize,

    /// Extra worker slots for communication tasks. Defaults to
    /// `hooks.comm_polling_tasks()`.
    comm_tasks: Option<usize>,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Pin worker `i` to the `i`-th permitted CPU, wrapping around.
    pin_workers: bool,

    /// How many ticks before pulling a task from the global injector queue.
    global_queue_interval: u32,

    /// How many times a worker will loop over the global injector queue and
    /// other stealable queues to try and find work, before parking.
    max_steal_retries: usize,

    hooks: Arc<dyn RuntimeHooks>,

    fn_table: FnTable,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            stack_size: 0,
            comm_tasks: None,
            thread_name: default_thread_name_fn(),
            pin_workers: false,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
            hooks: Arc::new(DefaultHooks::new()),
            fn_table: FnTable::new(),
        }
    }

    /// The number of workers, the main thread included. Overrides
    /// [`RuntimeHooks::num_threads_per_locale`].
    ///
    /// Defaults to one worker per permitted CPU.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Call stack size of every task, in bytes. Zero falls back to the
    /// hooks.
    pub fn stack_size(mut self, val: usize) -> Self {
        self.stack_size = val;
        self
    }

    /// Worker slots reserved for communication tasks, on top of
    /// `worker_threads`.
    pub fn comm_tasks(mut self, val: usize) -> Self {
        self.comm_tasks = Some(val);
        self
    }

    /// Sets name of threads spawned by the `Runtime`'s thread pool.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move |_| val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// `Runtime`'s thread pool. It is given the worker rank.
    ///
    /// The default name fn yields "weft-{rank}".
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    pub fn pin_workers(mut self, val: bool) -> Self {
        self.pin_workers = val;
        self
    }

    /// Sets the number of scheduler ticks after which a worker looks at the
    /// global task queue before its local one.
    ///
    /// Setting the interval to `1` prioritizes the global queue. A higher
    /// value favors tasks that are already local to the worker.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    /// Services provided by the embedding runtime. Defaults to
    /// [`DefaultHooks`].
    pub fn hooks(mut self, hooks: Arc<dyn RuntimeHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Entry points addressable by id through [`crate::task::spawn`].
    pub fn fn_table(mut self, table: FnTable) -> Self {
        self.fn_table = table;
        self
    }

    /// Starts the runtime, reporting any failure through
    /// [`RuntimeHooks::fatal`].
    pub fn init(self) -> Runtime {
        let hooks = Arc::clone(&self.hooks);

        match self.try_init() {
            Ok(runtime) => runtime,
            Err(err) => match err.downcast::<Error>() {
                Ok(err) => hooks.fatal(&err),
                Err(err) => {
                    tracing::error!(%err, "failed to initialize the tasking layer");
                    std::process::abort()
                }
            },
        }
    }

    /// Starts the runtime.
    ///
    /// Fails if a runtime is already active on this thread, if the thread is
    /// inside a critical section, or if the configuration, the affinity query
    /// or a worker spawn fails.
    pub fn try_init(self) -> anyhow::Result<Runtime> {
        if context::is_active() {
            return Err(Error::AlreadyActive.into());
        }

        let depth = context::pre_init_depth();
        if depth > 0 {
            return Err(Error::InitInCriticalSection(depth).into());
        }

        let cfg = RuntimeConfig::try_from(self)?;
        let total = cfg.total_workers();

        tracing::debug!(
            worker_threads = cfg.worker_threads,
            comm_tasks = cfg.comm_tasks,
            stack_size = cfg.stack_size,
            available_cores = cfg.available_cores,
            physical_cores = cfg.physical_cores,
            "initializing tasking layer"
        );

        let queues = (0..total).map(|_| CbWorker::new_lifo()).collect::<Vec<_>>();
        let stealers = queues.iter().map(CbWorker::stealer).collect::<Vec<_>>();
        let shared = Arc::new(Shared::new(cfg, stealers));

        let mut queues = queues.into_iter().enumerate();
        let (_, root_queue) = queues
            .next()
            .expect("there is always at least one worker");

        let context = Rc::new(Context::new(Worker::new(0, Arc::clone(&shared), root_queue)));
        let main = Header::main(&shared);
        context.replace_current(Some(NonNull::from(&*main)));
        context::enter(Rc::clone(&context))?;

        let mut rollback = ScopeGuard::new(|| {
            context::exit();
        });
        let pool = ThreadPool::spawn(&shared, queues)?;
        rollback.disarm();

        Ok(Runtime {
            shared,
            pool,
            context,
            main,
            torn_down: false,
        })
    }
}

/// A running tasking layer. Lives on the thread that created it.
///
/// Dropping it shuts the workers down without the consistency checks of
/// [`Runtime::teardown`].
#[derive(Debug)]
pub struct Runtime {
    shared: Arc<Shared>,

    pool: ThreadPool,

    context: Rc<Context>,

    /// Storage of the main task. The context points at it.
    main: Box<Header>,

    torn_down: bool,
}

impl Runtime {
    /// Runs the program's main function as the main task.
    pub fn call_main<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        debug_assert_eq!(
            context::current_header(),
            Some(NonNull::from(&*self.main)),
            "main function called outside of the main task"
        );

        let _span = tracing::debug_span!("main_task").entered();
        f()
    }

    /// Called once the embedding program's standard modules are up. From then
    /// on tasks started with [`execute_on`](crate::task::execute_on) take
    /// part in the running-task count, and the main task is counted once.
    pub fn std_modules_initialized(&self) {
        if !self.shared.can_count_running.swap(true, Ordering::AcqRel) {
            self.shared.cfg.hooks.running_task_inc();
        }
    }

    /// Stops every worker and deactivates the runtime.
    ///
    /// Holding a critical section at this point is a fatal error, reported
    /// through [`RuntimeHooks::fatal`].
    pub fn teardown(mut self) {
        if let Err(err) = self.teardown_inner() {
            self.shared.fatal(err);
        }
    }

    /// Like [`Runtime::teardown`], but hands the failed check back. The
    /// runtime is shut down either way.
    pub fn try_teardown(mut self) -> Result<()> {
        self.teardown_inner()
    }

    fn teardown_inner(&mut self) -> Result<()> {
        self.shared.critical.ensure_released()?;
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        tracing::debug!(live_tasks = self.shared.live_tasks(), "tearing down tasking layer");

        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.unpark_all_threads();
        let joined = self.pool.join_all();

        let abandoned = self.shared.drain_queues().len() + self.context.worker().abandon_remaining();
        if abandoned > 0 {
            tracing::warn!(abandoned, "tasks never ran to completion");
        }

        context::exit();
        joined
    }

    /// Number of workers, the main thread included.
    pub fn thread_count(&self) -> usize {
        self.shared.cfg.worker_threads
    }

    /// Tasks spawned and not yet returned.
    pub fn live_tasks(&self) -> usize {
        self.shared.live_tasks()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown_inner() {
            tracing::error!(%err, "error during runtime shutdown");
        }
    }
}

// Export runtime builder as a RuntimeConfig object to be consumed by each
// worker.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) comm_tasks: usize,
    pub(crate) stack_size: usize,
    pub(crate) available_cores: usize,
    pub(crate) physical_cores: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) pin_workers: bool,
    pub(crate) global_queue_interval: u32,
    pub(crate) max_steal_retries: usize,
    pub(crate) hooks: Arc<dyn RuntimeHooks>,
    pub(crate) fn_table: Arc<FnTable>,
}

impl RuntimeConfig {
    /// Every worker slot: task workers and communication slots.
    pub(crate) fn total_workers(&self) -> usize {
        self.worker_threads + self.comm_tasks
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let hooks = builder.hooks;
        let available_cores = available_cores()?;

        let mut worker_threads = builder
            .worker_threads
            .or_else(|| hooks.num_threads_per_locale().filter(|n| *n > 0))
            .unwrap_or(available_cores);

        if let Some(max) = hooks.comm_max_threads().filter(|max| *max > 0) {
            worker_threads = worker_threads.min(max);
        }

        let stack_size = resolve_stack_size(builder.stack_size, hooks.as_ref())?;

        Ok(RuntimeConfig {
            worker_threads,
            comm_tasks: builder
                .comm_tasks
                .unwrap_or_else(|| hooks.comm_polling_tasks()),
            stack_size,
            available_cores,
            physical_cores: physical_cores()?,
            thread_name: builder.thread_name,
            pin_workers: builder.pin_workers,
            global_queue_interval: builder.global_queue_interval,
            max_steal_retries: builder.max_steal_retries,
            hooks,
            fn_table: Arc::new(builder.fn_table),
        })
    }
}

fn resolve_stack_size(requested: usize, hooks: &dyn RuntimeHooks) -> Result<usize> {
    let size = Some(requested)
        .filter(|size| *size > 0)
        .or_else(|| hooks.call_stack_size().filter(|size| *size > 0))
        .unwrap_or_else(|| hooks.default_call_stack_size());

    if size == 0 {
        Err(Error::ZeroStackSize)
    } else {
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::DEFAULT_CALL_STACK_SIZE;
    use crate::test_utils::PanicHooks;
    use rstest::rstest;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    // We need this to inject RuntimeConfig in every worker's shared state.
    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);

    // The runtime owns the main thread's context.
    assert_not_impl_any!(Runtime: Send, Sync);

    #[derive(Debug)]
    struct StackHooks {
        configured: Option<usize>,
        default: usize,
    }

    impl RuntimeHooks for StackHooks {
        fn call_stack_size(&self) -> Option<usize> {
            self.configured
        }

        fn default_call_stack_size(&self) -> usize {
            self.default
        }
    }

    #[rstest]
    #[case::explicit(4096, Some(8192), 1024, Some(4096))]
    #[case::configured(0, Some(8192), 1024, Some(8192))]
    #[case::configured_zero(0, Some(0), 1024, Some(1024))]
    #[case::fallback(0, None, 1024, Some(1024))]
    #[case::zero(0, None, 0, None)]
    fn test_resolve_stack_size(
        #[case] requested: usize,
        #[case] configured: Option<usize>,
        #[case] default: usize,
        #[case] expected: Option<usize>,
    ) {
        let hooks = StackHooks {
            configured,
            default,
        };
        assert_eq!(resolve_stack_size(requested, &hooks).ok(), expected);
    }

    #[test]
    fn test_config_resolution_order() -> anyhow::Result<()> {
        let cores = available_cores()?;

        let cfg = RuntimeConfig::try_from(Builder::new().hooks(Arc::new(DefaultHooks::new())))?;
        assert!(cfg.worker_threads > 0);
        assert_eq!(cfg.available_cores, cores);
        assert!(cfg.stack_size > 0);

        let hooks = PanicHooks::new().threads_per_locale(3).comm_polling_tasks(2);
        let cfg = RuntimeConfig::try_from(Builder::new().hooks(Arc::new(hooks)))?;
        assert_eq!(cfg.worker_threads, 3);
        assert_eq!(cfg.comm_tasks, 2);
        assert_eq!(cfg.total_workers(), 5);

        // Explicit values win over the hooks.
        let hooks = PanicHooks::new().threads_per_locale(3).comm_polling_tasks(2);
        let cfg = RuntimeConfig::try_from(
            Builder::new()
                .hooks(Arc::new(hooks))
                .worker_threads(7)
                .comm_tasks(0)
                .stack_size(64 * 1024),
        )?;
        assert_eq!(cfg.worker_threads, 7);
        assert_eq!(cfg.comm_tasks, 0);
        assert_eq!(cfg.stack_size, 64 * 1024);
        Ok(())
    }

    #[test]
    fn test_comm_layer_caps_workers() -> anyhow::Result<()> {
        let hooks = PanicHooks::new().comm_max_threads(2);
        let cfg = RuntimeConfig::try_from(Builder::new().hooks(Arc::new(hooks)).worker_threads(8))?;
        assert_eq!(cfg.worker_threads, 2);
        Ok(())
    }

    #[test]
    fn test_default_stack_size() -> anyhow::Result<()> {
        let cfg = RuntimeConfig::try_from(Builder::new().hooks(Arc::new(PanicHooks::new())))?;
        assert_eq!(cfg.stack_size, DEFAULT_CALL_STACK_SIZE);
        Ok(())
    }

    #[test]
    fn test_default_thread_names() {
        let names = default_thread_name_fn();
        assert_eq!(names.name(0), "weft-0");
        assert_eq!(names.name(12), "weft-12");

        let fixed = Builder::new().thread_name("pool").thread_name;
        assert_eq!(fixed.name(3), "pool");
    }

    #[rstest]
    #[case::zero_workers(|b: Builder| b.worker_threads(0))]
    #[case::zero_interval(|b: Builder| b.global_queue_interval(0))]
    #[case::zero_retries(|b: Builder| b.max_steal_retries(0))]
    #[should_panic]
    fn test_invalid_builder_values(#[case] configure: fn(Builder) -> Builder) {
        configure(Builder::new());
    }
}
