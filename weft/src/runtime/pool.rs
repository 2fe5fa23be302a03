use crate::context::{self, Context, Shared};
use crate::error::{Error, Result};
use crate::runtime::Worker;
use crate::task::TaskRef;
use crate::utils::ScopeGuard;
use crate::utils::affinity::{allowed_cpus, cpu_for_rank};
use crate::utils::thread::pin_current_thread;
use crossbeam_deque::Worker as CbWorker;
use parking_lot::Mutex;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

/// The worker threads of a runtime, ranks 1 and up. Rank 0 is the thread that
/// initialized the runtime and is not part of the pool.
#[derive(Debug)]
pub(crate) struct ThreadPool {
    handles: Mutex<Vec<(usize, thread::JoinHandle<()>)>>,
}

impl ThreadPool {
    /// Starts one thread per queue. On failure the threads already running
    /// are stopped before returning.
    pub(crate) fn spawn<I>(shared: &Arc<Shared>, queues: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, CbWorker<TaskRef>)>,
    {
        let cpus = if shared.cfg.pin_workers {
            allowed_cpus()?
        } else {
            Vec::new()
        };

        let pool = Self {
            handles: Mutex::new(Vec::new()),
        };

        for (rank, queue) in queues {
            match spawn_worker_thread(Arc::clone(shared), rank, queue, cpu_for_rank(&cpus, rank)) {
                Ok(handle) => pool.handles.lock().push((rank, handle)),
                Err(err) => {
                    shared.shutdown.store(true, Ordering::Release);
                    shared.unpark_all_threads();
                    let _ = pool.join_all();
                    return Err(err);
                }
            }
        }

        Ok(pool)
    }

    /// Waits for every worker thread to exit. Only returns once the runtime
    /// has been told to shut down.
    pub(crate) fn join_all(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock());

        let panicked = handles
            .into_iter()
            .filter_map(|(rank, handle)| handle.join().err().map(|_| rank))
            .inspect(|rank| tracing::error!(rank, "worker thread panicked"))
            .count();

        if panicked == 0 {
            Ok(())
        } else {
            Err(Error::WorkerPanicked(panicked))
        }
    }
}

fn spawn_worker_thread(
    shared: Arc<Shared>,
    rank: usize,
    queue: CbWorker<TaskRef>,
    cpu: Option<usize>,
) -> Result<thread::JoinHandle<()>> {
    let name = shared.cfg.thread_name.name(rank);

    thread::Builder::new()
        .name(name)
        .spawn(move || {
            if let Some(cpu) = cpu
                && let Err(source) = pin_current_thread(cpu)
            {
                let err = Error::Pin { rank, cpu, source };
                tracing::warn!(%err, "running worker unpinned");
            }

            let ctx = Rc::new(Context::new(Worker::new(rank, Arc::clone(&shared), queue)));
            if let Err(err) = context::enter(Rc::clone(&ctx)) {
                shared.fatal(err);
            }
            let _exit = ScopeGuard::new(|| {
                context::exit();
            });

            ctx.worker().event_loop(&ctx);
        })
        .map_err(|source| Error::WorkerSpawn { rank, source })
}
