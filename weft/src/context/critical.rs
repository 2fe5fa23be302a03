use crate::context;
use crate::error::{Error, Result};
use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread_local;

thread_local! {
    /// Critical-section depth of a thread outside of any runtime, such as the
    /// startup thread before init. Only ever touched by its own thread.
    static PRE_INIT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Per-worker critical-section depth, indexed by worker rank.
///
/// Each counter is only written by the worker that owns it, so `Relaxed` is
/// enough. Counters are cache padded so that workers entering and leaving
/// critical sections do not bounce each other's cache lines.
#[derive(Debug)]
pub(crate) struct CriticalSections {
    depth: Box<[CachePadded<AtomicUsize>]>,
}

impl CriticalSections {
    pub(crate) fn new(num_workers: usize) -> Self {
        Self {
            depth: (0..num_workers)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
        }
    }

    pub(crate) fn enter(&self, rank: usize) {
        self.depth[rank].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn exit(&self, rank: usize) {
        clamped_decrement(&self.depth[rank], Some(rank));
    }

    pub(crate) fn depth(&self, rank: usize) -> usize {
        self.depth[rank].load(Ordering::Relaxed)
    }

    pub(crate) fn is_held(&self, rank: usize) -> bool {
        self.depth(rank) > 0
    }

    /// Fails with the first worker still inside a critical section.
    pub(crate) fn ensure_released(&self) -> Result<()> {
        match self
            .depth
            .iter()
            .enumerate()
            .map(|(rank, depth)| (rank, depth.load(Ordering::Relaxed)))
            .find(|(_, depth)| *depth > 0)
        {
            Some((rank, depth)) => Err(Error::CriticalSectionHeld { rank, depth }),
            None => Ok(()),
        }
    }
}

fn clamped_decrement(depth: &AtomicUsize, rank: Option<usize>) {
    if depth
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1))
        .is_err()
    {
        warn_unmatched_exit(rank);
    }
}

fn warn_unmatched_exit(rank: Option<usize>) {
    tracing::warn!(?rank, "left a critical section that was never entered");
}

/// Depth of the calling thread outside of any runtime. Init refuses to start
/// while it is not zero: the matching exit would land on a worker counter.
pub(crate) fn pre_init_depth() -> usize {
    PRE_INIT_DEPTH.get()
}

/// Marks the calling worker as inside a critical section: a task running on
/// it will not migrate to another worker until the matching
/// [`exit_critical_section`].
///
/// Safe to call before the runtime exists.
pub fn enter_critical_section() {
    if context::with_context(|ctx| ctx.shared().critical.enter(ctx.rank())).is_none() {
        PRE_INIT_DEPTH.set(PRE_INIT_DEPTH.get() + 1);
    }
}

/// Leaves a critical section. An unmatched call is logged and ignored: the
/// depth never goes below zero.
pub fn exit_critical_section() {
    if context::with_context(|ctx| ctx.shared().critical.exit(ctx.rank())).is_none() {
        match PRE_INIT_DEPTH.get().checked_sub(1) {
            Some(depth) => PRE_INIT_DEPTH.set(depth),
            None => warn_unmatched_exit(None),
        }
    }
}

/// Critical-section depth of the calling worker.
pub fn critical_section_depth() -> usize {
    context::with_context(|ctx| ctx.shared().critical.depth(ctx.rank()))
        .unwrap_or_else(pre_init_depth)
}

pub fn is_in_critical_section() -> bool {
    critical_section_depth() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::thread;

    #[rstest]
    #[case::balanced(3, 3, 0)]
    #[case::nested(5, 2, 3)]
    #[case::underflow(1, 4, 0)]
    #[case::only_exits(0, 2, 0)]
    fn test_counter_clamps_at_zero(
        #[case] enters: usize,
        #[case] exits: usize,
        #[case] expected: usize,
    ) {
        let cs = CriticalSections::new(2);

        (0..enters).for_each(|_| cs.enter(1));
        (0..exits).for_each(|_| cs.exit(1));

        assert_eq!(cs.depth(1), expected);
        assert_eq!(cs.depth(0), 0, "other workers are untouched");
    }

    #[test]
    fn test_ensure_released_reports_holder() {
        let cs = CriticalSections::new(3);
        assert!(cs.ensure_released().is_ok());

        cs.enter(2);
        cs.enter(2);
        assert!(matches!(
            cs.ensure_released(),
            Err(Error::CriticalSectionHeld { rank: 2, depth: 2 })
        ));

        cs.exit(2);
        cs.exit(2);
        assert!(cs.ensure_released().is_ok());
    }

    #[test]
    fn test_pre_init_counter() {
        thread::spawn(|| {
            assert!(!is_in_critical_section());

            enter_critical_section();
            enter_critical_section();
            assert_eq!(critical_section_depth(), 2);

            exit_critical_section();
            exit_critical_section();
            // Unmatched: clamped.
            exit_critical_section();
            assert_eq!(critical_section_depth(), 0);
        })
        .join()
        .expect("pre-init thread panicked");
    }

    #[test]
    fn test_pre_init_depth_is_per_thread() {
        enter_critical_section();

        let other = thread::spawn(critical_section_depth)
            .join()
            .expect("pre-init thread panicked");
        assert_eq!(other, 0);
        assert_eq!(pre_init_depth(), 1);

        exit_critical_section();
        assert_eq!(pre_init_depth(), 0);
    }
}
