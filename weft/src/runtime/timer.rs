use crate::task::TaskRef;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

/// Sleeping tasks, earliest deadline first.
///
/// Each worker keeps one for the tasks pinned to it. The runtime keeps a
/// shared one for every other sleeper, fired by whichever worker gets there
/// first.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<Sleeper>>,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns whether `deadline` is now the earliest one in the queue.
    pub(crate) fn push(&mut self, task: TaskRef, deadline: Instant) -> bool {
        let earliest = self.next_deadline().is_none_or(|next| deadline < next);

        let seq = self.seq;
        self.seq = seq.wrapping_add(1);
        self.heap.push(Reverse(Sleeper {
            deadline,
            seq,
            task,
        }));

        earliest
    }

    /// Pops the earliest sleeper if its deadline is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TaskRef> {
        match self.heap.peek() {
            Some(Reverse(sleeper)) if sleeper.deadline <= now => {
                self.heap.pop().map(|Reverse(sleeper)| sleeper.task)
            }
            _ => None,
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(s)| s.deadline)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = TaskRef> + '_ {
        self.heap.drain().map(|Reverse(s)| s.task)
    }
}

/// Earlier of two optional deadlines.
pub(crate) fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// A task waiting for its deadline.
#[derive(Debug)]
struct Sleeper {
    deadline: Instant,

    /// Breaks ties so that equal deadlines wake in sleep order.
    seq: u64,

    task: TaskRef,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crate::task::{Task, TaskDescriptor, TaskKind};
    use anyhow::Result;
    use rstest::rstest;
    use std::iter;
    use std::time::Duration;

    #[test]
    fn test_expired_sleepers_pop_in_deadline_order() -> Result<()> {
        let runtime = Builder::new().worker_threads(1).try_init()?;
        let shared = runtime.shared();
        let new_task = || Task::new(TaskKind::User, TaskDescriptor::default(), shared);

        let now = Instant::now();
        let ms = Duration::from_millis;
        let mut timers = TimerQueue::new();

        let late = new_task();
        let first = new_task();
        let tied = new_task();
        let middle = new_task();
        let order = vec![first.id(), tied.id(), middle.id(), late.id()];

        assert!(timers.push(late, now + ms(30)));
        assert!(timers.push(first, now + ms(10)));
        assert!(!timers.push(tied, now + ms(10)), "a tie is not earlier");
        assert!(!timers.push(middle, now + ms(20)));
        assert_eq!(timers.next_deadline(), Some(now + ms(10)));

        assert!(timers.pop_expired(now).is_none());

        let woken = iter::from_fn(|| timers.pop_expired(now + ms(30)))
            .map(|task| task.id())
            .collect::<Vec<_>>();
        assert_eq!(woken, order);
        assert_eq!(timers.len(), 0);

        runtime.teardown();
        Ok(())
    }

    #[rstest]
    #[case::both(Some(10), Some(20), Some(10))]
    #[case::left(Some(10), None, Some(10))]
    #[case::right(None, Some(20), Some(20))]
    #[case::neither(None, None, None)]
    fn test_earliest(#[case] a: Option<u64>, #[case] b: Option<u64>, #[case] expected: Option<u64>) {
        let base = Instant::now();
        let at = |ms: Option<u64>| ms.map(|ms| base + Duration::from_millis(ms));
        assert_eq!(earliest(at(a), at(b)), at(expected));
    }
}
