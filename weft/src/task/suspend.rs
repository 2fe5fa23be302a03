use crate::context;
use crate::task::{Header, Suspend};
use std::ptr::NonNull;
use std::thread;
use std::time::{Duration, Instant};

/// Longer sleeps are cut to this.
const MAX_SLEEP: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn current_coroutine() -> Option<NonNull<Header>> {
    // Safety: the header of the running task outlives this call.
    context::current_header().filter(|header| unsafe { header.as_ref() }.is_coroutine())
}

/// Lets other tasks run. The calling task goes to the back of the global
/// queue and may resume on another worker.
///
/// On the main thread this runs at most one other task in place.
pub fn yield_now() {
    match current_coroutine() {
        // Safety: we are that task.
        Some(header) => unsafe { header.as_ref() }.suspend(Suspend::Yield),
        None => {
            if context::with_context(|ctx| ctx.worker().run_once(ctx)).is_none() {
                thread::yield_now();
            }
        }
    }
}

/// Suspends the calling task for at least `duration`. The worker runs other
/// tasks in the meantime.
pub fn sleep(duration: Duration) {
    let deadline = Instant::now() + duration.min(MAX_SLEEP);

    match current_coroutine() {
        // Safety: we are that task.
        Some(header) => unsafe { header.as_ref() }.suspend(Suspend::Sleep(deadline)),
        None => {
            let slept = context::with_context(|ctx| ctx.worker().sleep_until(ctx, deadline));
            if slept.is_none() {
                thread::sleep(deadline.saturating_duration_since(Instant::now()));
            }
        }
    }
}

/// [`sleep`] for a number of seconds. Negative and NaN values do not sleep.
pub fn sleep_secs(secs: f64) {
    sleep(secs_to_duration(secs));
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(MAX_SLEEP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0.0, Duration::ZERO)]
    #[case::negative(-1.5, Duration::ZERO)]
    #[case::nan(f64::NAN, Duration::ZERO)]
    #[case::fraction(0.25, Duration::from_millis(250))]
    #[case::whole(2.0, Duration::from_secs(2))]
    #[case::infinite(f64::INFINITY, MAX_SLEEP)]
    fn test_secs_to_duration(#[case] secs: f64, #[case] expected: Duration) {
        assert_eq!(secs_to_duration(secs), expected);
    }

    #[test]
    fn test_sleep_outside_of_runtime() {
        thread::spawn(|| {
            let start = Instant::now();
            sleep(Duration::from_millis(5));
            assert!(start.elapsed() >= Duration::from_millis(5));
            yield_now();
        })
        .join()
        .expect("probe thread panicked");
    }
}
