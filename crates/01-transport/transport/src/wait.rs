//! Cross-process atomic wait/notify shims used by the transport primitives.
//!
//! Native targets park on shared (non-private) futexes so a waiter in one
//! process is woken by a store in the other. Every wait is bounded; callers
//! loop with the remaining budget.

use rustix::io::Errno;
use rustix::thread::futex;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Result of attempting to wait on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The value matched and the caller was woken by a notify (or spuriously).
    Ok,
    /// The value no longer matched when the wait was attempted.
    NotEqual,
    /// The wait timed out before a notify was observed.
    TimedOut,
}

/// Blocks until the atomic differs from `expected`, a wakeup occurs, or `timeout` elapses.
#[inline]
pub fn wait_u32(atomic: &AtomicU32, expected: u32, timeout: Duration) -> WaitResult {
    let timespec = futex::Timespec {
        tv_sec: timeout.as_secs().min(i64::MAX as u64) as _,
        tv_nsec: timeout.subsec_nanos() as _,
    };
    // Shared futex: no PRIVATE flag, the word lives in a MAP_SHARED mapping.
    match futex::wait(atomic, futex::Flags::empty(), expected, Some(&timespec)) {
        Ok(()) => WaitResult::Ok,
        Err(Errno::AGAIN) => WaitResult::NotEqual,
        Err(Errno::TIMEDOUT) => WaitResult::TimedOut,
        // EINTR and anything unexpected: let the caller re-check its condition.
        Err(_) => WaitResult::Ok,
    }
}

/// Wakes every waiter parked on `atomic`, in any process.
#[inline]
pub fn wake_all(atomic: &AtomicU32) -> usize {
    futex::wake(atomic, futex::Flags::empty(), i32::MAX as u32).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn mismatched_value_returns_immediately() {
        let word = AtomicU32::new(5);
        assert_eq!(
            wait_u32(&word, 4, Duration::from_secs(5)),
            WaitResult::NotEqual
        );
    }

    #[test]
    fn wait_times_out_without_notify() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        assert_eq!(
            wait_u32(&word, 0, Duration::from_millis(20)),
            WaitResult::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn wake_all_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            thread::spawn(move || loop {
                let seen = word.load(Ordering::Acquire);
                if seen != 0 {
                    break;
                }
                wait_u32(&word, seen, Duration::from_secs(5));
            })
        };

        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake_all(&word);
        waiter.join().unwrap();
    }
}
