//! Bounded cross-process signals with peer-liveness injection.
//!
//! A [`Signal`] is a futex word living inside the shared region. Signalling
//! bumps the word and wakes every waiter in any process. Waiting combines two
//! conditions: the caller's readiness predicate OR the death of the peer. The
//! waiter never sleeps longer than one poll interval between liveness checks,
//! so a peer that dies without signalling is noticed within that interval.

use crate::wait::{wait_u32, wake_all};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Lower bound for the liveness poll slice; zero would spin.
const MIN_POLL: Duration = Duration::from_millis(1);

/// Reports whether the process on the other end of a channel is still running.
pub trait PeerLiveness: Send + Sync {
    /// Returns `false` once the peer is known to be gone. Must not block.
    fn is_alive(&self) -> bool;
}

impl<F> PeerLiveness for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_alive(&self) -> bool {
        self()
    }
}

/// Liveness source for peers that cannot die independently (tests, same-process use).
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysAlive;

impl PeerLiveness for AlwaysAlive {
    fn is_alive(&self) -> bool {
        true
    }
}

/// Why a bounded wait ended without its condition becoming true.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitError {
    /// The timeout elapsed while the peer was still alive.
    TimedOut,
    /// The peer died or detached.
    PeerLost,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::TimedOut => f.write_str("wait timed out"),
            WaitError::PeerLost => f.write_str("peer lost"),
        }
    }
}

/// The instant a bounded operation gives up.
///
/// Timeouts too long to add to `Instant::now()` (e.g. `Duration::MAX`) mean
/// the deadline never passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Time left; `Duration::MAX` for a deadline that never passes.
    pub fn remaining(&self) -> Duration {
        match self.0 {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }
}

/// Borrowed view of a futex word used as a counting signal.
#[derive(Clone, Copy)]
pub struct Signal<'a> {
    word: &'a AtomicU32,
}

impl<'a> Signal<'a> {
    /// Wraps a word that lives in shared memory.
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Current sequence value of the signal.
    pub fn sequence(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    /// Bumps the sequence and wakes every waiter.
    pub fn notify(&self) {
        self.word.fetch_add(1, Ordering::Release);
        wake_all(self.word);
    }

    /// Waits until `ready` returns true, the peer is lost, or `timeout` elapses.
    ///
    /// Readiness wins over peer loss: data the peer published before dying is
    /// still delivered. The sequence is sampled before `ready` runs, so a
    /// notify racing with the check makes the futex wait return immediately.
    pub fn wait_until<F>(
        &self,
        mut ready: F,
        timeout: Duration,
        peer: &dyn PeerLiveness,
        poll: Duration,
    ) -> Result<(), WaitError>
    where
        F: FnMut() -> bool,
    {
        let poll = poll.max(MIN_POLL);
        let start = Instant::now();
        loop {
            let seq = self.word.load(Ordering::Acquire);
            if ready() {
                return Ok(());
            }
            if !peer.is_alive() {
                return Err(WaitError::PeerLost);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(WaitError::TimedOut);
            }
            wait_u32(self.word, seq, (timeout - elapsed).min(poll));
        }
    }
}

impl fmt::Debug for Signal<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("sequence", &self.sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    const POLL: Duration = Duration::from_millis(5);

    #[test]
    fn unbounded_deadline_never_expires() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::MAX);

        let passed = Deadline::after(Duration::ZERO);
        assert!(passed.is_expired());
        assert_eq!(passed.remaining(), Duration::ZERO);
    }

    #[test]
    fn wait_with_maximal_timeout_still_sees_readiness() {
        let word = AtomicU32::new(0);
        let signal = Signal::new(&word);
        let mut checks = 0;
        let ready = || {
            checks += 1;
            checks > 2
        };
        assert_eq!(signal.wait_until(ready, Duration::MAX, &AlwaysAlive, POLL), Ok(()));
    }

    #[test]
    fn ready_condition_returns_immediately() {
        let word = AtomicU32::new(0);
        let signal = Signal::new(&word);
        assert_eq!(
            signal.wait_until(|| true, Duration::ZERO, &AlwaysAlive, POLL),
            Ok(())
        );
    }

    #[test]
    fn times_out_when_nothing_happens() {
        let word = AtomicU32::new(0);
        let signal = Signal::new(&word);
        let start = Instant::now();
        let result = signal.wait_until(|| false, Duration::from_millis(30), &AlwaysAlive, POLL);
        assert_eq!(result, Err(WaitError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn dead_peer_ends_wait_before_timeout() {
        let word = AtomicU32::new(0);
        let signal = Signal::new(&word);
        let alive = Arc::new(AtomicBool::new(true));
        let probe = {
            let alive = Arc::clone(&alive);
            move || alive.load(Ordering::Acquire)
        };

        let killer = {
            let alive = Arc::clone(&alive);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                alive.store(false, Ordering::Release);
            })
        };

        let start = Instant::now();
        let result = signal.wait_until(|| false, Duration::from_secs(10), &probe, POLL);
        killer.join().unwrap();
        assert_eq!(result, Err(WaitError::PeerLost));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn notify_wakes_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let word = Arc::clone(&word);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                Signal::new(&word).wait_until(
                    || flag.load(Ordering::Acquire),
                    Duration::from_secs(10),
                    &AlwaysAlive,
                    Duration::from_secs(5),
                )
            })
        };

        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Release);
        Signal::new(&word).notify();
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(word.load(Ordering::Acquire), 1);
    }
}
