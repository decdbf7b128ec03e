//! Completion signaling between the command-issuing thread and the
//! listener draining the peer's `task_complete` slot.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::{Error, Result};

#[derive(Default)]
struct LatchInner {
    set: bool,
    terminated: bool,
    peer_dead: bool,
}

/// Level latch backing the command barrier.
///
/// The listener callback calls [`set`](Self::set) when a completion pulse
/// arrives; the issuing thread calls [`reset`](Self::reset) strictly
/// before publishing a command and then [`wait`](Self::wait)s. Setting is
/// idempotent: duplicate pulses before the next reset cannot make a later
/// wait return without a fresh signal.
pub struct CompletionLatch {
    inner: Mutex<LatchInner>,
    cvar: Condvar,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LatchInner::default()),
            cvar: Condvar::new(),
        }
    }

    /// Clears the latch. Called by the issuing thread before publishing
    /// a command whose completion must be awaited.
    pub fn reset(&self) {
        self.inner.lock().unwrap().set = false;
    }

    /// Sets the latch, waking any waiter. Safe to call any number of
    /// times per cycle.
    pub fn set(&self) {
        self.inner.lock().unwrap().set = true;
        self.cvar.notify_all();
    }

    /// Marks the owning session as shutting down; all pending and future
    /// waits return `Error::Terminated`.
    pub fn terminate(&self) {
        self.inner.lock().unwrap().terminated = true;
        self.cvar.notify_all();
    }

    /// Marks the peer process as dead; all pending and future waits
    /// return `Error::PeerTerminated`.
    pub fn peer_died(&self) {
        self.inner.lock().unwrap().peer_dead = true;
        self.cvar.notify_all();
    }

    /// Blocks until the latch is set, the deadline passes, or the session
    /// goes away.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.terminated {
                return Err(Error::Terminated);
            }
            if guard.peer_dead {
                return Err(Error::PeerTerminated);
            }
            if guard.set {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TimedOut);
            }
            let (g, _) = self.cvar.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }
}

impl Default for CompletionLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_after_set() {
        let latch = Arc::new(CompletionLatch::new());
        latch.reset();
        let l = latch.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            l.set();
        });
        latch.wait(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_without_signal() {
        let latch = CompletionLatch::new();
        latch.reset();
        match latch.wait(Duration::from_millis(50)) {
            Err(Error::TimedOut) => (),
            other => panic!("expected timeout, got: {:?}", other),
        }
    }

    #[test]
    fn duplicate_pulses_do_not_leak_into_the_next_cycle() {
        let latch = CompletionLatch::new();
        latch.reset();
        latch.set();
        latch.set();
        latch.wait(Duration::from_millis(10)).unwrap();

        // a fresh cycle must require a fresh signal
        latch.reset();
        match latch.wait(Duration::from_millis(50)) {
            Err(Error::TimedOut) => (),
            other => panic!("expected timeout, got: {:?}", other),
        }
    }

    #[test]
    fn terminate_unblocks_pending_wait() {
        let latch = Arc::new(CompletionLatch::new());
        latch.reset();
        let l = latch.clone();
        let handle = thread::spawn(move || l.wait(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(50));
        latch.terminate();
        match handle.join().unwrap() {
            Err(Error::Terminated) => (),
            other => panic!("expected terminated, got: {:?}", other),
        }
    }

    #[test]
    fn peer_death_unblocks_pending_wait() {
        let latch = Arc::new(CompletionLatch::new());
        latch.reset();
        let l = latch.clone();
        let handle = thread::spawn(move || l.wait(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(50));
        latch.peer_died();
        match handle.join().unwrap() {
            Err(Error::PeerTerminated) => (),
            other => panic!("expected peer terminated, got: {:?}", other),
        }
    }
}
