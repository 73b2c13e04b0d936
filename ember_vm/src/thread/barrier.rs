//! Suspend barriers and checkpoint closures.

use super::Thread;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

/// A countdown the requestor of a suspension waits on.
///
/// Each thread the request applies to decrements it once, when it leaves
/// `Runnable` (or immediately if it already had). The requestor blocks in
/// [`wait`](Self::wait) until the count reaches zero.
#[derive(Debug)]
pub struct SuspendBarrier {
    remaining: AtomicI32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl SuspendBarrier {
    pub fn new(count: i32) -> Self {
        Self {
            remaining: AtomicI32::new(count),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Add `n` participants.
    pub fn add(&self, n: i32) {
        self.remaining.fetch_add(n, Ordering::AcqRel);
    }

    /// Decrement; wakes the waiter on reaching zero.
    pub fn pass(&self) {
        let before = self.remaining.fetch_sub(1, Ordering::AcqRel);
        ember_core::check!(before > 0, "suspend barrier passed too often");
        if before == 1 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    pub fn remaining(&self) -> i32 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Block until the count reaches zero. Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while self.remaining() > 0 {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.remaining() <= 0;
            }
        }
        true
    }
}

/// Work run by (or on behalf of) a thread at a safepoint.
pub trait Closure: Send + Sync {
    fn run(&self, thread: &Thread);
}

impl<F: Fn(&Thread) + Send + Sync> Closure for F {
    fn run(&self, thread: &Thread) {
        self(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_barrier_releases_waiter() {
        let barrier = Arc::new(SuspendBarrier::new(2));
        let b = Arc::clone(&barrier);
        let handle = std::thread::spawn(move || {
            b.pass();
            b.pass();
        });
        assert!(barrier.wait(Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(barrier.remaining(), 0);
    }

    #[test]
    fn test_barrier_times_out() {
        let barrier = SuspendBarrier::new(1);
        assert!(!barrier.wait(Duration::from_millis(5)));
        barrier.pass();
        assert!(barrier.wait(Duration::from_millis(5)));
    }
}
