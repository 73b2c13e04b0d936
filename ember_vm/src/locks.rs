//! Runtime locks and the lock-order checker.
//!
//! Every runtime lock has a [`LockLevel`]. A thread may only acquire a lock
//! whose level is strictly below every level it already holds, so locks
//! are always taken from the top of the hierarchy down:
//!
//! ```text
//! SuspendAll > Mutator > ThreadList > ClassLinker > Monitor > SuspendCount > Leaf
//! ```
//!
//! The check is performed by [`ScopedLock`] when the runtime is created with
//! `check_lock_order`; it costs a per-thread bookkeeping push and pop.

use crate::thread::Thread;
use ember_core::ThreadId;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Position of a lock in the acquisition hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    /// Innermost locks guarding a single structure.
    Leaf = 0,
    /// Guards suspend counts and the resume condition.
    ThreadSuspendCount = 1,
    /// Guards the monitor table.
    Monitor = 2,
    /// Guards class tables and resolution caches.
    ClassLinker = 3,
    /// Guards the set of registered threads.
    ThreadList = 4,
    /// Shared by runnable threads, exclusive during suspend-all.
    Mutator = 5,
    /// Serializes suspend-all requests.
    SuspendAll = 6,
}

// =============================================================================
// Level-checked mutex
// =============================================================================

/// A mutex with a level in the hierarchy.
#[derive(Debug)]
pub struct LevelMutex<T> {
    name: &'static str,
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> LevelMutex<T> {
    pub const fn new(name: &'static str, level: LockLevel, value: T) -> Self {
        Self {
            name,
            level,
            inner: Mutex::new(value),
        }
    }

    #[inline]
    pub fn level(&self) -> LockLevel {
        self.level
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire on behalf of `thread`, checking the lock order.
    pub fn lock<'a>(&'a self, thread: &'a Thread) -> ScopedLock<'a, T> {
        thread.note_lock_acquired(self.level, self.name);
        ScopedLock {
            guard: self.inner.lock(),
            thread,
            level: self.level,
        }
    }

    /// Acquire without bookkeeping, for code running outside any thread.
    pub fn lock_unchecked(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

/// Guard of a [`LevelMutex`] that records the level on its thread.
pub struct ScopedLock<'a, T> {
    guard: MutexGuard<'a, T>,
    thread: &'a Thread,
    level: LockLevel,
}

impl<T> ScopedLock<'_, T> {
    /// Release the lock while waiting on `cond`.
    pub fn wait(&mut self, cond: &Condvar) {
        cond.wait(&mut self.guard);
    }

    /// Like [`wait`](Self::wait) with a timeout. Returns `true` on timeout.
    pub fn wait_for(&mut self, cond: &Condvar, timeout: Duration) -> bool {
        cond.wait_for(&mut self.guard, timeout).timed_out()
    }
}

impl<T> Deref for ScopedLock<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ScopedLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ScopedLock<'_, T> {
    fn drop(&mut self) {
        self.thread.note_lock_released(self.level);
    }
}

// =============================================================================
// Mutator lock
// =============================================================================

#[derive(Debug, Default)]
struct MutatorState {
    readers: u32,
    writer: Option<ThreadId>,
}

/// Reader-writer lock between managed-code executors and stop-the-world
/// operations.
///
/// A thread holds it shared exactly while its state is `Runnable`; the
/// thread-state transitions acquire and release it. Suspend-all takes it
/// exclusive once every other thread has left `Runnable`.
#[derive(Debug, Default)]
pub struct MutatorLock {
    state: Mutex<MutatorState>,
    cond: Condvar,
}

impl MutatorLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared_lock(&self, thread: &Thread) {
        thread.note_lock_acquired(LockLevel::Mutator, "mutator lock");
        let mut state = self.state.lock();
        while state.writer.is_some() {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    pub fn shared_unlock(&self, thread: &Thread) {
        let mut state = self.state.lock();
        ember_core::check!(state.readers > 0, "mutator lock shared-released by {:?} with no readers", thread.id());
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
        drop(state);
        thread.note_lock_released(LockLevel::Mutator);
    }

    pub fn exclusive_lock(&self, thread: &Thread) {
        thread.note_lock_acquired(LockLevel::Mutator, "mutator lock");
        let mut state = self.state.lock();
        while state.writer.is_some() || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writer = Some(thread.id());
    }

    /// Exclusive acquisition bounded by `timeout`. Returns `false` on timeout.
    pub fn exclusive_lock_timeout(&self, thread: &Thread, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        while state.writer.is_some() || state.readers > 0 {
            if self.cond.wait_for(&mut state, timeout).timed_out() {
                return false;
            }
        }
        state.writer = Some(thread.id());
        drop(state);
        thread.note_lock_acquired(LockLevel::Mutator, "mutator lock");
        true
    }

    pub fn exclusive_unlock(&self, thread: &Thread) {
        let mut state = self.state.lock();
        ember_core::check!(
            state.writer == Some(thread.id()),
            "mutator lock released by non-owner {:?}",
            thread.id()
        );
        state.writer = None;
        self.cond.notify_all();
        drop(state);
        thread.note_lock_released(LockLevel::Mutator);
    }

    pub fn is_exclusive_held(&self, thread: &Thread) -> bool {
        self.state.lock().writer == Some(thread.id())
    }

    /// Number of threads holding the lock shared.
    pub fn readers(&self) -> u32 {
        self.state.lock().readers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Thread;
    use ember_core::ThreadId;

    #[test]
    fn test_ordered_acquisition() {
        let thread = Thread::detached_for_testing(ThreadId(1), true);
        let outer = LevelMutex::new("outer", LockLevel::ThreadList, 0u32);
        let inner = LevelMutex::new("inner", LockLevel::ThreadSuspendCount, 0u32);
        {
            let mut a = outer.lock(&thread);
            let mut b = inner.lock(&thread);
            *a += 1;
            *b += 1;
            assert_eq!(thread.held_lock_levels().len(), 2);
        }
        assert!(thread.held_lock_levels().is_empty());
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_inverted_acquisition_aborts() {
        let thread = Thread::detached_for_testing(ThreadId(1), true);
        let low = LevelMutex::new("low", LockLevel::Leaf, ());
        let high = LevelMutex::new("high", LockLevel::ThreadList, ());
        let _a = low.lock(&thread);
        let _b = high.lock(&thread);
    }

    #[test]
    fn test_mutator_lock_exclusion() {
        let a = Thread::detached_for_testing(ThreadId(1), false);
        let b = Thread::detached_for_testing(ThreadId(2), false);
        let lock = MutatorLock::new();
        lock.shared_lock(&a);
        assert_eq!(lock.readers(), 1);
        assert!(!lock.exclusive_lock_timeout(&b, Duration::from_millis(10)));
        lock.shared_unlock(&a);
        assert!(lock.exclusive_lock_timeout(&b, Duration::from_millis(10)));
        assert!(lock.is_exclusive_held(&b));
        lock.exclusive_unlock(&b);
    }
}
