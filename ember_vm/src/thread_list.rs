//! The set of live threads and the operations that act on all of them.
//!
//! # Suspend-all
//!
//! One requestor at a time owns suspend-all. It marks itself immune,
//! raises every other thread's suspend count with a single shared barrier,
//! waits for the barrier to drain and then takes the mutator lock
//! exclusively. A thread that was not `Runnable` when its count was raised
//! will never pass the barrier, so the requestor passes it on that thread's
//! behalf.

use crate::locks::{LevelMutex, LockLevel};
use crate::thread::{
    Closure, ScopedThreadStateChange, SuspendBarrier, SuspendShared, Thread, ThreadConfig, ThreadFlag,
    ThreadState,
};
use ember_core::{EmberError, EmberResult, ThreadId};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Registered threads.
pub struct ThreadList {
    shared: Arc<SuspendShared>,
    threads: LevelMutex<Vec<Arc<Thread>>>,
    suspend_all_owner: Mutex<Option<ThreadId>>,
    suspend_all_cond: Condvar,
    /// Active suspend-alls; guarded by the suspend-count lock.
    global_suspend_count: AtomicU32,
    /// Threads between the start and end of `register`/`unregister`.
    pending_threads: AtomicU32,
    pending_cond: Condvar,
    pending_lock: Mutex<()>,
    next_id: AtomicU32,
    config: ThreadConfig,
    suspend_timeout: Duration,
}

impl ThreadList {
    pub(crate) fn new(config: ThreadConfig, suspend_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(SuspendShared::new()),
            threads: LevelMutex::new("thread list lock", LockLevel::ThreadList, Vec::new()),
            suspend_all_owner: Mutex::new(None),
            suspend_all_cond: Condvar::new(),
            global_suspend_count: AtomicU32::new(0),
            pending_threads: AtomicU32::new(0),
            pending_cond: Condvar::new(),
            pending_lock: Mutex::new(()),
            next_id: AtomicU32::new(1),
            config,
            suspend_timeout,
        }
    }

    pub fn suspend_timeout(&self) -> Duration {
        self.suspend_timeout
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Create and register a thread in `Native` state. A thread registered
    /// during a suspend-all starts suspended.
    pub fn register(&self, name: &str) -> Arc<Thread> {
        self.pending_threads.fetch_add(1, Ordering::AcqRel);
        let id = ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(Thread::new(id, name.to_string(), Arc::clone(&self.shared), self.config));
        {
            let mut threads = self.threads.lock(&thread);
            let guard = self.shared.suspend_count_lock.lock(&thread);
            let global = self.global_suspend_count.load(Ordering::Acquire);
            for _ in 0..global {
                thread.modify_suspend_count(&guard, 1, None);
            }
            thread.store_state(ThreadState::Native);
            threads.push(Arc::clone(&thread));
        }
        self.end_pending();
        info!(thread = id.0, name, "thread registered");
        thread
    }

    /// Remove `thread`, which must not be `Runnable`.
    pub fn unregister(&self, thread: &Thread) {
        ember_core::check!(!thread.is_runnable(), "unregistering runnable thread {}", thread.id().0);
        self.pending_threads.fetch_add(1, Ordering::AcqRel);
        {
            let mut threads = self.threads.lock(thread);
            threads.retain(|t| !std::ptr::eq(Arc::as_ptr(t), thread));
            thread.store_state(ThreadState::Terminated);
        }
        thread.pass_active_suspend_barriers();
        self.end_pending();
        info!(thread = thread.id().0, "thread unregistered");
    }

    fn end_pending(&self) {
        let _guard = self.pending_lock.lock();
        if self.pending_threads.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pending_cond.notify_all();
        }
    }

    /// Threads in the middle of registering or unregistering.
    pub fn pending_threads(&self) -> u32 {
        self.pending_threads.load(Ordering::Acquire)
    }

    /// Block until no thread is registering or unregistering.
    pub fn wait_for_pending_threads(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.pending_lock.lock();
        while self.pending_threads() > 0 {
            if self.pending_cond.wait_until(&mut guard, deadline).timed_out() {
                return self.pending_threads() == 0;
            }
        }
        true
    }

    pub fn size(&self) -> usize {
        self.threads.lock_unchecked().len()
    }

    pub fn find(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.lock_unchecked().iter().find(|t| t.id() == id).cloned()
    }

    /// Run `f` over every registered thread while holding the list lock.
    pub fn for_each(&self, self_thread: &Thread, mut f: impl FnMut(&Arc<Thread>)) {
        for thread in self.threads.lock(self_thread).iter() {
            f(thread);
        }
    }

    pub fn snapshot(&self, self_thread: &Thread) -> Vec<Arc<Thread>> {
        self.threads.lock(self_thread).clone()
    }

    // =========================================================================
    // Suspend-all
    // =========================================================================

    fn acquire_suspend_all(&self, self_thread: &Thread) {
        self_thread.note_lock_acquired(LockLevel::SuspendAll, "suspend all lock");
        let mut owner = self.suspend_all_owner.lock();
        while owner.is_some() {
            self.suspend_all_cond.wait(&mut owner);
        }
        *owner = Some(self_thread.id());
    }

    fn release_suspend_all(&self, self_thread: &Thread) {
        let mut owner = self.suspend_all_owner.lock();
        ember_core::check!(
            *owner == Some(self_thread.id()),
            "suspend-all released by non-owner {}",
            self_thread.id().0
        );
        *owner = None;
        self.suspend_all_cond.notify_one();
        drop(owner);
        self_thread.note_lock_released(LockLevel::SuspendAll);
    }

    /// Raise or lower the suspend count of every thread but `self_thread`.
    fn adjust_all(&self, self_thread: &Thread, delta: i32, barrier: Option<&Arc<SuspendBarrier>>) {
        let threads = self.threads.lock(self_thread);
        let guard = self.shared.suspend_count_lock.lock(self_thread);
        if delta > 0 {
            self.global_suspend_count.fetch_add(1, Ordering::AcqRel);
        } else {
            self.global_suspend_count.fetch_sub(1, Ordering::AcqRel);
        }
        for thread in threads.iter().filter(|t| !std::ptr::eq(Arc::as_ptr(t), self_thread)) {
            let Some(barrier) = barrier else {
                thread.modify_suspend_count(&guard, delta, None);
                continue;
            };
            barrier.add(1);
            let old = thread.modify_suspend_count(&guard, delta, Some(Arc::clone(barrier)));
            if !old.state().is_runnable() && thread.remove_suspend_barrier(barrier) {
                barrier.pass();
            }
        }
        if delta < 0 {
            self.shared.resume_cond.notify_all();
        }
    }

    /// Stop every other thread outside `Runnable` and take the mutator lock
    /// exclusively. The caller must not be `Runnable`.
    pub fn suspend_all(&self, self_thread: &Thread, cause: &str) -> EmberResult<()> {
        ember_core::check!(!self_thread.is_runnable(), "suspend_all called from a runnable thread");
        let start = Instant::now();
        self.acquire_suspend_all(self_thread);
        self_thread.set_flag(ThreadFlag::SUSPENSION_IMMUNE);

        let barrier = Arc::new(SuspendBarrier::new(0));
        self.adjust_all(self_thread, 1, Some(&barrier));
        if !barrier.wait(self.suspend_timeout) {
            warn!(cause, remaining = barrier.remaining(), "suspend all timed out");
            self.rollback_suspend_all(self_thread, &barrier);
            return Err(EmberError::timeout(
                format!("suspend all ({cause})"),
                self.suspend_timeout.as_millis() as u64,
            ));
        }
        self.shared.mutator_lock.exclusive_lock(self_thread);
        debug!(cause, elapsed_us = start.elapsed().as_micros() as u64, "all threads suspended");
        Ok(())
    }

    fn rollback_suspend_all(&self, self_thread: &Thread, barrier: &Arc<SuspendBarrier>) {
        for thread in self.snapshot(self_thread) {
            thread.remove_suspend_barrier(barrier);
        }
        self.adjust_all(self_thread, -1, None);
        self_thread.clear_flag(ThreadFlag::SUSPENSION_IMMUNE);
        self.release_suspend_all(self_thread);
    }

    /// Undo [`suspend_all`](Self::suspend_all).
    pub fn resume_all(&self, self_thread: &Thread) {
        self.shared.mutator_lock.exclusive_unlock(self_thread);
        self.adjust_all(self_thread, -1, None);
        self_thread.clear_flag(ThreadFlag::SUSPENSION_IMMUNE);
        self.release_suspend_all(self_thread);
        debug!("all threads resumed");
    }

    // =========================================================================
    // Single-thread suspension
    // =========================================================================

    /// Suspend the thread `id` and wait until it has left `Runnable`.
    pub fn suspend_thread_by_id(&self, self_thread: &Thread, id: ThreadId) -> EmberResult<Arc<Thread>> {
        if id == self_thread.id() {
            return Err(EmberError::invalid_state("a thread cannot suspend itself by id"));
        }
        let target = self
            .find(id)
            .ok_or_else(|| EmberError::invalid_state(format!("no thread with id {}", id.0)))?;
        let barrier = Arc::new(SuspendBarrier::new(1));
        {
            let _threads = self.threads.lock(self_thread);
            let guard = self.shared.suspend_count_lock.lock(self_thread);
            let old = target.modify_suspend_count(&guard, 1, Some(Arc::clone(&barrier)));
            if !old.state().is_runnable() && target.remove_suspend_barrier(&barrier) {
                barrier.pass();
            }
        }
        let passed = {
            let _waiting = ScopedThreadStateChange::new(self_thread, ThreadState::Suspended);
            barrier.wait(self.suspend_timeout)
        };
        if !passed {
            target.remove_suspend_barrier(&barrier);
            target.resume_one(self_thread);
            return Err(EmberError::timeout(
                format!("suspend thread {}", id.0),
                self.suspend_timeout.as_millis() as u64,
            ));
        }
        debug!(target = id.0, "thread suspended");
        Ok(target)
    }

    /// Drop one suspension of `target`.
    pub fn resume(&self, self_thread: &Thread, target: &Thread) {
        target.resume_one(self_thread);
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Run `closure` on every thread. Runnable threads run it themselves at
    /// their next safepoint; the rest are pinned suspended and the caller
    /// runs it for them. Returns the number of threads covered, the caller
    /// included. The caller must wait for the asynchronous runs itself.
    pub fn run_checkpoint(&self, self_thread: &Thread, closure: Arc<dyn Closure>) -> usize {
        let mut suspended = Vec::new();
        let mut count = 0;
        {
            let threads = self.threads.lock(self_thread);
            let guard = self.shared.suspend_count_lock.lock(self_thread);
            for thread in threads.iter().filter(|t| !std::ptr::eq(Arc::as_ptr(t), self_thread)) {
                if thread.request_checkpoint(Arc::clone(&closure)) {
                    count += 1;
                } else {
                    thread.modify_suspend_count(&guard, 1, None);
                    suspended.push(Arc::clone(thread));
                }
            }
        }
        closure.run(self_thread);
        count += 1;
        for thread in suspended {
            // Raced into Runnable before the request landed; it stops at its
            // next poll.
            while thread.is_runnable() {
                std::thread::yield_now();
            }
            thread.ensure_flip_function_started(self_thread);
            closure.run(&thread);
            thread.resume_one(self_thread);
            count += 1;
        }
        count
    }

    /// Wait until every runnable thread has passed a safepoint.
    pub fn run_empty_checkpoint(&self, self_thread: &Thread) -> EmberResult<()> {
        let barrier = Arc::new(SuspendBarrier::new(0));
        {
            let threads = self.threads.lock(self_thread);
            for thread in threads.iter().filter(|t| !std::ptr::eq(Arc::as_ptr(t), self_thread)) {
                barrier.add(1);
                if !thread.request_empty_checkpoint(&barrier) {
                    barrier.pass();
                }
            }
        }
        let _waiting = ScopedThreadStateChange::new(self_thread, ThreadState::WaitingForCheckPointsToRun);
        if barrier.wait(self.suspend_timeout) {
            Ok(())
        } else {
            Err(EmberError::timeout(
                "empty checkpoint",
                self.suspend_timeout.as_millis() as u64,
            ))
        }
    }

    // =========================================================================
    // Root flips
    // =========================================================================

    /// Install `flip` on every thread during a pause, then let each thread
    /// run it before it next executes managed code. `during_pause` runs
    /// with all threads suspended. Returns the number of threads flipped by
    /// the caller.
    pub fn flip_thread_roots(
        &self,
        self_thread: &Thread,
        flip: Arc<dyn Closure>,
        during_pause: impl FnOnce(),
    ) -> EmberResult<usize> {
        self.suspend_all(self_thread, "flip thread roots")?;
        let threads = {
            let threads = self.threads.lock(self_thread);
            let _guard = self.shared.suspend_count_lock.lock(self_thread);
            for thread in threads.iter() {
                thread.set_flip_function(Arc::clone(&flip));
            }
            threads.clone()
        };
        during_pause();
        self.resume_all(self_thread);

        let mut flipped = 0;
        for thread in threads.iter().filter(|t| !std::ptr::eq(Arc::as_ptr(t), self_thread)) {
            if thread.ensure_flip_function_started(self_thread) {
                flipped += 1;
            }
        }
        if self_thread.ensure_flip_function_started(self_thread) {
            flipped += 1;
        }
        debug!(threads = threads.len(), flipped, "thread roots flipped");
        Ok(flipped)
    }
}

impl std::fmt::Debug for ThreadList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadList")
            .field("size", &self.size())
            .field("global_suspend_count", &self.global_suspend_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ScopedObjectAccess;
    use std::sync::atomic::AtomicBool;

    fn list() -> ThreadList {
        ThreadList::new(
            ThreadConfig {
                check_lock_order: true,
                verify_no_suspension: true,
            },
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_register_unregister() {
        let list = list();
        let a = list.register("a");
        let b = list.register("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(list.size(), 2);
        assert_eq!(a.state(), ThreadState::Native);
        list.unregister(&a);
        assert_eq!(list.size(), 1);
        assert_eq!(a.state(), ThreadState::Terminated);
        assert!(list.find(b.id()).is_some());
        assert_eq!(list.pending_threads(), 0);
    }

    #[test]
    fn test_suspend_all_with_idle_threads() {
        let list = list();
        let me = list.register("gc");
        let other = list.register("worker");
        list.suspend_all(&me, "test").unwrap();
        assert_eq!(other.suspend_count(), 1);
        assert!(other.is_flag_set(ThreadFlag::SUSPEND_REQUEST));
        assert!(me.is_flag_set(ThreadFlag::SUSPENSION_IMMUNE));
        list.resume_all(&me);
        assert_eq!(other.suspend_count(), 0);
        assert!(!me.is_flag_set(ThreadFlag::SUSPENSION_IMMUNE));
        assert!(me.held_lock_levels().is_empty());
    }

    #[test]
    fn test_thread_registered_during_suspend_all_starts_suspended() {
        let list = list();
        let me = list.register("gc");
        list.suspend_all(&me, "test").unwrap();
        let late = list.register("late");
        assert_eq!(late.suspend_count(), 1);
        list.resume_all(&me);
        assert_eq!(late.suspend_count(), 0);
    }

    #[test]
    fn test_suspend_all_stops_runnable_thread() {
        let list = Arc::new(list());
        let me = list.register("gc");
        let worker = list.register("worker");
        let stop = Arc::new(AtomicBool::new(false));
        let polls = Arc::new(AtomicU32::new(0));

        let (w, s, p) = (Arc::clone(&worker), Arc::clone(&stop), Arc::clone(&polls));
        let handle = std::thread::spawn(move || {
            let _soa = ScopedObjectAccess::new(&w);
            while !s.load(Ordering::SeqCst) {
                w.check_suspend();
                p.fetch_add(1, Ordering::SeqCst);
            }
        });
        while polls.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        list.suspend_all(&me, "test").unwrap();
        assert_eq!(worker.state(), ThreadState::Suspended);
        let frozen = polls.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(polls.load(Ordering::SeqCst), frozen);
        list.resume_all(&me);

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_checkpoint_covers_every_thread() {
        let list = list();
        let me = list.register("main");
        let _a = list.register("a");
        let _b = list.register("b");
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let n = list.run_checkpoint(
            &me,
            Arc::new(move |_: &Thread| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(n, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(list.find(ThreadId(2)).unwrap().suspend_count(), 0);
    }

    #[test]
    fn test_flip_runs_once_per_thread() {
        let list = list();
        let me = list.register("gc");
        let _a = list.register("a");
        let hits = Arc::new(AtomicU32::new(0));
        let paused = Arc::new(AtomicBool::new(false));
        let (h, p) = (Arc::clone(&hits), Arc::clone(&paused));
        let flipped = list
            .flip_thread_roots(
                &me,
                Arc::new(move |_: &Thread| {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
                move || p.store(true, Ordering::SeqCst),
            )
            .unwrap();
        assert!(paused.load(Ordering::SeqCst));
        assert_eq!(flipped, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_suspend_self_by_id_rejected() {
        let list = list();
        let me = list.register("main");
        assert!(list.suspend_thread_by_id(&me, me.id()).is_err());
    }
}
