//! State transitions and the safepoint protocol.
//!
//! Requestors never block a thread directly. They set a flag in the
//! target's state word; the target notices it at its next safepoint poll
//! or state transition and acts on it itself. A target that is already
//! outside `Runnable` cannot touch managed state, so requestors act on its
//! behalf instead (passing its barrier, running its checkpoint or flip).

use super::scoped::ScopedThreadStateChange;
use super::{Closure, StateAndFlags, SuspendBarrier, Thread, ThreadFlag, ThreadState};
use crate::locks::ScopedLock;
use ember_core::{EmberError, EmberResult};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, trace};

/// Runs a checkpoint closure and then passes a barrier.
struct BarrierClosure {
    inner: Arc<dyn Closure>,
    barrier: Arc<SuspendBarrier>,
}

impl Closure for BarrierClosure {
    fn run(&self, thread: &Thread) {
        self.inner.run(thread);
        self.barrier.pass();
    }
}

impl Thread {
    // =========================================================================
    // State word
    // =========================================================================

    #[inline]
    pub fn state_and_flags(&self) -> StateAndFlags {
        StateAndFlags(self.state_and_flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state_and_flags().state()
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.state().is_runnable()
    }

    pub fn suspend_count(&self) -> u32 {
        self.suspend_count.load(Ordering::Acquire)
    }

    pub fn is_flag_set(&self, flag: ThreadFlag) -> bool {
        self.state_and_flags().is_flag_set(flag)
    }

    pub(crate) fn set_flag(&self, flag: ThreadFlag) -> StateAndFlags {
        StateAndFlags(self.state_and_flags.fetch_or(flag.bits(), Ordering::AcqRel))
    }

    pub(crate) fn clear_flag(&self, flag: ThreadFlag) -> StateAndFlags {
        StateAndFlags(self.state_and_flags.fetch_and(!flag.bits(), Ordering::AcqRel))
    }

    #[inline]
    fn cas_state_and_flags(&self, old: StateAndFlags, new: StateAndFlags, success: Ordering) -> bool {
        self.state_and_flags
            .compare_exchange_weak(old.0, new.0, success, Ordering::Relaxed)
            .is_ok()
    }

    /// Overwrite the state, keeping the flags. Only for threads that are not
    /// yet (or no longer) visible to other threads.
    pub(crate) fn store_state(&self, state: ThreadState) {
        loop {
            let old = StateAndFlags(self.state_and_flags.load(Ordering::Relaxed));
            if self.cas_state_and_flags(old, old.with_state(state), Ordering::Release) {
                return;
            }
        }
    }

    /// Change between two non-runnable states. Returns the previous state.
    pub fn set_state(&self, new_state: ThreadState) -> ThreadState {
        ember_core::check!(!new_state.is_runnable(), "set_state cannot enter Runnable");
        loop {
            let old = StateAndFlags(self.state_and_flags.load(Ordering::Relaxed));
            let old_state = old.state();
            ember_core::check!(!old_state.is_runnable(), "set_state cannot leave Runnable");
            if self.cas_state_and_flags(old, old.with_state(new_state), Ordering::Release) {
                return old_state;
            }
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Leave `Runnable` for `new_state`.
    ///
    /// Pending checkpoints are run first: a requestor only queues one on a
    /// runnable thread and counts on it running before the thread leaves.
    /// The mutator lock is released after the state is published, and any
    /// barriers installed meanwhile are passed last.
    pub fn transition_from_runnable_to_suspended(&self, new_state: ThreadState) {
        ember_core::check!(!new_state.is_runnable(), "cannot suspend into Runnable");
        self.assert_thread_suspension_is_allowable();
        loop {
            let old = StateAndFlags(self.state_and_flags.load(Ordering::Relaxed));
            ember_core::check!(old.state().is_runnable(), "thread {} not runnable: {:?}", self.id.0, old);
            if old.is_flag_set(ThreadFlag::CHECKPOINT_REQUEST) {
                self.run_checkpoint_function();
                continue;
            }
            if old.is_flag_set(ThreadFlag::EMPTY_CHECKPOINT_REQUEST) {
                self.run_empty_checkpoint();
                continue;
            }
            let new = old.with_state(new_state);
            if self.cas_state_and_flags(old, new, Ordering::Release) {
                break;
            }
        }
        self.shared.mutator_lock.shared_unlock(self);
        if self.is_flag_set(ThreadFlag::ACTIVE_SUSPEND_BARRIER) {
            self.pass_active_suspend_barriers();
        }
        trace!(thread = self.id.0, state = %new_state, "left runnable");
    }

    /// Become `Runnable`, blocking while a suspension is requested. Returns
    /// the state left.
    ///
    /// After the state is published the flip-function flags are re-read
    /// with acquire ordering; a flip installed while the thread was
    /// suspended runs before managed code resumes.
    pub fn transition_from_suspended_to_runnable(&self) -> ThreadState {
        loop {
            let old = StateAndFlags(self.state_and_flags.load(Ordering::Relaxed));
            let old_state = old.state();
            ember_core::check!(!old_state.is_runnable(), "thread {} already runnable", self.id.0);
            let immune = old.is_flag_set(ThreadFlag::SUSPENSION_IMMUNE);
            if !old.is_flag_set(ThreadFlag::SUSPEND_REQUEST) || immune {
                let new = old.with_state(ThreadState::Runnable);
                if !self.cas_state_and_flags(old, new, Ordering::Acquire) {
                    continue;
                }
                self.shared.mutator_lock.shared_lock(self);
                let now = self.state_and_flags();
                if now.is_flag_set(ThreadFlag::PENDING_FLIP_FUNCTION) {
                    self.ensure_flip_function_started(self);
                } else if now.is_flag_set(ThreadFlag::RUNNING_FLIP_FUNCTION) {
                    self.wait_for_flip_function();
                }
                trace!(thread = self.id.0, from = %old_state, "became runnable");
                return old_state;
            }
            if old.is_flag_set(ThreadFlag::ACTIVE_SUSPEND_BARRIER) {
                self.pass_active_suspend_barriers();
                continue;
            }
            let mut guard = self.shared.suspend_count_lock.lock(self);
            while self.suspend_count() > 0 && self.is_flag_set(ThreadFlag::SUSPEND_REQUEST) {
                guard.wait(&self.shared.resume_cond);
            }
        }
    }

    // =========================================================================
    // Safepoint poll
    // =========================================================================

    /// Service every pending request. Called by a runnable thread at its
    /// safepoints.
    pub fn check_suspend(&self) {
        loop {
            let flags = self.state_and_flags();
            if !flags.is_any_of_flags_set(ThreadFlag::SUSPEND_OR_CHECKPOINT) {
                return;
            }
            self.assert_thread_suspension_is_allowable();
            if flags.is_flag_set(ThreadFlag::CHECKPOINT_REQUEST) {
                self.run_checkpoint_function();
            } else if flags.is_flag_set(ThreadFlag::EMPTY_CHECKPOINT_REQUEST) {
                self.run_empty_checkpoint();
            } else if flags.is_flag_set(ThreadFlag::SUSPEND_REQUEST)
                && !flags.is_flag_set(ThreadFlag::SUSPENSION_IMMUNE)
            {
                self.full_suspend_check();
            } else if flags.is_flag_set(ThreadFlag::ACTIVE_SUSPEND_BARRIER) {
                self.pass_active_suspend_barriers();
            } else {
                return;
            }
        }
    }

    /// Suspend until every outstanding suspend request is withdrawn.
    pub fn full_suspend_check(&self) {
        let _suspended = ScopedThreadStateChange::new(self, ThreadState::Suspended);
    }

    // =========================================================================
    // Suspend counts and barriers
    // =========================================================================

    /// Adjust the suspend count by `delta` and update `SUSPEND_REQUEST`.
    /// The caller proves it holds the suspend-count lock with `_held`.
    ///
    /// Returns the state word as it was immediately before the flags
    /// changed. If a barrier was installed and that word was not
    /// `Runnable`, the thread will never pass it: the caller must take it
    /// back with [`remove_suspend_barrier`](Self::remove_suspend_barrier)
    /// and pass it itself.
    pub fn modify_suspend_count(
        &self,
        _held: &ScopedLock<'_, ()>,
        delta: i32,
        barrier: Option<Arc<SuspendBarrier>>,
    ) -> StateAndFlags {
        ember_core::check!(delta != 0, "zero suspend count delta");
        let count = self.suspend_count.load(Ordering::Relaxed) as i64 + delta as i64;
        ember_core::check!(count >= 0, "suspend count underflow on thread {}", self.id.0);
        self.suspend_count.store(count as u32, Ordering::Release);
        let mut flags = ThreadFlag::empty();
        if let Some(barrier) = barrier {
            self.active_barriers.lock().push(barrier);
            flags |= ThreadFlag::ACTIVE_SUSPEND_BARRIER;
        }
        let old = if count > 0 {
            self.set_flag(flags | ThreadFlag::SUSPEND_REQUEST)
        } else {
            let old = self.clear_flag(ThreadFlag::SUSPEND_REQUEST);
            if !flags.is_empty() {
                self.set_flag(flags);
            }
            old
        };
        trace!(thread = self.id.0, delta, count, "suspend count modified");
        old
    }

    /// Take back a barrier installed by `modify_suspend_count`. Returns
    /// `false` if the thread already passed it.
    pub fn remove_suspend_barrier(&self, barrier: &Arc<SuspendBarrier>) -> bool {
        let mut list = self.active_barriers.lock();
        match list.iter().position(|b| Arc::ptr_eq(b, barrier)) {
            Some(pos) => {
                list.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Pass every installed barrier. Returns whether there were any.
    pub fn pass_active_suspend_barriers(&self) -> bool {
        let barriers = {
            let mut list = self.active_barriers.lock();
            self.clear_flag(ThreadFlag::ACTIVE_SUSPEND_BARRIER);
            std::mem::take(&mut *list)
        };
        let any = !barriers.is_empty();
        for barrier in barriers {
            barrier.pass();
        }
        any
    }

    /// Drop one suspension and wake the thread if it was the last.
    pub(crate) fn resume_one(&self, requestor: &Thread) {
        let guard = self.shared.suspend_count_lock.lock(requestor);
        self.modify_suspend_count(&guard, -1, None);
        self.shared.resume_cond.notify_all();
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Queue `closure` to run at the thread's next safepoint. Fails unless
    /// the thread is `Runnable`.
    pub fn request_checkpoint(&self, closure: Arc<dyn Closure>) -> bool {
        let mut queue = self.checkpoints.lock();
        loop {
            let old = StateAndFlags(self.state_and_flags.load(Ordering::Relaxed));
            if !old.state().is_runnable() {
                return false;
            }
            let new = old.with_flag(ThreadFlag::CHECKPOINT_REQUEST);
            if self.cas_state_and_flags(old, new, Ordering::Release) {
                queue.push_back(closure);
                return true;
            }
        }
    }

    /// Ask the thread to pass `barrier` at its next safepoint. Fails unless
    /// the thread is `Runnable`.
    pub fn request_empty_checkpoint(&self, barrier: &Arc<SuspendBarrier>) -> bool {
        let mut slot = self.empty_checkpoint_barrier.lock();
        loop {
            let old = StateAndFlags(self.state_and_flags.load(Ordering::Relaxed));
            if !old.state().is_runnable() {
                return false;
            }
            let new = old.with_flag(ThreadFlag::EMPTY_CHECKPOINT_REQUEST);
            if self.cas_state_and_flags(old, new, Ordering::Release) {
                *slot = Some(Arc::clone(barrier));
                return true;
            }
        }
    }

    /// Run and drain the checkpoint queue.
    pub fn run_checkpoint_function(&self) {
        let closures: Vec<_> = {
            let mut queue = self.checkpoints.lock();
            self.clear_flag(ThreadFlag::CHECKPOINT_REQUEST);
            queue.drain(..).collect()
        };
        for closure in closures {
            closure.run(self);
        }
    }

    fn run_empty_checkpoint(&self) {
        let barrier = {
            let mut slot = self.empty_checkpoint_barrier.lock();
            self.clear_flag(ThreadFlag::EMPTY_CHECKPOINT_REQUEST);
            slot.take()
        };
        if let Some(barrier) = barrier {
            barrier.pass();
        }
    }

    /// Run `closure` against this thread and wait for it to finish.
    ///
    /// A runnable target runs it at its next safepoint while the requestor
    /// waits. Otherwise the requestor pins the target suspended and runs
    /// the closure itself.
    pub fn request_synchronous_checkpoint(
        &self,
        requestor: &Thread,
        closure: Arc<dyn Closure>,
        timeout: Duration,
    ) -> EmberResult<()> {
        if std::ptr::eq(self, requestor) {
            closure.run(self);
            return Ok(());
        }
        loop {
            let barrier = Arc::new(SuspendBarrier::new(1));
            let wrapped: Arc<dyn Closure> = Arc::new(BarrierClosure {
                inner: Arc::clone(&closure),
                barrier: Arc::clone(&barrier),
            });
            if self.request_checkpoint(wrapped) {
                let _waiting = ScopedThreadStateChange::new(requestor, ThreadState::WaitingForCheckPointsToRun);
                if !barrier.wait(timeout) {
                    return Err(EmberError::timeout("synchronous checkpoint", timeout.as_millis() as u64));
                }
                return Ok(());
            }

            {
                let guard = self.shared.suspend_count_lock.lock(requestor);
                self.modify_suspend_count(&guard, 1, None);
            }
            if self.is_runnable() {
                // Became runnable before the request landed; it will pick up
                // a queued checkpoint instead.
                self.resume_one(requestor);
                continue;
            }
            self.ensure_flip_function_started(requestor);
            closure.run(self);
            self.resume_one(requestor);
            debug!(thread = self.id.0, requestor = requestor.id.0, "checkpoint run on behalf");
            return Ok(());
        }
    }

    // =========================================================================
    // Flip functions
    // =========================================================================

    /// Install the root-flip closure and mark it pending.
    pub fn set_flip_function(&self, function: Arc<dyn Closure>) {
        let mut slot = self.flip_function.lock();
        ember_core::check!(
            !self.is_flag_set(ThreadFlag::PENDING_FLIP_FUNCTION),
            "flip function already pending on thread {}",
            self.id.0
        );
        *slot = Some(function);
        self.set_flag(ThreadFlag::PENDING_FLIP_FUNCTION);
    }

    /// Run the pending flip function, on behalf of this thread if `runner`
    /// is another. Returns `true` if `runner` ran it; `false` if there was
    /// none or another thread had claimed it (in which case this waits for
    /// it to finish).
    pub fn ensure_flip_function_started(&self, runner: &Thread) -> bool {
        loop {
            let old = StateAndFlags(self.state_and_flags.load(Ordering::Acquire));
            if !old.is_flag_set(ThreadFlag::PENDING_FLIP_FUNCTION) {
                if old.is_flag_set(ThreadFlag::RUNNING_FLIP_FUNCTION) {
                    self.wait_for_flip_function();
                }
                return false;
            }
            let new = old
                .without_flag(ThreadFlag::PENDING_FLIP_FUNCTION)
                .with_flag(ThreadFlag::RUNNING_FLIP_FUNCTION);
            if self.cas_state_and_flags(old, new, Ordering::AcqRel) {
                self.run_flip_function(runner);
                return true;
            }
        }
    }

    fn run_flip_function(&self, runner: &Thread) {
        let function = self.flip_function.lock().take();
        if let Some(function) = function {
            function.run(self);
        }
        let _slot = self.flip_function.lock();
        self.clear_flag(ThreadFlag::RUNNING_FLIP_FUNCTION);
        self.flip_cond.notify_all();
        trace!(thread = self.id.0, runner = runner.id.0, "flip function done");
    }

    /// Block while another thread runs this thread's flip function.
    pub fn wait_for_flip_function(&self) {
        let mut slot = self.flip_function.lock();
        while self.is_flag_set(ThreadFlag::RUNNING_FLIP_FUNCTION) {
            self.flip_cond.wait(&mut slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ThreadId;
    use std::sync::atomic::AtomicU32;

    fn runnable() -> Thread {
        let t = Thread::detached_for_testing(ThreadId(1), false);
        t.transition_from_suspended_to_runnable();
        t
    }

    #[test]
    fn test_runnable_round_trip_holds_mutator_lock() {
        let t = runnable();
        assert!(t.is_runnable());
        assert_eq!(t.shared().mutator_lock.readers(), 1);
        t.transition_from_runnable_to_suspended(ThreadState::Native);
        assert_eq!(t.state(), ThreadState::Native);
        assert_eq!(t.shared().mutator_lock.readers(), 0);
    }

    #[test]
    fn test_checkpoint_runs_at_poll() {
        let t = runnable();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        assert!(t.request_checkpoint(Arc::new(move |_: &Thread| {
            h.fetch_add(1, Ordering::SeqCst);
        })));
        assert!(t.is_flag_set(ThreadFlag::CHECKPOINT_REQUEST));
        t.check_suspend();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!t.is_flag_set(ThreadFlag::CHECKPOINT_REQUEST));
    }

    #[test]
    fn test_checkpoint_refused_when_not_runnable() {
        let t = Thread::detached_for_testing(ThreadId(1), false);
        assert!(!t.request_checkpoint(Arc::new(|_: &Thread| {})));
        assert!(!t.request_empty_checkpoint(&Arc::new(SuspendBarrier::new(1))));
    }

    #[test]
    fn test_checkpoint_runs_before_leaving_runnable() {
        let t = runnable();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        t.request_checkpoint(Arc::new(move |_: &Thread| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        t.transition_from_runnable_to_suspended(ThreadState::Native);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_checkpoint_passes_barrier() {
        let t = runnable();
        let barrier = Arc::new(SuspendBarrier::new(1));
        assert!(t.request_empty_checkpoint(&barrier));
        t.check_suspend();
        assert_eq!(barrier.remaining(), 0);
    }

    #[test]
    fn test_barrier_passed_on_behalf_of_suspended_thread() {
        let requestor = Thread::detached_for_testing(ThreadId(2), false);
        let t = Thread::detached_for_testing(ThreadId(1), false);
        let barrier = Arc::new(SuspendBarrier::new(1));
        let old = {
            let guard = t.shared().suspend_count_lock.lock(&requestor);
            t.modify_suspend_count(&guard, 1, Some(Arc::clone(&barrier)))
        };
        assert!(!old.state().is_runnable());
        assert!(t.remove_suspend_barrier(&barrier));
        barrier.pass();
        assert_eq!(barrier.remaining(), 0);
        assert_eq!(t.suspend_count(), 1);
        assert!(t.is_flag_set(ThreadFlag::SUSPEND_REQUEST));
        t.resume_one(&requestor);
        assert_eq!(t.suspend_count(), 0);
        assert!(!t.is_flag_set(ThreadFlag::SUSPEND_REQUEST));
    }

    #[test]
    fn test_flip_function_runs_once_on_resume() {
        let t = Thread::detached_for_testing(ThreadId(1), false);
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        t.set_flip_function(Arc::new(move |_: &Thread| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(t.is_flag_set(ThreadFlag::PENDING_FLIP_FUNCTION));
        t.transition_from_suspended_to_runnable();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!t.state_and_flags().is_any_of_flags_set(ThreadFlag::FLIP_FUNCTION));
        assert!(!t.ensure_flip_function_started(&t));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_synchronous_checkpoint_on_suspended_target() {
        let requestor = Thread::detached_for_testing(ThreadId(2), false);
        let t = Thread::detached_for_testing(ThreadId(1), false);
        let seen = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&seen);
        t.request_synchronous_checkpoint(
            &requestor,
            Arc::new(move |th: &Thread| {
                s.store(th.id().0, Ordering::SeqCst);
            }),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(t.suspend_count(), 0);
    }

    #[test]
    #[should_panic(expected = "no-suspension region")]
    fn test_poll_inside_no_suspension_region_aborts() {
        let t = runnable();
        let _region = t.start_assert_no_thread_suspension("raw heap pointer");
        t.request_checkpoint(Arc::new(|_: &Thread| {}));
        t.check_suspend();
    }
}
