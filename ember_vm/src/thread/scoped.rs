//! RAII thread-state guards.

use super::{Thread, ThreadState};

fn change_state(thread: &Thread, to: ThreadState) {
    let from = thread.state();
    if from == to {
        return;
    }
    if to.is_runnable() {
        thread.transition_from_suspended_to_runnable();
    } else if from.is_runnable() {
        thread.transition_from_runnable_to_suspended(to);
    } else {
        thread.set_state(to);
    }
}

/// Moves a thread into a state and back to the original on drop.
#[must_use = "the state is restored when the guard drops"]
pub struct ScopedThreadStateChange<'a> {
    thread: &'a Thread,
    old_state: ThreadState,
}

impl<'a> ScopedThreadStateChange<'a> {
    pub fn new(thread: &'a Thread, new_state: ThreadState) -> Self {
        let old_state = thread.state();
        change_state(thread, new_state);
        Self { thread, old_state }
    }

    pub fn thread(&self) -> &'a Thread {
        self.thread
    }

    pub fn old_state(&self) -> ThreadState {
        self.old_state
    }
}

impl Drop for ScopedThreadStateChange<'_> {
    fn drop(&mut self) {
        change_state(self.thread, self.old_state);
    }
}

/// Makes the thread `Runnable` so it may touch the managed heap.
#[must_use = "the thread leaves Runnable when the guard drops"]
pub struct ScopedObjectAccess<'a> {
    change: ScopedThreadStateChange<'a>,
}

impl<'a> ScopedObjectAccess<'a> {
    pub fn new(thread: &'a Thread) -> Self {
        Self {
            change: ScopedThreadStateChange::new(thread, ThreadState::Runnable),
        }
    }

    pub fn thread(&self) -> &'a Thread {
        self.change.thread()
    }
}

/// A region in which the thread must not reach a safepoint.
#[must_use = "the region ends when the guard drops"]
pub struct ScopedAssertNoThreadSuspension<'a> {
    thread: &'a Thread,
    previous_cause: Option<&'static str>,
}

impl<'a> ScopedAssertNoThreadSuspension<'a> {
    pub fn new(thread: &'a Thread, cause: &'static str) -> Self {
        let previous_cause = thread.start_assert_no_thread_suspension(cause);
        Self { thread, previous_cause }
    }
}

impl Drop for ScopedAssertNoThreadSuspension<'_> {
    fn drop(&mut self) {
        self.thread.end_assert_no_thread_suspension(self.previous_cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ThreadId;

    #[test]
    fn test_state_restored_on_drop() {
        let t = Thread::detached_for_testing(ThreadId(1), true);
        {
            let soa = ScopedObjectAccess::new(&t);
            assert_eq!(soa.thread().state(), ThreadState::Runnable);
            {
                let _native = ScopedThreadStateChange::new(&t, ThreadState::Native);
                assert_eq!(t.state(), ThreadState::Native);
            }
            assert!(t.is_runnable());
        }
        assert_eq!(t.state(), ThreadState::Native);
        assert!(t.held_lock_levels().is_empty());
    }

    #[test]
    fn test_nested_no_suspension_regions() {
        let t = Thread::detached_for_testing(ThreadId(1), false);
        {
            let _outer = ScopedAssertNoThreadSuspension::new(&t, "outer");
            {
                let _inner = ScopedAssertNoThreadSuspension::new(&t, "inner");
            }
        }
        t.assert_thread_suspension_is_allowable();
    }

    #[test]
    #[should_panic(expected = "outer")]
    fn test_cause_restored_after_inner_region() {
        let t = Thread::detached_for_testing(ThreadId(1), false);
        let _outer = ScopedAssertNoThreadSuspension::new(&t, "outer");
        {
            let _inner = ScopedAssertNoThreadSuspension::new(&t, "inner");
        }
        t.assert_thread_suspension_is_allowable();
    }
}
