//! Object monitors.
//!
//! Monitors are inflated eagerly into a table keyed by object. Each entry
//! records the owning thread, the recursion count and the threads in
//! `Object.wait()`. Blocking operations move the calling thread out of
//! `Runnable` first so a suspend-all never waits on a thread parked here.

use crate::locks::{LevelMutex, LockLevel};
use crate::thread::{ScopedThreadStateChange, Thread, ThreadState};
use ember_core::{ObjRef, ThreadId};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

/// Failure of a monitor operation, surfaced to managed code as an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("current thread does not own the monitor")]
    IllegalMonitorState,
    #[error("thread interrupted while waiting")]
    Interrupted,
}

impl MonitorError {
    /// Descriptor of the exception class to throw.
    pub fn exception_descriptor(self) -> &'static str {
        match self {
            MonitorError::IllegalMonitorState => "Ljava/lang/IllegalMonitorStateException;",
            MonitorError::Interrupted => "Ljava/lang/InterruptedException;",
        }
    }
}

/// Where a waiting thread parks. Shared with the thread so an interrupt can
/// wake it.
#[derive(Debug, Default)]
pub struct WaitSlot {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl WaitSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        *self.woken.lock() = true;
        self.cond.notify_all();
    }

    /// Park until woken or until `timeout` elapses. Returns whether it was
    /// woken.
    pub fn park(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut woken = self.woken.lock();
        while !*woken {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut woken, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut woken),
            }
        }
        *woken
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    count: u32,
    waiters: VecDeque<Arc<WaitSlot>>,
}

impl MonitorState {
    fn is_idle(&self) -> bool {
        self.owner.is_none() && self.waiters.is_empty()
    }
}

/// The monitors of every locked or waited-on object.
#[derive(Debug)]
pub struct MonitorTable {
    monitors: LevelMutex<FxHashMap<ObjRef, MonitorState>>,
    released: Condvar,
}

impl Default for MonitorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorTable {
    pub fn new() -> Self {
        Self {
            monitors: LevelMutex::new("monitor table lock", LockLevel::Monitor, FxHashMap::default()),
            released: Condvar::new(),
        }
    }

    /// Acquire `obj`'s monitor, blocking while another thread owns it.
    pub fn monitor_enter(&self, thread: &Thread, obj: ObjRef) {
        self.enter_with_count(thread, obj, 1);
        trace!(thread = thread.id().0, ?obj, "monitor enter");
    }

    fn enter_with_count(&self, thread: &Thread, obj: ObjRef, count: u32) {
        let me = thread.id();
        loop {
            {
                let mut monitors = self.monitors.lock(thread);
                let state = monitors.entry(obj).or_default();
                match state.owner {
                    None => {
                        state.owner = Some(me);
                        state.count = count;
                        return;
                    }
                    Some(owner) if owner == me => {
                        state.count += count;
                        return;
                    }
                    Some(_) => {}
                }
            }
            let _blocked = ScopedThreadStateChange::new(thread, ThreadState::Blocked);
            let mut monitors = self.monitors.lock(thread);
            while monitors.get(&obj).is_some_and(|s| s.owner.is_some_and(|o| o != me)) {
                monitors.wait(&self.released);
            }
        }
    }

    /// Release one level of `obj`'s monitor.
    pub fn monitor_exit(&self, thread: &Thread, obj: ObjRef) -> Result<(), MonitorError> {
        let mut monitors = self.monitors.lock(thread);
        let state = monitors.get_mut(&obj).ok_or(MonitorError::IllegalMonitorState)?;
        if state.owner != Some(thread.id()) {
            return Err(MonitorError::IllegalMonitorState);
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            if state.is_idle() {
                monitors.remove(&obj);
            }
            self.released.notify_all();
        }
        trace!(thread = thread.id().0, ?obj, "monitor exit");
        Ok(())
    }

    /// `Object.wait`. A zero or absent timeout waits indefinitely.
    pub fn wait(&self, thread: &Thread, obj: ObjRef, timeout: Option<Duration>) -> Result<(), MonitorError> {
        let slot = Arc::new(WaitSlot::new());
        let saved_count = {
            let mut monitors = self.monitors.lock(thread);
            let state = monitors.get_mut(&obj).ok_or(MonitorError::IllegalMonitorState)?;
            if state.owner != Some(thread.id()) {
                return Err(MonitorError::IllegalMonitorState);
            }
            if thread.interrupted() {
                return Err(MonitorError::Interrupted);
            }
            let saved = state.count;
            state.owner = None;
            state.count = 0;
            state.waiters.push_back(Arc::clone(&slot));
            self.released.notify_all();
            saved
        };

        thread.set_current_wait(Some(Arc::clone(&slot)));
        // An interrupt that landed before the slot was published.
        if thread.is_interrupted() {
            slot.wake();
        }
        let timeout = timeout.filter(|t| !t.is_zero());
        {
            let state = if timeout.is_some() {
                ThreadState::TimedWaiting
            } else {
                ThreadState::Waiting
            };
            let _waiting = ScopedThreadStateChange::new(thread, state);
            slot.park(timeout);
        }
        thread.set_current_wait(None);

        {
            let mut monitors = self.monitors.lock(thread);
            if let Some(state) = monitors.get_mut(&obj) {
                state.waiters.retain(|w| !Arc::ptr_eq(w, &slot));
            }
        }
        self.enter_with_count(thread, obj, saved_count);
        if thread.interrupted() {
            return Err(MonitorError::Interrupted);
        }
        Ok(())
    }

    /// `Object.notify`.
    pub fn notify(&self, thread: &Thread, obj: ObjRef) -> Result<(), MonitorError> {
        let mut monitors = self.monitors.lock(thread);
        let state = self.owned_state(&mut monitors, thread, obj)?;
        if let Some(waiter) = state.waiters.pop_front() {
            waiter.wake();
        }
        Ok(())
    }

    /// `Object.notifyAll`.
    pub fn notify_all(&self, thread: &Thread, obj: ObjRef) -> Result<(), MonitorError> {
        let mut monitors = self.monitors.lock(thread);
        let state = self.owned_state(&mut monitors, thread, obj)?;
        for waiter in state.waiters.drain(..) {
            waiter.wake();
        }
        Ok(())
    }

    fn owned_state<'m>(
        &self,
        monitors: &'m mut FxHashMap<ObjRef, MonitorState>,
        thread: &Thread,
        obj: ObjRef,
    ) -> Result<&'m mut MonitorState, MonitorError> {
        match monitors.get_mut(&obj) {
            Some(state) if state.owner == Some(thread.id()) => Ok(state),
            _ => Err(MonitorError::IllegalMonitorState),
        }
    }

    pub fn owner(&self, thread: &Thread, obj: ObjRef) -> Option<ThreadId> {
        self.monitors.lock(thread).get(&obj).and_then(|s| s.owner)
    }

    pub fn holds_lock(&self, thread: &Thread, obj: ObjRef) -> bool {
        self.owner(thread, obj) == Some(thread.id())
    }

    /// Recursion count of `obj`'s monitor; zero when unowned.
    pub fn lock_count(&self, thread: &Thread, obj: ObjRef) -> u32 {
        self.monitors.lock(thread).get(&obj).map_or(0, |s| s.count)
    }
}

/// `Thread.sleep`. Returns `Err(Interrupted)` if interrupted.
pub fn sleep(thread: &Thread, duration: Duration) -> Result<(), MonitorError> {
    if thread.interrupted() {
        return Err(MonitorError::Interrupted);
    }
    let slot = Arc::new(WaitSlot::new());
    thread.set_current_wait(Some(Arc::clone(&slot)));
    if thread.is_interrupted() {
        slot.wake();
    }
    {
        let _sleeping = ScopedThreadStateChange::new(thread, ThreadState::Sleeping);
        slot.park(Some(duration));
    }
    thread.set_current_wait(None);
    if thread.interrupted() {
        return Err(MonitorError::Interrupted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(id: u32) -> Thread {
        Thread::detached_for_testing(ThreadId(id), true)
    }

    #[test]
    fn test_recursive_enter_exit() {
        let table = MonitorTable::new();
        let t = thread(1);
        let obj = ObjRef::from_index(1);
        table.monitor_enter(&t, obj);
        table.monitor_enter(&t, obj);
        assert_eq!(table.lock_count(&t, obj), 2);
        assert!(table.holds_lock(&t, obj));
        table.monitor_exit(&t, obj).unwrap();
        table.monitor_exit(&t, obj).unwrap();
        assert_eq!(table.owner(&t, obj), None);
        assert_eq!(table.monitor_exit(&t, obj), Err(MonitorError::IllegalMonitorState));
    }

    #[test]
    fn test_exit_by_non_owner() {
        let table = MonitorTable::new();
        let a = thread(1);
        let b = thread(2);
        let obj = ObjRef::from_index(1);
        table.monitor_enter(&a, obj);
        assert_eq!(table.monitor_exit(&b, obj), Err(MonitorError::IllegalMonitorState));
        assert_eq!(table.notify(&b, obj), Err(MonitorError::IllegalMonitorState));
        assert_eq!(table.wait(&b, obj, None), Err(MonitorError::IllegalMonitorState));
    }

    #[test]
    fn test_contended_enter_blocks() {
        let table = Arc::new(MonitorTable::new());
        let obj = ObjRef::from_index(1);
        let owner = thread(1);
        table.monitor_enter(&owner, obj);
        let t2 = Arc::clone(&table);
        let handle = std::thread::spawn(move || {
            let other = thread(2);
            t2.monitor_enter(&other, obj);
            let count = t2.lock_count(&other, obj);
            t2.monitor_exit(&other, obj).unwrap();
            count
        });
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(table.owner(&owner, obj), Some(ThreadId(1)));
        table.monitor_exit(&owner, obj).unwrap();
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn test_wait_notify() {
        let table = Arc::new(MonitorTable::new());
        let obj = ObjRef::from_index(5);
        let waiter_table = Arc::clone(&table);
        let handle = std::thread::spawn(move || {
            let t = thread(2);
            waiter_table.monitor_enter(&t, obj);
            waiter_table.monitor_enter(&t, obj);
            let result = waiter_table.wait(&t, obj, Some(Duration::from_secs(5)));
            let count = waiter_table.lock_count(&t, obj);
            waiter_table.monitor_exit(&t, obj).unwrap();
            waiter_table.monitor_exit(&t, obj).unwrap();
            (result, count)
        });
        let me = thread(1);
        loop {
            table.monitor_enter(&me, obj);
            let waiting = table.monitors.lock(&me).get(&obj).is_some_and(|s| !s.waiters.is_empty());
            if waiting {
                table.notify(&me, obj).unwrap();
                table.monitor_exit(&me, obj).unwrap();
                break;
            }
            table.monitor_exit(&me, obj).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        let (result, count) = handle.join().unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(count, 2);
    }

    #[test]
    fn test_timed_wait_expires() {
        let table = MonitorTable::new();
        let t = thread(1);
        let obj = ObjRef::from_index(2);
        table.monitor_enter(&t, obj);
        assert_eq!(table.wait(&t, obj, Some(Duration::from_millis(5))), Ok(()));
        assert!(table.holds_lock(&t, obj));
        assert_eq!(t.state(), ThreadState::Native);
    }

    #[test]
    fn test_interrupted_before_wait() {
        let table = MonitorTable::new();
        let t = thread(1);
        let obj = ObjRef::from_index(2);
        table.monitor_enter(&t, obj);
        t.interrupt();
        assert_eq!(table.wait(&t, obj, None), Err(MonitorError::Interrupted));
        assert!(!t.is_interrupted());
        assert!(table.holds_lock(&t, obj));
    }

    #[test]
    fn test_sleep_interrupted() {
        let t = Arc::new(thread(1));
        let target = Arc::clone(&t);
        let handle = std::thread::spawn(move || sleep(&target, Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(20));
        t.interrupt();
        assert_eq!(handle.join().unwrap(), Err(MonitorError::Interrupted));
    }
}
