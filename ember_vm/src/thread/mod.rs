//! Managed threads.
//!
//! A [`Thread`] is shared (`Arc`) between its owner and the runtime. Other
//! threads only ever set request flags on it, queue closures, or touch its
//! roots while it is not `Runnable`; everything else is owner-only.
//!
//! # Components
//!
//! - [`state`]: the 32-bit state-and-flags word
//! - [`barrier`]: suspend barriers and checkpoint closures
//! - `suspend`: state transitions, the safepoint poll, checkpoints, flip functions
//! - [`scoped`]: RAII state changes and no-suspension regions

pub mod barrier;
pub mod scoped;
pub mod state;

mod suspend;

pub use barrier::{Closure, SuspendBarrier};
pub use scoped::{ScopedAssertNoThreadSuspension, ScopedObjectAccess, ScopedThreadStateChange};
pub use state::{StateAndFlags, ThreadFlag, ThreadState};

use crate::deoptimizer::DeoptimizationContext;
use crate::locks::{LevelMutex, LockLevel, MutatorLock};
use crate::monitor::WaitSlot;
use crate::runtime::Runtime;
use crate::shadow_frame::ShadowFrame;
use ember_core::{ObjRef, ThreadId};
use ember_gc::{HandleScopeStack, RootInfo, RootKind, RootVisitor, Tlab};
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, trace};

/// State shared by every thread of a runtime and its thread list.
#[derive(Debug)]
pub(crate) struct SuspendShared {
    /// Guards every suspend count and the resume condition.
    pub(crate) suspend_count_lock: LevelMutex<()>,
    /// Signalled whenever a suspend count drops.
    pub(crate) resume_cond: Condvar,
    pub(crate) mutator_lock: MutatorLock,
}

impl SuspendShared {
    pub(crate) fn new() -> Self {
        Self {
            suspend_count_lock: LevelMutex::new("thread suspend count lock", LockLevel::ThreadSuspendCount, ()),
            resume_cond: Condvar::new(),
            mutator_lock: MutatorLock::new(),
        }
    }
}

/// What is pending on a thread's exception slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingThrow {
    /// A managed exception.
    Exception(ObjRef),
    /// Not an exception: unwind to the deoptimizer.
    Deoptimize,
}

/// Per-thread settings copied from the runtime options at attach.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadConfig {
    pub(crate) check_lock_order: bool,
    pub(crate) verify_no_suspension: bool,
}

/// A thread known to the runtime.
pub struct Thread {
    id: ThreadId,
    name: String,
    state_and_flags: AtomicU32,
    /// Written only under the suspend-count lock.
    suspend_count: AtomicU32,
    shared: Arc<SuspendShared>,
    config: ThreadConfig,

    tlab: Mutex<Tlab>,
    stack: Mutex<Vec<ShadowFrame>>,
    handle_scopes: Mutex<HandleScopeStack>,
    exception: Mutex<Option<PendingThrow>>,
    async_exception: Mutex<Option<ObjRef>>,
    deopt_contexts: Mutex<Vec<DeoptimizationContext>>,

    active_barriers: Mutex<Vec<Arc<SuspendBarrier>>>,
    checkpoints: Mutex<VecDeque<Arc<dyn Closure>>>,
    empty_checkpoint_barrier: Mutex<Option<Arc<SuspendBarrier>>>,
    flip_function: Mutex<Option<Arc<dyn Closure>>>,
    flip_cond: Condvar,

    interrupted: AtomicBool,
    current_wait: Mutex<Option<Arc<WaitSlot>>>,

    no_suspension_count: AtomicU32,
    no_suspension_cause: Mutex<Option<&'static str>>,
    held_locks: Mutex<SmallVec<[LockLevel; 8]>>,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, name: String, shared: Arc<SuspendShared>, config: ThreadConfig) -> Self {
        Self {
            id,
            name,
            state_and_flags: AtomicU32::new(StateAndFlags::new(ThreadState::Starting).0),
            suspend_count: AtomicU32::new(0),
            shared,
            config,
            tlab: Mutex::new(Tlab::EMPTY),
            stack: Mutex::new(Vec::new()),
            handle_scopes: Mutex::new(HandleScopeStack::new()),
            exception: Mutex::new(None),
            async_exception: Mutex::new(None),
            deopt_contexts: Mutex::new(Vec::new()),
            active_barriers: Mutex::new(Vec::new()),
            checkpoints: Mutex::new(VecDeque::new()),
            empty_checkpoint_barrier: Mutex::new(None),
            flip_function: Mutex::new(None),
            flip_cond: Condvar::new(),
            interrupted: AtomicBool::new(false),
            current_wait: Mutex::new(None),
            no_suspension_count: AtomicU32::new(0),
            no_suspension_cause: Mutex::new(None),
            held_locks: Mutex::new(SmallVec::new()),
        }
    }

    /// A thread outside any runtime, in `Native` state.
    #[cfg(test)]
    pub(crate) fn detached_for_testing(id: ThreadId, check_lock_order: bool) -> Self {
        let thread = Self::new(
            id,
            format!("test-{}", id.0),
            Arc::new(SuspendShared::new()),
            ThreadConfig {
                check_lock_order,
                verify_no_suspension: true,
            },
        );
        thread.store_state(ThreadState::Native);
        thread
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared(&self) -> &Arc<SuspendShared> {
        &self.shared
    }

    // =========================================================================
    // TLAB
    // =========================================================================

    /// Bump-allocate from the thread's buffer. `None` means the caller must
    /// go to the heap.
    pub fn alloc_tlab(&self, bytes: usize) -> Option<usize> {
        self.tlab.lock().alloc(bytes)
    }

    /// Install a freshly registered buffer.
    pub fn set_tlab(&self, start: usize, end: usize, limit: usize) {
        self.tlab.lock().reset(start, end, limit);
        trace!(thread = self.id.0, start, end, limit, "tlab set");
    }

    /// Drop the buffer.
    pub fn reset_tlab(&self) {
        self.tlab.lock().clear();
    }

    /// Relocate the buffer after the collector moved it.
    pub fn adjust_tlab(&self, delta: isize) {
        self.tlab.lock().slide(delta);
    }

    /// Grow the buffer into its reserved tail.
    pub fn expand_tlab(&self, bytes: usize) -> bool {
        self.tlab.lock().expand(bytes)
    }

    pub fn tlab(&self) -> Tlab {
        *self.tlab.lock()
    }

    /// Run `f` with the buffer, for heap allocation.
    pub fn with_tlab<R>(&self, f: impl FnOnce(&mut Tlab) -> R) -> R {
        f(&mut self.tlab.lock())
    }

    // =========================================================================
    // Managed stack
    // =========================================================================

    /// Push a frame; returns the new depth.
    pub fn push_shadow_frame(&self, frame: ShadowFrame) -> usize {
        let mut stack = self.stack.lock();
        stack.push(frame);
        stack.len()
    }

    pub fn pop_shadow_frame(&self) -> Option<ShadowFrame> {
        self.stack.lock().pop()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.lock().len()
    }

    /// The topmost frame. Aborts if the stack is empty.
    pub fn top_frame(&self) -> MappedMutexGuard<'_, ShadowFrame> {
        MutexGuard::map(self.stack.lock(), |stack| match stack.last_mut() {
            Some(frame) => frame,
            None => ember_core::fatal!("no shadow frame on thread"),
        })
    }

    /// Frame at `depth` from the top (0 is the top).
    pub fn frame_at(&self, depth: usize) -> Option<MappedMutexGuard<'_, ShadowFrame>> {
        let stack = self.stack.lock();
        let index = stack.len().checked_sub(depth + 1)?;
        Some(MutexGuard::map(stack, |s| &mut s[index]))
    }

    /// Frame at `index` from the bottom of the stack. Aborts if absent.
    pub(crate) fn frame(&self, index: usize) -> MappedMutexGuard<'_, ShadowFrame> {
        MutexGuard::map(self.stack.lock(), |stack| match stack.get_mut(index) {
            Some(frame) => frame,
            None => ember_core::fatal!("no shadow frame at index {}", index),
        })
    }

    /// Run `f` over every frame, innermost first.
    pub fn for_each_frame(&self, mut f: impl FnMut(&ShadowFrame)) {
        for frame in self.stack.lock().iter().rev() {
            f(frame);
        }
    }

    // =========================================================================
    // Handle scopes
    // =========================================================================

    /// The handle-scope stack, for [`ember_gc::HandleScopeGuard`].
    pub fn handle_scopes(&self) -> &Mutex<HandleScopeStack> {
        &self.handle_scopes
    }

    // =========================================================================
    // Roots
    // =========================================================================

    /// Visit every reference the thread roots. Only valid while the thread
    /// is not `Runnable`, or from the thread itself.
    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        let info = RootInfo::thread(RootKind::PendingException, self.id);
        {
            let mut exception = self.exception.lock();
            if let Some(PendingThrow::Exception(obj)) = *exception {
                let mut slot = Some(obj);
                visitor.visit_root(&mut slot, info);
                *exception = slot.map(PendingThrow::Exception);
            }
        }
        visitor.visit_root(&mut self.async_exception.lock(), info);
        for frame in self.stack.lock().iter_mut() {
            frame.visit_roots(visitor, self.id);
        }
        for ctx in self.deopt_contexts.lock().iter_mut() {
            for frame in ctx.frames.iter_mut() {
                frame.visit_roots(visitor, self.id);
            }
        }
        self.handle_scopes.lock().visit_roots(visitor, self.id);
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    pub fn set_exception(&self, exception: ObjRef) {
        debug!(thread = self.id.0, ?exception, "exception pending");
        *self.exception.lock() = Some(PendingThrow::Exception(exception));
    }

    /// Mark the thread as unwinding to the deoptimizer.
    pub fn set_deoptimization_pending(&self) {
        *self.exception.lock() = Some(PendingThrow::Deoptimize);
    }

    pub fn pending(&self) -> Option<PendingThrow> {
        *self.exception.lock()
    }

    /// The pending managed exception, if any.
    pub fn exception(&self) -> Option<ObjRef> {
        match *self.exception.lock() {
            Some(PendingThrow::Exception(obj)) => Some(obj),
            _ => None,
        }
    }

    pub fn is_exception_pending(&self) -> bool {
        self.exception.lock().is_some()
    }

    pub fn is_deoptimization_pending(&self) -> bool {
        matches!(*self.exception.lock(), Some(PendingThrow::Deoptimize))
    }

    pub fn clear_exception(&self) {
        *self.exception.lock() = None;
    }

    pub fn take_exception(&self) -> Option<PendingThrow> {
        self.exception.lock().take()
    }

    /// Allocate a throwable of class `descriptor` and make it pending. If
    /// the allocation fails the preallocated `OutOfMemoryError` is thrown
    /// instead.
    pub fn throw_new_exception(&self, runtime: &Runtime, descriptor: &str, message: Option<&str>) {
        let exception = runtime.new_throwable(self, descriptor, message);
        self.set_exception(exception);
    }

    /// Post an exception to be raised at the thread's next back-edge.
    pub fn set_async_exception(&self, exception: ObjRef) {
        debug!(thread = self.id.0, ?exception, "async exception posted");
        *self.async_exception.lock() = Some(exception);
    }

    /// Move a posted async exception into the pending slot. Returns whether
    /// one was promoted.
    pub fn promote_async_exception(&self) -> bool {
        let Some(exception) = self.async_exception.lock().take() else {
            return false;
        };
        self.set_exception(exception);
        true
    }

    pub(crate) fn push_deoptimization_context(&self, ctx: DeoptimizationContext) {
        self.deopt_contexts.lock().push(ctx);
    }

    pub(crate) fn pop_deoptimization_context(&self) -> Option<DeoptimizationContext> {
        self.deopt_contexts.lock().pop()
    }

    // =========================================================================
    // Interruption
    // =========================================================================

    /// Set the interrupted flag and wake the thread if it is waiting.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(slot) = self.current_wait.lock().clone() {
            slot.wake();
        }
        debug!(thread = self.id.0, "interrupted");
    }

    /// Read and clear the interrupted flag.
    pub fn interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_current_wait(&self, slot: Option<Arc<WaitSlot>>) {
        *self.current_wait.lock() = slot;
    }

    // =========================================================================
    // No-suspension regions
    // =========================================================================

    /// Enter a region in which reaching a safepoint is a fatal error.
    /// Returns the enclosing region's cause.
    pub fn start_assert_no_thread_suspension(&self, cause: &'static str) -> Option<&'static str> {
        self.no_suspension_count.fetch_add(1, Ordering::Relaxed);
        self.no_suspension_cause.lock().replace(cause)
    }

    pub fn end_assert_no_thread_suspension(&self, previous_cause: Option<&'static str>) {
        let before = self.no_suspension_count.fetch_sub(1, Ordering::Relaxed);
        ember_core::check!(before > 0, "unbalanced end of no-suspension region");
        *self.no_suspension_cause.lock() = previous_cause;
    }

    /// Abort if the thread is inside a no-suspension region.
    pub fn assert_thread_suspension_is_allowable(&self) {
        if self.config.verify_no_suspension && self.no_suspension_count.load(Ordering::Relaxed) > 0 {
            let cause = self.no_suspension_cause.lock().unwrap_or("unknown");
            ember_core::fatal!("thread {} reached a safepoint inside no-suspension region: {}", self.id.0, cause);
        }
    }

    // =========================================================================
    // Lock-order bookkeeping
    // =========================================================================

    pub(crate) fn note_lock_acquired(&self, level: LockLevel, name: &str) {
        if !self.config.check_lock_order {
            return;
        }
        let mut held = self.held_locks.lock();
        if let Some(conflict) = held.iter().find(|&&h| h <= level) {
            ember_core::fatal!(
                "lock order violation: thread {} acquiring {} ({:?}) while holding {:?}",
                self.id.0,
                name,
                level,
                conflict
            );
        }
        held.push(level);
    }

    pub(crate) fn note_lock_released(&self, level: LockLevel) {
        if !self.config.check_lock_order {
            return;
        }
        let mut held = self.held_locks.lock();
        if let Some(pos) = held.iter().rposition(|&h| h == level) {
            held.remove(pos);
        }
    }

    pub fn held_lock_levels(&self) -> SmallVec<[LockLevel; 8]> {
        self.held_locks.lock().clone()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state_and_flags", &self.state_and_flags())
            .field("suspend_count", &self.suspend_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> Thread {
        Thread::detached_for_testing(ThreadId(7), false)
    }

    #[test]
    fn test_tlab_overflow_and_expand() {
        let t = thread();
        t.set_tlab(0, 64, 256);
        assert_eq!(t.alloc_tlab(32), Some(0));
        assert_eq!(t.tlab().pos(), 32);
        assert_eq!(t.alloc_tlab(40), None);
        assert!(t.expand_tlab(128));
        assert_eq!(t.tlab().end(), 192);
        assert_eq!(t.alloc_tlab(40), Some(32));
        assert_eq!(t.tlab().pos(), 72);
    }

    #[test]
    fn test_tlab_slide_and_reset() {
        let t = thread();
        t.set_tlab(0x1000, 0x1100, 0x1200);
        t.alloc_tlab(16);
        t.adjust_tlab(0x100);
        let tlab = t.tlab();
        assert_eq!((tlab.start(), tlab.pos(), tlab.end()), (0x1100, 0x1110, 0x1200));
        t.reset_tlab();
        assert!(t.tlab().is_empty());
    }

    #[test]
    fn test_async_exception_promotion() {
        let t = thread();
        assert!(!t.promote_async_exception());
        let e = ObjRef::from_index(3);
        t.set_async_exception(e);
        assert!(!t.is_exception_pending());
        assert!(t.promote_async_exception());
        assert_eq!(t.exception(), Some(e));
        t.clear_exception();
        assert!(!t.is_exception_pending());
    }

    #[test]
    fn test_deoptimize_is_not_an_exception() {
        let t = thread();
        t.set_deoptimization_pending();
        assert!(t.is_exception_pending());
        assert!(t.is_deoptimization_pending());
        assert_eq!(t.exception(), None);
    }

    #[test]
    fn test_interrupt_flag() {
        let t = thread();
        assert!(!t.is_interrupted());
        t.interrupt();
        assert!(t.is_interrupted());
        assert!(t.interrupted());
        assert!(!t.is_interrupted());
    }

    #[test]
    fn test_roots_are_rewritten() {
        let t = thread();
        let old = ObjRef::from_index(1);
        let new = ObjRef::from_index(2);
        t.set_exception(old);
        t.visit_roots(&mut |slot: &mut Option<ObjRef>, _info: RootInfo| {
            if *slot == Some(old) {
                *slot = Some(new);
            }
        });
        assert_eq!(t.exception(), Some(new));
    }
}
