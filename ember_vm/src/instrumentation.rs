//! Interpreter event listeners.
//!
//! Debuggers and profilers register an [`InstrumentationListener`] for a set
//! of [`InstrumentationEvents`]. The interpreter checks the cheap `has_*`
//! predicates before building an event, and runs the instrumented dispatch
//! loop only while at least one listener is installed.
//!
//! A listener that fails returns a [`ListenerError`]; the interpreter turns
//! it into a pending exception and marks the frame so the exception is not
//! reported back to exception listeners.

use crate::mirror::{Field, Method};
use crate::shadow_frame::FrameFlags;
use crate::thread::Thread;
use crate::value::JValue;
use bitflags::bitflags;
use ember_core::ObjRef;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::debug;

bitflags! {
    /// Events a listener can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstrumentationEvents: u32 {
        const METHOD_ENTERED = 1 << 0;
        const METHOD_EXITED = 1 << 1;
        const DEX_PC_MOVED = 1 << 2;
        const BRANCH = 1 << 3;
        const EXCEPTION_THROWN = 1 << 4;
        const EXCEPTION_HANDLED = 1 << 5;
        const FIELD_READ = 1 << 6;
        const FIELD_WRITTEN = 1 << 7;
    }
}

/// A listener asks for this exception to be thrown in the event's thread.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("listener raised {descriptor}")]
pub struct ListenerError {
    pub descriptor: String,
    pub message: Option<String>,
}

impl ListenerError {
    pub fn new(descriptor: &str, message: Option<&str>) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            message: message.map(str::to_string),
        }
    }
}

pub type ListenerResult = Result<(), ListenerError>;

/// Receives interpreter events. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait InstrumentationListener: Send + Sync {
    fn method_entered(&self, thread: &Thread, method: &Method) -> ListenerResult {
        Ok(())
    }

    fn method_exited(&self, thread: &Thread, method: &Method, dex_pc: u32, value: JValue) -> ListenerResult {
        Ok(())
    }

    fn dex_pc_moved(&self, thread: &Thread, this: Option<ObjRef>, method: &Method, dex_pc: u32) -> ListenerResult {
        Ok(())
    }

    fn branch(&self, thread: &Thread, method: &Method, dex_pc: u32, offset: i32) -> ListenerResult {
        Ok(())
    }

    fn exception_thrown(&self, thread: &Thread, exception: ObjRef) -> ListenerResult {
        Ok(())
    }

    fn exception_handled(&self, thread: &Thread, exception: ObjRef) -> ListenerResult {
        Ok(())
    }

    fn field_read(
        &self,
        thread: &Thread,
        this: Option<ObjRef>,
        method: &Method,
        dex_pc: u32,
        field: &Field,
    ) -> ListenerResult {
        Ok(())
    }

    fn field_written(
        &self,
        thread: &Thread,
        this: Option<ObjRef>,
        method: &Method,
        dex_pc: u32,
        field: &Field,
        value: JValue,
    ) -> ListenerResult {
        Ok(())
    }
}

struct Registration {
    events: InstrumentationEvents,
    listener: Arc<dyn InstrumentationListener>,
}

/// The listener registry.
#[derive(Default)]
pub struct Instrumentation {
    listeners: RwLock<Vec<Registration>>,
    /// Union of every registration's events.
    active: AtomicU32,
}

impl Instrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn InstrumentationListener>, events: InstrumentationEvents) {
        let mut listeners = self.listeners.write();
        listeners.push(Registration { events, listener });
        self.recompute(&listeners);
        debug!(?events, "instrumentation listener added");
    }

    /// Unsubscribe `listener` from `events`; drop it once it has none left.
    pub fn remove_listener(&self, listener: &Arc<dyn InstrumentationListener>, events: InstrumentationEvents) {
        let mut listeners = self.listeners.write();
        for r in listeners.iter_mut().filter(|r| Arc::ptr_eq(&r.listener, listener)) {
            r.events.remove(events);
        }
        listeners.retain(|r| !r.events.is_empty());
        self.recompute(&listeners);
        debug!(?events, "instrumentation listener removed");
    }

    fn recompute(&self, listeners: &[Registration]) {
        let union = listeners
            .iter()
            .fold(InstrumentationEvents::empty(), |acc, r| acc | r.events);
        self.active.store(union.bits(), Ordering::Release);
    }

    #[inline]
    pub fn active_events(&self) -> InstrumentationEvents {
        InstrumentationEvents::from_bits_truncate(self.active.load(Ordering::Acquire))
    }

    /// Whether the instrumented dispatch loop is needed.
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.active_events().is_empty()
    }

    #[inline]
    fn has(&self, event: InstrumentationEvents) -> bool {
        self.active_events().contains(event)
    }

    pub fn has_method_entry_listeners(&self) -> bool {
        self.has(InstrumentationEvents::METHOD_ENTERED)
    }

    pub fn has_method_exit_listeners(&self) -> bool {
        self.has(InstrumentationEvents::METHOD_EXITED)
    }

    pub fn has_dex_pc_listeners(&self) -> bool {
        self.has(InstrumentationEvents::DEX_PC_MOVED)
    }

    pub fn has_branch_listeners(&self) -> bool {
        self.has(InstrumentationEvents::BRANCH)
    }

    pub fn has_exception_thrown_listeners(&self) -> bool {
        self.has(InstrumentationEvents::EXCEPTION_THROWN)
    }

    pub fn has_exception_handled_listeners(&self) -> bool {
        self.has(InstrumentationEvents::EXCEPTION_HANDLED)
    }

    pub fn has_field_read_listeners(&self) -> bool {
        self.has(InstrumentationEvents::FIELD_READ)
    }

    pub fn has_field_write_listeners(&self) -> bool {
        self.has(InstrumentationEvents::FIELD_WRITTEN)
    }

    /// Call `f` on every listener subscribed to `event`, stopping at the
    /// first failure.
    fn dispatch(
        &self,
        event: InstrumentationEvents,
        mut f: impl FnMut(&dyn InstrumentationListener) -> ListenerResult,
    ) -> ListenerResult {
        // Snapshot so listeners may (un)register from inside a callback.
        let targets: Vec<Arc<dyn InstrumentationListener>> = self
            .listeners
            .read()
            .iter()
            .filter(|r| r.events.contains(event))
            .map(|r| Arc::clone(&r.listener))
            .collect();
        targets.iter().try_for_each(|l| f(l.as_ref()))
    }

    pub fn method_enter_event(&self, thread: &Thread, method: &Method) -> ListenerResult {
        self.dispatch(InstrumentationEvents::METHOD_ENTERED, |l| l.method_entered(thread, method))
    }

    pub fn method_exit_event(&self, thread: &Thread, method: &Method, dex_pc: u32, value: JValue) -> ListenerResult {
        self.dispatch(InstrumentationEvents::METHOD_EXITED, |l| {
            l.method_exited(thread, method, dex_pc, value)
        })
    }

    pub fn dex_pc_moved_event(
        &self,
        thread: &Thread,
        this: Option<ObjRef>,
        method: &Method,
        dex_pc: u32,
    ) -> ListenerResult {
        self.dispatch(InstrumentationEvents::DEX_PC_MOVED, |l| {
            l.dex_pc_moved(thread, this, method, dex_pc)
        })
    }

    pub fn branch_event(&self, thread: &Thread, method: &Method, dex_pc: u32, offset: i32) -> ListenerResult {
        self.dispatch(InstrumentationEvents::BRANCH, |l| l.branch(thread, method, dex_pc, offset))
    }

    pub fn exception_thrown_event(&self, thread: &Thread, exception: ObjRef) -> ListenerResult {
        self.dispatch(InstrumentationEvents::EXCEPTION_THROWN, |l| {
            l.exception_thrown(thread, exception)
        })
    }

    pub fn exception_handled_event(&self, thread: &Thread, exception: ObjRef) -> ListenerResult {
        self.dispatch(InstrumentationEvents::EXCEPTION_HANDLED, |l| {
            l.exception_handled(thread, exception)
        })
    }

    pub fn field_read_event(
        &self,
        thread: &Thread,
        this: Option<ObjRef>,
        method: &Method,
        dex_pc: u32,
        field: &Field,
    ) -> ListenerResult {
        self.dispatch(InstrumentationEvents::FIELD_READ, |l| {
            l.field_read(thread, this, method, dex_pc, field)
        })
    }

    pub fn field_write_event(
        &self,
        thread: &Thread,
        this: Option<ObjRef>,
        method: &Method,
        dex_pc: u32,
        field: &Field,
        value: JValue,
    ) -> ListenerResult {
        self.dispatch(InstrumentationEvents::FIELD_WRITTEN, |l| {
            l.field_written(thread, this, method, dex_pc, field, value)
        })
    }

    // =========================================================================
    // Frame requests
    // =========================================================================

    /// Ask the frame `depth` levels below the top to return immediately the
    /// next time it executes. The thread must be suspended or the caller.
    pub fn force_frame_pop(&self, thread: &Thread, depth: usize) -> bool {
        match thread.frame_at(depth) {
            Some(mut frame) => {
                frame.set_flag(FrameFlags::FORCE_POP);
                true
            }
            None => false,
        }
    }

    /// Report every dex-pc move in the frame `depth` levels below the top.
    pub fn watch_dex_pc_moves(&self, thread: &Thread, depth: usize) -> bool {
        match thread.frame_at(depth) {
            Some(mut frame) => {
                frame.set_flag(FrameFlags::NOTIFY_DEX_PC_MOVE);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("listeners", &self.listeners.read().len())
            .field("active", &self.active_events())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::DexFile;
    use crate::mirror::AccessFlags;
    use crate::shadow_frame::ShadowFrame;
    use ember_core::{ClassId, MethodId, ThreadId};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        entered: AtomicUsize,
        fail_branch: bool,
    }

    impl InstrumentationListener for Counter {
        fn method_entered(&self, _thread: &Thread, _method: &Method) -> ListenerResult {
            self.entered.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn branch(&self, _thread: &Thread, _method: &Method, _dex_pc: u32, _offset: i32) -> ListenerResult {
            if self.fail_branch {
                Err(ListenerError::new("Ljava/lang/Error;", Some("branch")))
            } else {
                Ok(())
            }
        }
    }

    fn method() -> Method {
        Method::new(
            MethodId(0),
            ClassId(0),
            "m".to_string(),
            "V".to_string(),
            AccessFlags::STATIC,
            None,
            None,
            Arc::new(DexFile::new("instr.dex")),
            None,
        )
    }

    #[test]
    fn test_active_events_track_registrations() {
        let instr = Instrumentation::new();
        assert!(!instr.is_active());
        let listener: Arc<dyn InstrumentationListener> = Arc::new(Counter::default());
        instr.add_listener(
            Arc::clone(&listener),
            InstrumentationEvents::METHOD_ENTERED | InstrumentationEvents::BRANCH,
        );
        assert!(instr.has_method_entry_listeners());
        assert!(instr.has_branch_listeners());
        assert!(!instr.has_dex_pc_listeners());

        instr.remove_listener(&listener, InstrumentationEvents::BRANCH);
        assert!(!instr.has_branch_listeners());
        assert!(instr.is_active());
        instr.remove_listener(&listener, InstrumentationEvents::all());
        assert!(!instr.is_active());
    }

    #[test]
    fn test_dispatch_only_to_subscribers() {
        let instr = Instrumentation::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        instr.add_listener(a.clone(), InstrumentationEvents::METHOD_ENTERED);
        instr.add_listener(b.clone(), InstrumentationEvents::BRANCH);
        let t = Thread::detached_for_testing(ThreadId(1), false);
        instr.method_enter_event(&t, &method()).unwrap();
        assert_eq!(a.entered.load(Ordering::Relaxed), 1);
        assert_eq!(b.entered.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_listener_failure_propagates() {
        let instr = Instrumentation::new();
        instr.add_listener(
            Arc::new(Counter {
                fail_branch: true,
                ..Counter::default()
            }),
            InstrumentationEvents::BRANCH,
        );
        let t = Thread::detached_for_testing(ThreadId(1), false);
        let err = instr.branch_event(&t, &method(), 4, -2).unwrap_err();
        assert_eq!(err.descriptor, "Ljava/lang/Error;");
        assert_eq!(err.message.as_deref(), Some("branch"));
    }

    #[test]
    fn test_frame_requests() {
        let instr = Instrumentation::new();
        let t = Thread::detached_for_testing(ThreadId(1), false);
        assert!(!instr.force_frame_pop(&t, 0));
        t.push_shadow_frame(ShadowFrame::create(1, None, Arc::new(method()), 0));
        assert!(instr.force_frame_pop(&t, 0));
        assert!(instr.watch_dex_pc_moves(&t, 0));
        let flags = t.top_frame().flags();
        assert!(flags.contains(FrameFlags::FORCE_POP | FrameFlags::NOTIFY_DEX_PC_MOVE));
    }
}
