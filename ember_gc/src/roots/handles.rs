//! Handle scopes.
//!
//! Native runtime code that holds references across a possible suspension
//! point parks them in handle-scope slots. Scopes nest: a scope owns every
//! slot created after it was pushed, and popping it releases them all. The
//! stack is an index arena so the collector can rewrite slots through
//! [`HandleScopeStack::visit_roots`] without chasing pointers.

use super::{RootInfo, RootKind, RootVisitor};
use ember_core::{ObjRef, ThreadId};
use parking_lot::Mutex;

/// Index of a slot in a [`HandleScopeStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Slot index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Depth marker returned by [`HandleScopeStack::push_scope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(u32);

/// Stack of handle scopes owned by one thread.
#[derive(Debug, Default)]
pub struct HandleScopeStack {
    slots: Vec<Option<ObjRef>>,
    /// Slot index at which each live scope starts.
    scope_starts: Vec<usize>,
}

impl HandleScopeStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new scope.
    pub fn push_scope(&mut self) -> ScopeId {
        self.scope_starts.push(self.slots.len());
        ScopeId(self.scope_starts.len() as u32)
    }

    /// Close the innermost scope, which must be `scope`.
    pub fn pop_scope(&mut self, scope: ScopeId) {
        ember_core::check!(
            self.scope_starts.len() as u32 == scope.0,
            "handle scope {:?} popped out of order (depth {})",
            scope,
            self.scope_starts.len()
        );
        if let Some(start) = self.scope_starts.pop() {
            self.slots.truncate(start);
        }
    }

    /// Park `value` in the innermost scope.
    pub fn new_handle(&mut self, value: Option<ObjRef>) -> Handle {
        ember_core::check!(!self.scope_starts.is_empty(), "new_handle outside any handle scope");
        self.slots.push(value);
        Handle((self.slots.len() - 1) as u32)
    }

    /// Current value of a handle.
    #[inline]
    pub fn get(&self, handle: Handle) -> Option<ObjRef> {
        match self.slots.get(handle.index()) {
            Some(v) => *v,
            None => ember_core::fatal!("stale handle {:?}", handle),
        }
    }

    /// Replace the value of a handle.
    #[inline]
    pub fn set(&mut self, handle: Handle, value: Option<ObjRef>) {
        match self.slots.get_mut(handle.index()) {
            Some(slot) => *slot = value,
            None => ember_core::fatal!("stale handle {:?}", handle),
        }
    }

    /// Number of live slots across all scopes.
    #[inline]
    pub fn number_of_references(&self) -> usize {
        self.slots.len()
    }

    /// Number of open scopes.
    #[inline]
    pub fn depth(&self) -> usize {
        self.scope_starts.len()
    }

    /// Whether `handle` belongs to a live scope.
    #[inline]
    pub fn contains(&self, handle: Handle) -> bool {
        handle.index() < self.slots.len()
    }

    /// Visit every slot, innermost scope last.
    pub fn visit_roots(&mut self, visitor: &mut dyn RootVisitor, thread: ThreadId) {
        let info = RootInfo::thread(RootKind::HandleScope, thread);
        for slot in self.slots.iter_mut() {
            visitor.visit_root(slot, info);
        }
    }
}

/// RAII scope over a thread's shared [`HandleScopeStack`].
///
/// The stack lock is taken per operation, never held by the guard, so the
/// collector can visit the scopes while the owner is suspended.
pub struct HandleScopeGuard<'a> {
    stack: &'a Mutex<HandleScopeStack>,
    scope: ScopeId,
}

impl<'a> HandleScopeGuard<'a> {
    /// Open a scope on `stack`.
    pub fn new(stack: &'a Mutex<HandleScopeStack>) -> Self {
        let scope = stack.lock().push_scope();
        Self { stack, scope }
    }

    /// Park `value` in this scope.
    pub fn new_handle(&self, value: Option<ObjRef>) -> Handle {
        self.stack.lock().new_handle(value)
    }

    /// Current value of a handle.
    pub fn get(&self, handle: Handle) -> Option<ObjRef> {
        self.stack.lock().get(handle)
    }

    /// Replace the value of a handle.
    pub fn set(&self, handle: Handle, value: Option<ObjRef>) {
        self.stack.lock().set(handle, value)
    }
}

impl Drop for HandleScopeGuard<'_> {
    fn drop(&mut self) {
        self.stack.lock().pop_scope(self.scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(i: usize) -> Option<ObjRef> {
        Some(ObjRef::from_index(i))
    }

    #[test]
    fn test_nested_scopes() {
        let mut stack = HandleScopeStack::new();
        let outer = stack.push_scope();
        let a = stack.new_handle(obj(1));

        let inner = stack.push_scope();
        let b = stack.new_handle(obj(2));
        stack.new_handle(None);
        assert_eq!(stack.number_of_references(), 3);
        assert_eq!(stack.get(b), obj(2));

        stack.pop_scope(inner);
        assert_eq!(stack.number_of_references(), 1);
        assert!(!stack.contains(b));
        assert_eq!(stack.get(a), obj(1));

        stack.pop_scope(outer);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_visitor_rewrites_slots() {
        let mut stack = HandleScopeStack::new();
        stack.push_scope();
        let h = stack.new_handle(obj(5));

        let mut forward = |root: &mut Option<ObjRef>, info: RootInfo| {
            assert_eq!(info.kind, RootKind::HandleScope);
            assert_eq!(info.thread, Some(ThreadId(7)));
            *root = root.map(|r| ObjRef::from_index(r.index() + 100));
        };
        stack.visit_roots(&mut forward, ThreadId(7));
        assert_eq!(stack.get(h), obj(105));
    }

    #[test]
    fn test_guard_pops_on_drop() {
        let stack = Mutex::new(HandleScopeStack::new());
        {
            let guard = HandleScopeGuard::new(&stack);
            let h = guard.new_handle(obj(1));
            guard.set(h, obj(2));
            assert_eq!(guard.get(h), obj(2));
            assert_eq!(stack.lock().depth(), 1);
        }
        assert_eq!(stack.lock().depth(), 0);
        assert_eq!(stack.lock().number_of_references(), 0);
    }

    #[test]
    #[should_panic(expected = "outside any handle scope")]
    fn test_handle_without_scope_is_fatal() {
        HandleScopeStack::new().new_handle(None);
    }

    #[test]
    #[should_panic(expected = "popped out of order")]
    fn test_out_of_order_pop_is_fatal() {
        let mut stack = HandleScopeStack::new();
        let outer = stack.push_scope();
        stack.push_scope();
        stack.pop_scope(outer);
    }
}
