//! Root enumeration.
//!
//! Roots are slots outside the heap that hold references: handle-scope
//! slots, shadow-frame vregs, pending exceptions, monitor owners. The
//! collector walks them through a [`RootVisitor`] and may rewrite each slot
//! in place, so every visit hands out `&mut Option<ObjRef>`.

mod handles;

pub use handles::{Handle, HandleScopeGuard, HandleScopeStack, ScopeId};

use ember_core::{ObjRef, ThreadId};

/// Where a root was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    /// A slot in a handle scope.
    HandleScope,
    /// A reference vreg of an interpreter frame.
    ShadowFrame,
    /// A pending or asynchronous exception slot.
    PendingException,
    /// A held monitor.
    Monitor,
    /// The managed peer of a thread.
    ThreadObject,
    /// A runtime-wide reference (preallocated errors, interned strings).
    Global,
}

/// Description of a root passed alongside the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootInfo {
    /// Kind of root.
    pub kind: RootKind,
    /// Owning thread, if any.
    pub thread: Option<ThreadId>,
}

impl RootInfo {
    /// Root owned by a thread.
    #[inline]
    pub const fn thread(kind: RootKind, thread: ThreadId) -> Self {
        Self {
            kind,
            thread: Some(thread),
        }
    }

    /// Runtime-wide root.
    #[inline]
    pub const fn global() -> Self {
        Self {
            kind: RootKind::Global,
            thread: None,
        }
    }
}

/// Visitor over root slots.
pub trait RootVisitor {
    /// Visit one root. The visitor may overwrite the slot.
    fn visit_root(&mut self, root: &mut Option<ObjRef>, info: RootInfo);
}

impl<F: FnMut(&mut Option<ObjRef>, RootInfo)> RootVisitor for F {
    #[inline]
    fn visit_root(&mut self, root: &mut Option<ObjRef>, info: RootInfo) {
        self(root, info)
    }
}

/// Visitor that counts non-null roots by kind.
#[derive(Debug, Default)]
pub struct CountingVisitor {
    /// Non-null roots seen.
    pub count: usize,
    /// Null slots seen.
    pub nulls: usize,
    /// Roots seen in shadow frames.
    pub frame_roots: usize,
}

impl RootVisitor for CountingVisitor {
    fn visit_root(&mut self, root: &mut Option<ObjRef>, info: RootInfo) {
        if root.is_none() {
            self.nulls += 1;
            return;
        }
        self.count += 1;
        if info.kind == RootKind::ShadowFrame {
            self.frame_roots += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_visitor() {
        let mut seen = Vec::new();
        let mut visitor = |root: &mut Option<ObjRef>, info: RootInfo| {
            seen.push((*root, info.kind));
            *root = None;
        };
        let mut slot = Some(ObjRef::from_index(3));
        visitor.visit_root(&mut slot, RootInfo::global());
        assert_eq!(slot, None);
        assert_eq!(seen, vec![(Some(ObjRef::from_index(3)), RootKind::Global)]);
    }

    #[test]
    fn test_counting_visitor() {
        let mut counter = CountingVisitor::default();
        let info = RootInfo::thread(RootKind::ShadowFrame, ThreadId(1));
        counter.visit_root(&mut Some(ObjRef::from_index(0)), info);
        counter.visit_root(&mut None, info);
        assert_eq!(counter.count, 1);
        assert_eq!(counter.nulls, 1);
        assert_eq!(counter.frame_roots, 1);
    }
}
