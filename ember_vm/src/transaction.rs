//! Abortable class initialization.
//!
//! While a [`Transaction`] is active every heap write the interpreter makes
//! is logged with the value it overwrote, so the whole initialization can be
//! undone. Writes that could never be undone, such as to the statics of a
//! boot-image class, abort the transaction instead.

use crate::mirror::Class;
use ember_core::{ClassId, ObjRef};
use ember_gc::{Heap, RootInfo, RootVisitor};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// One overwritten location.
#[derive(Debug, Clone)]
enum UndoRecord {
    FieldPrim { obj: ObjRef, slot: usize, old: u64 },
    FieldRef { obj: ObjRef, slot: usize, old: Option<ObjRef> },
    StaticPrim { class: Arc<Class>, slot: u32, old: u64 },
    StaticRef { class: Arc<Class>, slot: u32, old: Option<ObjRef> },
    ArrayElement { array: ObjRef, index: usize, old: u64 },
}

#[derive(Debug, Default)]
struct TransactionLog {
    records: Vec<UndoRecord>,
    abort_message: Option<String>,
}

/// A log of undoable heap writes.
#[derive(Debug)]
pub struct Transaction {
    /// Class whose initializer opened the transaction, if any.
    root: Option<ClassId>,
    log: Mutex<TransactionLog>,
}

impl Transaction {
    pub fn new(root: Option<ClassId>) -> Self {
        Self {
            root,
            log: Mutex::new(TransactionLog::default()),
        }
    }

    pub fn root(&self) -> Option<ClassId> {
        self.root
    }

    pub fn record_field_prim(&self, obj: ObjRef, slot: usize, old: u64) {
        self.log.lock().records.push(UndoRecord::FieldPrim { obj, slot, old });
    }

    pub fn record_field_ref(&self, obj: ObjRef, slot: usize, old: Option<ObjRef>) {
        self.log.lock().records.push(UndoRecord::FieldRef { obj, slot, old });
    }

    pub fn record_static_prim(&self, class: &Arc<Class>, slot: u32, old: u64) {
        self.log.lock().records.push(UndoRecord::StaticPrim {
            class: Arc::clone(class),
            slot,
            old,
        });
    }

    pub fn record_static_ref(&self, class: &Arc<Class>, slot: u32, old: Option<ObjRef>) {
        self.log.lock().records.push(UndoRecord::StaticRef {
            class: Arc::clone(class),
            slot,
            old,
        });
    }

    pub fn record_array_element(&self, array: ObjRef, index: usize, old: u64) {
        self.log.lock().records.push(UndoRecord::ArrayElement { array, index, old });
    }

    /// Whether a static write to `class` may be logged. Boot-image statics
    /// are shared with every other process and cannot be rolled back.
    pub fn write_constraints_ok(&self, class: &Class) -> bool {
        !class.in_boot_image
    }

    /// Mark the transaction failed. The first message wins.
    pub fn abort(&self, message: impl Into<String>) {
        let mut log = self.log.lock();
        if log.abort_message.is_none() {
            let message = message.into();
            debug!(%message, "transaction aborted");
            log.abort_message = Some(message);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.log.lock().abort_message.is_some()
    }

    pub fn abort_message(&self) -> Option<String> {
        self.log.lock().abort_message.clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Undo every logged write, newest first.
    pub fn rollback(&self, heap: &Heap) {
        let records = std::mem::take(&mut self.log.lock().records);
        debug!(writes = records.len(), "rolling back transaction");
        for record in records.into_iter().rev() {
            match record {
                UndoRecord::FieldPrim { obj, slot, old } => heap.set_field_prim(obj, slot, old),
                UndoRecord::FieldRef { obj, slot, old } => heap.set_field_ref(obj, slot, old),
                UndoRecord::StaticPrim { class, slot, old } => class.set_static_prim(slot, old),
                UndoRecord::StaticRef { class, slot, old } => class.set_static_ref(slot, old),
                UndoRecord::ArrayElement { array, index, old } => {
                    heap.array_set(array, index, old);
                }
            }
        }
    }

    /// Old reference values are roots until the transaction ends.
    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        let info = RootInfo::global();
        let mut log = self.log.lock();
        for record in log.records.iter_mut() {
            match record {
                UndoRecord::FieldRef { obj, old, .. } => {
                    visit_ref(visitor, obj, info);
                    visitor.visit_root(old, info);
                }
                UndoRecord::FieldPrim { obj, .. } => visit_ref(visitor, obj, info),
                UndoRecord::StaticRef { old, .. } => visitor.visit_root(old, info),
                UndoRecord::ArrayElement { array, .. } => visit_ref(visitor, array, info),
                UndoRecord::StaticPrim { .. } => {}
            }
        }
    }
}

fn visit_ref(visitor: &mut dyn RootVisitor, obj: &mut ObjRef, info: RootInfo) {
    let mut slot = Some(*obj);
    visitor.visit_root(&mut slot, info);
    if let Some(moved) = slot {
        *obj = moved;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_gc::{GcConfig, Tlab};

    #[test]
    fn test_rollback_restores_newest_first() {
        let heap = Heap::new(GcConfig::testing()).unwrap();
        let mut tlab = Tlab::EMPTY;
        let obj = heap.alloc_object(&mut tlab, ClassId(0), 1, 1).unwrap();
        let other = heap.alloc_object(&mut tlab, ClassId(0), 0, 0).unwrap();
        let tx = Transaction::new(None);

        tx.record_field_prim(obj, 0, heap.get_field_prim(obj, 0));
        heap.set_field_prim(obj, 0, 5);
        tx.record_field_prim(obj, 0, heap.get_field_prim(obj, 0));
        heap.set_field_prim(obj, 0, 9);
        tx.record_field_ref(obj, 0, heap.get_field_ref(obj, 0));
        heap.set_field_ref(obj, 0, Some(other));
        assert_eq!(tx.len(), 3);

        tx.rollback(&heap);
        assert_eq!(heap.get_field_prim(obj, 0), 0);
        assert_eq!(heap.get_field_ref(obj, 0), None);
        assert!(tx.is_empty());
    }

    #[test]
    fn test_array_rollback() {
        let heap = Heap::new(GcConfig::testing()).unwrap();
        let mut tlab = Tlab::EMPTY;
        let array = heap
            .alloc_array(&mut tlab, ClassId(0), ember_gc::PrimitiveType::Int, 4)
            .unwrap();
        let tx = Transaction::new(None);
        tx.record_array_element(array, 2, heap.array_get(array, 2).unwrap());
        heap.array_set(array, 2, 77);
        tx.rollback(&heap);
        assert_eq!(heap.array_get(array, 2), Some(0));
    }

    #[test]
    fn test_first_abort_message_wins() {
        let tx = Transaction::new(Some(ClassId(3)));
        assert!(!tx.is_aborted());
        tx.abort("first");
        tx.abort("second");
        assert_eq!(tx.abort_message().as_deref(), Some("first"));
        assert_eq!(tx.root(), Some(ClassId(3)));
    }
}
