//! Read and write barriers applied by the runtime.
//!
//! Compiled code emits its own barrier sequences; these functions are the
//! runtime's equivalents, used by the interpreter and by slow paths.

mod card_table;

pub use card_table::{CardTable, CARD_CLEAN, CARD_DIRTY};

use crate::config::ReadBarrierKind;
use crate::heap::Heap;
use ember_core::ObjRef;

// =============================================================================
// Write Barrier
// =============================================================================

/// Barrier for a reference store into `holder`.
///
/// Null stores never need a card mark.
#[inline]
pub fn write_barrier(heap: &Heap, holder: ObjRef, new_value: Option<ObjRef>) {
    if new_value.is_some() {
        heap.mark_gc_card(holder);
    }
}

// =============================================================================
// Read Barrier
// =============================================================================

/// Barrier for a reference `referent` loaded from `holder`.
///
/// - `Baker`: marks the referent only while the holder is gray.
/// - `Slow`: marks every loaded referent.
/// - `None`: returns the referent unchanged.
#[inline]
pub fn read_barrier(
    heap: &Heap,
    kind: ReadBarrierKind,
    holder: ObjRef,
    referent: Option<ObjRef>,
) -> Option<ObjRef> {
    let referent = referent?;
    match kind {
        ReadBarrierKind::Baker if heap.lock_word(holder).is_gray() => {
            Some(heap.read_barrier_mark(referent))
        }
        ReadBarrierKind::Slow => Some(heap.read_barrier_mark(referent)),
        _ => Some(referent),
    }
}

/// Barrier for a reference loaded from a GC root (no holder).
#[inline]
pub fn read_barrier_for_root(heap: &Heap, kind: ReadBarrierKind, root: Option<ObjRef>) -> Option<ObjRef> {
    match (kind, root) {
        (ReadBarrierKind::None, r) | (_, r @ None) => r,
        (_, Some(r)) => Some(heap.read_barrier_mark(r)),
    }
}
