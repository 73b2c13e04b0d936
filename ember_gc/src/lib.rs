//! Ember heap surface.
//!
//! The collector proper is an external collaborator. This crate is the part
//! of it the runtime and the code generator program against:
//!
//! - **Heap**: an object arena with stable [`ObjRef`](ember_core::ObjRef)
//!   indices, allocation of instances, arrays and strings
//! - **TLAB**: per-thread bump allocation windows with expand and slide
//! - **Barriers**: the card table behind the write barrier and the
//!   read-barrier mark hook
//! - **Roots**: handle scopes and the visitor the collector walks them with
//!
//! # Usage
//!
//! ```
//! use ember_core::ClassId;
//! use ember_gc::{GcConfig, Heap, Tlab};
//!
//! let heap = Heap::new(GcConfig::testing()).unwrap();
//! let mut tlab = Tlab::EMPTY;
//! let obj = heap.alloc_object(&mut tlab, ClassId(1), 1, 0).unwrap();
//! heap.set_field_prim(obj, 0, 7);
//! assert_eq!(heap.get_field_prim(obj, 0), 7);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod barrier;
pub mod config;
pub mod heap;
pub mod roots;
pub mod tlab;

mod stats;

pub use barrier::{read_barrier, read_barrier_for_root, write_barrier, CardTable};
pub use config::{ConfigError, GcConfig, ReadBarrierKind};
pub use heap::{ArrayData, Heap, HeapObject, LockWord, ObjectBody, PrimitiveType};
pub use roots::{
    CountingVisitor, Handle, HandleScopeGuard, HandleScopeStack, RootInfo, RootKind, RootVisitor,
    ScopeId,
};
pub use stats::{GcStats, GcStatsSnapshot};
pub use tlab::Tlab;
