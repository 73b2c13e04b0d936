//! Managed threads, the safepoint protocol and the bytecode interpreter of
//! the ember runtime.
//!
//! A [`Runtime`] owns the heap, the class linker and the thread list.
//! Threads attach to it, run dex bytecode through [`interpreter`] and stop at
//! safepoints when another thread suspends them, runs a checkpoint on them
//! or flips their roots.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bytecode;
pub mod class_linker;
pub mod deoptimizer;
pub mod instrumentation;
pub mod interpreter;
pub mod locks;
pub mod mirror;
pub mod monitor;
mod natives;
pub mod options;
pub mod runtime;
pub mod shadow_frame;
pub mod thread;
pub mod thread_list;
pub mod transaction;
pub mod value;

pub use class_linker::{ClassDef, ClassLinker, ClassTable, InvokeType};
pub use options::RuntimeOptions;
pub use runtime::{JitHooks, Runtime};
pub use shadow_frame::{FrameFlags, ShadowFrame};
pub use thread::{Thread, ThreadState};
pub use thread_list::ThreadList;
pub use value::JValue;
