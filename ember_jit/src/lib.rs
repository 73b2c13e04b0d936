//! Machine-code generation for the ember runtime.
//!
//! Two layers:
//! - [`backend::x64`]: an x86 / x86-64 assembler with REX and VEX encoding,
//!   labels, fixups and a deduplicated constant area
//! - [`codegen`]: the optimizing compiler's backend, lowering an [`codegen::HGraph`]
//!   through location summaries into assembler calls, with slow paths, GC
//!   barriers, intrinsics, stack maps and linker patches
#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod codegen;
pub mod error;
pub mod options;

pub use backend::x64::{AssembledCode, Assembler};
pub use codegen::{compile, CompiledMethod};
pub use error::{CodegenError, CodegenResult};
pub use options::{CodegenOptions, CpuFeatures, InstructionSet};
