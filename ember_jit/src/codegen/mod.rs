//! Optimizing compiler backend for x86 and x86-64.
//!
//! # Pipeline
//!
//! 1. `locations_builder` attaches a [`LocationSummary`] to every
//!    instruction describing its register demands.
//! 2. `allocator` gives every value a stack home and resolves each
//!    summary's policies to concrete registers, then lays out the frame.
//! 3. `code_generator` walks the blocks, moving inputs into place,
//!    emitting each instruction through `instruction_visitor` (and
//!    `intrinsics` for expanded calls), storing outputs back to their homes
//!    and finally emitting slow paths, stack maps and linker patches.
//!
//! # Usage
//!
//! ```ignore
//! let mut graph = HGraph::new(MethodIndex(3), true);
//! // ... build blocks ...
//! let method = compile(&mut graph, &CodegenOptions::default())?;
//! ```

pub mod allocator;
pub mod code_generator;
pub mod entrypoints;
pub mod hir;
pub mod instruction_visitor;
pub mod intrinsics;
pub mod layout;
pub mod linker_patch;
pub mod location;
pub mod locations_builder;
pub mod parallel_move;
pub mod slow_path;
pub mod stack_map;

pub use allocator::{allocate, Allocation, FrameLayout};
pub use code_generator::{compile, CodeGeneratorX86_64, CompiledMethod};
pub use entrypoints::QuickEntrypoint;
pub use hir::{
    BlockId, CodePtrLocation, ComparisonBias, DataType, DispatchInfo, HGraph, HInstruction, HKind, IfCondition,
    InstructionId, LoadKind, MemBarrierKind, MethodLoadKind, MoveOperands, TypeCheckKind,
};
pub use instruction_visitor::InstructionCodeGeneratorX86_64;
pub use intrinsics::{Intrinsic, IntrinsicCodeGenerator, IntrinsicLocationsBuilder};
pub use linker_patch::{LinkerPatch, PatchKind, PLACEHOLDER_32BIT_OFFSET};
pub use location::{CallKind, Location, LocationSummary, Policy};
pub use locations_builder::{build_locations, LocationsBuilderX86_64};
pub use slow_path::SlowPathCode;
pub use stack_map::{SafepointKind, StackMap, StackMapEntry};
