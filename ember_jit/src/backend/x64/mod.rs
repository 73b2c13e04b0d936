//! x86 / x86-64 encoding.
//!
//! The assembler covers both ISAs; [`crate::InstructionSet::X86`] is an
//! encoding mode that rejects anything needing REX.

pub mod assembler;
pub mod buffer;
pub mod constant_area;
pub mod encoder;
pub mod label;
pub mod operand;
pub mod registers;
pub mod vex;

pub use assembler::{AssembledCode, Assembler};
pub use buffer::{AssemblerBuffer, AssemblerFixup, FixupKind};
pub use constant_area::ConstantArea;
pub use encoder::{Rex, RmOperand, SsePrefix};
pub use label::{Label, LabelState, NearLabel};
pub use operand::{Address, Displacement, Immediate, ScaleFactor};
pub use registers::{
    Condition, CpuRegister, ManagedCallingConvention, RegisterSet, RuntimeCallingConvention,
    XmmRegister, XmmSet,
};
pub use vex::{OpcodeMap, VectorLength, Vex};
