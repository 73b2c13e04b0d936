//! Dex bytecode: opcodes, decoding, code items and symbolic tables.

pub mod builder;
pub mod code_item;
pub mod dex_file;
pub mod instruction;
pub mod opcodes;

pub(crate) use opcodes::dex_instruction_list;

pub use builder::{CodeItemBuilder, CodeLabel};
pub use code_item::{CatchHandler, CodeItem, TryItem};
pub use dex_file::{DexFile, MethodHandleKind};
pub use instruction::Instruction;
pub use opcodes::{IndexType, InstructionFlags, InstructionFormat, Opcode};
