//! Field offsets of runtime structures read by generated code.
//!
//! Object headers come from the heap; method, class, string and var-handle
//! layouts are fixed here and scale with the pointer size where they hold
//! native pointers.

pub use ember_gc::heap::{
    ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, CLASS_OFFSET, LOCK_WORD_OFFSET, WIDE_ARRAY_DATA_OFFSET,
};

use super::hir::DataType;
use crate::options::InstructionSet;

/// Byte of the lock word holding the read-barrier state.
pub const GRAY_BYTE_OFFSET: i32 = LOCK_WORD_OFFSET + 3;
/// Gray bit within [`GRAY_BYTE_OFFSET`].
pub const GRAY_BIT_IN_BYTE: i64 = 1 << (ember_gc::heap::LOCK_WORD_READ_BARRIER_SHIFT - 24);

/// String character count.
pub const STRING_COUNT_OFFSET: i32 = 8;
/// Cached hash code.
pub const STRING_HASH_OFFSET: i32 = 12;
/// First UTF-16 unit of a string. Eight-byte aligned, so whole-word
/// compares stay inside the object's zeroed padding.
pub const STRING_VALUE_OFFSET: i32 = 16;

/// `ArtField`-style field descriptor: byte offset of the field in its holder.
pub const FIELD_OFFSET_OFFSET: i32 = 8;

/// Var-handle: bitmask of supported access modes.
pub const VAR_HANDLE_ACCESS_MODES_OFFSET: i32 = 8;
/// Var-handle: class of the receiver coordinate.
pub const VAR_HANDLE_COORDINATE_TYPE0_OFFSET: i32 = 12;
/// Field var-handle: pointer to the field descriptor.
pub const VAR_HANDLE_FIELD_OFFSET: i32 = 16;

/// Offset of element 0 of an array of `ty`.
#[inline]
pub const fn array_data_offset(ty: DataType) -> i32 {
    if ty.is_64bit() { WIDE_ARRAY_DATA_OFFSET } else { ARRAY_DATA_OFFSET }
}

/// Method layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodLayout {
    pointer_size: i32,
}

impl MethodLayout {
    pub const fn new(isa: InstructionSet) -> Self {
        Self { pointer_size: isa.pointer_size() as i32 }
    }

    /// Declaring class reference.
    pub const fn declaring_class(&self) -> i32 {
        0
    }

    pub const fn access_flags(&self) -> i32 {
        4
    }

    pub const fn hotness_count(&self) -> i32 {
        12
    }

    /// Entrypoint for calls from compiled code.
    pub const fn entry_point(&self) -> i32 {
        16 + self.pointer_size
    }
}

/// Class layout with the embedded vtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLayout {
    pointer_size: i32,
}

impl ClassLayout {
    pub const fn new(isa: InstructionSet) -> Self {
        Self { pointer_size: isa.pointer_size() as i32 }
    }

    pub const fn super_class(&self) -> i32 {
        8
    }

    pub const fn status(&self) -> i32 {
        12
    }

    pub const fn component_type(&self) -> i32 {
        16
    }

    /// Pointer to the interface method table.
    pub const fn imt_ptr(&self) -> i32 {
        24
    }

    /// Embedded vtable entry `index`.
    pub const fn vtable_entry(&self, index: u32) -> i32 {
        24 + self.pointer_size * (1 + index as i32)
    }

    /// Entry `index` of an interface method table.
    pub const fn imt_entry(&self, index: u32) -> i32 {
        self.pointer_size * index as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gray_bit_lands_in_top_byte() {
        assert_eq!(GRAY_BYTE_OFFSET, 7);
        assert_eq!(GRAY_BIT_IN_BYTE, 0x10);
    }

    #[test]
    fn test_pointer_sized_layouts() {
        let m64 = MethodLayout::new(InstructionSet::X86_64);
        let m32 = MethodLayout::new(InstructionSet::X86);
        assert_eq!(m64.entry_point(), 24);
        assert_eq!(m32.entry_point(), 20);
        let c = ClassLayout::new(InstructionSet::X86_64);
        assert_eq!(c.vtable_entry(0), 32);
        assert_eq!(c.vtable_entry(2), 48);
        assert_eq!(array_data_offset(DataType::Int64), 16);
        assert_eq!(array_data_offset(DataType::Uint16), 12);
    }
}
