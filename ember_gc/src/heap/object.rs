//! Object representation in the arena heap.
//!
//! Every object has a two-word header (class, lock word) at its heap
//! address followed by its body. The arena keeps the body in typed Rust
//! storage; the header layout constants describe what emitted code sees.

use ember_core::{ClassId, ObjRef};

// =============================================================================
// Layout
// =============================================================================

/// Offset of the class reference in every object.
pub const CLASS_OFFSET: i32 = 0;
/// Offset of the lock word in every object.
pub const LOCK_WORD_OFFSET: i32 = 4;
/// Size of the object header.
pub const HEADER_SIZE: usize = 8;
/// Offset of the length field in arrays and strings.
pub const ARRAY_LENGTH_OFFSET: i32 = 8;
/// Offset of the first element of an array (and of a string's chars).
pub const ARRAY_DATA_OFFSET: i32 = 12;
/// Offset of the first element of an array of 64-bit elements.
pub const WIDE_ARRAY_DATA_OFFSET: i32 = 16;
/// Size of a heap reference.
pub const REFERENCE_SIZE: usize = 4;

/// Bit in the lock word set while the object is gray for the concurrent copier.
pub const LOCK_WORD_READ_BARRIER_SHIFT: u32 = 28;
/// Bit in the lock word set once the object has been marked.
pub const LOCK_WORD_MARK_BIT_SHIFT: u32 = 29;
const HASH_MASK: u32 = (1 << LOCK_WORD_READ_BARRIER_SHIFT) - 1;

// =============================================================================
// Lock word
// =============================================================================

/// Object lock word: identity hash plus GC state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockWord(pub u32);

impl LockWord {
    /// Whether the read-barrier state is gray.
    #[inline]
    pub const fn is_gray(self) -> bool {
        self.0 & (1 << LOCK_WORD_READ_BARRIER_SHIFT) != 0
    }

    /// Set or clear the gray bit.
    #[inline]
    pub const fn with_gray(self, gray: bool) -> Self {
        if gray {
            LockWord(self.0 | (1 << LOCK_WORD_READ_BARRIER_SHIFT))
        } else {
            LockWord(self.0 & !(1 << LOCK_WORD_READ_BARRIER_SHIFT))
        }
    }

    /// Whether the object has been marked.
    #[inline]
    pub const fn is_marked(self) -> bool {
        self.0 & (1 << LOCK_WORD_MARK_BIT_SHIFT) != 0
    }

    /// Set the mark bit.
    #[inline]
    pub const fn marked(self) -> Self {
        LockWord(self.0 | (1 << LOCK_WORD_MARK_BIT_SHIFT))
    }

    /// Identity hash (0 until assigned).
    #[inline]
    pub const fn hash(self) -> u32 {
        self.0 & HASH_MASK
    }

    /// Install an identity hash.
    #[inline]
    pub const fn with_hash(self, hash: u32) -> Self {
        LockWord((self.0 & !HASH_MASK) | (hash & HASH_MASK))
    }
}

// =============================================================================
// Primitive types and arrays
// =============================================================================

/// Element kinds of arrays and fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    /// `boolean`
    Boolean,
    /// `byte`
    Byte,
    /// `char`
    Char,
    /// `short`
    Short,
    /// `int`
    Int,
    /// `long`
    Long,
    /// `float`
    Float,
    /// `double`
    Double,
    /// Object reference.
    Reference,
}

impl PrimitiveType {
    /// Size of one element in bytes.
    #[inline]
    pub const fn component_size(self) -> usize {
        match self {
            PrimitiveType::Boolean | PrimitiveType::Byte => 1,
            PrimitiveType::Char | PrimitiveType::Short => 2,
            PrimitiveType::Int | PrimitiveType::Float => 4,
            PrimitiveType::Reference => REFERENCE_SIZE,
            PrimitiveType::Long | PrimitiveType::Double => 8,
        }
    }

    /// Whether values of this type occupy two vregs.
    #[inline]
    pub const fn is_wide(self) -> bool {
        matches!(self, PrimitiveType::Long | PrimitiveType::Double)
    }

    /// Parse a one-character type descriptor.
    pub fn from_descriptor(descriptor: &str) -> Option<Self> {
        Some(match descriptor.as_bytes().first()? {
            b'Z' => PrimitiveType::Boolean,
            b'B' => PrimitiveType::Byte,
            b'C' => PrimitiveType::Char,
            b'S' => PrimitiveType::Short,
            b'I' => PrimitiveType::Int,
            b'J' => PrimitiveType::Long,
            b'F' => PrimitiveType::Float,
            b'D' => PrimitiveType::Double,
            b'L' | b'[' => PrimitiveType::Reference,
            _ => return None,
        })
    }
}

/// Typed array storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    /// `boolean[]`
    Boolean(Vec<u8>),
    /// `byte[]`
    Byte(Vec<i8>),
    /// `char[]`
    Char(Vec<u16>),
    /// `short[]`
    Short(Vec<i16>),
    /// `int[]`
    Int(Vec<i32>),
    /// `long[]`
    Long(Vec<i64>),
    /// `float[]`
    Float(Vec<f32>),
    /// `double[]`
    Double(Vec<f64>),
    /// `Object[]` and friends.
    Reference(Vec<Option<ObjRef>>),
}

impl ArrayData {
    /// Zero-filled array of `length` elements.
    pub fn zeroed(component: PrimitiveType, length: usize) -> Self {
        match component {
            PrimitiveType::Boolean => ArrayData::Boolean(vec![0; length]),
            PrimitiveType::Byte => ArrayData::Byte(vec![0; length]),
            PrimitiveType::Char => ArrayData::Char(vec![0; length]),
            PrimitiveType::Short => ArrayData::Short(vec![0; length]),
            PrimitiveType::Int => ArrayData::Int(vec![0; length]),
            PrimitiveType::Long => ArrayData::Long(vec![0; length]),
            PrimitiveType::Float => ArrayData::Float(vec![0.0; length]),
            PrimitiveType::Double => ArrayData::Double(vec![0.0; length]),
            PrimitiveType::Reference => ArrayData::Reference(vec![None; length]),
        }
    }

    /// Element type.
    pub fn component(&self) -> PrimitiveType {
        match self {
            ArrayData::Boolean(_) => PrimitiveType::Boolean,
            ArrayData::Byte(_) => PrimitiveType::Byte,
            ArrayData::Char(_) => PrimitiveType::Char,
            ArrayData::Short(_) => PrimitiveType::Short,
            ArrayData::Int(_) => PrimitiveType::Int,
            ArrayData::Long(_) => PrimitiveType::Long,
            ArrayData::Float(_) => PrimitiveType::Float,
            ArrayData::Double(_) => PrimitiveType::Double,
            ArrayData::Reference(_) => PrimitiveType::Reference,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            ArrayData::Boolean(v) => v.len(),
            ArrayData::Byte(v) => v.len(),
            ArrayData::Char(v) => v.len(),
            ArrayData::Short(v) => v.len(),
            ArrayData::Int(v) => v.len(),
            ArrayData::Long(v) => v.len(),
            ArrayData::Float(v) => v.len(),
            ArrayData::Double(v) => v.len(),
            ArrayData::Reference(v) => v.len(),
        }
    }

    /// Whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read element `index` as raw bits, sign- or zero-extended as the
    /// element type demands. References are returned by their raw encoding.
    pub fn get_raw(&self, index: usize) -> Option<u64> {
        Some(match self {
            ArrayData::Boolean(v) => *v.get(index)? as u64,
            ArrayData::Byte(v) => *v.get(index)? as i64 as u64,
            ArrayData::Char(v) => *v.get(index)? as u64,
            ArrayData::Short(v) => *v.get(index)? as i64 as u64,
            ArrayData::Int(v) => *v.get(index)? as i64 as u64,
            ArrayData::Long(v) => *v.get(index)? as u64,
            ArrayData::Float(v) => v.get(index)?.to_bits() as u64,
            ArrayData::Double(v) => v.get(index)?.to_bits(),
            ArrayData::Reference(v) => ember_core::refs::raw_ref(*v.get(index)?) as u64,
        })
    }

    /// Store raw bits into element `index`, truncating to the element width.
    /// Returns `false` if the index is out of bounds.
    pub fn set_raw(&mut self, index: usize, bits: u64) -> bool {
        fn put<T>(v: &mut [T], index: usize, value: T) -> bool {
            match v.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            }
        }
        match self {
            ArrayData::Boolean(v) => put(v, index, bits as u8),
            ArrayData::Byte(v) => put(v, index, bits as i8),
            ArrayData::Char(v) => put(v, index, bits as u16),
            ArrayData::Short(v) => put(v, index, bits as i16),
            ArrayData::Int(v) => put(v, index, bits as i32),
            ArrayData::Long(v) => put(v, index, bits as i64),
            ArrayData::Float(v) => put(v, index, f32::from_bits(bits as u32)),
            ArrayData::Double(v) => put(v, index, f64::from_bits(bits)),
            ArrayData::Reference(v) => put(v, index, ObjRef::from_raw(bits as u32)),
        }
    }

    /// Size of the array body in bytes.
    pub fn data_size(&self) -> usize {
        self.len() * self.component().component_size()
    }
}

// =============================================================================
// Objects
// =============================================================================

/// Body of a heap object.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectBody {
    /// Plain instance: primitive slots and reference slots.
    Instance {
        /// Primitive field storage, one 64-bit slot per field.
        prims: Vec<u64>,
        /// Reference field storage.
        refs: Vec<Option<ObjRef>>,
    },
    /// Array of primitives or references.
    Array(ArrayData),
    /// UTF-16 string.
    String(Vec<u16>),
}

/// One object in the arena.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapObject {
    /// Class of the object.
    pub class: ClassId,
    /// Heap address handed out by the allocator.
    pub address: usize,
    /// Allocated size in bytes.
    pub size: usize,
    /// Lock word.
    pub lock_word: LockWord,
    /// Object contents.
    pub body: ObjectBody,
}

impl HeapObject {
    /// Array contents, if this is an array.
    #[inline]
    pub fn as_array(&self) -> Option<&ArrayData> {
        match &self.body {
            ObjectBody::Array(data) => Some(data),
            _ => None,
        }
    }

    /// Mutable array contents, if this is an array.
    #[inline]
    pub fn as_array_mut(&mut self) -> Option<&mut ArrayData> {
        match &mut self.body {
            ObjectBody::Array(data) => Some(data),
            _ => None,
        }
    }

    /// String contents, if this is a string.
    #[inline]
    pub fn as_string(&self) -> Option<&[u16]> {
        match &self.body {
            ObjectBody::String(chars) => Some(chars),
            _ => None,
        }
    }

    /// Visit every reference slot in the body.
    pub fn for_each_reference_mut<F: FnMut(&mut Option<ObjRef>)>(&mut self, mut f: F) {
        match &mut self.body {
            ObjectBody::Instance { refs, .. } => refs.iter_mut().for_each(&mut f),
            ObjectBody::Array(ArrayData::Reference(refs)) => refs.iter_mut().for_each(&mut f),
            _ => {}
        }
    }
}

/// Bytes needed for an instance with the given slot counts.
#[inline]
pub const fn instance_size(prim_slots: usize, ref_slots: usize, alignment: usize) -> usize {
    ember_core::bits::align_up(
        HEADER_SIZE + ref_slots * REFERENCE_SIZE + prim_slots * 8,
        alignment,
    )
}

/// Bytes needed for an array.
#[inline]
pub fn array_size(data: &ArrayData, alignment: usize) -> usize {
    let header = if data.component().is_wide() {
        WIDE_ARRAY_DATA_OFFSET as usize
    } else {
        ARRAY_DATA_OFFSET as usize
    };
    ember_core::bits::align_up(header + data.data_size(), alignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_word_bits() {
        let word = LockWord::default();
        assert!(!word.is_gray());
        let gray = word.with_gray(true);
        assert!(gray.is_gray());
        assert!(!gray.with_gray(false).is_gray());
        assert!(gray.marked().is_marked());
        assert_eq!(gray.with_hash(0x1234).hash(), 0x1234);
        assert!(gray.with_hash(0xffff_ffff).is_gray());
    }

    #[test]
    fn test_array_raw_access() {
        let mut data = ArrayData::zeroed(PrimitiveType::Byte, 4);
        assert!(data.set_raw(1, 0xff));
        assert_eq!(data.get_raw(1), Some(u64::MAX));
        assert!(!data.set_raw(4, 1));
        assert_eq!(data.get_raw(4), None);

        let mut chars = ArrayData::zeroed(PrimitiveType::Char, 2);
        chars.set_raw(0, 0xffff);
        assert_eq!(chars.get_raw(0), Some(0xffff));
    }

    #[test]
    fn test_sizes() {
        assert_eq!(instance_size(0, 0, 8), 8);
        assert_eq!(instance_size(1, 1, 8), 24);
        assert_eq!(array_size(&ArrayData::zeroed(PrimitiveType::Int, 3), 8), 24);
        assert_eq!(array_size(&ArrayData::zeroed(PrimitiveType::Long, 1), 8), 24);
    }

    #[test]
    fn test_descriptor_parse() {
        assert_eq!(PrimitiveType::from_descriptor("J"), Some(PrimitiveType::Long));
        assert_eq!(
            PrimitiveType::from_descriptor("Ljava/lang/Object;"),
            Some(PrimitiveType::Reference)
        );
        assert_eq!(PrimitiveType::from_descriptor("V"), None);
        assert!(PrimitiveType::Double.is_wide());
    }
}
