//! Stable arena handles.
//!
//! Every runtime entity that participates in a pointer graph (objects,
//! classes, methods, fields, threads) is named by a small index into an
//! arena owned by its subsystem. Visitors update the arena slot, never a
//! raw back-pointer, so a moving collector only has to rewrite roots.

use std::fmt;
use std::num::NonZeroU32;

/// Reference to a managed-heap object.
///
/// The index is 1-based so that `Option<ObjRef>` stays 4 bytes and
/// `None` is the managed `null`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjRef(NonZeroU32);

impl ObjRef {
    /// Create a reference from a 0-based arena slot.
    #[inline]
    pub const fn from_index(index: usize) -> Self {
        match NonZeroU32::new(index as u32 + 1) {
            Some(raw) => ObjRef(raw),
            None => panic!("object index overflow"),
        }
    }

    /// Create a reference from its raw 32-bit encoding (0 is null).
    #[inline]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(raw) => Some(ObjRef(raw)),
            None => None,
        }
    }

    /// 0-based arena slot.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Raw 32-bit encoding as stored in a vreg or a heap slot.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.index())
    }
}

/// Raw encoding of an optional reference (null is 0).
#[inline]
pub const fn raw_ref(r: Option<ObjRef>) -> u32 {
    match r {
        Some(r) => r.raw(),
        None => 0,
    }
}

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Arena slot of this handle.
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(v: u32) -> Self {
                $name(v)
            }
        }
    };
}

index_type!(
    /// Resolved class in the class table.
    ClassId,
    "class#"
);
index_type!(
    /// Resolved method in the method table.
    MethodId,
    "method#"
);
index_type!(
    /// Resolved field in the field table.
    FieldId,
    "field#"
);
index_type!(
    /// Registered thread.
    ThreadId,
    "thread#"
);
index_type!(
    /// Symbolic string reference in a dex file.
    StringIndex,
    "string@"
);
index_type!(
    /// Symbolic type reference in a dex file.
    TypeIndex,
    "type@"
);
index_type!(
    /// Symbolic method reference in a dex file.
    MethodIndex,
    "method@"
);
index_type!(
    /// Symbolic field reference in a dex file.
    FieldIndex,
    "field@"
);
index_type!(
    /// Symbolic prototype reference in a dex file.
    ProtoIndex,
    "proto@"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obj_ref_niche() {
        assert_eq!(std::mem::size_of::<Option<ObjRef>>(), 4);
        let r = ObjRef::from_index(0);
        assert_eq!(r.raw(), 1);
        assert_eq!(r.index(), 0);
        assert_eq!(ObjRef::from_raw(0), None);
        assert_eq!(ObjRef::from_raw(8).map(ObjRef::index), Some(7));
        assert_eq!(raw_ref(None), 0);
    }

    #[test]
    fn test_index_debug() {
        assert_eq!(format!("{:?}", TypeIndex(3)), "type@3");
        assert_eq!(MethodId(9).index(), 9);
    }
}
