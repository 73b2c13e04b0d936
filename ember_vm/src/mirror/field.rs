//! Fields.

use super::AccessFlags;
use ember_core::{ClassId, FieldId};
use ember_gc::PrimitiveType;

/// A linked field. `slot` indexes the primitive or reference storage of its
/// holder (the instance for instance fields, the class for statics).
#[derive(Debug, Clone)]
pub struct Field {
    pub id: FieldId,
    pub class: ClassId,
    pub name: String,
    pub type_descriptor: String,
    pub ty: PrimitiveType,
    pub access_flags: AccessFlags,
    pub slot: u32,
}

impl Field {
    #[inline]
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(AccessFlags::STATIC)
    }

    #[inline]
    pub fn is_volatile(&self) -> bool {
        self.access_flags.contains(AccessFlags::VOLATILE)
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        self.access_flags.contains(AccessFlags::FINAL)
    }

    #[inline]
    pub fn is_reference(&self) -> bool {
        self.ty == PrimitiveType::Reference
    }
}
