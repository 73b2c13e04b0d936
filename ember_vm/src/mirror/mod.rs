//! Runtime views of classes, methods and fields.

mod class;
mod field;
mod method;

pub use class::{ArrayComponent, Class, ClassStatus, StaticStorage};
pub use field::Field;
pub use method::{Method, NativeContext, NativeMethod};

use bitflags::bitflags;

bitflags! {
    /// Dex access flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const VOLATILE = 0x0040;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const CONSTRUCTOR = 0x10000;
    }
}
