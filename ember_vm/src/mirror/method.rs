//! Methods.

use super::AccessFlags;
use crate::bytecode::{CodeItem, DexFile};
use crate::runtime::Runtime;
use crate::thread::Thread;
use crate::value::JValue;
use ember_core::{ClassId, MethodId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Everything a native implementation can reach.
pub struct NativeContext<'a> {
    pub runtime: &'a Runtime,
    pub thread: &'a Thread,
    pub method: &'a Method,
}

/// A method implemented by the runtime. Arguments arrive one [`JValue`] per
/// parameter, receiver first for instance methods. A managed exception is
/// reported by leaving it pending on the thread.
pub type NativeMethod = fn(&NativeContext<'_>, &[JValue]) -> JValue;

/// A linked method.
pub struct Method {
    pub id: MethodId,
    pub class: ClassId,
    pub name: String,
    /// Return type then parameter types, one character each.
    pub shorty: String,
    pub access_flags: AccessFlags,
    pub code: Option<Arc<CodeItem>>,
    pub native: Option<NativeMethod>,
    pub dex_file: Arc<DexFile>,
    pub vtable_index: Option<u32>,
    hotness: AtomicU32,
}

impl Method {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: MethodId,
        class: ClassId,
        name: String,
        shorty: String,
        access_flags: AccessFlags,
        code: Option<Arc<CodeItem>>,
        native: Option<NativeMethod>,
        dex_file: Arc<DexFile>,
        vtable_index: Option<u32>,
    ) -> Self {
        Self {
            id,
            class,
            name,
            shorty,
            access_flags,
            code,
            native,
            dex_file,
            vtable_index,
            hotness: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(AccessFlags::STATIC)
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.access_flags.contains(AccessFlags::ABSTRACT)
    }

    #[inline]
    pub fn is_synchronized(&self) -> bool {
        self.access_flags.contains(AccessFlags::SYNCHRONIZED)
    }

    #[inline]
    pub fn is_constructor(&self) -> bool {
        self.name == "<init>" || self.name == "<clinit>"
    }

    /// Direct methods bypass virtual dispatch.
    #[inline]
    pub fn is_direct(&self) -> bool {
        self.is_static() || self.access_flags.contains(AccessFlags::PRIVATE) || self.name == "<init>"
    }

    /// Shorty character of the return type.
    #[inline]
    pub fn return_type(&self) -> char {
        self.shorty.chars().next().unwrap_or('V')
    }

    /// Shorty characters of the declared parameters.
    #[inline]
    pub fn param_types(&self) -> impl Iterator<Item = char> + '_ {
        self.shorty.chars().skip(1)
    }

    /// Registers the arguments occupy, receiver included.
    pub fn arg_registers(&self) -> usize {
        let receiver = usize::from(!self.is_static());
        receiver
            + self
                .param_types()
                .map(|c| if matches!(c, 'J' | 'D') { 2 } else { 1 })
                .sum::<usize>()
    }

    /// Whether `other` has the same name and prototype.
    pub fn same_signature(&self, other: &Method) -> bool {
        self.name == other.name && self.shorty == other.shorty
    }

    pub fn hotness(&self) -> u32 {
        self.hotness.load(Ordering::Relaxed)
    }

    /// Add to the hotness counter, returning the new value.
    pub fn add_hotness(&self, delta: u32) -> u32 {
        self.hotness.fetch_add(delta, Ordering::Relaxed).saturating_add(delta)
    }

    pub fn reset_hotness(&self) {
        self.hotness.store(0, Ordering::Relaxed);
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("name", &self.name)
            .field("shorty", &self.shorty)
            .finish_non_exhaustive()
    }
}
