//! Classes.

use super::{AccessFlags, Field, Method};
use crate::bytecode::DexFile;
use ember_core::{ClassId, ObjRef, ThreadId};
use ember_gc::PrimitiveType;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

/// Initialization state of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassStatus {
    /// Linked; static initializer not yet run.
    Linked,
    /// `<clinit>` is running on the given thread.
    Initializing(ThreadId),
    Initialized,
    /// `<clinit>` threw.
    Erroneous,
}

/// Element type of an array class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayComponent {
    Primitive(PrimitiveType),
    Reference(ClassId),
}

impl ArrayComponent {
    pub fn primitive_type(self) -> PrimitiveType {
        match self {
            ArrayComponent::Primitive(p) => p,
            ArrayComponent::Reference(_) => PrimitiveType::Reference,
        }
    }
}

/// Static field storage of a class.
#[derive(Debug, Default, Clone)]
pub struct StaticStorage {
    pub prims: Vec<u64>,
    pub refs: Vec<Option<ObjRef>>,
}

/// A linked class.
pub struct Class {
    pub id: ClassId,
    pub descriptor: String,
    pub super_class: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    pub access_flags: AccessFlags,
    pub component: Option<ArrayComponent>,
    /// Instance storage, inherited slots included.
    pub instance_prims: u32,
    pub instance_refs: u32,
    pub fields: Vec<Arc<Field>>,
    pub methods: Vec<Arc<Method>>,
    pub vtable: Vec<Arc<Method>>,
    /// Part of the boot image; statics are immutable inside transactions.
    pub in_boot_image: bool,
    pub dex_file: Option<Arc<DexFile>>,
    statics: Mutex<StaticStorage>,
    status: Mutex<ClassStatus>,
    status_cond: Condvar,
}

impl Class {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ClassId,
        descriptor: String,
        super_class: Option<ClassId>,
        interfaces: Vec<ClassId>,
        access_flags: AccessFlags,
        component: Option<ArrayComponent>,
        instance_prims: u32,
        instance_refs: u32,
        fields: Vec<Arc<Field>>,
        methods: Vec<Arc<Method>>,
        vtable: Vec<Arc<Method>>,
        statics: StaticStorage,
        in_boot_image: bool,
        dex_file: Option<Arc<DexFile>>,
    ) -> Self {
        let needs_init = methods.iter().any(|m| m.name == "<clinit>");
        Self {
            id,
            descriptor,
            super_class,
            interfaces,
            access_flags,
            component,
            instance_prims,
            instance_refs,
            fields,
            methods,
            vtable,
            in_boot_image,
            dex_file,
            statics: Mutex::new(statics),
            status: Mutex::new(if needs_init {
                ClassStatus::Linked
            } else {
                ClassStatus::Initialized
            }),
            status_cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn is_interface(&self) -> bool {
        self.access_flags.contains(AccessFlags::INTERFACE)
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.access_flags.intersects(AccessFlags::ABSTRACT | AccessFlags::INTERFACE)
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        self.component.is_some()
    }

    pub fn is_string(&self) -> bool {
        self.descriptor == "Ljava/lang/String;"
    }

    pub fn find_declared_method(&self, name: &str, shorty: &str) -> Option<&Arc<Method>> {
        self.methods.iter().find(|m| m.name == name && m.shorty == shorty)
    }

    pub fn find_declared_field(&self, name: &str, is_static: bool) -> Option<&Arc<Field>> {
        self.fields
            .iter()
            .find(|f| f.name == name && f.is_static() == is_static)
    }

    // =========================================================================
    // Statics
    // =========================================================================

    pub fn get_static_prim(&self, slot: u32) -> u64 {
        self.statics.lock().prims.get(slot as usize).copied().unwrap_or(0)
    }

    pub fn set_static_prim(&self, slot: u32, value: u64) {
        if let Some(s) = self.statics.lock().prims.get_mut(slot as usize) {
            *s = value;
        }
    }

    pub fn get_static_ref(&self, slot: u32) -> Option<ObjRef> {
        self.statics.lock().refs.get(slot as usize).copied().flatten()
    }

    pub fn set_static_ref(&self, slot: u32, value: Option<ObjRef>) {
        if let Some(s) = self.statics.lock().refs.get_mut(slot as usize) {
            *s = value;
        }
    }

    /// Visit every static reference slot.
    pub fn visit_static_refs(&self, mut f: impl FnMut(&mut Option<ObjRef>)) {
        for slot in self.statics.lock().refs.iter_mut() {
            f(slot);
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self) -> ClassStatus {
        *self.status.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.status() == ClassStatus::Initialized
    }

    /// Claim initialization for `thread`.
    ///
    /// Returns `true` if the caller must run `<clinit>`, `false` if the class
    /// is initialized or being initialized by `thread` itself. Blocks while
    /// another thread initializes.
    pub(crate) fn begin_initialization(&self, thread: ThreadId) -> Result<bool, ClassStatus> {
        let mut status = self.status.lock();
        loop {
            match *status {
                ClassStatus::Initialized => return Ok(false),
                ClassStatus::Erroneous => return Err(ClassStatus::Erroneous),
                ClassStatus::Initializing(owner) if owner == thread => return Ok(false),
                ClassStatus::Initializing(_) => self.status_cond.wait(&mut status),
                ClassStatus::Linked => {
                    *status = ClassStatus::Initializing(thread);
                    return Ok(true);
                }
            }
        }
    }

    pub(crate) fn finish_initialization(&self, ok: bool) {
        *self.status.lock() = if ok {
            ClassStatus::Initialized
        } else {
            ClassStatus::Erroneous
        };
        self.status_cond.notify_all();
    }

    /// Undo a claimed initialization, as when a transaction rolls back.
    pub(crate) fn reset_initialization(&self) {
        *self.status.lock() = ClassStatus::Linked;
        self.status_cond.notify_all();
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("super_class", &self.super_class)
            .finish_non_exhaustive()
    }
}
