//! Class resolution.
//!
//! The interpreter resolves every symbolic reference through the
//! [`ClassLinker`] trait. [`ClassTable`] is the built-in implementation: an
//! in-memory registry of classes defined from [`ClassDef`]s, bootstrapped
//! with the core library classes the runtime itself depends on.
//!
//! # Layout
//!
//! Instance fields are laid out into two slot spaces, primitives and
//! references, with a subclass's slots following its superclass's. Static
//! fields are laid out the same way in per-class storage. Virtual methods
//! get vtable indices: an override reuses the overridden method's index,
//! anything else is appended.

use crate::bytecode::{CodeItem, CodeItemBuilder, DexFile, MethodHandleKind, Opcode};
use crate::locks::{LevelMutex, LockLevel};
use crate::mirror::{AccessFlags, ArrayComponent, Class, Field, Method, NativeMethod, StaticStorage};
use crate::natives;
use crate::thread::Thread;
use ember_core::{
    ClassId, EmberError, EmberResult, FieldId, FieldIndex, MethodId, MethodIndex, ObjRef, ProtoIndex,
    StringIndex, TypeIndex,
};
use ember_gc::{Heap, PrimitiveType, RootInfo, RootVisitor, Tlab};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

/// Descriptors of the classes the runtime throws or allocates itself.
pub mod descriptors {
    pub const OBJECT: &str = "Ljava/lang/Object;";
    pub const STRING: &str = "Ljava/lang/String;";
    pub const CLASS: &str = "Ljava/lang/Class;";
    pub const THREAD: &str = "Ljava/lang/Thread;";
    pub const THROWABLE: &str = "Ljava/lang/Throwable;";
    pub const ERROR: &str = "Ljava/lang/Error;";
    pub const EXCEPTION: &str = "Ljava/lang/Exception;";
    pub const RUNTIME_EXCEPTION: &str = "Ljava/lang/RuntimeException;";
    pub const METHOD_HANDLE: &str = "Ljava/lang/invoke/MethodHandle;";
    pub const METHOD_TYPE: &str = "Ljava/lang/invoke/MethodType;";

    pub const ARITHMETIC_EXCEPTION: &str = "Ljava/lang/ArithmeticException;";
    pub const NULL_POINTER_EXCEPTION: &str = "Ljava/lang/NullPointerException;";
    pub const ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION: &str = "Ljava/lang/ArrayIndexOutOfBoundsException;";
    pub const STRING_INDEX_OUT_OF_BOUNDS_EXCEPTION: &str = "Ljava/lang/StringIndexOutOfBoundsException;";
    pub const NEGATIVE_ARRAY_SIZE_EXCEPTION: &str = "Ljava/lang/NegativeArraySizeException;";
    pub const CLASS_CAST_EXCEPTION: &str = "Ljava/lang/ClassCastException;";
    pub const ARRAY_STORE_EXCEPTION: &str = "Ljava/lang/ArrayStoreException;";
    pub const ILLEGAL_MONITOR_STATE_EXCEPTION: &str = "Ljava/lang/IllegalMonitorStateException;";
    pub const INTERRUPTED_EXCEPTION: &str = "Ljava/lang/InterruptedException;";
    pub const WRONG_METHOD_TYPE_EXCEPTION: &str = "Ljava/lang/invoke/WrongMethodTypeException;";

    pub const OUT_OF_MEMORY_ERROR: &str = "Ljava/lang/OutOfMemoryError;";
    pub const STACK_OVERFLOW_ERROR: &str = "Ljava/lang/StackOverflowError;";
    pub const NO_CLASS_DEF_FOUND_ERROR: &str = "Ljava/lang/NoClassDefFoundError;";
    pub const NO_SUCH_FIELD_ERROR: &str = "Ljava/lang/NoSuchFieldError;";
    pub const NO_SUCH_METHOD_ERROR: &str = "Ljava/lang/NoSuchMethodError;";
    pub const LINKAGE_ERROR: &str = "Ljava/lang/LinkageError;";
    pub const INCOMPATIBLE_CLASS_CHANGE_ERROR: &str = "Ljava/lang/IncompatibleClassChangeError;";
    pub const ABSTRACT_METHOD_ERROR: &str = "Ljava/lang/AbstractMethodError;";
    pub const INSTANTIATION_ERROR: &str = "Ljava/lang/InstantiationError;";
    pub const EXCEPTION_IN_INITIALIZER_ERROR: &str = "Ljava/lang/ExceptionInInitializerError;";
    pub const TRANSACTION_ABORT_ERROR: &str = "Ldalvik/system/TransactionAbortError;";
}

use descriptors as d;

/// How a method reference is invoked; selects the lookup rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeType {
    Static,
    Direct,
    Virtual,
    Super,
    Interface,
    Polymorphic,
    Custom,
}

/// Classes the runtime refers to by id.
#[derive(Debug, Clone, Copy, Default)]
pub struct WellKnownClasses {
    pub object: ClassId,
    pub string: ClassId,
    pub class: ClassId,
    pub thread: ClassId,
    pub throwable: ClassId,
    pub method_handle: ClassId,
    pub method_type: ClassId,
}

/// Resolution services used by the interpreter.
pub trait ClassLinker: Send + Sync {
    fn resolve_string(&self, dex: &DexFile, index: StringIndex) -> EmberResult<ObjRef>;

    fn resolve_type(&self, dex: &DexFile, index: TypeIndex) -> EmberResult<Arc<Class>>;

    fn resolve_field(&self, dex: &DexFile, index: FieldIndex, is_static: bool) -> EmberResult<Arc<Field>>;

    fn resolve_method(&self, dex: &DexFile, index: MethodIndex, invoke: InvokeType) -> EmberResult<Arc<Method>>;

    /// A `java.lang.invoke.MethodHandle` for a method-handle item.
    fn resolve_method_handle(&self, dex: &DexFile, index: u32) -> EmberResult<ObjRef>;

    /// A `java.lang.invoke.MethodType` for a prototype.
    fn resolve_method_type(&self, dex: &DexFile, index: ProtoIndex) -> EmberResult<ObjRef>;

    fn find_class(&self, descriptor: &str) -> EmberResult<Arc<Class>>;

    fn lookup_class(&self, id: ClassId) -> Option<Arc<Class>>;

    fn lookup_method(&self, id: MethodId) -> Option<Arc<Method>>;

    /// The `java.lang.Class` instance of `class`.
    fn class_object(&self, class: ClassId) -> EmberResult<ObjRef>;

    /// The class a `java.lang.Class` instance stands for.
    fn class_from_object(&self, obj: ObjRef) -> Option<ClassId>;

    /// Target and kind of a method handle created by this linker.
    fn decode_method_handle(&self, handle: ObjRef) -> Option<(Arc<Method>, MethodHandleKind)>;

    /// The interned string with value `value`.
    fn intern(&self, value: &str) -> EmberResult<ObjRef>;

    fn well_known(&self) -> &WellKnownClasses;

    /// Visit interned strings, class objects and static reference fields.
    fn visit_roots(&self, visitor: &mut dyn RootVisitor);

    /// Whether a value of class `from` may be stored where `to` is expected.
    fn is_assignable(&self, from: ClassId, to: ClassId) -> bool {
        if from == to || to == self.well_known().object {
            return true;
        }
        let (Some(from_class), Some(to_class)) = (self.lookup_class(from), self.lookup_class(to)) else {
            return false;
        };
        if let (Some(fc), Some(tc)) = (from_class.component, to_class.component) {
            return match (fc, tc) {
                (ArrayComponent::Reference(f), ArrayComponent::Reference(t)) => self.is_assignable(f, t),
                (ArrayComponent::Primitive(f), ArrayComponent::Primitive(t)) => f == t,
                _ => false,
            };
        }
        if to_class.is_interface() {
            return self.implements(&from_class, to);
        }
        let mut current = from_class.super_class;
        while let Some(id) = current {
            if id == to {
                return true;
            }
            current = self.lookup_class(id).and_then(|c| c.super_class);
        }
        false
    }

    /// Whether `class` or one of its superclasses implements `interface`.
    fn implements(&self, class: &Class, interface: ClassId) -> bool {
        if class
            .interfaces
            .iter()
            .any(|&i| i == interface || self.lookup_class(i).is_some_and(|c| self.implements(&c, interface)))
        {
            return true;
        }
        class
            .super_class
            .and_then(|s| self.lookup_class(s))
            .is_some_and(|s| self.implements(&s, interface))
    }

    /// The implementation of `method` that a receiver of class `receiver`
    /// dispatches to.
    fn find_virtual_method(&self, receiver: &Class, method: &Method) -> Option<Arc<Method>> {
        let owner = self.lookup_class(method.class)?;
        if !owner.is_interface() {
            if let Some(m) = method.vtable_index.and_then(|i| receiver.vtable.get(i as usize)) {
                if m.same_signature(method) {
                    return Some(Arc::clone(m));
                }
            }
        }
        // Interface dispatch: the most derived concrete method, then a
        // default method on an implemented interface.
        if let Some(m) = receiver.vtable.iter().rev().find(|m| m.same_signature(method) && !m.is_abstract()) {
            return Some(Arc::clone(m));
        }
        let mut pending: Vec<ClassId> = receiver.interfaces.clone();
        let mut current = receiver.super_class;
        while let Some(id) = current {
            let class = self.lookup_class(id)?;
            pending.extend(class.interfaces.iter().copied());
            current = class.super_class;
        }
        while let Some(id) = pending.pop() {
            let iface = self.lookup_class(id)?;
            if let Some(m) = iface.methods.iter().find(|m| m.same_signature(method) && m.code.is_some()) {
                return Some(Arc::clone(m));
            }
            pending.extend(iface.interfaces.iter().copied());
        }
        None
    }
}

// =============================================================================
// Class definitions
// =============================================================================

/// A field to define.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub type_descriptor: String,
    pub access_flags: AccessFlags,
}

/// A method to define.
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub shorty: String,
    pub access_flags: AccessFlags,
    pub code: Option<CodeItem>,
    pub native: Option<NativeMethod>,
}

/// Everything needed to define a class.
///
/// # Example
///
/// ```
/// use ember_vm::class_linker::ClassDef;
/// use ember_vm::mirror::AccessFlags;
///
/// let def = ClassDef::new("LPoint;")
///     .field("x", "I", AccessFlags::PUBLIC)
///     .field("y", "I", AccessFlags::PUBLIC)
///     .field("ORIGIN", "LPoint;", AccessFlags::STATIC);
/// assert_eq!(def.fields.len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub descriptor: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub access_flags: AccessFlags,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
    pub dex_file: Option<Arc<DexFile>>,
    pub in_boot_image: bool,
}

impl ClassDef {
    /// A public class extending `java.lang.Object`.
    pub fn new(descriptor: &str) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            super_class: (descriptor != d::OBJECT).then(|| d::OBJECT.to_string()),
            interfaces: Vec::new(),
            access_flags: AccessFlags::PUBLIC,
            fields: Vec::new(),
            methods: Vec::new(),
            dex_file: None,
            in_boot_image: false,
        }
    }

    pub fn extends(mut self, descriptor: &str) -> Self {
        self.super_class = Some(descriptor.to_string());
        self
    }

    pub fn implements(mut self, descriptor: &str) -> Self {
        self.interfaces.push(descriptor.to_string());
        self
    }

    pub fn access(mut self, flags: AccessFlags) -> Self {
        self.access_flags = flags;
        self
    }

    pub fn field(mut self, name: &str, type_descriptor: &str, access_flags: AccessFlags) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            type_descriptor: type_descriptor.to_string(),
            access_flags,
        });
        self
    }

    pub fn method(mut self, name: &str, shorty: &str, access_flags: AccessFlags, code: CodeItem) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            shorty: shorty.to_string(),
            access_flags,
            code: Some(code),
            native: None,
        });
        self
    }

    pub fn abstract_method(mut self, name: &str, shorty: &str, access_flags: AccessFlags) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            shorty: shorty.to_string(),
            access_flags: access_flags | AccessFlags::ABSTRACT,
            code: None,
            native: None,
        });
        self
    }

    pub fn native_method(
        mut self,
        name: &str,
        shorty: &str,
        access_flags: AccessFlags,
        native: NativeMethod,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            shorty: shorty.to_string(),
            access_flags: access_flags | AccessFlags::NATIVE,
            code: None,
            native: Some(native),
        });
        self
    }

    pub fn dex_file(mut self, dex_file: Arc<DexFile>) -> Self {
        self.dex_file = Some(dex_file);
        self
    }

    pub fn boot_image(mut self) -> Self {
        self.in_boot_image = true;
        self
    }
}

// =============================================================================
// ClassTable
// =============================================================================

/// The built-in [`ClassLinker`].
pub struct ClassTable {
    heap: Arc<Heap>,
    core_dex: Arc<DexFile>,
    define_lock: LevelMutex<()>,
    classes: RwLock<Vec<Arc<Class>>>,
    by_descriptor: RwLock<FxHashMap<String, ClassId>>,
    methods: RwLock<Vec<Arc<Method>>>,
    next_field_id: AtomicU32,
    resolved_fields: RwLock<FxHashMap<(u32, u32), Arc<Field>>>,
    resolved_methods: RwLock<FxHashMap<(u32, u32), Arc<Method>>>,
    strings: Mutex<FxHashMap<String, ObjRef>>,
    class_objects: Mutex<FxHashMap<ClassId, ObjRef>>,
    method_handles: Mutex<FxHashMap<(u32, u32), ObjRef>>,
    method_types: Mutex<FxHashMap<String, ObjRef>>,
    tlab: Mutex<Tlab>,
    well_known: WellKnownClasses,
}

impl ClassTable {
    /// Create a table holding the core classes.
    pub fn new(heap: Arc<Heap>) -> EmberResult<Self> {
        let mut core = DexFile::new("ember-core.dex");
        let message_field = core.add_field(d::THROWABLE, "detailMessage", d::STRING);
        let mut table = Self {
            heap,
            core_dex: Arc::new(core),
            define_lock: LevelMutex::new("class linker lock", LockLevel::ClassLinker, ()),
            classes: RwLock::new(Vec::new()),
            by_descriptor: RwLock::new(FxHashMap::default()),
            methods: RwLock::new(Vec::new()),
            next_field_id: AtomicU32::new(0),
            resolved_fields: RwLock::new(FxHashMap::default()),
            resolved_methods: RwLock::new(FxHashMap::default()),
            strings: Mutex::new(FxHashMap::default()),
            class_objects: Mutex::new(FxHashMap::default()),
            method_handles: Mutex::new(FxHashMap::default()),
            method_types: Mutex::new(FxHashMap::default()),
            tlab: Mutex::new(Tlab::EMPTY),
            well_known: WellKnownClasses::default(),
        };
        table.well_known = table.bootstrap(message_field)?;
        debug!(classes = table.classes.read().len(), "core classes defined");
        Ok(table)
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Define a class. Its superclass and interfaces must already exist.
    pub fn define_class(&self, thread: &Thread, def: ClassDef) -> EmberResult<Arc<Class>> {
        let _guard = self.define_lock.lock(thread);
        self.define_locked(def)
    }

    fn define_locked(&self, def: ClassDef) -> EmberResult<Arc<Class>> {
        if self.by_descriptor.read().contains_key(&def.descriptor) {
            return Err(EmberError::invalid_state(format!("class {} already defined", def.descriptor)));
        }
        if let Some(array) = def.super_class.iter().chain(&def.interfaces).find(|d| d.starts_with('[')) {
            return Err(EmberError::resolution(format!("{} cannot extend array type {array}", def.descriptor)));
        }
        let super_class = def.super_class.as_deref().map(|s| self.find_class(s)).transpose()?;
        let interfaces = def
            .interfaces
            .iter()
            .map(|i| self.find_class(i).map(|c| c.id))
            .collect::<EmberResult<Vec<_>>>()?;

        let id = ClassId(self.classes.read().len() as u32);
        let (mut prims, mut refs) = super_class
            .as_ref()
            .map_or((0, 0), |s| (s.instance_prims, s.instance_refs));
        let mut statics = StaticStorage::default();
        let mut fields = Vec::with_capacity(def.fields.len());
        for f in &def.fields {
            let ty = PrimitiveType::from_descriptor(&f.type_descriptor)
                .ok_or_else(|| EmberError::resolution(format!("bad field type {}", f.type_descriptor)))?;
            let is_static = f.access_flags.contains(AccessFlags::STATIC);
            let slot = match (is_static, ty == PrimitiveType::Reference) {
                (false, false) => post_inc(&mut prims),
                (false, true) => post_inc(&mut refs),
                (true, false) => {
                    statics.prims.push(0);
                    statics.prims.len() as u32 - 1
                }
                (true, true) => {
                    statics.refs.push(None);
                    statics.refs.len() as u32 - 1
                }
            };
            fields.push(Arc::new(Field {
                id: FieldId(self.next_field_id.fetch_add(1, Ordering::Relaxed)),
                class: id,
                name: f.name.clone(),
                type_descriptor: f.type_descriptor.clone(),
                ty,
                access_flags: f.access_flags,
                slot,
            }));
        }

        let dex_file = def.dex_file.clone().unwrap_or_else(|| Arc::clone(&self.core_dex));
        let is_interface = def.access_flags.contains(AccessFlags::INTERFACE);
        let mut vtable: Vec<Arc<Method>> = super_class.as_ref().map_or_else(Vec::new, |s| s.vtable.clone());
        let mut methods = Vec::with_capacity(def.methods.len());
        {
            let mut all_methods = self.methods.write();
            for m in def.methods {
                let mut access_flags = m.access_flags;
                if is_interface && m.code.is_none() && m.native.is_none() {
                    access_flags |= AccessFlags::ABSTRACT;
                }
                if m.name == "<init>" || m.name == "<clinit>" {
                    access_flags |= AccessFlags::CONSTRUCTOR;
                }
                let is_direct = access_flags.intersects(AccessFlags::STATIC | AccessFlags::PRIVATE)
                    || m.name == "<init>"
                    || m.name == "<clinit>";
                let vtable_index = if is_direct || is_interface {
                    None
                } else {
                    let slot = vtable.iter().position(|v| v.name == m.name && v.shorty == m.shorty);
                    Some(slot.unwrap_or(vtable.len()) as u32)
                };
                let method = Arc::new(Method::new(
                    MethodId(all_methods.len() as u32),
                    id,
                    m.name,
                    m.shorty,
                    access_flags,
                    m.code.map(Arc::new),
                    m.native,
                    Arc::clone(&dex_file),
                    vtable_index,
                ));
                if let Some(i) = vtable_index {
                    let i = i as usize;
                    if i == vtable.len() {
                        vtable.push(Arc::clone(&method));
                    } else {
                        vtable[i] = Arc::clone(&method);
                    }
                }
                all_methods.push(Arc::clone(&method));
                methods.push(method);
            }
        }

        let class = Arc::new(Class::new(
            id,
            def.descriptor.clone(),
            super_class.map(|s| s.id),
            interfaces,
            def.access_flags,
            None,
            prims,
            refs,
            fields,
            methods,
            vtable,
            statics,
            def.in_boot_image,
            def.dex_file,
        ));
        self.register(Arc::clone(&class));
        trace!(descriptor = %def.descriptor, id = id.0, "class defined");
        Ok(class)
    }

    fn register(&self, class: Arc<Class>) {
        let mut classes = self.classes.write();
        ember_core::check!(class.id.index() == classes.len(), "class id out of sequence");
        self.by_descriptor.write().insert(class.descriptor.clone(), class.id);
        classes.push(class);
    }

    /// Synthesize an array class for `descriptor` (`[I`, `[LFoo;`, ...).
    fn define_array_class(&self, descriptor: &str) -> EmberResult<Arc<Class>> {
        let component_descriptor = &descriptor[1..];
        let component = match PrimitiveType::from_descriptor(component_descriptor) {
            Some(PrimitiveType::Reference) => ArrayComponent::Reference(self.find_class(component_descriptor)?.id),
            Some(p) if component_descriptor.len() == 1 => ArrayComponent::Primitive(p),
            _ => return Err(EmberError::resolution(format!("bad array descriptor {descriptor}"))),
        };
        // Serialize with define_class so class ids stay dense; another
        // thread may have won the race.
        let _guard = self.define_lock.lock_unchecked();
        let mut classes = self.classes.write();
        if let Some(&id) = self.by_descriptor.read().get(descriptor) {
            return Ok(Arc::clone(&classes[id.index()]));
        }
        let object = Arc::clone(&classes[self.well_known.object.index()]);
        let class = Arc::new(Class::new(
            ClassId(classes.len() as u32),
            descriptor.to_string(),
            Some(object.id),
            Vec::new(),
            AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::ABSTRACT,
            Some(component),
            0,
            0,
            Vec::new(),
            Vec::new(),
            object.vtable.clone(),
            StaticStorage::default(),
            true,
            None,
        ));
        self.by_descriptor.write().insert(descriptor.to_string(), class.id);
        classes.push(Arc::clone(&class));
        trace!(descriptor, "array class synthesized");
        Ok(class)
    }

    fn alloc(&self, f: impl FnOnce(&Heap, &mut Tlab) -> EmberResult<ObjRef>) -> EmberResult<ObjRef> {
        let mut tlab = self.tlab.lock();
        f(&self.heap, &mut tlab)
    }

    fn field_owner_search(&self, class: &Arc<Class>, name: &str, is_static: bool) -> Option<Arc<Field>> {
        let mut current = Some(Arc::clone(class));
        while let Some(c) = current {
            if let Some(f) = c.find_declared_field(name, is_static) {
                return Some(Arc::clone(f));
            }
            if is_static {
                for &i in &c.interfaces {
                    if let Some(f) = self.lookup_class(i).and_then(|i| self.field_owner_search(&i, name, true)) {
                        return Some(f);
                    }
                }
            }
            current = c.super_class.and_then(|s| self.lookup_class(s));
        }
        None
    }

    fn method_search(&self, class: &Arc<Class>, name: &str, shorty: &str) -> Option<Arc<Method>> {
        let mut current = Some(Arc::clone(class));
        while let Some(c) = current {
            if let Some(m) = c.find_declared_method(name, shorty) {
                return Some(Arc::clone(m));
            }
            current = c.super_class.and_then(|s| self.lookup_class(s));
        }
        let mut pending = class.interfaces.clone();
        while let Some(id) = pending.pop() {
            let iface = self.lookup_class(id)?;
            if let Some(m) = iface.find_declared_method(name, shorty) {
                return Some(Arc::clone(m));
            }
            pending.extend(iface.interfaces.iter().copied());
        }
        None
    }

    // =========================================================================
    // Core classes
    // =========================================================================

    fn bootstrap(&self, message_field: FieldIndex) -> EmberResult<WellKnownClasses> {
        let public = AccessFlags::PUBLIC;
        let native_static = AccessFlags::PUBLIC | AccessFlags::STATIC;

        let return_void = || -> EmberResult<CodeItem> {
            let mut b = CodeItemBuilder::new(1, 1);
            b.op_10x(Opcode::ReturnVoid);
            b.build()
        };

        let object = self.define_locked(
            ClassDef::new(d::OBJECT)
                .boot_image()
                .method("<init>", "V", public, return_void()?)
                .native_method("hashCode", "I", public, natives::object_hash_code)
                .native_method("equals", "ZL", public, natives::object_equals)
                .native_method("getClass", "L", public | AccessFlags::FINAL, natives::object_get_class)
                .native_method("wait", "V", public | AccessFlags::FINAL, natives::object_wait)
                .native_method("wait", "VJ", public | AccessFlags::FINAL, natives::object_wait_timeout)
                .native_method("notify", "V", public | AccessFlags::FINAL, natives::object_notify)
                .native_method("notifyAll", "V", public | AccessFlags::FINAL, natives::object_notify_all),
        )?;
        let string = self.define_locked(
            ClassDef::new(d::STRING)
                .boot_image()
                .access(public | AccessFlags::FINAL)
                .native_method("length", "I", public, natives::string_length)
                .native_method("charAt", "CI", public, natives::string_char_at)
                .native_method("equals", "ZL", public, natives::string_equals)
                .native_method("intern", "L", public, natives::string_intern),
        )?;
        let class = self.define_locked(
            ClassDef::new(d::CLASS)
                .boot_image()
                .access(public | AccessFlags::FINAL)
                .field("classId", "I", AccessFlags::PRIVATE | AccessFlags::FINAL),
        )?;
        let thread = self.define_locked(
            ClassDef::new(d::THREAD)
                .boot_image()
                .native_method("sleep", "VJ", native_static, natives::thread_sleep)
                .native_method("interrupted", "Z", native_static, natives::thread_interrupted),
        )?;

        let mut init_with_message = CodeItemBuilder::new(2, 2);
        init_with_message
            .op_22(Opcode::IputObject, 1, 0, message_field.0 as u16)
            .op_10x(Opcode::ReturnVoid);
        let mut get_message = CodeItemBuilder::new(2, 1);
        get_message
            .op_22(Opcode::IgetObject, 0, 1, message_field.0 as u16)
            .op_11x(Opcode::ReturnObject, 0);
        let throwable = self.define_locked(
            ClassDef::new(d::THROWABLE)
                .boot_image()
                .dex_file(Arc::clone(&self.core_dex))
                .field("detailMessage", d::STRING, AccessFlags::PRIVATE)
                .method("<init>", "V", public, return_void()?)
                .method("<init>", "VL", public, init_with_message.build()?)
                .method("getMessage", "L", public, get_message.build()?),
        )?;

        let hierarchy: &[(&str, &str)] = &[
            (d::ERROR, d::THROWABLE),
            (d::EXCEPTION, d::THROWABLE),
            (d::RUNTIME_EXCEPTION, d::EXCEPTION),
            (d::ARITHMETIC_EXCEPTION, d::RUNTIME_EXCEPTION),
            (d::NULL_POINTER_EXCEPTION, d::RUNTIME_EXCEPTION),
            ("Ljava/lang/IndexOutOfBoundsException;", d::RUNTIME_EXCEPTION),
            (d::ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, "Ljava/lang/IndexOutOfBoundsException;"),
            (d::STRING_INDEX_OUT_OF_BOUNDS_EXCEPTION, "Ljava/lang/IndexOutOfBoundsException;"),
            (d::NEGATIVE_ARRAY_SIZE_EXCEPTION, d::RUNTIME_EXCEPTION),
            (d::CLASS_CAST_EXCEPTION, d::RUNTIME_EXCEPTION),
            (d::ARRAY_STORE_EXCEPTION, d::RUNTIME_EXCEPTION),
            (d::ILLEGAL_MONITOR_STATE_EXCEPTION, d::RUNTIME_EXCEPTION),
            (d::WRONG_METHOD_TYPE_EXCEPTION, d::RUNTIME_EXCEPTION),
            (d::INTERRUPTED_EXCEPTION, d::EXCEPTION),
            ("Ljava/lang/VirtualMachineError;", d::ERROR),
            (d::OUT_OF_MEMORY_ERROR, "Ljava/lang/VirtualMachineError;"),
            (d::STACK_OVERFLOW_ERROR, "Ljava/lang/VirtualMachineError;"),
            (d::LINKAGE_ERROR, d::ERROR),
            (d::NO_CLASS_DEF_FOUND_ERROR, d::LINKAGE_ERROR),
            (d::EXCEPTION_IN_INITIALIZER_ERROR, d::LINKAGE_ERROR),
            (d::INCOMPATIBLE_CLASS_CHANGE_ERROR, d::LINKAGE_ERROR),
            (d::NO_SUCH_FIELD_ERROR, d::INCOMPATIBLE_CLASS_CHANGE_ERROR),
            (d::NO_SUCH_METHOD_ERROR, d::INCOMPATIBLE_CLASS_CHANGE_ERROR),
            (d::ABSTRACT_METHOD_ERROR, d::INCOMPATIBLE_CLASS_CHANGE_ERROR),
            (d::INSTANTIATION_ERROR, d::INCOMPATIBLE_CLASS_CHANGE_ERROR),
            (d::TRANSACTION_ABORT_ERROR, d::ERROR),
        ];
        for &(descriptor, super_class) in hierarchy {
            self.define_locked(ClassDef::new(descriptor).extends(super_class).boot_image())?;
        }

        let method_handle = self.define_locked(
            ClassDef::new(d::METHOD_HANDLE)
                .boot_image()
                .access(public | AccessFlags::ABSTRACT)
                .field("methodId", "I", AccessFlags::PRIVATE | AccessFlags::FINAL)
                .field("kind", "I", AccessFlags::PRIVATE | AccessFlags::FINAL),
        )?;
        let method_type = self.define_locked(
            ClassDef::new(d::METHOD_TYPE)
                .boot_image()
                .access(public | AccessFlags::FINAL)
                .field("shorty", d::STRING, AccessFlags::PRIVATE | AccessFlags::FINAL),
        )?;

        Ok(WellKnownClasses {
            object: object.id,
            string: string.id,
            class: class.id,
            thread: thread.id,
            throwable: throwable.id,
            method_handle: method_handle.id,
            method_type: method_type.id,
        })
    }
}

fn post_inc(slot: &mut u32) -> u32 {
    let value = *slot;
    *slot += 1;
    value
}

fn encode_handle_kind(kind: MethodHandleKind) -> u64 {
    match kind {
        MethodHandleKind::InvokeStatic => 0,
        MethodHandleKind::InvokeInstance => 1,
        MethodHandleKind::InvokeDirect => 2,
        MethodHandleKind::InvokeInterface => 3,
    }
}

fn decode_handle_kind(bits: u64) -> Option<MethodHandleKind> {
    Some(match bits {
        0 => MethodHandleKind::InvokeStatic,
        1 => MethodHandleKind::InvokeInstance,
        2 => MethodHandleKind::InvokeDirect,
        3 => MethodHandleKind::InvokeInterface,
        _ => return None,
    })
}

impl ClassLinker for ClassTable {
    fn resolve_string(&self, dex: &DexFile, index: StringIndex) -> EmberResult<ObjRef> {
        let value = dex
            .string(index)
            .ok_or_else(|| EmberError::resolution(format!("string index {} in {}", index.0, dex.location())))?;
        self.intern(value)
    }

    fn resolve_type(&self, dex: &DexFile, index: TypeIndex) -> EmberResult<Arc<Class>> {
        let descriptor = dex
            .type_descriptor(index)
            .ok_or_else(|| EmberError::resolution(format!("type index {} in {}", index.0, dex.location())))?;
        self.find_class(descriptor)
    }

    fn resolve_field(&self, dex: &DexFile, index: FieldIndex, is_static: bool) -> EmberResult<Arc<Field>> {
        let key = (dex.id(), index.0);
        if let Some(f) = self.resolved_fields.read().get(&key) {
            return Ok(Arc::clone(f));
        }
        let field_ref = dex
            .field(index)
            .ok_or_else(|| EmberError::resolution(format!("field index {} in {}", index.0, dex.location())))?;
        let class = self.resolve_type(dex, field_ref.class)?;
        let field = self
            .field_owner_search(&class, &field_ref.name, is_static)
            .filter(|f| f.type_descriptor == field_ref.type_descriptor)
            .ok_or_else(|| {
                EmberError::resolution(format!(
                    "field {}.{}:{}",
                    class.descriptor, field_ref.name, field_ref.type_descriptor
                ))
            })?;
        self.resolved_fields.write().insert(key, Arc::clone(&field));
        Ok(field)
    }

    fn resolve_method(&self, dex: &DexFile, index: MethodIndex, invoke: InvokeType) -> EmberResult<Arc<Method>> {
        let key = (dex.id(), index.0);
        if let Some(m) = self.resolved_methods.read().get(&key) {
            return check_invoke_type(m, invoke).map(|()| Arc::clone(m));
        }
        let method_ref = dex
            .method(index)
            .ok_or_else(|| EmberError::resolution(format!("method index {} in {}", index.0, dex.location())))?;
        let shorty = dex
            .shorty(method_ref.proto)
            .ok_or_else(|| EmberError::resolution(format!("proto index {}", method_ref.proto.0)))?;
        let class = self.resolve_type(dex, method_ref.class)?;
        let method = self
            .method_search(&class, &method_ref.name, shorty)
            .ok_or_else(|| EmberError::resolution(format!("method {}.{}{}", class.descriptor, method_ref.name, shorty)))?;
        check_invoke_type(&method, invoke)?;
        self.resolved_methods.write().insert(key, Arc::clone(&method));
        Ok(method)
    }

    fn resolve_method_handle(&self, dex: &DexFile, index: u32) -> EmberResult<ObjRef> {
        let key = (dex.id(), index);
        if let Some(&h) = self.method_handles.lock().get(&key) {
            return Ok(h);
        }
        let handle_ref = *dex
            .method_handle(index)
            .ok_or_else(|| EmberError::resolution(format!("method handle {index} in {}", dex.location())))?;
        let invoke = match handle_ref.kind {
            MethodHandleKind::InvokeStatic => InvokeType::Static,
            MethodHandleKind::InvokeInstance => InvokeType::Virtual,
            MethodHandleKind::InvokeDirect => InvokeType::Direct,
            MethodHandleKind::InvokeInterface => InvokeType::Interface,
        };
        let method = self.resolve_method(dex, handle_ref.method, invoke)?;
        let class = self.well_known.method_handle;
        let handle = self.alloc(|heap, tlab| heap.alloc_object(tlab, class, 2, 0))?;
        self.heap.set_field_prim(handle, 0, u64::from(method.id.0));
        self.heap.set_field_prim(handle, 1, encode_handle_kind(handle_ref.kind));
        self.method_handles.lock().insert(key, handle);
        Ok(handle)
    }

    fn resolve_method_type(&self, dex: &DexFile, index: ProtoIndex) -> EmberResult<ObjRef> {
        let shorty = dex
            .shorty(index)
            .ok_or_else(|| EmberError::resolution(format!("proto index {} in {}", index.0, dex.location())))?;
        if let Some(&t) = self.method_types.lock().get(shorty) {
            return Ok(t);
        }
        let shorty_string = self.intern(shorty)?;
        let class = self.well_known.method_type;
        let method_type = self.alloc(|heap, tlab| heap.alloc_object(tlab, class, 0, 1))?;
        self.heap.set_field_ref(method_type, 0, Some(shorty_string));
        self.method_types.lock().insert(shorty.to_string(), method_type);
        Ok(method_type)
    }

    fn find_class(&self, descriptor: &str) -> EmberResult<Arc<Class>> {
        let found = self.by_descriptor.read().get(descriptor).copied();
        match found {
            Some(id) => Ok(Arc::clone(&self.classes.read()[id.index()])),
            None if descriptor.starts_with('[') => self.define_array_class(descriptor),
            None => Err(EmberError::resolution(format!("class {descriptor}"))),
        }
    }

    fn lookup_class(&self, id: ClassId) -> Option<Arc<Class>> {
        self.classes.read().get(id.index()).cloned()
    }

    fn lookup_method(&self, id: MethodId) -> Option<Arc<Method>> {
        self.methods.read().get(id.index()).cloned()
    }

    fn class_object(&self, class: ClassId) -> EmberResult<ObjRef> {
        let mut objects = self.class_objects.lock();
        if let Some(&obj) = objects.get(&class) {
            return Ok(obj);
        }
        let class_class = self.well_known.class;
        let obj = self.alloc(|heap, tlab| heap.alloc_object(tlab, class_class, 1, 0))?;
        self.heap.set_field_prim(obj, 0, u64::from(class.0));
        objects.insert(class, obj);
        Ok(obj)
    }

    fn class_from_object(&self, obj: ObjRef) -> Option<ClassId> {
        (self.heap.class_of(obj) == self.well_known.class).then(|| ClassId(self.heap.get_field_prim(obj, 0) as u32))
    }

    fn decode_method_handle(&self, handle: ObjRef) -> Option<(Arc<Method>, MethodHandleKind)> {
        if self.heap.class_of(handle) != self.well_known.method_handle {
            return None;
        }
        let method = self.lookup_method(MethodId(self.heap.get_field_prim(handle, 0) as u32))?;
        let kind = decode_handle_kind(self.heap.get_field_prim(handle, 1))?;
        Some((method, kind))
    }

    fn intern(&self, value: &str) -> EmberResult<ObjRef> {
        let mut strings = self.strings.lock();
        if let Some(&s) = strings.get(value) {
            return Ok(s);
        }
        let class = self.well_known.string;
        let s = self.alloc(|heap, tlab| heap.alloc_string(tlab, class, value))?;
        strings.insert(value.to_string(), s);
        Ok(s)
    }

    fn well_known(&self) -> &WellKnownClasses {
        &self.well_known
    }

    fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        let info = RootInfo::global();
        let mut visit = |obj: &mut ObjRef| {
            let mut slot = Some(*obj);
            visitor.visit_root(&mut slot, info);
            if let Some(moved) = slot {
                *obj = moved;
            }
        };
        self.strings.lock().values_mut().for_each(&mut visit);
        self.class_objects.lock().values_mut().for_each(&mut visit);
        self.method_handles.lock().values_mut().for_each(&mut visit);
        self.method_types.lock().values_mut().for_each(&mut visit);
        for class in self.classes.read().iter() {
            class.visit_static_refs(|slot| visitor.visit_root(slot, info));
        }
    }
}

fn check_invoke_type(method: &Method, invoke: InvokeType) -> EmberResult<()> {
    let ok = match invoke {
        InvokeType::Static => method.is_static(),
        InvokeType::Direct => !method.is_static(),
        InvokeType::Virtual | InvokeType::Super | InvokeType::Interface => {
            !method.is_static() && method.name != "<init>"
        }
        InvokeType::Polymorphic | InvokeType::Custom => true,
    };
    if ok {
        Ok(())
    } else {
        Err(EmberError::resolution(format!(
            "method {} cannot be invoked as {:?}",
            method.name, invoke
        )))
    }
}

impl std::fmt::Debug for ClassTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassTable")
            .field("classes", &self.classes.read().len())
            .field("methods", &self.methods.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ThreadId;
    use ember_gc::GcConfig;

    fn table() -> ClassTable {
        ClassTable::new(Arc::new(Heap::new(GcConfig::testing()).unwrap())).unwrap()
    }

    fn code() -> CodeItem {
        let mut b = CodeItemBuilder::new(1, 1);
        b.op_10x(Opcode::ReturnVoid);
        b.build().unwrap()
    }

    #[test]
    fn test_core_classes() {
        let t = table();
        let wk = *t.well_known();
        assert_eq!(t.find_class(d::OBJECT).unwrap().id, wk.object);
        assert!(t.find_class(d::NULL_POINTER_EXCEPTION).is_ok());
        let npe = t.find_class(d::NULL_POINTER_EXCEPTION).unwrap();
        assert!(t.is_assignable(npe.id, wk.throwable));
        assert!(!t.is_assignable(wk.throwable, npe.id));
        assert!(t.find_class("LMissing;").is_err());
    }

    #[test]
    fn test_field_layout_follows_superclass() {
        let t = table();
        let thread = Thread::detached_for_testing(ThreadId(1), false);
        let base = t
            .define_class(&thread, ClassDef::new("LBase;").field("a", "I", AccessFlags::empty()).field(
                "r",
                d::OBJECT,
                AccessFlags::empty(),
            ))
            .unwrap();
        let derived = t
            .define_class(
                &thread,
                ClassDef::new("LDerived;")
                    .extends("LBase;")
                    .field("b", "J", AccessFlags::empty())
                    .field("s", "I", AccessFlags::STATIC),
            )
            .unwrap();
        assert_eq!((base.instance_prims, base.instance_refs), (1, 1));
        assert_eq!((derived.instance_prims, derived.instance_refs), (2, 1));
        assert_eq!(derived.find_declared_field("b", false).unwrap().slot, 1);
        assert_eq!(derived.find_declared_field("s", true).unwrap().slot, 0);
    }

    #[test]
    fn test_override_reuses_vtable_slot() {
        let t = table();
        let thread = Thread::detached_for_testing(ThreadId(1), false);
        let base = t
            .define_class(&thread, ClassDef::new("LA;").method("run", "V", AccessFlags::PUBLIC, code()))
            .unwrap();
        let sub = t
            .define_class(
                &thread,
                ClassDef::new("LB;")
                    .extends("LA;")
                    .method("run", "V", AccessFlags::PUBLIC, code())
                    .method("other", "V", AccessFlags::PUBLIC, code()),
            )
            .unwrap();
        let base_run = base.find_declared_method("run", "V").unwrap();
        let sub_run = sub.find_declared_method("run", "V").unwrap();
        assert_eq!(base_run.vtable_index, sub_run.vtable_index);
        assert_eq!(sub.vtable.len(), base.vtable.len() + 1);
        let target = t.find_virtual_method(&sub, base_run).unwrap();
        assert_eq!(target.id, sub_run.id);
    }

    #[test]
    fn test_interface_dispatch_and_assignability() {
        let t = table();
        let thread = Thread::detached_for_testing(ThreadId(1), false);
        let iface = t
            .define_class(
                &thread,
                ClassDef::new("LRunnable;")
                    .access(AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT)
                    .abstract_method("run", "V", AccessFlags::PUBLIC),
            )
            .unwrap();
        let imp = t
            .define_class(
                &thread,
                ClassDef::new("LTask;").implements("LRunnable;").method("run", "V", AccessFlags::PUBLIC, code()),
            )
            .unwrap();
        assert!(t.is_assignable(imp.id, iface.id));
        let decl = iface.find_declared_method("run", "V").unwrap();
        assert!(decl.is_abstract());
        let target = t.find_virtual_method(&imp, decl).unwrap();
        assert_eq!(target.class, imp.id);
    }

    #[test]
    fn test_array_classes() {
        let t = table();
        let ints = t.find_class("[I").unwrap();
        assert_eq!(ints.component, Some(ArrayComponent::Primitive(PrimitiveType::Int)));
        assert_eq!(t.find_class("[I").unwrap().id, ints.id);
        let strings = t.find_class("[Ljava/lang/String;").unwrap();
        let objects = t.find_class("[Ljava/lang/Object;").unwrap();
        assert!(t.is_assignable(strings.id, objects.id));
        assert!(!t.is_assignable(objects.id, strings.id));
        assert!(!t.is_assignable(ints.id, objects.id));
        assert!(t.is_assignable(ints.id, t.well_known().object));
        assert!(t.find_class("[Q").is_err());
    }

    #[test]
    fn test_resolution_through_dex_file() {
        let t = table();
        let mut dex = DexFile::new("app.dex");
        let s = dex.add_string("hello");
        let ty = dex.add_type(d::THROWABLE);
        let field = dex.add_field(d::RUNTIME_EXCEPTION, "detailMessage", d::STRING);
        let method = dex.add_method(d::RUNTIME_EXCEPTION, "<init>", "VL");
        let missing = dex.add_method(d::OBJECT, "nope", "V");
        let handle = dex.add_method_handle(MethodHandleKind::InvokeDirect, method);

        let a = t.resolve_string(&dex, s).unwrap();
        assert_eq!(t.resolve_string(&dex, s).unwrap(), a);
        assert_eq!(t.heap().string_value(a).as_deref(), Some("hello"));
        assert_eq!(t.resolve_type(&dex, ty).unwrap().id, t.well_known().throwable);
        let f = t.resolve_field(&dex, field, false).unwrap();
        assert_eq!(f.class, t.well_known().throwable);
        assert!(t.resolve_field(&dex, field, true).is_err());
        let m = t.resolve_method(&dex, method, InvokeType::Direct).unwrap();
        assert_eq!(m.name, "<init>");
        assert!(t.resolve_method(&dex, method, InvokeType::Static).is_err());
        assert!(t.resolve_method(&dex, missing, InvokeType::Virtual).is_err());

        let h = t.resolve_method_handle(&dex, handle).unwrap();
        let (target, kind) = t.decode_method_handle(h).unwrap();
        assert_eq!(target.id, m.id);
        assert_eq!(kind, MethodHandleKind::InvokeDirect);
    }

    #[test]
    fn test_class_objects_round_trip() {
        let t = table();
        let id = t.well_known().string;
        let obj = t.class_object(id).unwrap();
        assert_eq!(t.class_object(id).unwrap(), obj);
        assert_eq!(t.class_from_object(obj), Some(id));
        let s = t.intern("x").unwrap();
        assert_eq!(t.class_from_object(s), None);
    }
}
