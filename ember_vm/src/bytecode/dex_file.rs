//! Symbolic tables of a dex file.
//!
//! Instructions carry indices into these tables; the class linker resolves
//! them to runtime entities and caches the results.

use ember_core::{FieldIndex, MethodIndex, ProtoIndex, StringIndex, TypeIndex};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_DEX_ID: AtomicU32 = AtomicU32::new(0);

/// A field reference: declaring type, name and type descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub class: TypeIndex,
    pub name: String,
    pub type_descriptor: String,
}

/// A method reference: declaring type, name and prototype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub class: TypeIndex,
    pub name: String,
    pub proto: ProtoIndex,
}

/// Kind of a method handle constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodHandleKind {
    InvokeStatic,
    InvokeInstance,
    InvokeDirect,
    InvokeInterface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHandleRef {
    pub kind: MethodHandleKind,
    pub method: MethodIndex,
}

/// A call site: the method handle its `invoke-custom` links to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSiteRef {
    pub target: u32,
}

/// String, type, prototype, field, method, method-handle and call-site
/// tables. Prototypes are stored as shorty strings (`"VIL"`: return type
/// first).
#[derive(Debug)]
pub struct DexFile {
    id: u32,
    location: String,
    strings: Vec<String>,
    types: Vec<String>,
    protos: Vec<String>,
    fields: Vec<FieldRef>,
    methods: Vec<MethodRef>,
    method_handles: Vec<MethodHandleRef>,
    call_sites: Vec<CallSiteRef>,
    string_ids: FxHashMap<String, StringIndex>,
    type_ids: FxHashMap<String, TypeIndex>,
}

impl DexFile {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            id: NEXT_DEX_ID.fetch_add(1, Ordering::Relaxed),
            location: location.into(),
            strings: Vec::new(),
            types: Vec::new(),
            protos: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            method_handles: Vec::new(),
            call_sites: Vec::new(),
            string_ids: FxHashMap::default(),
            type_ids: FxHashMap::default(),
        }
    }

    /// Process-unique id, used to key resolution caches.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    // =========================================================================
    // Building
    // =========================================================================

    pub fn add_string(&mut self, s: &str) -> StringIndex {
        if let Some(&idx) = self.string_ids.get(s) {
            return idx;
        }
        let idx = StringIndex(self.strings.len() as u32);
        self.strings.push(s.to_owned());
        self.string_ids.insert(s.to_owned(), idx);
        idx
    }

    pub fn add_type(&mut self, descriptor: &str) -> TypeIndex {
        if let Some(&idx) = self.type_ids.get(descriptor) {
            return idx;
        }
        let idx = TypeIndex(self.types.len() as u32);
        self.types.push(descriptor.to_owned());
        self.type_ids.insert(descriptor.to_owned(), idx);
        idx
    }

    pub fn add_proto(&mut self, shorty: &str) -> ProtoIndex {
        if let Some(i) = self.protos.iter().position(|p| p == shorty) {
            return ProtoIndex(i as u32);
        }
        self.protos.push(shorty.to_owned());
        ProtoIndex(self.protos.len() as u32 - 1)
    }

    pub fn add_field(&mut self, class: &str, name: &str, type_descriptor: &str) -> FieldIndex {
        let class = self.add_type(class);
        self.fields.push(FieldRef {
            class,
            name: name.to_owned(),
            type_descriptor: type_descriptor.to_owned(),
        });
        FieldIndex(self.fields.len() as u32 - 1)
    }

    pub fn add_method(&mut self, class: &str, name: &str, shorty: &str) -> MethodIndex {
        let class = self.add_type(class);
        let proto = self.add_proto(shorty);
        self.methods.push(MethodRef {
            class,
            name: name.to_owned(),
            proto,
        });
        MethodIndex(self.methods.len() as u32 - 1)
    }

    pub fn add_method_handle(&mut self, kind: MethodHandleKind, method: MethodIndex) -> u32 {
        self.method_handles.push(MethodHandleRef { kind, method });
        self.method_handles.len() as u32 - 1
    }

    pub fn add_call_site(&mut self, target: u32) -> u32 {
        self.call_sites.push(CallSiteRef { target });
        self.call_sites.len() as u32 - 1
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn string(&self, idx: StringIndex) -> Option<&str> {
        self.strings.get(idx.index()).map(String::as_str)
    }

    pub fn type_descriptor(&self, idx: TypeIndex) -> Option<&str> {
        self.types.get(idx.index()).map(String::as_str)
    }

    pub fn shorty(&self, idx: ProtoIndex) -> Option<&str> {
        self.protos.get(idx.index()).map(String::as_str)
    }

    pub fn field(&self, idx: FieldIndex) -> Option<&FieldRef> {
        self.fields.get(idx.index())
    }

    pub fn method(&self, idx: MethodIndex) -> Option<&MethodRef> {
        self.methods.get(idx.index())
    }

    pub fn method_handle(&self, idx: u32) -> Option<&MethodHandleRef> {
        self.method_handles.get(idx as usize)
    }

    pub fn call_site(&self, idx: u32) -> Option<&CallSiteRef> {
        self.call_sites.get(idx as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning() {
        let mut dex = DexFile::new("test.dex");
        let a = dex.add_string("hello");
        let b = dex.add_string("hello");
        assert_eq!(a, b);
        let t = dex.add_type("LFoo;");
        let m = dex.add_method("LFoo;", "bar", "IJ");
        let r = dex.method(m).unwrap();
        assert_eq!(r.class, t);
        assert_eq!(dex.shorty(r.proto), Some("IJ"));
        assert_eq!(dex.type_descriptor(t), Some("LFoo;"));
        assert!(dex.string(StringIndex(9)).is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = DexFile::new("a");
        let b = DexFile::new("b");
        assert_ne!(a.id(), b.id());
    }
}
