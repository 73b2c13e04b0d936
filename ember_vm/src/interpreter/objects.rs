//! Handlers that touch the heap or the class linker: constants resolved
//! through the dex file, allocation, type checks, monitors, arrays and
//! fields.

use super::ensure_initialized;
use super::switch_impl::{ControlFlow, Interp};
use crate::bytecode::Instruction;
use crate::class_linker::{descriptors as d, ClassLinker};
use crate::mirror::{ArrayComponent, Class, Field};
use crate::shadow_frame::ShadowFrame;
use crate::value::JValue;
use ember_core::{FieldIndex, ObjRef, ProtoIndex, StringIndex, TypeIndex};
use ember_gc::{ArrayData, PrimitiveType};
use std::sync::Arc;

/// Read register `reg` in the representation `shorty` names.
pub(super) fn vreg_value(frame: &ShadowFrame, reg: usize, shorty: char) -> JValue {
    match shorty {
        'J' | 'D' => JValue::from_long(frame.get_vreg_long(reg)),
        'L' | '[' => JValue::from_ref(frame.get_vreg_reference(reg)),
        _ => JValue::from_int(frame.get_vreg(reg)),
    }
}

/// Storage bits of a primitive field value, narrowed to the field's type.
fn field_bits(ty: PrimitiveType, value: JValue) -> u64 {
    let v = value.int();
    match ty {
        PrimitiveType::Boolean => u64::from(v as u8),
        PrimitiveType::Byte => u64::from(i32::from(v as i8) as u32),
        PrimitiveType::Char => u64::from(v as u16),
        PrimitiveType::Short => u64::from(i32::from(v as i16) as u32),
        PrimitiveType::Long | PrimitiveType::Double => value.bits(),
        PrimitiveType::Int | PrimitiveType::Float | PrimitiveType::Reference => u64::from(v as u32),
    }
}

fn field_value(ty: PrimitiveType, bits: u64) -> JValue {
    if ty.is_wide() {
        JValue::from_bits(bits)
    } else {
        JValue::from_int(bits as u32 as i32)
    }
}

impl<const TRANSACTION_ACTIVE: bool, const INSTRUMENTED: bool> Interp<'_, TRANSACTION_ACTIVE, INSTRUMENTED> {
    #[inline]
    fn vreg_ref(&self, reg: u32) -> Option<ObjRef> {
        self.frame().get_vreg_reference(reg as usize)
    }

    #[inline]
    fn set_ref(&self, reg: u32, value: Option<ObjRef>) -> ControlFlow {
        self.frame().set_vreg_reference(reg as usize, value);
        ControlFlow::Continue
    }

    pub(super) fn resolve_class(&self, index: u32) -> Result<Arc<Class>, ControlFlow> {
        self.linker()
            .resolve_type(&self.method.dex_file, TypeIndex(index))
            .map_err(|e| self.throw_linkage(e, d::NO_CLASS_DEF_FOUND_ERROR))
    }

    fn descriptor_of(&self, obj: ObjRef) -> String {
        self.linker()
            .lookup_class(self.heap().class_of(obj))
            .map_or_else(|| "?".to_string(), |c| c.descriptor.clone())
    }

    fn is_instance(&self, obj: ObjRef, class: &Class) -> bool {
        self.linker().is_assignable(self.heap().class_of(obj), class.id)
    }

    // =========================================================================
    // Resolved constants
    // =========================================================================

    fn load_string(&mut self, dst: u32, index: u32) -> ControlFlow {
        match self.linker().resolve_string(&self.method.dex_file, StringIndex(index)) {
            Ok(s) => self.set_ref(dst, Some(s)),
            Err(e) => self.throw_linkage(e, d::LINKAGE_ERROR),
        }
    }

    pub(super) fn const_string(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.load_string(inst.vreg_a(), inst.vreg_b())
    }

    pub(super) fn const_string_jumbo(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.load_string(inst.vreg_a(), inst.vreg_b())
    }

    pub(super) fn const_class(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let class = match self.resolve_class(inst.vreg_b()) {
            Ok(c) => c,
            Err(flow) => return flow,
        };
        match self.linker().class_object(class.id) {
            Ok(obj) => self.set_ref(inst.vreg_a(), Some(obj)),
            Err(e) => self.throw_linkage(e, d::NO_CLASS_DEF_FOUND_ERROR),
        }
    }

    pub(super) fn const_method_handle(&mut self, inst: Instruction<'_>) -> ControlFlow {
        match self.linker().resolve_method_handle(&self.method.dex_file, inst.vreg_b()) {
            Ok(handle) => self.set_ref(inst.vreg_a(), Some(handle)),
            Err(e) => self.throw_linkage(e, d::NO_SUCH_METHOD_ERROR),
        }
    }

    pub(super) fn const_method_type(&mut self, inst: Instruction<'_>) -> ControlFlow {
        match self.linker().resolve_method_type(&self.method.dex_file, ProtoIndex(inst.vreg_b())) {
            Ok(method_type) => self.set_ref(inst.vreg_a(), Some(method_type)),
            Err(e) => self.throw_linkage(e, d::LINKAGE_ERROR),
        }
    }

    // =========================================================================
    // Monitors and throw
    // =========================================================================

    pub(super) fn monitor_enter(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let Some(obj) = self.vreg_ref(inst.vreg_a()) else {
            return self.throw_null_pointer("lock");
        };
        self.runtime.monitors().monitor_enter(self.thread, obj);
        self.frame().add_monitor(obj);
        ControlFlow::Continue
    }

    pub(super) fn monitor_exit(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let Some(obj) = self.vreg_ref(inst.vreg_a()) else {
            return self.throw_null_pointer("unlock");
        };
        match self.runtime.monitors().monitor_exit(self.thread, obj) {
            Ok(()) => {
                self.frame().remove_monitor(obj);
                ControlFlow::Continue
            }
            Err(e) => self.throw(e.exception_descriptor(), Some(&e.to_string())),
        }
    }

    pub(super) fn throw_op(&mut self, inst: Instruction<'_>) -> ControlFlow {
        match self.vreg_ref(inst.vreg_a()) {
            Some(exception) => {
                self.thread.set_exception(exception);
                ControlFlow::Throw
            }
            None => self.throw_null_pointer("throw"),
        }
    }

    // =========================================================================
    // Type checks
    // =========================================================================

    pub(super) fn check_cast(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let Some(obj) = self.vreg_ref(inst.vreg_a()) else {
            return ControlFlow::Continue;
        };
        let class = match self.resolve_class(inst.vreg_b()) {
            Ok(c) => c,
            Err(flow) => return flow,
        };
        if self.is_instance(obj, &class) {
            return ControlFlow::Continue;
        }
        let message = format!("{} cannot be cast to {}", self.descriptor_of(obj), class.descriptor);
        self.throw(d::CLASS_CAST_EXCEPTION, Some(&message))
    }

    pub(super) fn instance_of(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let obj = self.vreg_ref(inst.vreg_b());
        let class = match self.resolve_class(inst.vreg_c()) {
            Ok(c) => c,
            Err(flow) => return flow,
        };
        let result = obj.is_some_and(|o| self.is_instance(o, &class));
        self.frame().set_vreg(inst.vreg_a() as usize, i32::from(result));
        ControlFlow::Continue
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    pub(super) fn new_instance(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let class = match self.resolve_class(inst.vreg_b()) {
            Ok(c) => c,
            Err(flow) => return flow,
        };
        if class.is_abstract() || class.is_array() {
            return self.throw(d::INSTANTIATION_ERROR, Some(&class.descriptor));
        }
        if !ensure_initialized(self.runtime, self.thread, &class) {
            return ControlFlow::Throw;
        }
        let obj = if class.is_string() {
            self.allocate(|heap, tlab| heap.alloc_string(tlab, class.id, ""))
        } else {
            let (prims, refs) = (class.instance_prims as usize, class.instance_refs as usize);
            self.allocate(|heap, tlab| heap.alloc_object(tlab, class.id, prims, refs))
        };
        match obj {
            Some(obj) => self.set_ref(inst.vreg_a(), Some(obj)),
            None => ControlFlow::Throw,
        }
    }

    pub(super) fn new_array(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let length = self.frame().get_vreg(inst.vreg_b() as usize);
        let class = match self.resolve_class(inst.vreg_c()) {
            Ok(c) => c,
            Err(flow) => return flow,
        };
        let Some(component) = class.component else {
            return self.throw(d::NO_CLASS_DEF_FOUND_ERROR, Some(&class.descriptor));
        };
        let Ok(length) = usize::try_from(length) else {
            return self.throw(d::NEGATIVE_ARRAY_SIZE_EXCEPTION, Some(&length.to_string()));
        };
        match self.allocate(|heap, tlab| heap.alloc_array(tlab, class.id, component.primitive_type(), length)) {
            Some(array) => self.set_ref(inst.vreg_a(), Some(array)),
            None => ControlFlow::Throw,
        }
    }

    fn filled_array(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let class = match self.resolve_class(inst.vreg_b()) {
            Ok(c) => c,
            Err(flow) => return flow,
        };
        let regs = inst.arg_registers();
        let data = {
            let f = self.frame();
            match class.component {
                Some(ArrayComponent::Primitive(PrimitiveType::Int)) => {
                    ArrayData::Int(regs.iter().map(|&r| f.get_vreg(r as usize)).collect())
                }
                Some(ArrayComponent::Reference(_)) => {
                    ArrayData::Reference(regs.iter().map(|&r| f.get_vreg_reference(r as usize)).collect())
                }
                _ => {
                    drop(f);
                    let message = format!("Bad filled array request for type {}", class.descriptor);
                    return self.throw(d::RUNTIME_EXCEPTION, Some(&message));
                }
            }
        };
        match self.allocate(|heap, tlab| heap.alloc_array_from(tlab, class.id, data)) {
            Some(array) => {
                self.frame().result_register = JValue::from_ref(Some(array));
                ControlFlow::Continue
            }
            None => ControlFlow::Throw,
        }
    }

    pub(super) fn filled_new_array(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.filled_array(inst)
    }

    pub(super) fn filled_new_array_range(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.filled_array(inst)
    }

    pub(super) fn fill_array_data(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let Some(array) = self.vreg_ref(inst.vreg_a()) else {
            return self.throw_null_pointer("fill a null array");
        };
        let Some(payload) = inst.array_data_payload() else {
            ember_core::fatal!("{}: bad fill-array-data payload at {}", self.method.name, self.dex_pc);
        };
        let heap = self.heap();
        let Some(length) = heap.array_length(array) else {
            ember_core::fatal!("fill-array-data on a non-array");
        };
        if payload.element_count > length {
            let message = format!(
                "failed FILL_ARRAY_DATA; length={}, index={}",
                length,
                payload.element_count - 1
            );
            return self.throw(d::ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, Some(&message));
        }
        for i in 0..payload.element_count {
            if let Some(tx) = self.transaction() {
                tx.record_array_element(array, i, heap.array_get(array, i).unwrap_or(0));
            }
            heap.array_set(array, i, payload.element(i));
        }
        ControlFlow::Continue
    }

    // =========================================================================
    // Arrays
    // =========================================================================

    pub(super) fn array_length(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let Some(array) = self.vreg_ref(inst.vreg_b()) else {
            return self.throw_null_pointer("get length of a null array");
        };
        let Some(length) = self.heap().array_length(array) else {
            ember_core::fatal!("array-length on a non-array");
        };
        self.frame().set_vreg(inst.vreg_a() as usize, length as i32);
        ControlFlow::Continue
    }

    /// Checked index of element `index` of `array`, or the exception to throw.
    fn element_index(&self, array: ObjRef, index: i32) -> Result<usize, ControlFlow> {
        let Some(length) = self.heap().array_length(array) else {
            ember_core::fatal!("array access on a non-array");
        };
        match usize::try_from(index) {
            Ok(i) if i < length => Ok(i),
            _ => {
                let message = format!("length={length}; index={index}");
                Err(self.throw(d::ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, Some(&message)))
            }
        }
    }

    fn array_get(&mut self, inst: Instruction<'_>, view: char) -> ControlFlow {
        let (array, index) = {
            let f = self.frame();
            (f.get_vreg_reference(inst.vreg_b() as usize), f.get_vreg(inst.vreg_c() as usize))
        };
        let Some(array) = array else {
            return self.throw_null_pointer("read from null array");
        };
        let i = match self.element_index(array, index) {
            Ok(i) => i,
            Err(flow) => return flow,
        };
        let bits = self.heap().array_get(array, i).unwrap_or(0);
        let value = match view {
            'L' => JValue::from_ref(ObjRef::from_raw(bits as u32)),
            'J' => JValue::from_bits(bits),
            _ => JValue::from_int(bits as i32),
        };
        self.frame().set_vreg_value(inst.vreg_a() as usize, view, value);
        ControlFlow::Continue
    }

    fn array_put(&mut self, inst: Instruction<'_>, view: char) -> ControlFlow {
        let (array, index, value) = {
            let f = self.frame();
            (
                f.get_vreg_reference(inst.vreg_b() as usize),
                f.get_vreg(inst.vreg_c() as usize),
                vreg_value(&f, inst.vreg_a() as usize, view),
            )
        };
        let Some(array) = array else {
            return self.throw_null_pointer("write to null array");
        };
        let i = match self.element_index(array, index) {
            Ok(i) => i,
            Err(flow) => return flow,
        };
        let heap = self.heap();
        let bits = if view == 'L' {
            if let Some(stored) = value.reference() {
                if let Some(flow) = self.check_array_store(array, stored) {
                    return flow;
                }
            }
            u64::from(value.reference().map_or(0, ObjRef::raw))
        } else {
            value.bits()
        };
        if let Some(tx) = self.transaction() {
            tx.record_array_element(array, i, heap.array_get(array, i).unwrap_or(0));
        }
        heap.array_set(array, i, bits);
        ControlFlow::Continue
    }

    fn check_array_store(&self, array: ObjRef, value: ObjRef) -> Option<ControlFlow> {
        let linker = self.linker();
        let array_class = linker.lookup_class(self.heap().class_of(array))?;
        let Some(ArrayComponent::Reference(component)) = array_class.component else {
            return None;
        };
        if linker.is_assignable(self.heap().class_of(value), component) {
            return None;
        }
        let message = format!(
            "{} cannot be stored in an array of type {}",
            self.descriptor_of(value),
            array_class.descriptor
        );
        Some(self.throw(d::ARRAY_STORE_EXCEPTION, Some(&message)))
    }

    pub(super) fn aget(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_get(inst, 'I')
    }

    pub(super) fn aget_wide(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_get(inst, 'J')
    }

    pub(super) fn aget_object(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_get(inst, 'L')
    }

    pub(super) fn aget_boolean(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_get(inst, 'Z')
    }

    pub(super) fn aget_byte(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_get(inst, 'B')
    }

    pub(super) fn aget_char(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_get(inst, 'C')
    }

    pub(super) fn aget_short(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_get(inst, 'S')
    }

    pub(super) fn aput(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_put(inst, 'I')
    }

    pub(super) fn aput_wide(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_put(inst, 'J')
    }

    pub(super) fn aput_object(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_put(inst, 'L')
    }

    pub(super) fn aput_boolean(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_put(inst, 'Z')
    }

    pub(super) fn aput_byte(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_put(inst, 'B')
    }

    pub(super) fn aput_char(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_put(inst, 'C')
    }

    pub(super) fn aput_short(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.array_put(inst, 'S')
    }

    // =========================================================================
    // Fields
    // =========================================================================

    fn resolve_field(&self, index: u32, is_static: bool) -> Result<Arc<Field>, ControlFlow> {
        self.linker()
            .resolve_field(&self.method.dex_file, FieldIndex(index), is_static)
            .map_err(|e| self.throw_linkage(e, d::NO_SUCH_FIELD_ERROR))
    }

    /// Resolve a static field and initialize its holder.
    fn resolve_static_field(&self, index: u32) -> Result<(Arc<Field>, Arc<Class>), ControlFlow> {
        let field = self.resolve_field(index, true)?;
        let Some(class) = self.linker().lookup_class(field.class) else {
            ember_core::fatal!("field {} has no holder", field.name);
        };
        if !ensure_initialized(self.runtime, self.thread, &class) {
            return Err(ControlFlow::Throw);
        }
        Ok((field, class))
    }

    fn report_field_read(&self, this: Option<ObjRef>, field: &Field) -> Option<ControlFlow> {
        let instrumentation = self.runtime.instrumentation();
        if !instrumentation.has_field_read_listeners() {
            return None;
        }
        instrumentation
            .field_read_event(self.thread, this, self.method, self.dex_pc, field)
            .err()
            .map(|e| self.raise_listener_error(e))
    }

    fn report_field_write(&self, this: Option<ObjRef>, field: &Field, value: JValue) -> Option<ControlFlow> {
        let instrumentation = self.runtime.instrumentation();
        if !instrumentation.has_field_write_listeners() {
            return None;
        }
        instrumentation
            .field_write_event(self.thread, this, self.method, self.dex_pc, field, value)
            .err()
            .map(|e| self.raise_listener_error(e))
    }

    fn instance_get(&mut self, inst: Instruction<'_>, view: char) -> ControlFlow {
        let field = match self.resolve_field(inst.vreg_c(), false) {
            Ok(f) => f,
            Err(flow) => return flow,
        };
        let Some(obj) = self.vreg_ref(inst.vreg_b()) else {
            return self.throw_null_pointer(&format!("read field {}", field.name));
        };
        if INSTRUMENTED {
            if let Some(flow) = self.report_field_read(Some(obj), &field) {
                return flow;
            }
        }
        let heap = self.heap();
        let slot = field.slot as usize;
        let value = if field.is_reference() {
            JValue::from_ref(heap.get_field_ref(obj, slot))
        } else {
            field_value(field.ty, heap.get_field_prim(obj, slot))
        };
        self.frame().set_vreg_value(inst.vreg_a() as usize, view, value);
        ControlFlow::Continue
    }

    fn instance_put(&mut self, inst: Instruction<'_>, view: char) -> ControlFlow {
        let field = match self.resolve_field(inst.vreg_c(), false) {
            Ok(f) => f,
            Err(flow) => return flow,
        };
        let (obj, value) = {
            let f = self.frame();
            (
                f.get_vreg_reference(inst.vreg_b() as usize),
                vreg_value(&f, inst.vreg_a() as usize, view),
            )
        };
        let Some(obj) = obj else {
            return self.throw_null_pointer(&format!("write field {}", field.name));
        };
        if INSTRUMENTED {
            if let Some(flow) = self.report_field_write(Some(obj), &field, value) {
                return flow;
            }
        }
        let heap = self.heap();
        let slot = field.slot as usize;
        if field.is_reference() {
            if let Some(tx) = self.transaction() {
                tx.record_field_ref(obj, slot, heap.get_field_ref(obj, slot));
            }
            heap.set_field_ref(obj, slot, value.reference());
        } else {
            if let Some(tx) = self.transaction() {
                tx.record_field_prim(obj, slot, heap.get_field_prim(obj, slot));
            }
            heap.set_field_prim(obj, slot, field_bits(field.ty, value));
        }
        ControlFlow::Continue
    }

    fn static_get(&mut self, inst: Instruction<'_>, view: char) -> ControlFlow {
        let (field, class) = match self.resolve_static_field(inst.vreg_b()) {
            Ok(resolved) => resolved,
            Err(flow) => return flow,
        };
        if INSTRUMENTED {
            if let Some(flow) = self.report_field_read(None, &field) {
                return flow;
            }
        }
        let value = if field.is_reference() {
            JValue::from_ref(class.get_static_ref(field.slot))
        } else {
            field_value(field.ty, class.get_static_prim(field.slot))
        };
        self.frame().set_vreg_value(inst.vreg_a() as usize, view, value);
        ControlFlow::Continue
    }

    fn static_put(&mut self, inst: Instruction<'_>, view: char) -> ControlFlow {
        let (field, class) = match self.resolve_static_field(inst.vreg_b()) {
            Ok(resolved) => resolved,
            Err(flow) => return flow,
        };
        let value = vreg_value(&self.frame(), inst.vreg_a() as usize, view);
        if INSTRUMENTED {
            if let Some(flow) = self.report_field_write(None, &field, value) {
                return flow;
            }
        }
        if let Some(tx) = self.transaction() {
            if !tx.write_constraints_ok(&class) {
                return self.abort_transaction(format!("Can't set fields of boot image class {}", class.descriptor));
            }
            if field.is_reference() {
                tx.record_static_ref(&class, field.slot, class.get_static_ref(field.slot));
            } else {
                tx.record_static_prim(&class, field.slot, class.get_static_prim(field.slot));
            }
        }
        if field.is_reference() {
            class.set_static_ref(field.slot, value.reference());
        } else {
            class.set_static_prim(field.slot, field_bits(field.ty, value));
        }
        ControlFlow::Continue
    }

    pub(super) fn iget(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_get(inst, 'I')
    }

    pub(super) fn iget_wide(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_get(inst, 'J')
    }

    pub(super) fn iget_object(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_get(inst, 'L')
    }

    pub(super) fn iget_boolean(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_get(inst, 'Z')
    }

    pub(super) fn iget_byte(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_get(inst, 'B')
    }

    pub(super) fn iget_char(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_get(inst, 'C')
    }

    pub(super) fn iget_short(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_get(inst, 'S')
    }

    pub(super) fn iput(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_put(inst, 'I')
    }

    pub(super) fn iput_wide(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_put(inst, 'J')
    }

    pub(super) fn iput_object(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_put(inst, 'L')
    }

    pub(super) fn iput_boolean(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_put(inst, 'Z')
    }

    pub(super) fn iput_byte(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_put(inst, 'B')
    }

    pub(super) fn iput_char(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_put(inst, 'C')
    }

    pub(super) fn iput_short(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.instance_put(inst, 'S')
    }

    pub(super) fn sget(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_get(inst, 'I')
    }

    pub(super) fn sget_wide(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_get(inst, 'J')
    }

    pub(super) fn sget_object(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_get(inst, 'L')
    }

    pub(super) fn sget_boolean(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_get(inst, 'Z')
    }

    pub(super) fn sget_byte(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_get(inst, 'B')
    }

    pub(super) fn sget_char(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_get(inst, 'C')
    }

    pub(super) fn sget_short(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_get(inst, 'S')
    }

    pub(super) fn sput(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_put(inst, 'I')
    }

    pub(super) fn sput_wide(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_put(inst, 'J')
    }

    pub(super) fn sput_object(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_put(inst, 'L')
    }

    pub(super) fn sput_boolean(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_put(inst, 'Z')
    }

    pub(super) fn sput_byte(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_put(inst, 'B')
    }

    pub(super) fn sput_char(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_put(inst, 'C')
    }

    pub(super) fn sput_short(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.static_put(inst, 'S')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_bits_narrow_to_type() {
        assert_eq!(field_bits(PrimitiveType::Byte, JValue::from_int(0x1ff)), 0xffff_ffff);
        assert_eq!(field_value(PrimitiveType::Byte, 0xffff_ffff).int(), -1);
        assert_eq!(field_bits(PrimitiveType::Char, JValue::from_int(-1)), 0xffff);
        assert_eq!(field_bits(PrimitiveType::Boolean, JValue::from_int(0x101)), 1);
        assert_eq!(field_value(PrimitiveType::Short, field_bits(PrimitiveType::Short, JValue::from_int(-2))).int(), -2);
        assert_eq!(field_bits(PrimitiveType::Long, JValue::from_long(-1)), u64::MAX);
    }
}
