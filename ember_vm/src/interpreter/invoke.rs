//! Invoke handlers: method resolution, dispatch on the receiver, argument
//! marshalling and the return into the caller's frame.

use super::objects::vreg_value;
use super::switch_impl::{ControlFlow, Interp};
use super::{complete_call, ensure_initialized, invoke_method};
use crate::bytecode::{Instruction, MethodHandleKind};
use crate::class_linker::{descriptors as d, ClassLinker, InvokeType};
use crate::mirror::Method;
use crate::shadow_frame::FrameFlags;
use crate::value::JValue;
use ember_core::{MethodIndex, ObjRef, ProtoIndex};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::trace;

type Args = SmallVec<[JValue; 8]>;

/// Whether a method handle of `kind` takes a receiver.
fn takes_receiver(kind: MethodHandleKind) -> bool {
    !matches!(kind, MethodHandleKind::InvokeStatic)
}

/// The shorty a call site must use for `method` invoked through a handle of
/// `kind`: instance kinds pass the receiver as a leading reference.
fn handle_call_shorty(method: &Method, kind: MethodHandleKind) -> String {
    let mut shorty = method.shorty.clone();
    if takes_receiver(kind) {
        shorty.insert(1, 'L');
    }
    shorty
}

impl<const TRANSACTION_ACTIVE: bool, const INSTRUMENTED: bool> Interp<'_, TRANSACTION_ACTIVE, INSTRUMENTED> {
    // =========================================================================
    // Resolution and dispatch
    // =========================================================================

    /// Resolve the method an invoke names. A method that exists but does not
    /// fit the invoke kind is an `IncompatibleClassChangeError`.
    fn resolve_invoke(&self, index: u32, invoke: InvokeType) -> Result<Arc<Method>, ControlFlow> {
        let linker = self.linker();
        let dex = &self.method.dex_file;
        let error = match linker.resolve_method(dex, MethodIndex(index), invoke) {
            Ok(method) => return self.check_holder_kind(method, invoke),
            Err(error) => error,
        };
        match linker.resolve_method(dex, MethodIndex(index), InvokeType::Custom) {
            Ok(method) => {
                let message = format!("{} cannot be invoked as {:?}", method.name, invoke);
                Err(self.throw(d::INCOMPATIBLE_CLASS_CHANGE_ERROR, Some(&message)))
            }
            Err(_) => Err(self.throw_linkage(error, d::NO_SUCH_METHOD_ERROR)),
        }
    }

    /// `invoke-interface` must name an interface method and `invoke-virtual`
    /// must not.
    fn check_holder_kind(&self, method: Arc<Method>, invoke: InvokeType) -> Result<Arc<Method>, ControlFlow> {
        let holder_is_interface = self.linker().lookup_class(method.class).is_some_and(|c| c.is_interface());
        let mismatch = match invoke {
            InvokeType::Interface => !holder_is_interface,
            InvokeType::Virtual => holder_is_interface,
            _ => false,
        };
        if mismatch {
            let message = format!("{} cannot be invoked as {:?}", method.name, invoke);
            return Err(self.throw(d::INCOMPATIBLE_CLASS_CHANGE_ERROR, Some(&message)));
        }
        Ok(method)
    }

    /// The method a call of `resolved` with `receiver` runs.
    fn select_target(
        &self,
        resolved: &Arc<Method>,
        invoke: InvokeType,
        receiver: Option<ObjRef>,
    ) -> Result<Arc<Method>, ControlFlow> {
        let linker = self.linker();
        let target = match invoke {
            InvokeType::Static | InvokeType::Direct | InvokeType::Polymorphic | InvokeType::Custom => {
                Some(Arc::clone(resolved))
            }
            InvokeType::Virtual | InvokeType::Interface => {
                let Some(receiver) = receiver else {
                    return Err(self.throw_null_pointer(&format!("invoke virtual method {}", resolved.name)));
                };
                let class_id = self.heap().class_of(receiver);
                if invoke == InvokeType::Interface && !linker.is_assignable(class_id, resolved.class) {
                    let message = format!("receiver does not implement the interface of {}", resolved.name);
                    return Err(self.throw(d::INCOMPATIBLE_CLASS_CHANGE_ERROR, Some(&message)));
                }
                linker
                    .lookup_class(class_id)
                    .and_then(|class| linker.find_virtual_method(&class, resolved))
            }
            InvokeType::Super => Some(self.super_target(resolved)),
        };
        match target {
            Some(method) if !method.is_abstract() => Ok(method),
            _ => Err(self.throw(d::ABSTRACT_METHOD_ERROR, Some(&resolved.name))),
        }
    }

    /// `invoke-super` dispatches through the superclass of the calling
    /// method's class. Interface (default) methods are called directly.
    fn super_target(&self, resolved: &Arc<Method>) -> Arc<Method> {
        let linker = self.linker();
        if linker.lookup_class(resolved.class).is_some_and(|c| c.is_interface()) {
            return Arc::clone(resolved);
        }
        linker
            .lookup_class(self.method.class)
            .and_then(|caller| caller.super_class)
            .and_then(|s| linker.lookup_class(s))
            .and_then(|super_class| {
                let index = resolved.vtable_index? as usize;
                super_class.vtable.get(index).cloned()
            })
            .unwrap_or_else(|| Arc::clone(resolved))
    }

    // =========================================================================
    // Arguments and the call
    // =========================================================================

    /// Read the receiver (if any) and the parameters described by `shorty`
    /// (return type first) from `regs`.
    fn collect_args(&self, regs: &[u32], has_receiver: bool, shorty: &str) -> Args {
        let frame = self.frame();
        let mut args = Args::new();
        let mut i = 0;
        if has_receiver {
            args.push(JValue::from_ref(frame.get_vreg_reference(regs[0] as usize)));
            i = 1;
        }
        for ty in shorty.chars().skip(1) {
            let Some(&reg) = regs.get(i) else {
                ember_core::fatal!("{}: too few argument registers for {}", self.method.name, shorty);
            };
            args.push(vreg_value(&frame, reg as usize, ty));
            i += if matches!(ty, 'J' | 'D') { 2 } else { 1 };
        }
        args
    }

    /// Call `target`, store its result and decide how the caller goes on.
    fn call(&mut self, target: &Arc<Method>, args: &[JValue]) -> ControlFlow {
        trace!(caller = %self.method.name, callee = %target.name, dex_pc = self.dex_pc, "invoke");
        let result = invoke_method(self.runtime, self.thread, target, args);
        let result = complete_call(self.runtime, self.thread, result);
        let retry = {
            let mut frame = self.frame();
            if frame.has_flag(FrameFlags::FORCE_RETRY) {
                frame.clear_flag(FrameFlags::FORCE_RETRY);
                true
            } else {
                frame.result_register = result;
                false
            }
        };
        if retry {
            return ControlFlow::Retry;
        }
        if self.thread.pending().is_some() {
            self.exception_from_callee = true;
            return ControlFlow::Throw;
        }
        ControlFlow::Continue
    }

    fn do_invoke(&mut self, inst: Instruction<'_>, invoke: InvokeType) -> ControlFlow {
        let resolved = match self.resolve_invoke(inst.vreg_b(), invoke) {
            Ok(m) => m,
            Err(flow) => return flow,
        };
        let regs = inst.arg_registers();
        let has_receiver = invoke != InvokeType::Static;
        let receiver = if has_receiver {
            let Some(&first) = regs.first() else {
                ember_core::fatal!("{}: instance invoke without a receiver", self.method.name);
            };
            let receiver = self.frame().get_vreg_reference(first as usize);
            if receiver.is_none() {
                return self.throw_null_pointer(&format!("invoke method {}", resolved.name));
            }
            receiver
        } else {
            None
        };
        let target = match self.select_target(&resolved, invoke, receiver) {
            Ok(m) => m,
            Err(flow) => return flow,
        };
        if target.is_static() {
            let Some(class) = self.linker().lookup_class(target.class) else {
                ember_core::fatal!("method {} has no holder", target.name);
            };
            if !ensure_initialized(self.runtime, self.thread, &class) {
                return ControlFlow::Throw;
            }
        }
        let args = self.collect_args(&regs, has_receiver, &target.shorty);
        self.call(&target, &args)
    }

    /// Call the method behind a handle. `regs[0]` holds the handle itself.
    fn do_invoke_polymorphic(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let regs = inst.arg_registers();
        let Some(&handle_reg) = regs.first() else {
            ember_core::fatal!("{}: invoke-polymorphic without a handle", self.method.name);
        };
        let Some(handle) = self.frame().get_vreg_reference(handle_reg as usize) else {
            return self.throw_null_pointer("invoke a null method handle");
        };
        let Some((method, kind)) = self.linker().decode_method_handle(handle) else {
            return self.throw(d::CLASS_CAST_EXCEPTION, Some("receiver is not a MethodHandle"));
        };
        let Some(call_shorty) = self.method.dex_file.shorty(ProtoIndex(inst.vreg_h())) else {
            ember_core::fatal!("{}: bad prototype index {}", self.method.name, inst.vreg_h());
        };
        let expected = handle_call_shorty(&method, kind);
        if call_shorty != expected {
            let message = format!("expected {expected} but was {call_shorty}");
            return self.throw(d::WRONG_METHOD_TYPE_EXCEPTION, Some(&message));
        }
        self.invoke_handle_target(&method, kind, &regs[1..])
    }

    fn invoke_handle_target(&mut self, method: &Arc<Method>, kind: MethodHandleKind, regs: &[u32]) -> ControlFlow {
        let has_receiver = takes_receiver(kind);
        let invoke = match kind {
            MethodHandleKind::InvokeStatic => InvokeType::Static,
            MethodHandleKind::InvokeDirect => InvokeType::Direct,
            MethodHandleKind::InvokeInstance => InvokeType::Virtual,
            MethodHandleKind::InvokeInterface => InvokeType::Interface,
        };
        let receiver = if has_receiver {
            let receiver = regs.first().and_then(|&r| self.frame().get_vreg_reference(r as usize));
            if receiver.is_none() {
                return self.throw_null_pointer(&format!("invoke method {} through a handle", method.name));
            }
            receiver
        } else {
            None
        };
        let target = match self.select_target(method, invoke, receiver) {
            Ok(m) => m,
            Err(flow) => return flow,
        };
        if target.is_static() {
            if let Some(class) = self.linker().lookup_class(target.class) {
                if !ensure_initialized(self.runtime, self.thread, &class) {
                    return ControlFlow::Throw;
                }
            }
        }
        let args = self.collect_args(regs, has_receiver, &target.shorty);
        self.call(&target, &args)
    }

    /// Link the call site named by `vB` to its bootstrap handle and call it.
    fn do_invoke_custom(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let dex = &self.method.dex_file;
        let Some(call_site) = dex.call_site(inst.vreg_b()).copied() else {
            let message = format!("call site {}", inst.vreg_b());
            return self.throw(d::LINKAGE_ERROR, Some(&message));
        };
        let handle = match self.linker().resolve_method_handle(dex, call_site.target) {
            Ok(h) => h,
            Err(e) => return self.throw_linkage(e, d::LINKAGE_ERROR),
        };
        let Some((method, kind)) = self.linker().decode_method_handle(handle) else {
            return self.throw(d::LINKAGE_ERROR, Some("call site target is not a method handle"));
        };
        let regs = inst.arg_registers();
        self.invoke_handle_target(&method, kind, &regs)
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    pub(super) fn invoke_virtual(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke(inst, InvokeType::Virtual)
    }

    pub(super) fn invoke_super(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke(inst, InvokeType::Super)
    }

    pub(super) fn invoke_direct(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke(inst, InvokeType::Direct)
    }

    pub(super) fn invoke_static(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke(inst, InvokeType::Static)
    }

    pub(super) fn invoke_interface(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke(inst, InvokeType::Interface)
    }

    pub(super) fn invoke_virtual_range(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke(inst, InvokeType::Virtual)
    }

    pub(super) fn invoke_super_range(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke(inst, InvokeType::Super)
    }

    pub(super) fn invoke_direct_range(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke(inst, InvokeType::Direct)
    }

    pub(super) fn invoke_static_range(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke(inst, InvokeType::Static)
    }

    pub(super) fn invoke_interface_range(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke(inst, InvokeType::Interface)
    }

    pub(super) fn invoke_polymorphic(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke_polymorphic(inst)
    }

    pub(super) fn invoke_polymorphic_range(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke_polymorphic(inst)
    }

    pub(super) fn invoke_custom(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke_custom(inst)
    }

    pub(super) fn invoke_custom_range(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.do_invoke_custom(inst)
    }
}
