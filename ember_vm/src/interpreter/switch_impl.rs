//! The switch interpreter loop.
//!
//! Each iteration polls for suspension, decodes the instruction at the
//! current pc, runs the instrumentation preamble when instrumented and
//! dispatches to the opcode's handler. Handlers report what happens next
//! through [`ControlFlow`]; branches, returns and exceptions are finished
//! here so every handler stays small.

use super::HOTNESS_BATCH;
use crate::bytecode::{dex_instruction_list, CodeItem, Instruction, Opcode};
use crate::class_linker::{descriptors as d, ClassLinker, ClassTable};
use crate::instrumentation::ListenerError;
use crate::mirror::Method;
use crate::runtime::Runtime;
use crate::shadow_frame::{FrameFlags, ShadowFrame};
use crate::thread::{PendingThrow, Thread};
use crate::transaction::Transaction;
use crate::value::JValue;
use ember_core::{EmberError, EmberResult, ObjRef};
use ember_gc::{Heap, Tlab};
use parking_lot::MappedMutexGuard;
use std::sync::Arc;
use tracing::{debug, trace, warn};

// =============================================================================
// Control flow
// =============================================================================

/// What a handler asks the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum ControlFlow {
    /// Fall through to the next instruction.
    Continue,
    /// Jump by a signed offset in code units from the current instruction.
    Branch(i32),
    /// Execute the current instruction again.
    Retry,
    /// Leave the method with a value.
    Return(JValue),
    /// An exception or a deoptimization is pending on the thread.
    Throw,
}

// =============================================================================
// Interpreter state
// =============================================================================

/// State of one activation while the loop runs it.
pub(super) struct Interp<'a, const TRANSACTION_ACTIVE: bool, const INSTRUMENTED: bool> {
    pub(super) runtime: &'a Runtime,
    pub(super) thread: &'a Thread,
    pub(super) method: &'a Arc<Method>,
    pub(super) code: &'a CodeItem,
    pub(super) frame_index: usize,
    pub(super) dex_pc: u32,
    pub(super) transaction: Option<Arc<Transaction>>,
    /// The pending exception came out of a callee, which already reported it.
    pub(super) exception_from_callee: bool,
}

/// Run the frame at `frame_index` until it returns or an exception escapes.
pub(super) fn execute_switch_impl<const TRANSACTION_ACTIVE: bool, const INSTRUMENTED: bool>(
    runtime: &Runtime,
    thread: &Thread,
    frame_index: usize,
    method: &Arc<Method>,
    code: &CodeItem,
) -> JValue {
    let mut interp = Interp::<TRANSACTION_ACTIVE, INSTRUMENTED> {
        runtime,
        thread,
        method,
        code,
        frame_index,
        dex_pc: thread.frame(frame_index).dex_pc(),
        transaction: if TRANSACTION_ACTIVE {
            runtime.active_transaction()
        } else {
            None
        },
        exception_from_callee: false,
    };

    // Entry can fail before the first instruction (monitor, listener).
    if thread.is_exception_pending() && !interp.handle_pending_exception() {
        return interp.exit_abnormally();
    }

    loop {
        thread.check_suspend();
        let Some(inst) = Instruction::at(&code.insns, interp.dex_pc) else {
            ember_core::fatal!("{}: dex pc {} past the end of the code", method.name, interp.dex_pc);
        };
        if INSTRUMENTED || inst.opcode().can_throw() {
            interp.frame().set_dex_pc(interp.dex_pc);
        }

        let flow = match INSTRUMENTED.then(|| interp.preamble()).flatten() {
            Some(flow) => flow,
            None => interp.dispatch(inst),
        };

        let flow = match flow {
            ControlFlow::Branch(offset) => interp.take_branch(offset),
            other => other,
        };
        match flow {
            ControlFlow::Continue => interp.dex_pc += inst.size_in_code_units() as u32,
            ControlFlow::Branch(_) | ControlFlow::Retry => {}
            ControlFlow::Return(value) => return interp.exit_normally(value),
            ControlFlow::Throw => {
                if !interp.handle_pending_exception() {
                    return interp.exit_abnormally();
                }
            }
        }
    }
}

macro_rules! define_dispatch {
    ($($value:literal, $variant:ident, $handler:ident, $name:literal, $format:ident, $index:ident, [$($flag:ident)*];)*) => {
        impl<const TRANSACTION_ACTIVE: bool, const INSTRUMENTED: bool> Interp<'_, TRANSACTION_ACTIVE, INSTRUMENTED> {
            #[inline(always)]
            fn dispatch(&mut self, inst: Instruction<'_>) -> ControlFlow {
                match inst.opcode() {
                    $(Opcode::$variant => self.$handler(inst),)*
                }
            }
        }
    };
}

dex_instruction_list!(define_dispatch);

impl<'a, const TRANSACTION_ACTIVE: bool, const INSTRUMENTED: bool> Interp<'a, TRANSACTION_ACTIVE, INSTRUMENTED> {
    // =========================================================================
    // Accessors
    // =========================================================================

    /// Lock this activation's frame. Never hold the guard across a call
    /// back into the runtime.
    #[inline(always)]
    pub(super) fn frame(&self) -> MappedMutexGuard<'a, ShadowFrame> {
        self.thread.frame(self.frame_index)
    }

    #[inline(always)]
    pub(super) fn linker(&self) -> &'a ClassTable {
        self.runtime.class_linker()
    }

    #[inline(always)]
    pub(super) fn heap(&self) -> &'a Heap {
        self.runtime.heap()
    }

    /// The transaction recording this activation's writes, if one is active.
    #[inline(always)]
    pub(super) fn transaction(&self) -> Option<&Transaction> {
        if TRANSACTION_ACTIVE {
            self.transaction.as_deref()
        } else {
            None
        }
    }

    // =========================================================================
    // Throwing
    // =========================================================================

    pub(super) fn throw(&self, descriptor: &str, message: Option<&str>) -> ControlFlow {
        self.thread.throw_new_exception(self.runtime, descriptor, message);
        ControlFlow::Throw
    }

    pub(super) fn throw_null_pointer(&self, action: &str) -> ControlFlow {
        let message = format!("Attempt to {action} on a null object reference");
        self.throw(d::NULL_POINTER_EXCEPTION, Some(&message))
    }

    /// Turn a linker failure into the managed error `descriptor`, or into
    /// `OutOfMemoryError` when the linker ran out of heap.
    pub(super) fn throw_linkage(&self, error: EmberError, descriptor: &str) -> ControlFlow {
        match error {
            EmberError::OutOfMemory { .. } => {
                self.runtime.throw_out_of_memory(self.thread);
                ControlFlow::Throw
            }
            other => self.throw(descriptor, Some(&other.to_string())),
        }
    }

    /// Raise the exception a listener asked for. It is not reported back to
    /// exception listeners.
    pub(super) fn raise_listener_error(&self, error: ListenerError) -> ControlFlow {
        self.thread
            .throw_new_exception(self.runtime, &error.descriptor, error.message.as_deref());
        self.frame().set_flag(FrameFlags::SKIP_NEXT_EXCEPTION);
        ControlFlow::Throw
    }

    /// Allocate through the thread's buffer. `None` leaves
    /// `OutOfMemoryError` pending.
    pub(super) fn allocate(&self, f: impl FnOnce(&Heap, &mut Tlab) -> EmberResult<ObjRef>) -> Option<ObjRef> {
        let heap = self.heap();
        match self.thread.with_tlab(|tlab| f(heap, tlab)) {
            Ok(obj) => Some(obj),
            Err(error) => {
                debug!(thread = self.thread.id().0, %error, "allocation failed");
                self.runtime.throw_out_of_memory(self.thread);
                None
            }
        }
    }

    /// Abort the active transaction and throw `TransactionAbortError`.
    pub(super) fn abort_transaction(&self, message: String) -> ControlFlow {
        if let Some(tx) = self.transaction() {
            tx.abort(message.clone());
        }
        self.throw(d::TRANSACTION_ABORT_ERROR, Some(&message))
    }

    // =========================================================================
    // Branches
    // =========================================================================

    /// Finish a taken branch: report it, account a back-edge and move the pc.
    fn take_branch(&mut self, offset: i32) -> ControlFlow {
        if INSTRUMENTED {
            let instrumentation = self.runtime.instrumentation();
            if instrumentation.has_branch_listeners() {
                if let Err(e) = instrumentation.branch_event(self.thread, self.method, self.dex_pc, offset) {
                    return self.raise_listener_error(e);
                }
            }
        }
        let target = self.dex_pc.wrapping_add_signed(offset);
        if offset <= 0 {
            if let Some(flow) = self.back_edge(target) {
                return flow;
            }
        }
        self.dex_pc = target;
        ControlFlow::Branch(offset)
    }

    /// Hotness accounting, on-stack replacement and async exceptions at a
    /// backward branch. `None` continues at `target`.
    fn back_edge(&mut self, target: u32) -> Option<ControlFlow> {
        let flush = {
            let mut frame = self.frame();
            frame.cached_hotness_countdown -= 1;
            if frame.cached_hotness_countdown <= 0 {
                frame.cached_hotness_countdown = HOTNESS_BATCH;
                true
            } else {
                false
            }
        };
        if flush && self.runtime.report_hotness(self.thread, self.method, HOTNESS_BATCH as u32) {
            if let Some(value) = self.runtime.try_osr(self.thread, self.method, target) {
                trace!(method = %self.method.name, dex_pc = target, "left through osr");
                self.frame().set_flag(FrameFlags::SKIP_METHOD_EXIT);
                return Some(ControlFlow::Return(value));
            }
        }
        self.thread.promote_async_exception().then_some(ControlFlow::Throw)
    }

    // =========================================================================
    // Instrumentation
    // =========================================================================

    /// Work done before every instruction while instrumented. `Some` skips
    /// the instruction.
    fn preamble(&mut self) -> Option<ControlFlow> {
        let instrumentation = self.runtime.instrumentation();
        let (flags, caught, link, this) = {
            let mut frame = self.frame();
            let flags = frame.flags();
            frame.clear_flag(FrameFlags::FORCE_POP | FrameFlags::NOTIFY_EXCEPTION_HANDLED);
            let this = if self.method.is_static() {
                None
            } else {
                frame.get_vreg_reference(self.code.first_arg_register())
            };
            (flags, frame.caught_exception, frame.link(), this)
        };

        if flags.contains(FrameFlags::FORCE_POP) {
            debug!(method = %self.method.name, dex_pc = self.dex_pc, "frame force-popped");
            if let Some(caller) = link {
                self.thread.frame(caller).set_flag(FrameFlags::FORCE_RETRY);
            }
            self.frame().set_flag(FrameFlags::SKIP_METHOD_EXIT);
            return Some(ControlFlow::Return(JValue::VOID));
        }
        if flags.contains(FrameFlags::NOTIFY_EXCEPTION_HANDLED) {
            if let Some(exception) = caught {
                if let Err(e) = instrumentation.exception_handled_event(self.thread, exception) {
                    return Some(self.raise_listener_error(e));
                }
            }
        }
        if flags.contains(FrameFlags::NOTIFY_DEX_PC_MOVE) || instrumentation.has_dex_pc_listeners() {
            if let Err(e) = instrumentation.dex_pc_moved_event(self.thread, this, self.method, self.dex_pc) {
                return Some(self.raise_listener_error(e));
            }
        }
        None
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    /// Report the pending exception and look for a handler in this method.
    /// Returns `true` with the pc at the handler, or `false` if the
    /// exception (or a deoptimization) must leave the method.
    fn handle_pending_exception(&mut self) -> bool {
        let from_callee = std::mem::take(&mut self.exception_from_callee);
        let mut exception = match self.thread.pending() {
            Some(PendingThrow::Exception(e)) => e,
            Some(PendingThrow::Deoptimize) | None => return false,
        };

        if INSTRUMENTED {
            let skip = {
                let mut frame = self.frame();
                let skip = frame.has_flag(FrameFlags::SKIP_NEXT_EXCEPTION);
                frame.clear_flag(FrameFlags::SKIP_NEXT_EXCEPTION);
                skip
            };
            let instrumentation = self.runtime.instrumentation();
            if !from_callee && !skip && instrumentation.has_exception_thrown_listeners() {
                if let Err(e) = instrumentation.exception_thrown_event(self.thread, exception) {
                    self.raise_listener_error(e);
                    self.frame().clear_flag(FrameFlags::SKIP_NEXT_EXCEPTION);
                    match self.thread.exception() {
                        Some(replacement) => exception = replacement,
                        None => return false,
                    }
                }
            }
        }

        // An aborted transaction unwinds everything up to its owner.
        if self.transaction().is_some_and(Transaction::is_aborted) {
            return false;
        }

        let Some(handler) = self.find_catch_block(exception) else {
            trace!(method = %self.method.name, dex_pc = self.dex_pc, "exception not caught here");
            return false;
        };
        self.thread.clear_exception();
        let notify = INSTRUMENTED && self.runtime.instrumentation().has_exception_handled_listeners();
        {
            let mut frame = self.frame();
            frame.caught_exception = Some(exception);
            if notify {
                frame.set_flag(FrameFlags::NOTIFY_EXCEPTION_HANDLED);
            }
            frame.set_dex_pc(handler);
        }
        debug!(method = %self.method.name, from = self.dex_pc, handler, "exception caught");
        self.dex_pc = handler;
        true
    }

    /// Address of the first handler covering the current pc whose type the
    /// exception is an instance of. Unresolvable catch types never match.
    fn find_catch_block(&self, exception: ObjRef) -> Option<u32> {
        let try_item = self.code.find_try_item(self.dex_pc)?;
        let linker = self.linker();
        let exception_class = self.heap().class_of(exception);
        for handler in &try_item.handlers {
            match linker.resolve_type(&self.method.dex_file, handler.type_index) {
                Ok(catch_class) if linker.is_assignable(exception_class, catch_class.id) => {
                    return Some(handler.address);
                }
                Ok(_) => {}
                Err(error) => warn!(method = %self.method.name, %error, "catch type does not resolve"),
            }
        }
        try_item.catch_all
    }

    // =========================================================================
    // Exit
    // =========================================================================

    fn exit_normally(&mut self, value: JValue) -> JValue {
        if INSTRUMENTED && !self.frame().has_flag(FrameFlags::SKIP_METHOD_EXIT) {
            let instrumentation = self.runtime.instrumentation();
            if instrumentation.has_method_exit_listeners() {
                if let Err(e) = instrumentation.method_exit_event(self.thread, self.method, self.dex_pc, value) {
                    self.raise_listener_error(e);
                    return self.exit_abnormally();
                }
            }
        }
        self.release_monitors();
        value
    }

    fn exit_abnormally(&mut self) -> JValue {
        self.release_monitors();
        JValue::VOID
    }

    /// Unlock every monitor this activation still holds, innermost first.
    fn release_monitors(&self) {
        let held = self.frame().take_held_monitors();
        for &obj in held.iter().rev() {
            if let Err(error) = self.runtime.monitors().monitor_exit(self.thread, obj) {
                warn!(method = %self.method.name, ?obj, %error, "held monitor not owned at exit");
            }
        }
    }

    // =========================================================================
    // Handlers shared by every group
    // =========================================================================

    pub(super) fn unused(&mut self, inst: Instruction<'_>) -> ControlFlow {
        ember_core::fatal!(
            "{}: unused opcode {:#04x} at dex pc {}",
            self.method.name,
            inst.opcode() as u8,
            self.dex_pc
        );
    }
}
