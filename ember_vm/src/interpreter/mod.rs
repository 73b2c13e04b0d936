//! Dex bytecode interpreter.
//!
//! One [`ShadowFrame`] per activation lives on the thread's managed stack.
//! [`execute`] pushes a fresh frame, runs it with the switch interpreter and
//! pops it again; [`execute_frame`] resumes a frame built elsewhere (the
//! deoptimizer) at its saved pc.
//!
//! The dispatch loop is monomorphized over two flags, whether a transaction
//! is recording writes and whether instrumentation is active, so the common
//! path pays for neither.
//!
//! Handlers never hold the frame lock across an invoke, an allocation or a
//! monitor operation: each of those can reach a suspension point or re-enter
//! the thread's stack.

mod handlers;
mod invoke;
mod objects;
mod switch_impl;

use crate::class_linker::{descriptors as d, ClassLinker};
use crate::deoptimizer;
use crate::mirror::{Class, Method, NativeContext};
use crate::runtime::Runtime;
use crate::shadow_frame::{FrameFlags, ShadowFrame};
use crate::thread::{ScopedThreadStateChange, Thread, ThreadState};
use crate::value::JValue;
use std::sync::Arc;
use switch_impl::execute_switch_impl;
use tracing::{debug, trace, warn};

/// Back-edges counted locally before hotness is reported to the method.
pub(crate) const HOTNESS_BATCH: i32 = 32;

// =============================================================================
// Entry points
// =============================================================================

/// Run a new activation to completion and return its result.
///
/// An exception escaping the method is left pending on the thread and the
/// result is [`JValue::VOID`].
pub fn execute(runtime: &Runtime, thread: &Thread, frame: ShadowFrame) -> JValue {
    let depth = thread.stack_depth();
    if depth >= runtime.options().max_stack_depth {
        let message = format!("stack depth {depth}");
        thread.throw_new_exception(runtime, d::STACK_OVERFLOW_ERROR, Some(&message));
        return JValue::VOID;
    }
    run(runtime, thread, frame, true)
}

/// Resume `frame` at its saved dex pc. Method entry is not reported and
/// synchronized methods are assumed to hold their lock already.
pub fn execute_frame(runtime: &Runtime, thread: &Thread, frame: ShadowFrame) -> JValue {
    run(runtime, thread, frame, false)
}

/// Call `method` with `args`, receiver first for instance methods.
pub fn invoke_method(runtime: &Runtime, thread: &Thread, method: &Arc<Method>, args: &[JValue]) -> JValue {
    let expected = usize::from(!method.is_static()) + method.param_types().count();
    if args.len() != expected {
        ember_core::fatal!(
            "{} takes {} arguments, called with {}",
            method.name,
            expected,
            args.len()
        );
    }
    if let Some(native) = method.native {
        let ctx = NativeContext {
            runtime,
            thread,
            method,
        };
        return native(&ctx, args);
    }
    let Some(code) = method.code.as_ref() else {
        thread.throw_new_exception(runtime, d::ABSTRACT_METHOD_ERROR, Some(&method.name));
        return JValue::VOID;
    };

    let mut frame = ShadowFrame::create(usize::from(code.registers_size), None, Arc::clone(method), 0);
    let mut reg = code.first_arg_register();
    let mut args = args.iter();
    if !method.is_static() {
        frame.set_vreg_reference(reg, args.next().and_then(JValue::reference));
        reg += 1;
    }
    for (ty, &value) in method.param_types().zip(args) {
        frame.set_vreg_value(reg, ty, value);
        reg += if matches!(ty, 'J' | 'D') { 2 } else { 1 };
    }
    execute(runtime, thread, frame)
}

fn run(runtime: &Runtime, thread: &Thread, mut frame: ShadowFrame, entering: bool) -> JValue {
    let method = Arc::clone(frame.method());
    let Some(code) = method.code.clone() else {
        ember_core::fatal!("interpreting {} without code", method.name);
    };
    frame.set_link(thread.stack_depth().checked_sub(1));
    frame.cached_hotness_countdown = HOTNESS_BATCH;
    let index = thread.push_shadow_frame(frame) - 1;
    trace!(thread = thread.id().0, method = %method.name, depth = index, "enter");

    if entering {
        runtime.report_hotness(thread, &method, 1);
        enter_method(runtime, thread, index, &method, code.first_arg_register());
    }

    let instrumented = runtime.instrumentation().is_active()
        || thread
            .frame(index)
            .flags()
            .intersects(FrameFlags::NOTIFY_DEX_PC_MOVE | FrameFlags::FORCE_POP);
    let result = match (runtime.transaction_active(), instrumented) {
        (false, false) => execute_switch_impl::<false, false>(runtime, thread, index, &method, &code),
        (false, true) => execute_switch_impl::<false, true>(runtime, thread, index, &method, &code),
        (true, false) => execute_switch_impl::<true, false>(runtime, thread, index, &method, &code),
        (true, true) => execute_switch_impl::<true, true>(runtime, thread, index, &method, &code),
    };

    thread.pop_shadow_frame();
    ember_core::check!(
        thread.stack_depth() == index,
        "unbalanced managed stack leaving {}",
        method.name
    );
    trace!(thread = thread.id().0, method = %method.name, "exit");
    result
}

/// Lock a synchronized method's monitor and report entry. Failures leave an
/// exception pending, which the loop handles at pc 0.
fn enter_method(runtime: &Runtime, thread: &Thread, index: usize, method: &Method, first_arg: usize) {
    if method.is_synchronized() {
        let lock = if method.is_static() {
            runtime.class_linker().class_object(method.class).ok()
        } else {
            thread.frame(index).get_vreg_reference(first_arg)
        };
        match lock {
            Some(obj) => {
                runtime.monitors().monitor_enter(thread, obj);
                thread.frame(index).add_monitor(obj);
            }
            None => {
                thread.throw_new_exception(runtime, d::NULL_POINTER_EXCEPTION, Some("synchronized on null"));
                return;
            }
        }
    }
    let instrumentation = runtime.instrumentation();
    if instrumentation.has_method_entry_listeners() {
        if let Err(e) = instrumentation.method_enter_event(thread, method) {
            thread.throw_new_exception(runtime, &e.descriptor, e.message.as_deref());
            thread.frame(index).set_flag(FrameFlags::SKIP_NEXT_EXCEPTION);
        }
    }
}

/// Finish a call made by the interpreter or the embedder: a pending
/// deoptimization runs its frames and supplies the result.
pub(crate) fn complete_call(runtime: &Runtime, thread: &Thread, result: JValue) -> JValue {
    deoptimizer::complete_pending_deoptimization(runtime, thread).unwrap_or(result)
}

// =============================================================================
// Class initialization
// =============================================================================

/// Make sure `class` is initialized, running static initializers of it and
/// its superclasses as needed. Returns `false` with an exception pending if
/// initialization failed.
pub fn ensure_initialized(runtime: &Runtime, thread: &Thread, class: &Arc<Class>) -> bool {
    if class.is_initialized() {
        return true;
    }
    let linker = runtime.class_linker();
    if let Some(super_class) = class.super_class.and_then(|s| linker.lookup_class(s)) {
        if !ensure_initialized(runtime, thread, &super_class) {
            return false;
        }
    }
    let claim = {
        let _blocked = ScopedThreadStateChange::new(thread, ThreadState::Blocked);
        class.begin_initialization(thread.id())
    };
    match claim {
        Ok(false) => true,
        Ok(true) => run_class_initializer(runtime, thread, class),
        Err(_) => {
            thread.throw_new_exception(runtime, d::NO_CLASS_DEF_FOUND_ERROR, Some(&class.descriptor));
            false
        }
    }
}

fn run_class_initializer(runtime: &Runtime, thread: &Thread, class: &Arc<Class>) -> bool {
    debug!(class = %class.descriptor, "initializing");
    if let Some(clinit) = class.find_declared_method("<clinit>", "V").cloned() {
        let result = invoke_method(runtime, thread, &clinit, &[]);
        complete_call(runtime, thread, result);
    }
    let ok = !thread.is_exception_pending();
    if !ok {
        wrap_initializer_exception(runtime, thread);
        warn!(class = %class.descriptor, "static initializer failed");
    }
    class.finish_initialization(ok);
    ok
}

/// Initializers may only throw errors out; anything else is wrapped in
/// `ExceptionInInitializerError`.
fn wrap_initializer_exception(runtime: &Runtime, thread: &Thread) {
    let Some(exception) = thread.exception() else {
        return;
    };
    let linker = runtime.class_linker();
    let is_error = linker
        .find_class(d::ERROR)
        .is_ok_and(|error| linker.is_assignable(runtime.heap().class_of(exception), error.id));
    if !is_error {
        thread.clear_exception();
        thread.throw_new_exception(runtime, d::EXCEPTION_IN_INITIALIZER_ERROR, None);
    }
}
