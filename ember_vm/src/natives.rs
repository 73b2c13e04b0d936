//! Native implementations of core library methods.
//!
//! Arguments arrive receiver first. The interpreter null-checks receivers
//! before the call, so `args[0]` of an instance method is never null.

use crate::class_linker::ClassLinker;
use crate::class_linker::descriptors as d;
use crate::mirror::NativeContext;
use crate::monitor::{self, MonitorError};
use crate::value::JValue;
use ember_core::ObjRef;
use std::time::Duration;

fn receiver(args: &[JValue]) -> ObjRef {
    match args.first().and_then(JValue::reference) {
        Some(obj) => obj,
        None => ember_core::fatal!("native instance method called without a receiver"),
    }
}

fn throw_monitor_error(ctx: &NativeContext<'_>, error: MonitorError) -> JValue {
    ctx.thread
        .throw_new_exception(ctx.runtime, error.exception_descriptor(), Some(&error.to_string()));
    JValue::VOID
}

// =============================================================================
// java.lang.Object
// =============================================================================

pub(crate) fn object_hash_code(ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    JValue::from_int(ctx.runtime.heap().identity_hash(receiver(args)) as i32)
}

pub(crate) fn object_equals(_ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    let other = args.get(1).and_then(JValue::reference);
    JValue::from_int(i32::from(Some(receiver(args)) == other))
}

pub(crate) fn object_get_class(ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    let class = ctx.runtime.heap().class_of(receiver(args));
    match ctx.runtime.class_linker().class_object(class) {
        Ok(obj) => JValue::from_ref(Some(obj)),
        Err(_) => {
            ctx.thread.set_exception(ctx.runtime.preallocated_oome());
            JValue::VOID
        }
    }
}

fn wait_for(ctx: &NativeContext<'_>, obj: ObjRef, timeout: Option<Duration>) -> JValue {
    match ctx.runtime.monitors().wait(ctx.thread, obj, timeout) {
        Ok(()) => JValue::VOID,
        Err(e) => throw_monitor_error(ctx, e),
    }
}

pub(crate) fn object_wait(ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    wait_for(ctx, receiver(args), None)
}

/// `wait(0)` waits without a timeout.
pub(crate) fn object_wait_timeout(ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    let millis = args.get(1).map_or(0, JValue::long);
    if millis < 0 {
        ctx.thread.throw_new_exception(
            ctx.runtime,
            d::RUNTIME_EXCEPTION,
            Some("timeout value is negative"),
        );
        return JValue::VOID;
    }
    let timeout = (millis > 0).then(|| Duration::from_millis(millis as u64));
    wait_for(ctx, receiver(args), timeout)
}

pub(crate) fn object_notify(ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    match ctx.runtime.monitors().notify(ctx.thread, receiver(args)) {
        Ok(()) => JValue::VOID,
        Err(e) => throw_monitor_error(ctx, e),
    }
}

pub(crate) fn object_notify_all(ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    match ctx.runtime.monitors().notify_all(ctx.thread, receiver(args)) {
        Ok(()) => JValue::VOID,
        Err(e) => throw_monitor_error(ctx, e),
    }
}

// =============================================================================
// java.lang.String
// =============================================================================

fn utf16(ctx: &NativeContext<'_>, obj: ObjRef) -> Vec<u16> {
    ctx.runtime
        .heap()
        .with(obj, |o| o.as_string().map(<[u16]>::to_vec))
        .unwrap_or_default()
}

pub(crate) fn string_length(ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    JValue::from_int(utf16(ctx, receiver(args)).len() as i32)
}

pub(crate) fn string_char_at(ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    let index = args.get(1).map_or(0, JValue::int);
    let chars = utf16(ctx, receiver(args));
    match usize::try_from(index).ok().and_then(|i| chars.get(i)) {
        Some(&c) => JValue::from_int(i32::from(c)),
        None => {
            let message = format!("index={index} length={}", chars.len());
            ctx.thread
                .throw_new_exception(ctx.runtime, d::STRING_INDEX_OUT_OF_BOUNDS_EXCEPTION, Some(&message));
            JValue::VOID
        }
    }
}

pub(crate) fn string_equals(ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    let this = receiver(args);
    let equal = match args.get(1).and_then(JValue::reference) {
        Some(other) if other == this => true,
        Some(other) => {
            let heap = ctx.runtime.heap();
            heap.class_of(other) == heap.class_of(this) && utf16(ctx, other) == utf16(ctx, this)
        }
        None => false,
    };
    JValue::from_int(i32::from(equal))
}

pub(crate) fn string_intern(ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    let value = String::from_utf16_lossy(&utf16(ctx, receiver(args)));
    match ctx.runtime.class_linker().intern(&value) {
        Ok(s) => JValue::from_ref(Some(s)),
        Err(_) => {
            ctx.thread.set_exception(ctx.runtime.preallocated_oome());
            JValue::VOID
        }
    }
}

// =============================================================================
// java.lang.Thread
// =============================================================================

pub(crate) fn thread_sleep(ctx: &NativeContext<'_>, args: &[JValue]) -> JValue {
    let millis = args.first().map_or(0, JValue::long).max(0) as u64;
    match monitor::sleep(ctx.thread, Duration::from_millis(millis)) {
        Ok(()) => JValue::VOID,
        Err(e) => throw_monitor_error(ctx, e),
    }
}

pub(crate) fn thread_interrupted(ctx: &NativeContext<'_>, _args: &[JValue]) -> JValue {
    JValue::from_int(i32::from(ctx.thread.interrupted()))
}
