//! Deoptimization: resuming compiled activations in the interpreter.
//!
//! Compiled code that can no longer continue saves its activations as a
//! chain of shadow frames and asks for deoptimization. The request is
//! carried as [`PendingThrow::Deoptimize`](crate::thread::PendingThrow), a
//! sentinel in the exception slot that no catch handler matches. Whoever
//! sees it after a call returns hands the saved chain to [`deoptimize`],
//! which runs each frame to completion in the interpreter, innermost first,
//! feeding every frame's result into its caller.
//!
//! ```text
//!   compiled caller ─▶ compiled callee ─▶ request_deoptimization
//!                                           │ context pushed on thread
//!                                           ▼ Deoptimize pending
//!   invoke returns ─▶ complete_pending_deoptimization
//!                        │
//!                        ├─ callee frame:  interpreter resumes at its pc
//!                        └─ caller frame:  interpreter resumes after its invoke
//! ```

pub mod stats;

pub use stats::{DeoptSiteKey, DeoptStats, SiteSnapshot};

use crate::bytecode::Instruction;
use crate::interpreter;
use crate::runtime::Runtime;
use crate::shadow_frame::{FrameFlags, ShadowFrame};
use crate::thread::Thread;
use crate::value::JValue;
use tracing::debug;

// =============================================================================
// Kinds and reasons
// =============================================================================

/// How much of the stack is deoptimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptimizationKind {
    /// Only the requesting activation.
    SingleFrame,
    /// Every compiled activation saved with the request.
    FullStack,
}

/// Where the innermost frame resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptimizationMethodType {
    /// After the invoke at the saved pc if there is one, with the context's
    /// return value as the invoke's result; otherwise at the saved pc.
    Default,
    /// Re-execute the instruction at the saved pc.
    KeepDexPc,
}

/// Why compiled code gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeoptReason {
    /// A speculated receiver or value type did not hold.
    TypeGuard = 0,
    /// An array or string bounds check failed in optimized code.
    BoundsCheck = 1,
    /// A path compiled as never-taken was taken.
    UncommonTrap = 2,
    /// A class was loaded that invalidates a devirtualization.
    ClassHierarchyChange = 3,
    /// A debugger or tool asked for interpreted execution.
    Debuggable = 4,
    /// The method-exit event already fired for the innermost frame.
    MethodExitCallbackFired = 5,
    /// Explicit request.
    Explicit = 6,
}

impl DeoptReason {
    pub const COUNT: usize = 7;

    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::TypeGuard),
            1 => Some(Self::BoundsCheck),
            2 => Some(Self::UncommonTrap),
            3 => Some(Self::ClassHierarchyChange),
            4 => Some(Self::Debuggable),
            5 => Some(Self::MethodExitCallbackFired),
            6 => Some(Self::Explicit),
            _ => None,
        }
    }

    /// Whether the compiled code should be discarded and the method
    /// recompiled with less speculation.
    #[inline]
    pub const fn triggers_recompile(&self) -> bool {
        matches!(self, Self::TypeGuard | Self::ClassHierarchyChange | Self::UncommonTrap)
    }
}

impl std::fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TypeGuard => "type guard",
            Self::BoundsCheck => "bounds check",
            Self::UncommonTrap => "uncommon trap",
            Self::ClassHierarchyChange => "class hierarchy change",
            Self::Debuggable => "debuggable",
            Self::MethodExitCallbackFired => "method exit callback fired",
            Self::Explicit => "explicit",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Context
// =============================================================================

/// Activations saved by compiled code, waiting to be interpreted.
#[derive(Debug)]
pub struct DeoptimizationContext {
    /// Innermost first.
    pub frames: Vec<ShadowFrame>,
    pub kind: DeoptimizationKind,
    pub method_type: DeoptimizationMethodType,
    pub reason: DeoptReason,
    /// Result of the call the innermost frame was making, when
    /// `method_type` is `Default`.
    pub return_value: JValue,
}

impl DeoptimizationContext {
    pub fn new(
        frames: Vec<ShadowFrame>,
        kind: DeoptimizationKind,
        method_type: DeoptimizationMethodType,
        reason: DeoptReason,
    ) -> Self {
        Self {
            frames,
            kind,
            method_type,
            reason,
            return_value: JValue::VOID,
        }
    }

    pub fn with_return_value(mut self, value: JValue) -> Self {
        self.return_value = value;
        self
    }
}

// =============================================================================
// Driver
// =============================================================================

/// If the thread is unwinding to the deoptimizer, run the saved frames and
/// return the outermost one's result. `None` when no deoptimization is
/// pending; a pending managed exception is left alone.
pub fn complete_pending_deoptimization(runtime: &Runtime, thread: &Thread) -> Option<JValue> {
    if !thread.is_deoptimization_pending() {
        return None;
    }
    thread.clear_exception();
    let Some(ctx) = thread.pop_deoptimization_context() else {
        ember_core::fatal!("thread {} deoptimizing without a saved context", thread.id().0);
    };
    Some(deoptimize(runtime, thread, ctx))
}

/// Interpret the frames of `ctx` to completion, innermost first. Returns
/// the outermost frame's result; an exception escaping the outermost frame
/// is left pending.
pub fn deoptimize(runtime: &Runtime, thread: &Thread, ctx: DeoptimizationContext) -> JValue {
    let DeoptimizationContext {
        frames,
        kind,
        method_type,
        reason,
        return_value,
    } = ctx;
    if frames.is_empty() {
        ember_core::fatal!("deoptimization with no frames");
    }
    if kind == DeoptimizationKind::SingleFrame && frames.len() != 1 {
        ember_core::fatal!("single-frame deoptimization carried {} frames", frames.len());
    }
    let innermost = &frames[0];
    runtime
        .deopt_stats()
        .record(innermost.method().id, innermost.dex_pc(), reason);
    debug!(
        thread = thread.id().0,
        method = %innermost.method().name,
        dex_pc = innermost.dex_pc(),
        frames = frames.len(),
        %reason,
        ?kind,
        "deoptimizing"
    );

    let mut value = return_value;
    for (depth, mut frame) in frames.into_iter().enumerate() {
        frame.set_flag(FrameFlags::DEOPTIMIZED);
        let resume_after_invoke = if depth == 0 {
            if reason == DeoptReason::MethodExitCallbackFired {
                frame.set_flag(FrameFlags::SKIP_METHOD_EXIT);
            }
            method_type == DeoptimizationMethodType::Default
        } else {
            // A caller whose callee threw handles the exception at the invoke.
            !thread.is_exception_pending()
        };
        if resume_after_invoke {
            skip_invoke(&mut frame, value);
        }
        value = interpreter::execute_frame(runtime, thread, frame);
    }
    value
}

/// Move `frame` past the invoke at its pc, delivering `result` to it.
fn skip_invoke(frame: &mut ShadowFrame, result: JValue) {
    let next = {
        let Some(code) = frame.method().code.as_deref() else {
            return;
        };
        match Instruction::at(&code.insns, frame.dex_pc()) {
            Some(inst) if inst.opcode().is_invoke() => frame.dex_pc() + inst.size_in_code_units() as u32,
            _ => return,
        }
    };
    frame.result_register = result;
    frame.set_dex_pc(next);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_round_trip_and_display() {
        for raw in 0..DeoptReason::COUNT as u8 {
            let reason = DeoptReason::from_u8(raw).unwrap();
            assert_eq!(reason as u8, raw);
            assert!(!reason.to_string().is_empty());
        }
        assert_eq!(DeoptReason::from_u8(DeoptReason::COUNT as u8), None);
        assert!(DeoptReason::TypeGuard.triggers_recompile());
        assert!(!DeoptReason::Debuggable.triggers_recompile());
    }
}
