//! Runtime entrypoints reachable from compiled code.
//!
//! Entrypoints live in a per-thread table; generated code calls them through
//! the thread segment register at [`ThreadOffsets::entrypoint`].

use crate::options::InstructionSet;
use ember_core::abi::ThreadOffsets;

/// Number of per-register read-barrier mark entrypoints.
pub const NUM_MARK_ENTRYPOINTS: usize = 16;

/// A runtime function compiled code may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuickEntrypoint {
    AllocObject,
    AllocArray,
    AputObject,
    LockObject,
    UnlockObject,
    DeliverException,
    ThrowNullPointer,
    ThrowArrayBounds,
    ThrowStringBounds,
    ThrowDivZero,
    TestSuspend,
    Deoptimize,
    ResolveType,
    ResolveString,
    ResolveMethodType,
    ResolveMethodHandle,
    InstanceofNonTrivial,
    CheckInstanceOf,
    InvokeStaticTrampolineWithAccessCheck,
    InvokeVirtualTrampoline,
    InvokeInterfaceTrampoline,
    InvokePolymorphic,
    ReadBarrierSlow,
    ReadBarrierForRootSlow,
    /// Mark the reference held in register `n`, returning it in the same register.
    ReadBarrierMarkReg(u8),
    Fmodf,
    Fmod,
    Cos,
    Sin,
    Tan,
    Exp,
    Log,
    Pow,
    Atan2,
    StringCompareTo,
    StringIndexOf,
    StringEquals,
    ArrayCopy,
}

impl QuickEntrypoint {
    /// Slot in the entrypoint table.
    pub const fn index(self) -> usize {
        use QuickEntrypoint::*;
        match self {
            AllocObject => 0,
            AllocArray => 1,
            AputObject => 2,
            LockObject => 3,
            UnlockObject => 4,
            DeliverException => 5,
            ThrowNullPointer => 6,
            ThrowArrayBounds => 7,
            ThrowStringBounds => 8,
            ThrowDivZero => 9,
            TestSuspend => 10,
            Deoptimize => 11,
            ResolveType => 12,
            ResolveString => 13,
            ResolveMethodType => 14,
            ResolveMethodHandle => 15,
            InstanceofNonTrivial => 16,
            CheckInstanceOf => 17,
            InvokeStaticTrampolineWithAccessCheck => 18,
            InvokeVirtualTrampoline => 19,
            InvokeInterfaceTrampoline => 20,
            InvokePolymorphic => 21,
            ReadBarrierSlow => 22,
            ReadBarrierForRootSlow => 23,
            Fmodf => 24,
            Fmod => 25,
            Cos => 26,
            Sin => 27,
            Tan => 28,
            Exp => 29,
            Log => 30,
            Pow => 31,
            Atan2 => 32,
            StringCompareTo => 33,
            StringIndexOf => 34,
            StringEquals => 35,
            ArrayCopy => 36,
            ReadBarrierMarkReg(r) => 37 + r as usize,
        }
    }

    /// Entries that never return.
    pub const fn is_fatal(self) -> bool {
        use QuickEntrypoint::*;
        matches!(
            self,
            DeliverException
                | ThrowNullPointer
                | ThrowArrayBounds
                | ThrowStringBounds
                | ThrowDivZero
                | Deoptimize
        )
    }

    /// Whether the callee can suspend or allocate, so the call site needs a
    /// stack map. Mark and math helpers run without suspending.
    pub const fn needs_stack_map(self) -> bool {
        use QuickEntrypoint::*;
        !matches!(
            self,
            ReadBarrierMarkReg(_) | Fmodf | Fmod | Cos | Sin | Tan | Exp | Log | Pow | Atan2
        )
    }

    /// Offset of the entry from the thread register.
    pub fn thread_offset(self, isa: InstructionSet) -> i32 {
        ThreadOffsets::new(isa.pointer_size()).entrypoint(self.index() as u32)
    }

    /// Symbol used in disassembly and logs.
    pub fn name(self) -> String {
        match self {
            QuickEntrypoint::ReadBarrierMarkReg(r) => format!("pReadBarrierMarkReg{r:02}"),
            other => format!("p{other:?}"),
        }
    }
}

/// Total entrypoint table length.
pub const NUM_ENTRYPOINTS: usize = QuickEntrypoint::ReadBarrierMarkReg(0).index() + NUM_MARK_ENTRYPOINTS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_dense() {
        assert_eq!(QuickEntrypoint::ArrayCopy.index() + 1, QuickEntrypoint::ReadBarrierMarkReg(0).index());
        assert_eq!(NUM_ENTRYPOINTS, 53);
    }

    #[test]
    fn test_thread_offset_scales_with_pointer_size() {
        let p64 = QuickEntrypoint::AllocObject.thread_offset(InstructionSet::X86_64);
        let p32 = QuickEntrypoint::AllocObject.thread_offset(InstructionSet::X86);
        assert_eq!(QuickEntrypoint::AllocArray.thread_offset(InstructionSet::X86_64) - p64, 8);
        assert_eq!(QuickEntrypoint::AllocArray.thread_offset(InstructionSet::X86) - p32, 4);
    }

    #[test]
    fn test_classification() {
        assert!(QuickEntrypoint::ThrowDivZero.is_fatal());
        assert!(!QuickEntrypoint::TestSuspend.is_fatal());
        assert!(!QuickEntrypoint::ReadBarrierMarkReg(3).needs_stack_map());
        assert!(QuickEntrypoint::AllocObject.needs_stack_map());
        assert_eq!(QuickEntrypoint::ReadBarrierMarkReg(3).name(), "pReadBarrierMarkReg03");
        assert_eq!(QuickEntrypoint::TestSuspend.name(), "pTestSuspend");
    }
}
