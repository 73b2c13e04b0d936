//! Layout shared by the runtime and generated code.
//!
//! Compiled code reaches thread state through the thread register
//! (`gs` on x86-64, `fs` on x86) at the fixed offsets below, and tests the
//! request bits of the state-and-flags word directly. The runtime's thread
//! record must agree with both.

/// Request flag bits in the low half of the thread state-and-flags word.
pub mod flags {
    /// A suspension was requested.
    pub const SUSPEND_REQUEST: u32 = 1 << 0;
    /// A checkpoint closure is queued.
    pub const CHECKPOINT_REQUEST: u32 = 1 << 1;
    /// An empty checkpoint is pending.
    pub const EMPTY_CHECKPOINT_REQUEST: u32 = 1 << 2;
    /// Suspend barriers are attached and must be passed.
    pub const ACTIVE_SUSPEND_BARRIER: u32 = 1 << 3;
    /// A flip function is installed and not yet started.
    pub const PENDING_FLIP_FUNCTION: u32 = 1 << 4;
    /// A flip function is running.
    pub const RUNNING_FLIP_FUNCTION: u32 = 1 << 5;
    /// The thread ignores suspend requests (it is the one suspending all).
    pub const SUSPENSION_IMMUNE: u32 = 1 << 6;
    /// Monitor JNI entry/exit hooks are active.
    pub const MONITOR_JNI_ENTRY_EXIT: u32 = 1 << 7;

    /// Bits that make a safepoint poll leave the fast path.
    pub const SUSPEND_OR_CHECKPOINT_REQUEST: u32 =
        SUSPEND_REQUEST | CHECKPOINT_REQUEST | EMPTY_CHECKPOINT_REQUEST | ACTIVE_SUSPEND_BARRIER;

    /// Number of bits the state is shifted by.
    pub const STATE_SHIFT: u32 = 28;
}

/// Offsets of thread fields reachable from compiled code.
///
/// Word-sized fields scale with the pointer size of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadOffsets {
    pointer_size: i32,
}

impl ThreadOffsets {
    /// Offsets for a target with `pointer_size`-byte words.
    pub const fn new(pointer_size: usize) -> Self {
        Self {
            pointer_size: pointer_size as i32,
        }
    }

    /// 32-bit state-and-flags word.
    pub const fn state_and_flags(self) -> i32 {
        0
    }

    /// Nonzero while the collector is marking.
    pub const fn is_gc_marking(self) -> i32 {
        4
    }

    /// The thread record itself.
    pub const fn self_ptr(self) -> i32 {
        8
    }

    /// Managed `Thread` peer object.
    pub const fn peer(self) -> i32 {
        8 + self.pointer_size
    }

    /// Pending exception.
    pub const fn exception(self) -> i32 {
        8 + 2 * self.pointer_size
    }

    /// Biased card table base.
    pub const fn card_table(self) -> i32 {
        8 + 3 * self.pointer_size
    }

    /// TLAB bump pointer.
    pub const fn tlab_pos(self) -> i32 {
        8 + 4 * self.pointer_size
    }

    /// TLAB end.
    pub const fn tlab_end(self) -> i32 {
        8 + 5 * self.pointer_size
    }

    /// Lowest usable stack address.
    pub const fn stack_end(self) -> i32 {
        8 + 6 * self.pointer_size
    }

    /// Start of the runtime entrypoint table.
    pub const fn entrypoints(self) -> i32 {
        8 + 8 * self.pointer_size
    }

    /// Slot of entrypoint number `index`.
    pub const fn entrypoint(self, index: u32) -> i32 {
        self.entrypoints() + index as i32 * self.pointer_size
    }
}

/// Bytes below the stack pointer that an implicit overflow probe touches.
pub const STACK_OVERFLOW_RESERVED_BYTES: i32 = 8 * 1024;
