//! The thread state-and-flags word.
//!
//! ```text
//!  31    28 27                              8 7                 0
//! +--------+---------------------------------+-------------------+
//! | state  |             (unused)            |  request flags    |
//! +--------+---------------------------------+-------------------+
//! ```
//!
//! The flag bit positions are shared with generated code through
//! [`ember_core::abi::flags`].

use bitflags::bitflags;
use ember_core::abi::flags;
use std::fmt;

/// Execution state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    Terminated = 0,
    /// Executing managed code; holds the mutator lock shared.
    Runnable = 1,
    /// Executing native code outside the runtime.
    Native = 2,
    /// Suspended by a suspend request.
    Suspended = 3,
    /// Blocked on a monitor.
    Blocked = 4,
    /// In `Object.wait()`.
    Waiting = 5,
    /// In `Object.wait(timeout)`.
    TimedWaiting = 6,
    Sleeping = 7,
    WaitingForGcToComplete = 8,
    WaitingForCheckPointsToRun = 9,
    WaitingPerformingGc = 10,
    Starting = 11,
}

impl ThreadState {
    /// Decode the 4-bit state field. Values 12..=15 are invalid.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            0 => ThreadState::Terminated,
            1 => ThreadState::Runnable,
            2 => ThreadState::Native,
            3 => ThreadState::Suspended,
            4 => ThreadState::Blocked,
            5 => ThreadState::Waiting,
            6 => ThreadState::TimedWaiting,
            7 => ThreadState::Sleeping,
            8 => ThreadState::WaitingForGcToComplete,
            9 => ThreadState::WaitingForCheckPointsToRun,
            10 => ThreadState::WaitingPerformingGc,
            11 => ThreadState::Starting,
            _ => return None,
        })
    }

    #[inline]
    pub const fn is_runnable(self) -> bool {
        matches!(self, ThreadState::Runnable)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// Request flags in the low bits of the state word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThreadFlag: u32 {
        const SUSPEND_REQUEST = flags::SUSPEND_REQUEST;
        const CHECKPOINT_REQUEST = flags::CHECKPOINT_REQUEST;
        const EMPTY_CHECKPOINT_REQUEST = flags::EMPTY_CHECKPOINT_REQUEST;
        const ACTIVE_SUSPEND_BARRIER = flags::ACTIVE_SUSPEND_BARRIER;
        const PENDING_FLIP_FUNCTION = flags::PENDING_FLIP_FUNCTION;
        const RUNNING_FLIP_FUNCTION = flags::RUNNING_FLIP_FUNCTION;
        const SUSPENSION_IMMUNE = flags::SUSPENSION_IMMUNE;
        const MONITOR_JNI_ENTRY_EXIT = flags::MONITOR_JNI_ENTRY_EXIT;
    }
}

impl ThreadFlag {
    /// Flags that make a safepoint poll leave its fast path.
    pub const SUSPEND_OR_CHECKPOINT: ThreadFlag =
        ThreadFlag::from_bits_retain(flags::SUSPEND_OR_CHECKPOINT_REQUEST);

    /// Both flip-function flags.
    pub const FLIP_FUNCTION: ThreadFlag =
        ThreadFlag::PENDING_FLIP_FUNCTION.union(ThreadFlag::RUNNING_FLIP_FUNCTION);
}

const STATE_MASK: u32 = 0xf << flags::STATE_SHIFT;

/// A snapshot of the state-and-flags word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StateAndFlags(pub u32);

impl StateAndFlags {
    #[inline]
    pub const fn new(state: ThreadState) -> Self {
        Self((state as u32) << flags::STATE_SHIFT)
    }

    /// Decoded state. An invalid encoding is a corrupted thread record.
    #[inline]
    pub fn state(self) -> ThreadState {
        let bits = (self.0 & STATE_MASK) >> flags::STATE_SHIFT;
        match ThreadState::from_bits(bits) {
            Some(state) => state,
            None => ember_core::fatal!("invalid thread state {} in word {:#010x}", bits, self.0),
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_state(self, state: ThreadState) -> Self {
        Self((self.0 & !STATE_MASK) | ((state as u32) << flags::STATE_SHIFT))
    }

    #[inline]
    pub const fn flags(self) -> ThreadFlag {
        ThreadFlag::from_bits_truncate(self.0 & !STATE_MASK)
    }

    #[inline]
    pub const fn is_flag_set(self, flag: ThreadFlag) -> bool {
        self.0 & flag.bits() == flag.bits()
    }

    #[inline]
    pub const fn is_any_of_flags_set(self, flags: ThreadFlag) -> bool {
        self.0 & flags.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn with_flag(self, flag: ThreadFlag) -> Self {
        Self(self.0 | flag.bits())
    }

    #[inline]
    #[must_use]
    pub const fn without_flag(self, flag: ThreadFlag) -> Self {
        Self(self.0 & !flag.bits())
    }
}

impl fmt::Debug for StateAndFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateAndFlags")
            .field("state", &ThreadState::from_bits((self.0 & STATE_MASK) >> flags::STATE_SHIFT))
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for bits in 0..12 {
            let state = ThreadState::from_bits(bits).unwrap();
            assert_eq!(StateAndFlags::new(state).state(), state);
        }
        assert!(ThreadState::from_bits(12).is_none());
        assert!(ThreadState::from_bits(15).is_none());
    }

    #[test]
    fn test_flags_are_independent_of_state() {
        let word = StateAndFlags::new(ThreadState::Runnable)
            .with_flag(ThreadFlag::SUSPEND_REQUEST)
            .with_flag(ThreadFlag::PENDING_FLIP_FUNCTION);
        assert_eq!(word.state(), ThreadState::Runnable);
        let moved = word.with_state(ThreadState::Suspended);
        assert_eq!(moved.state(), ThreadState::Suspended);
        assert_eq!(moved.flags(), word.flags());
        assert!(moved.is_flag_set(ThreadFlag::SUSPEND_REQUEST));
        assert!(moved.is_any_of_flags_set(ThreadFlag::SUSPEND_OR_CHECKPOINT));
        let cleared = moved.without_flag(ThreadFlag::SUSPEND_REQUEST);
        assert!(!cleared.is_any_of_flags_set(ThreadFlag::SUSPEND_OR_CHECKPOINT));
        assert!(cleared.is_flag_set(ThreadFlag::PENDING_FLIP_FUNCTION));
    }

    #[test]
    #[should_panic(expected = "invalid thread state")]
    fn test_corrupt_state_aborts() {
        StateAndFlags(0xf000_0000).state();
    }
}
