//! Error types and result definitions for ember.
//!
//! Managed exceptions never travel through this type: they live in the
//! pending-exception slot of the thread. `EmberError` covers the runtime's
//! own failures at crate boundaries (resolution, encoding, protocol misuse).

use thiserror::Error;

/// The unified result type used throughout ember.
pub type EmberResult<T> = Result<T, EmberError>;

/// Runtime-level error conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmberError {
    /// An operation observed a state it cannot proceed from.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Error description.
        message: String,
    },

    /// A code unit did not decode to a defined opcode.
    #[error("invalid opcode 0x{opcode:02x} at dex pc {dex_pc}")]
    InvalidOpcode {
        /// The raw opcode byte.
        opcode: u8,
        /// Location of the offending instruction.
        dex_pc: u32,
    },

    /// A symbolic reference could not be resolved.
    #[error("resolution failed: {what}")]
    ResolutionFailed {
        /// Description of the unresolved entity.
        what: String,
    },

    /// The heap could not satisfy an allocation.
    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory {
        /// Requested size.
        bytes: usize,
    },

    /// A label was referenced but never bound before finalization.
    #[error("unbound label referenced at offset {position}")]
    UnboundLabel {
        /// Position of the first unresolved link.
        position: usize,
    },

    /// An instruction could not be encoded with the requested operands.
    #[error("encoding error: {message}")]
    Encoding {
        /// Error description.
        message: String,
    },

    /// The operation requires the target thread to be suspended.
    #[error("thread {thread} is not suspended")]
    ThreadNotSuspended {
        /// Target thread id.
        thread: u32,
    },

    /// A protocol step did not complete in time.
    #[error("timed out after {millis} ms waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// Elapsed wait.
        millis: u64,
    },
}

impl EmberError {
    /// Create an invalid-state error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a resolution failure.
    #[must_use]
    pub fn resolution(what: impl Into<String>) -> Self {
        Self::ResolutionFailed { what: what.into() }
    }

    /// Create an encoding error.
    #[must_use]
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(what: impl Into<String>, millis: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            millis,
        }
    }
}
