//! # Ember Core
//!
//! Foundational types shared by every ember crate:
//!
//! - **ABI**: thread flag bits and offsets shared with generated code
//! - **Errors**: the `EmberError` hierarchy and the `fatal!` abort path
//! - **References**: arena handles for objects, classes, methods and fields
//! - **Bits**: operand-range predicates used by the assembler and the decoder
//! - **Arithmetic**: two's-complement and IEEE helpers with managed-language semantics

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod abi;
pub mod arith;
pub mod bits;
pub mod error;
pub mod refs;

pub use error::{EmberError, EmberResult};
pub use refs::{
    ClassId, FieldId, FieldIndex, MethodId, MethodIndex, ObjRef, ProtoIndex, StringIndex,
    ThreadId, TypeIndex,
};

/// Ember runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Abort the current operation because an internal invariant was violated.
///
/// Internal errors are not recoverable: the message is logged at `error`
/// level and the thread panics. Use this for malformed state, unknown
/// opcodes and encoder operand-constraint violations.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        ::tracing::error!(target: "ember::fatal", "{}", message);
        panic!("fatal: {}", message)
    }};
}

/// Check an invariant and abort through [`fatal!`] when it does not hold.
#[macro_export]
macro_rules! check {
    ($cond:expr) => {
        if !$cond {
            $crate::fatal!("check failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::fatal!($($arg)*);
        }
    };
}
