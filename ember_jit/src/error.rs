//! Code generation errors.
//!
//! Encoding misuse is fatal and never surfaces here; these are the
//! conditions a caller can react to by falling back to the interpreter.

use thiserror::Error;

/// Error returned by the code generator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    /// Inconsistent [`crate::CodegenOptions`].
    #[error("invalid codegen options: {0}")]
    InvalidOptions(String),

    /// The graph uses something this backend cannot lower.
    #[error("unsupported {what} on {isa}")]
    Unsupported { what: String, isa: String },

    /// The frame would exceed the configured limit.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// An instruction reached code emission without a location summary.
    #[error("instruction {0} has no location summary")]
    MissingLocations(u32),

    /// An instruction's constraints need more registers than the target has.
    #[error("instruction {0} needs more registers than are allocatable")]
    OutOfRegisters(u32),

    /// The graph is malformed.
    #[error("malformed graph: {0}")]
    MalformedGraph(String),
}

/// Result alias for code generation.
pub type CodegenResult<T> = Result<T, CodegenError>;

impl CodegenError {
    /// Shorthand for [`CodegenError::Unsupported`].
    pub fn unsupported(what: impl Into<String>, isa: impl std::fmt::Display) -> Self {
        CodegenError::Unsupported {
            what: what.into(),
            isa: isa.to_string(),
        }
    }
}
