//! Code generation options.
//!
//! Resolved once per compilation from the heap configuration and the host
//! CPU. Everything the emitter decides from configuration (barrier scheme,
//! poisoning, null-check style, AVX availability) reads it from here.

use bitflags::bitflags;
use ember_gc::{GcConfig, ReadBarrierKind};
use std::fmt;

use crate::error::CodegenError;

/// Target instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InstructionSet {
    /// 32-bit x86. Encodings needing REX are rejected.
    X86,
    /// x86-64.
    #[default]
    X86_64,
}

impl InstructionSet {
    /// Native pointer size in bytes.
    #[inline]
    pub const fn pointer_size(self) -> usize {
        match self {
            InstructionSet::X86 => 4,
            InstructionSet::X86_64 => 8,
        }
    }

    /// Whether 64-bit operand sizes are encodable.
    #[inline]
    pub const fn is_64bit(self) -> bool {
        matches!(self, InstructionSet::X86_64)
    }
}

impl fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstructionSet::X86 => "x86",
            InstructionSet::X86_64 => "x86_64",
        })
    }
}

bitflags! {
    /// Optional CPU features the emitter may use.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CpuFeatures: u32 {
        const SSE4_1 = 1 << 0;
        const POPCNT = 1 << 1;
        const LZCNT = 1 << 2;
        const BMI1 = 1 << 3;
        const AVX = 1 << 4;
        const AVX2 = 1 << 5;
    }
}

/// Options for one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodegenOptions {
    /// Target ISA.
    pub instruction_set: InstructionSet,
    /// Read barrier emitted around reference loads.
    pub read_barrier: ReadBarrierKind,
    /// Heap references are stored negated.
    pub heap_poisoning: bool,
    /// Null checks fault on the first access instead of testing first.
    pub implicit_null_checks: bool,
    /// Card-table shift used by write barriers.
    pub card_shift: u32,
    /// Available CPU features.
    pub features: CpuFeatures,
    /// Largest frame the generator will lay out.
    pub max_frame_size: usize,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            instruction_set: InstructionSet::X86_64,
            read_barrier: ReadBarrierKind::Baker,
            heap_poisoning: false,
            implicit_null_checks: true,
            card_shift: 10,
            features: CpuFeatures::SSE4_1 | CpuFeatures::POPCNT,
            max_frame_size: 64 * 1024,
        }
    }
}

impl CodegenOptions {
    /// Options matching a heap configuration.
    pub fn for_heap(config: &GcConfig) -> Self {
        Self {
            read_barrier: config.read_barrier,
            heap_poisoning: config.heap_poisoning,
            card_shift: config.card_shift,
            ..Self::default()
        }
    }

    /// Options for 32-bit x86.
    pub fn x86() -> Self {
        Self {
            instruction_set: InstructionSet::X86,
            ..Self::default()
        }
    }

    /// Every test branch explicit, no barriers; handy for byte-level tests.
    pub fn plain() -> Self {
        Self {
            read_barrier: ReadBarrierKind::None,
            implicit_null_checks: false,
            ..Self::default()
        }
    }

    /// Whether an optional feature may be used.
    #[inline]
    pub fn has(&self, feature: CpuFeatures) -> bool {
        self.features.contains(feature)
    }

    /// Check option consistency.
    pub fn validate(&self) -> Result<(), CodegenError> {
        if self.has(CpuFeatures::AVX2) && !self.has(CpuFeatures::AVX) {
            return Err(CodegenError::InvalidOptions("avx2 requires avx".into()));
        }
        if !(4..=20).contains(&self.card_shift) {
            return Err(CodegenError::InvalidOptions(format!(
                "card shift {} out of range",
                self.card_shift
            )));
        }
        if self.max_frame_size % 16 != 0 {
            return Err(CodegenError::InvalidOptions(
                "max frame size must be 16-byte aligned".into(),
            ));
        }
        Ok(())
    }
}
