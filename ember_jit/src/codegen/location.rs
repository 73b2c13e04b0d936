//! Operand locations and per-instruction location summaries.
//!
//! The locations builder fills a [`LocationSummary`] for each instruction
//! with constraints ([`Location::Unallocated`] policies, fixed registers,
//! constants). The allocator replaces every policy with a concrete location
//! before the instruction visitor runs, so visitors only ever see registers,
//! stack slots and constants.

use crate::backend::x64::{CpuRegister, RegisterSet, XmmRegister, XmmSet};
use smallvec::SmallVec;
use std::fmt;

/// Allocation constraint of an unallocated location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Any core register.
    RequiresRegister,
    /// Any XMM register.
    RequiresFpuRegister,
    /// A core register whose low byte is addressable without REX on x86.
    RequiresByteRegister,
    /// A core register, or the constant itself for constant inputs.
    RegisterOrConstant,
    /// Register, stack slot or constant: constant inputs stay constants and
    /// other inputs are used from their home slot.
    Any,
    /// The output reuses input 0's register.
    SameAsFirstInput,
}

/// Where a value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Location {
    #[default]
    Invalid,
    /// Constant operand; raw bits, floats by bit pattern.
    Constant(i64),
    Register(CpuRegister),
    FpuRegister(XmmRegister),
    /// 64-bit value in two 32-bit registers (x86 only).
    RegisterPair { low: CpuRegister, high: CpuRegister },
    /// 32-bit stack slot at `[rsp + offset]`.
    StackSlot(i32),
    /// 64-bit stack slot at `[rsp + offset]`.
    DoubleStackSlot(i32),
    Unallocated(Policy),
}

impl Location {
    #[inline]
    pub const fn requires_register() -> Self {
        Location::Unallocated(Policy::RequiresRegister)
    }

    #[inline]
    pub const fn requires_fpu_register() -> Self {
        Location::Unallocated(Policy::RequiresFpuRegister)
    }

    #[inline]
    pub const fn requires_byte_register() -> Self {
        Location::Unallocated(Policy::RequiresByteRegister)
    }

    #[inline]
    pub const fn register_or_constant() -> Self {
        Location::Unallocated(Policy::RegisterOrConstant)
    }

    #[inline]
    pub const fn any() -> Self {
        Location::Unallocated(Policy::Any)
    }

    #[inline]
    pub const fn same_as_first_input() -> Self {
        Location::Unallocated(Policy::SameAsFirstInput)
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        !matches!(self, Location::Invalid)
    }

    #[inline]
    pub const fn is_register(&self) -> bool {
        matches!(self, Location::Register(_))
    }

    #[inline]
    pub const fn is_fpu_register(&self) -> bool {
        matches!(self, Location::FpuRegister(_))
    }

    #[inline]
    pub const fn is_register_pair(&self) -> bool {
        matches!(self, Location::RegisterPair { .. })
    }

    #[inline]
    pub const fn is_constant(&self) -> bool {
        matches!(self, Location::Constant(_))
    }

    #[inline]
    pub const fn is_stack_slot(&self) -> bool {
        matches!(self, Location::StackSlot(_) | Location::DoubleStackSlot(_))
    }

    #[inline]
    pub const fn is_unallocated(&self) -> bool {
        matches!(self, Location::Unallocated(_))
    }

    /// Core register; aborts on anything else.
    #[inline]
    pub fn reg(&self) -> CpuRegister {
        match self {
            Location::Register(r) => *r,
            other => ember_core::fatal!("expected a core register, found {}", other),
        }
    }

    /// XMM register; aborts on anything else.
    #[inline]
    pub fn xmm(&self) -> XmmRegister {
        match self {
            Location::FpuRegister(r) => *r,
            other => ember_core::fatal!("expected an xmm register, found {}", other),
        }
    }

    /// Low half of a register pair.
    #[inline]
    pub fn low(&self) -> CpuRegister {
        match self {
            Location::RegisterPair { low, .. } => *low,
            other => ember_core::fatal!("expected a register pair, found {}", other),
        }
    }

    /// High half of a register pair.
    #[inline]
    pub fn high(&self) -> CpuRegister {
        match self {
            Location::RegisterPair { high, .. } => *high,
            other => ember_core::fatal!("expected a register pair, found {}", other),
        }
    }

    /// Constant bits; aborts on anything else.
    #[inline]
    pub fn constant(&self) -> i64 {
        match self {
            Location::Constant(v) => *v,
            other => ember_core::fatal!("expected a constant, found {}", other),
        }
    }

    /// Stack offset of a slot; aborts on anything else.
    #[inline]
    pub fn stack_offset(&self) -> i32 {
        match self {
            Location::StackSlot(o) | Location::DoubleStackSlot(o) => *o,
            other => ember_core::fatal!("expected a stack slot, found {}", other),
        }
    }

    /// Whether two locations name overlapping storage.
    pub fn overlaps(&self, other: &Location) -> bool {
        match (self, other) {
            (Location::Register(a), Location::Register(b)) => a == b,
            (Location::RegisterPair { low, high }, Location::Register(r))
            | (Location::Register(r), Location::RegisterPair { low, high }) => r == low || r == high,
            (Location::RegisterPair { low: a, high: b }, Location::RegisterPair { low: c, high: d }) => {
                a == c || a == d || b == c || b == d
            }
            (Location::FpuRegister(a), Location::FpuRegister(b)) => a == b,
            (a, b) if a.is_stack_slot() && b.is_stack_slot() => {
                let (ao, al) = a.stack_extent();
                let (bo, bl) = b.stack_extent();
                ao < bo + bl && bo < ao + al
            }
            _ => false,
        }
    }

    fn stack_extent(&self) -> (i32, i32) {
        match self {
            Location::StackSlot(o) => (*o, 4),
            Location::DoubleStackSlot(o) => (*o, 8),
            _ => (0, 0),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Invalid => f.write_str("invalid"),
            Location::Constant(v) => write!(f, "#{v}"),
            Location::Register(r) => write!(f, "{r}"),
            Location::FpuRegister(r) => write!(f, "{r}"),
            Location::RegisterPair { low, high } => write!(f, "{}:{}", low.name_32(), high.name_32()),
            Location::StackSlot(o) => write!(f, "[sp+{o}]"),
            Location::DoubleStackSlot(o) => write!(f, "[sp+{o}]:64"),
            Location::Unallocated(p) => write!(f, "{p:?}"),
        }
    }
}

/// Whether and how an instruction calls out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallKind {
    #[default]
    NoCall,
    /// Only its slow path calls; live registers are saved around it.
    CallOnSlowPath,
    /// The main path calls; caller-save registers are clobbered.
    CallOnMainOnly,
    /// Both paths call.
    CallOnMainAndSlowPath,
}

/// Constraints and allocation results for one instruction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocationSummary {
    inputs: SmallVec<[Location; 4]>,
    temps: SmallVec<[Location; 2]>,
    output: Location,
    output_overlaps: bool,
    call_kind: CallKind,
    intrinsified: bool,
    custom_slow_path_caller_saves: Option<RegisterSet>,
    /// Core registers a slow path must preserve.
    pub live_registers: RegisterSet,
    /// XMM registers a slow path must preserve.
    pub live_fpu_registers: XmmSet,
    /// Registers that hold live references at the slow-path call.
    pub reference_registers: RegisterSet,
}

impl LocationSummary {
    /// Summary for an instruction with `num_inputs` inputs.
    pub fn new(num_inputs: usize, call_kind: CallKind) -> Self {
        Self {
            inputs: SmallVec::from_elem(Location::Invalid, num_inputs),
            call_kind,
            output_overlaps: true,
            ..Self::default()
        }
    }

    /// Summary for an intrinsic expansion.
    pub fn intrinsified(num_inputs: usize, call_kind: CallKind) -> Self {
        Self {
            intrinsified: true,
            ..Self::new(num_inputs, call_kind)
        }
    }

    pub fn set_in_at(&mut self, index: usize, location: Location) {
        self.inputs[index] = location;
    }

    #[inline]
    pub fn in_at(&self, index: usize) -> Location {
        self.inputs.get(index).copied().unwrap_or_default()
    }

    pub fn inputs(&self) -> &[Location] {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut [Location] {
        &mut self.inputs
    }

    pub fn add_temp(&mut self, location: Location) {
        self.temps.push(location);
    }

    #[inline]
    pub fn temp(&self, index: usize) -> Location {
        self.temps.get(index).copied().unwrap_or_default()
    }

    pub fn temps(&self) -> &[Location] {
        &self.temps
    }

    pub fn temps_mut(&mut self) -> &mut [Location] {
        &mut self.temps
    }

    /// Set the output; `overlaps` false lets it share an input register.
    pub fn set_out(&mut self, location: Location, overlaps: bool) {
        self.output = location;
        self.output_overlaps = overlaps;
    }

    #[inline]
    pub fn out(&self) -> Location {
        self.output
    }

    pub fn out_mut(&mut self) -> &mut Location {
        &mut self.output
    }

    #[inline]
    pub fn output_overlaps(&self) -> bool {
        self.output_overlaps
    }

    #[inline]
    pub fn call_kind(&self) -> CallKind {
        self.call_kind
    }

    /// Whether any path calls out.
    #[inline]
    pub fn can_call(&self) -> bool {
        self.call_kind != CallKind::NoCall
    }

    /// Whether the main path calls out.
    #[inline]
    pub fn calls_on_main_path(&self) -> bool {
        matches!(self.call_kind, CallKind::CallOnMainOnly | CallKind::CallOnMainAndSlowPath)
    }

    /// Restrict what a slow path must save, for runtime entries that
    /// preserve more than the native convention.
    pub fn set_custom_slow_path_caller_saves(&mut self, saves: RegisterSet) {
        self.custom_slow_path_caller_saves = Some(saves);
    }

    #[inline]
    pub fn custom_slow_path_caller_saves(&self) -> Option<RegisterSet> {
        self.custom_slow_path_caller_saves
    }

    #[inline]
    pub fn is_intrinsified(&self) -> bool {
        self.intrinsified
    }

    /// Every location in the summary.
    pub fn all(&self) -> impl Iterator<Item = &Location> {
        self.inputs.iter().chain(self.temps.iter()).chain(std::iter::once(&self.output))
    }

    /// Whether every location is concrete.
    pub fn is_allocated(&self) -> bool {
        self.all().all(|l| !l.is_unallocated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_accessors() {
        assert_eq!(Location::Register(CpuRegister::RBX).reg(), CpuRegister::RBX);
        assert_eq!(Location::Constant(-3).constant(), -3);
        assert_eq!(Location::DoubleStackSlot(16).stack_offset(), 16);
        assert!(Location::any().is_unallocated());
        assert!(!Location::Invalid.is_valid());
    }

    #[test]
    #[should_panic(expected = "expected a core register")]
    fn test_reg_on_slot_is_fatal() {
        Location::StackSlot(8).reg();
    }

    #[test]
    fn test_overlap() {
        assert!(Location::DoubleStackSlot(8).overlaps(&Location::StackSlot(12)));
        assert!(!Location::StackSlot(8).overlaps(&Location::StackSlot(12)));
        assert!(Location::Register(CpuRegister::RAX).overlaps(&Location::Register(CpuRegister::RAX)));
        assert!(!Location::Register(CpuRegister::RAX).overlaps(&Location::FpuRegister(XmmRegister::XMM0)));
        let pair = Location::RegisterPair {
            low: CpuRegister::RAX,
            high: CpuRegister::RDX,
        };
        assert!(pair.overlaps(&Location::Register(CpuRegister::RDX)));
        assert_eq!(pair.to_string(), "eax:edx");
        assert_eq!(pair.high(), CpuRegister::RDX);
    }

    #[test]
    fn test_summary() {
        let mut s = LocationSummary::new(2, CallKind::CallOnSlowPath);
        s.set_in_at(0, Location::requires_register());
        s.set_in_at(1, Location::Constant(4));
        s.set_out(Location::same_as_first_input(), true);
        assert!(s.can_call());
        assert!(!s.calls_on_main_path());
        assert!(!s.is_allocated());
        s.set_in_at(0, Location::Register(CpuRegister::RCX));
        *s.out_mut() = Location::Register(CpuRegister::RCX);
        assert!(s.is_allocated());
        assert_eq!(s.in_at(5), Location::Invalid);
    }
}
