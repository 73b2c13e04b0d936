//! Method bodies: registers, code units and try ranges.

use ember_core::TypeIndex;

/// One typed catch clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchHandler {
    pub type_index: TypeIndex,
    pub address: u32,
}

/// A protected range `[start_addr, start_addr + insn_count)` and its handlers,
/// tried in order before the catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryItem {
    pub start_addr: u32,
    pub insn_count: u32,
    pub handlers: Vec<CatchHandler>,
    pub catch_all: Option<u32>,
}

impl TryItem {
    #[inline]
    pub fn covers(&self, dex_pc: u32) -> bool {
        dex_pc >= self.start_addr && dex_pc - self.start_addr < self.insn_count
    }
}

/// The executable body of a method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeItem {
    pub registers_size: u16,
    /// Incoming arguments occupy the last `ins_size` registers.
    pub ins_size: u16,
    pub outs_size: u16,
    pub insns: Vec<u16>,
    pub tries: Vec<TryItem>,
}

impl CodeItem {
    /// The innermost try range covering `dex_pc`. Ranges never overlap.
    pub fn find_try_item(&self, dex_pc: u32) -> Option<&TryItem> {
        self.tries.iter().find(|t| t.covers(dex_pc))
    }

    /// First register holding an incoming argument.
    #[inline]
    pub fn first_arg_register(&self) -> usize {
        usize::from(self.registers_size - self.ins_size)
    }

    /// Number of code units.
    #[inline]
    pub fn insns_size(&self) -> u32 {
        self.insns.len() as u32
    }
}
