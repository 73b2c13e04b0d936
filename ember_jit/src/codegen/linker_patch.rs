//! Linker patches recorded for PC-relative references.
//!
//! The compiler emits a placeholder displacement and records where it is;
//! the linker later replaces it with the real distance from the anchor to
//! the target (boot-image object, `.bss` slot or relocated entry).

use super::hir::InstructionId;

/// Placeholder written into patched displacement fields.
pub const PLACEHOLDER_32BIT_OFFSET: i32 = 256;

/// What a patch refers to. The patch's `target` is an index whose meaning
/// depends on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// Boot-image method; target is a method index.
    BootImageMethod,
    /// Boot-image class; target is a type index.
    BootImageType,
    /// Boot-image string; target is a string index.
    BootImageString,
    MethodBssEntry,
    TypeBssEntry,
    StringBssEntry,
    /// Slot of the app image's relocated table of boot-image pointers;
    /// target is the slot number.
    AppImageRelRo,
    /// Native entry of a JNI method; target is a method index.
    JniEntrypoint,
    /// Boot-image object backing an intrinsic; target is its image offset.
    IntrinsicObject,
    /// Target is a proto index.
    MethodTypeBssEntry,
}

impl PatchKind {
    /// Whether the target lives in a `.bss` slot the runtime fills lazily.
    pub const fn is_bss_entry(self) -> bool {
        matches!(
            self,
            PatchKind::MethodBssEntry
                | PatchKind::TypeBssEntry
                | PatchKind::StringBssEntry
                | PatchKind::MethodTypeBssEntry
        )
    }
}

/// One patch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkerPatch {
    pub kind: PatchKind,
    /// Offset of the 32-bit field to rewrite.
    pub literal_offset: u32,
    /// Code offset the displacement is relative to.
    pub pc_insn_offset: u32,
    pub target: u32,
}

impl LinkerPatch {
    /// Resolve the patch given the target's address relative to code start.
    pub fn displacement_to(&self, target_offset: i64) -> i32 {
        (target_offset - self.pc_insn_offset as i64) as i32
    }
}

/// Patch site not yet tied to its anchor; x86 patches reference the
/// [`ComputeBaseMethodAddress`](super::hir::HKind::ComputeBaseMethodAddress)
/// that materialized the anchor register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingPatch {
    pub kind: PatchKind,
    pub literal_offset: u32,
    pub anchor: PatchAnchor,
    pub target: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PatchAnchor {
    /// End of the instruction, for RIP-relative operands.
    NextInstruction,
    /// Address computed by this instruction.
    BaseMethodAddress(InstructionId),
}

/// Apply resolved displacements to code; used by tests and in-memory
/// installation.
pub fn apply_patches(code: &mut [u8], patches: &[LinkerPatch], resolve: impl Fn(&LinkerPatch) -> i64) {
    for patch in patches {
        let at = patch.literal_offset as usize;
        let value = patch.displacement_to(resolve(patch));
        code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_displacement() {
        let p = LinkerPatch {
            kind: PatchKind::TypeBssEntry,
            literal_offset: 3,
            pc_insn_offset: 7,
            target: 1,
        };
        assert_eq!(p.displacement_to(107), 100);
        assert_eq!(p.displacement_to(0), -7);
        assert!(p.kind.is_bss_entry());
        assert!(!PatchKind::AppImageRelRo.is_bss_entry());
    }

    #[test]
    fn test_apply() {
        let mut code = vec![0x8B, 0x05, 0, 1, 0, 0, 0x90];
        code[2..6].copy_from_slice(&PLACEHOLDER_32BIT_OFFSET.to_le_bytes());
        let patch = LinkerPatch {
            kind: PatchKind::StringBssEntry,
            literal_offset: 2,
            pc_insn_offset: 6,
            target: 4,
        };
        apply_patches(&mut code, &[patch], |p| 0x40 + p.target as i64 + 2);
        assert_eq!(&code[2..6], &0x40i32.to_le_bytes());
    }
}
