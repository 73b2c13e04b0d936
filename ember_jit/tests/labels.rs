//! Label resolution under random branch layouts.

use ember_jit::backend::x64::{Assembler, Condition, Label, NearLabel};
use ember_jit::InstructionSet;
use iced_x86::{Decoder, DecoderOptions, Mnemonic};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Branch {
    Forward(usize),
    Backward(usize),
    NearForward(usize),
}

fn branch() -> impl Strategy<Value = Branch> {
    prop_oneof![
        (0usize..400).prop_map(Branch::Forward),
        (0usize..400).prop_map(Branch::Backward),
        (0usize..100).prop_map(Branch::NearForward),
    ]
}

/// Emit every branch as a `je` and return the offsets their targets were
/// bound at, in code order.
fn emit(asm: &mut Assembler, branches: &[Branch]) -> Vec<u64> {
    let mut targets = Vec::with_capacity(branches.len());
    for &b in branches {
        match b {
            Branch::Forward(padding) => {
                let mut label = Label::new();
                asm.j(Condition::Equal, &mut label);
                asm.nop_bytes(padding);
                targets.push(asm.code_size() as u64);
                asm.bind(&mut label);
            }
            Branch::Backward(padding) => {
                let mut label = Label::new();
                targets.push(asm.code_size() as u64);
                asm.bind(&mut label);
                asm.nop_bytes(padding);
                asm.j(Condition::Equal, &mut label);
            }
            Branch::NearForward(padding) => {
                let mut label = NearLabel::new();
                asm.j_near(Condition::Equal, &mut label);
                asm.nop_bytes(padding);
                targets.push(asm.code_size() as u64);
                asm.bind_near(&mut label);
            }
        }
    }
    targets
}

fn decoded_targets(bits: u32, code: &[u8]) -> Vec<u64> {
    let mut decoder = Decoder::with_ip(bits, code, 0, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        let instr = decoder.decode();
        assert!(!instr.is_invalid());
        if instr.mnemonic() == Mnemonic::Je {
            out.push(instr.near_branch_target());
        }
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_branches_land_on_bound_offsets(branches in prop::collection::vec(branch(), 1..24)) {
        let mut asm = Assembler::new(InstructionSet::X86_64);
        let targets = emit(&mut asm, &branches);
        asm.ret();
        prop_assert_eq!(decoded_targets(64, asm.code()), targets);
    }

    #[test]
    fn test_branches_in_32bit_mode(branches in prop::collection::vec(branch(), 1..12)) {
        let mut asm = Assembler::new(InstructionSet::X86);
        let targets = emit(&mut asm, &branches);
        asm.ret();
        prop_assert_eq!(decoded_targets(32, asm.code()), targets);
    }
}

#[test]
fn test_many_uses_of_one_label() {
    let mut asm = Assembler::new(InstructionSet::X86_64);
    let mut exit = Label::new();
    for _ in 0..10 {
        asm.j(Condition::Equal, &mut exit);
        asm.nop_bytes(30);
    }
    let bound = asm.code_size() as u64;
    asm.bind(&mut exit);
    asm.ret();
    let targets = decoded_targets(64, asm.code());
    assert_eq!(targets.len(), 10);
    assert!(targets.iter().all(|&t| t == bound));
}
