//! End-to-end compilation of small graphs.

use ember_core::{MethodIndex, TypeIndex};
use ember_jit::codegen::{
    compile, BlockId, ComparisonBias, CompiledMethod, DataType, DispatchInfo, HGraph, HKind, IfCondition, Intrinsic,
    LoadKind, MethodLoadKind, PatchKind, SafepointKind, PLACEHOLDER_32BIT_OFFSET,
};
use ember_jit::{CodegenOptions, InstructionSet};
use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, Register};

fn decode(method: &CompiledMethod) -> Vec<Instruction> {
    let bits = match method.instruction_set {
        InstructionSet::X86_64 => 64,
        InstructionSet::X86 => 32,
    };
    let mut decoder = Decoder::with_ip(bits, method.instructions(), 0, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        out.push(decoder.decode());
    }
    out
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn test_add_and_return() {
    let mut g = HGraph::new(MethodIndex(1), true);
    let entry = g.add_block();
    let a = g.add(entry, HKind::Parameter { index: 0 }, DataType::Int32, &[], 0);
    let b = g.add(entry, HKind::Parameter { index: 1 }, DataType::Int32, &[], 0);
    let sum = g.add(entry, HKind::Add, DataType::Int32, &[a, b], 1);
    g.add(entry, HKind::Return, DataType::Void, &[sum], 2);

    let method = compile(&mut g, &CodegenOptions::plain()).unwrap();
    assert_eq!(method.instruction_set, InstructionSet::X86_64);
    assert_eq!(method.frame_size % 16, 0);
    assert!(method.patches.is_empty());
    let decoded = decode(&method);
    assert!(decoded.iter().all(|i| !i.is_invalid()));
    assert!(decoded.iter().any(|i| i.mnemonic() == Mnemonic::Add));
    assert!(decoded.iter().any(|i| i.mnemonic() == Mnemonic::Ret));
}

#[test]
fn test_negate_and_complement_pick_operand_width() {
    for (ty, neg, not) in [
        (DataType::Int32, Code::Neg_rm32, Code::Not_rm32),
        (DataType::Int64, Code::Neg_rm64, Code::Not_rm64),
    ] {
        let mut g = HGraph::new(MethodIndex(1), true);
        let entry = g.add_block();
        let x = g.add(entry, HKind::Parameter { index: 0 }, ty, &[], 0);
        let negated = g.add(entry, HKind::Neg, ty, &[x], 1);
        let flipped = g.add(entry, HKind::Not, ty, &[negated], 2);
        g.add(entry, HKind::Return, DataType::Void, &[flipped], 3);

        let method = compile(&mut g, &CodegenOptions::plain()).unwrap();
        let codes: Vec<Code> = decode(&method).iter().map(|i| i.code()).collect();
        assert!(codes.contains(&neg), "{ty:?}: {codes:?}");
        assert!(codes.contains(&not), "{ty:?}: {codes:?}");
    }
}

#[test]
fn test_loop_back_edge_polls_suspend() {
    let mut g = HGraph::new(MethodIndex(2), true);
    let entry = g.add_block();
    let header = g.add_block();
    let body = g.add_block();
    let exit = g.add_block();
    let n = g.add(entry, HKind::Parameter { index: 0 }, DataType::Int32, &[], 0);
    g.add(entry, HKind::Goto { target: header }, DataType::Void, &[], 0);

    g.add(header, HKind::SuspendCheck, DataType::Void, &[], 1);
    let zero = g.add(header, HKind::IntConstant(0), DataType::Int32, &[], 1);
    let cond = g.add(
        header,
        HKind::Condition {
            cond: IfCondition::Gt,
            bias: ComparisonBias::None,
        },
        DataType::Bool,
        &[n, zero],
        2,
    );
    g.add(
        header,
        HKind::If {
            true_block: body,
            false_block: exit,
        },
        DataType::Void,
        &[cond],
        2,
    );
    g.add(body, HKind::Goto { target: header }, DataType::Void, &[], 3);
    g.add(exit, HKind::ReturnVoid, DataType::Void, &[], 4);

    let method = compile(&mut g, &CodegenOptions::plain()).unwrap();
    let polls = decode(&method)
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Test && i.segment_prefix() == Register::GS)
        .count();
    // The header's check moves to the single back edge.
    assert_eq!(polls, 1);
    assert!(method
        .stack_map
        .entries()
        .iter()
        .any(|e| e.kind == SafepointKind::SlowPath));
}

#[test]
fn test_reference_store_marks_card() {
    let mut g = HGraph::new(MethodIndex(3), false);
    let entry = g.add_block();
    let this = g.add(entry, HKind::Parameter { index: 0 }, DataType::Reference, &[], 0);
    let value = g.add(entry, HKind::Parameter { index: 1 }, DataType::Reference, &[], 0);
    g.add(
        entry,
        HKind::InstanceFieldSet {
            offset: 8,
            volatile: false,
            value_can_be_null: true,
        },
        DataType::Void,
        &[this, value],
        1,
    );
    g.add(entry, HKind::ReturnVoid, DataType::Void, &[], 2);

    let options = CodegenOptions::plain();
    let method = compile(&mut g, &options).unwrap();
    let decoded = decode(&method);
    let store = decoded
        .iter()
        .position(|i| {
            i.mnemonic() == Mnemonic::Mov
                && i.op0_register() == Register::None
                && i.memory_base() != Register::RSP
                && i.memory_displacement64() == 8
        })
        .expect("field store");
    let card_table = decoded
        .iter()
        .position(|i| i.mnemonic() == Mnemonic::Mov && i.segment_prefix() == Register::GS)
        .expect("card table load");
    assert!(card_table > store);
    assert!(decoded[card_table..]
        .iter()
        .any(|i| i.mnemonic() == Mnemonic::Shr && i.immediate(1) == u64::from(options.card_shift)));
}

#[test]
fn test_bss_invoke_records_patch_and_safepoint() {
    let mut g = HGraph::new(MethodIndex(4), true);
    let entry = g.add_block();
    g.add(
        entry,
        HKind::InvokeStaticOrDirect {
            method: MethodIndex(7),
            dispatch: DispatchInfo::via_method(MethodLoadKind::BssEntry),
        },
        DataType::Void,
        &[],
        5,
    );
    g.add(entry, HKind::ReturnVoid, DataType::Void, &[], 6);

    let method = compile(&mut g, &CodegenOptions::default()).unwrap();
    let patch = method
        .patches
        .iter()
        .find(|p| p.kind == PatchKind::MethodBssEntry)
        .expect("bss patch");
    assert_eq!(patch.target, 7);
    assert_eq!(patch.pc_insn_offset, patch.literal_offset + 4);
    let at = patch.literal_offset as usize;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&method.code[at..at + 4]);
    assert_eq!(i32::from_le_bytes(raw), PLACEHOLDER_32BIT_OFFSET);

    let call = method
        .stack_map
        .entries()
        .iter()
        .find(|e| e.kind == SafepointKind::Call)
        .expect("call safepoint");
    assert_eq!(call.dex_pc, 5);
    assert_eq!(method.stack_map.lookup(call.native_pc).map(|e| e.dex_pc), Some(5));
}

#[test]
fn test_x86_bss_load_anchors_on_base_address() {
    let mut g = HGraph::new(MethodIndex(5), true);
    let entry = g.add_block();
    let base = g.add(entry, HKind::ComputeBaseMethodAddress, DataType::Int32, &[], 0);
    let class = g.add(
        entry,
        HKind::LoadClass {
            type_index: TypeIndex(9),
            kind: LoadKind::BssEntry,
        },
        DataType::Reference,
        &[base],
        1,
    );
    g.add(entry, HKind::Return, DataType::Void, &[class], 2);

    let method = compile(&mut g, &CodegenOptions::x86()).unwrap();
    let decoded = decode(&method);
    let call = decoded
        .iter()
        .position(|i| i.mnemonic() == Mnemonic::Call)
        .expect("base address call");
    let pop = &decoded[call + 1];
    assert_eq!(decoded[call].near_branch_target(), pop.ip());
    assert_eq!(pop.mnemonic(), Mnemonic::Pop);

    let patch = method
        .patches
        .iter()
        .find(|p| p.kind == PatchKind::TypeBssEntry)
        .expect("type patch");
    assert_eq!(patch.target, 9);
    assert_eq!(u64::from(patch.pc_insn_offset), pop.ip());
}

#[test]
fn test_string_equals_is_expanded() {
    let mut g = HGraph::new(MethodIndex(6), true);
    let entry = g.add_block();
    let a = g.add(entry, HKind::Parameter { index: 0 }, DataType::Reference, &[], 0);
    let b = g.add(entry, HKind::Parameter { index: 1 }, DataType::Reference, &[], 0);
    let eq = g.add(
        entry,
        HKind::InvokeIntrinsic {
            method: MethodIndex(11),
            intrinsic: Intrinsic::StringEquals,
        },
        DataType::Bool,
        &[a, b],
        1,
    );
    g.add(entry, HKind::Return, DataType::Void, &[eq], 2);

    let method = compile(&mut g, &CodegenOptions::plain()).unwrap();
    // repe cmpsq
    assert!(contains(method.instructions(), &[0xF3, 0x48, 0xA7]));
    assert!(method.patches.is_empty());
}

#[test]
fn test_malformed_graph_is_rejected() {
    let mut g = HGraph::new(MethodIndex(7), true);
    let entry = g.add_block();
    g.add(entry, HKind::IntConstant(1), DataType::Int32, &[], 0);
    assert!(compile(&mut g, &CodegenOptions::plain()).is_err());

    let mut g = HGraph::new(MethodIndex(8), true);
    let entry = g.add_block();
    g.add(entry, HKind::Goto { target: BlockId(4) }, DataType::Void, &[], 0);
    assert!(compile(&mut g, &CodegenOptions::plain()).is_err());
}
