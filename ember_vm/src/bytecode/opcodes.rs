//! The dex opcode table.
//!
//! Every opcode is listed exactly once in [`dex_instruction_list`]. The
//! list drives the [`Opcode`] enum, its per-opcode properties and the
//! interpreter's dispatch switch, so adding an opcode means adding one line.

use bitflags::bitflags;
use std::fmt;

// =============================================================================
// Formats
// =============================================================================

/// Instruction encoding format.
///
/// The name spells the size in code units, the number of registers and the
/// kind of extra data (`x` none, `n` nibble literal, `b` byte literal,
/// `s` short literal, `i` int literal, `l` long literal, `h` high literal,
/// `t` branch target, `c` constant-pool index, `r` register range).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionFormat {
    K10x,
    K12x,
    K11n,
    K11x,
    K10t,
    K20t,
    K20bc,
    K22x,
    K21t,
    K21s,
    K21h,
    K21c,
    K23x,
    K22b,
    K22t,
    K22s,
    K22c,
    K32x,
    K30t,
    K31t,
    K31i,
    K31c,
    K35c,
    K3rc,
    K45cc,
    K4rcc,
    K51l,
}

impl InstructionFormat {
    /// Encoded size in 16-bit code units.
    pub const fn size_in_code_units(self) -> usize {
        use InstructionFormat::*;
        match self {
            K10x | K12x | K11n | K11x | K10t => 1,
            K20t | K20bc | K22x | K21t | K21s | K21h | K21c | K23x | K22b | K22t | K22s | K22c => 2,
            K32x | K30t | K31t | K31i | K31c | K35c | K3rc => 3,
            K45cc | K4rcc => 4,
            K51l => 5,
        }
    }
}

/// What an instruction's index operand refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    None,
    StringRef,
    TypeRef,
    FieldRef,
    MethodRef,
    /// Method in B, prototype in H.
    MethodAndProtoRef,
    CallSiteRef,
    MethodHandleRef,
    ProtoRef,
}

bitflags! {
    /// Control-flow properties of an opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstructionFlags: u8 {
        /// May fall through to the next instruction.
        const CONTINUE = 1 << 0;
        /// Has a branch target.
        const BRANCH = 1 << 1;
        /// Is a packed or sparse switch.
        const SWITCH = 1 << 2;
        /// May throw.
        const THROW = 1 << 3;
        /// Leaves the method.
        const RETURN = 1 << 4;
        /// Calls a method.
        const INVOKE = 1 << 5;
    }
}

// =============================================================================
// The list
// =============================================================================

/// Invoke `$m!` with every opcode as
/// `value, Variant, handler, "name", Format, IndexType, [FLAGS];`.
macro_rules! dex_instruction_list {
    ($m:ident) => {
        $m! {
            0x00, Nop, nop, "nop", K10x, None, [CONTINUE];
            0x01, Move, move_, "move", K12x, None, [CONTINUE];
            0x02, MoveFrom16, move_from16, "move/from16", K22x, None, [CONTINUE];
            0x03, Move16, move_16, "move/16", K32x, None, [CONTINUE];
            0x04, MoveWide, move_wide, "move-wide", K12x, None, [CONTINUE];
            0x05, MoveWideFrom16, move_wide_from16, "move-wide/from16", K22x, None, [CONTINUE];
            0x06, MoveWide16, move_wide_16, "move-wide/16", K32x, None, [CONTINUE];
            0x07, MoveObject, move_object, "move-object", K12x, None, [CONTINUE];
            0x08, MoveObjectFrom16, move_object_from16, "move-object/from16", K22x, None, [CONTINUE];
            0x09, MoveObject16, move_object_16, "move-object/16", K32x, None, [CONTINUE];
            0x0a, MoveResult, move_result, "move-result", K11x, None, [CONTINUE];
            0x0b, MoveResultWide, move_result_wide, "move-result-wide", K11x, None, [CONTINUE];
            0x0c, MoveResultObject, move_result_object, "move-result-object", K11x, None, [CONTINUE];
            0x0d, MoveException, move_exception, "move-exception", K11x, None, [CONTINUE];
            0x0e, ReturnVoid, return_void, "return-void", K10x, None, [RETURN];
            0x0f, Return, return_, "return", K11x, None, [RETURN];
            0x10, ReturnWide, return_wide, "return-wide", K11x, None, [RETURN];
            0x11, ReturnObject, return_object, "return-object", K11x, None, [RETURN];
            0x12, Const4, const_4, "const/4", K11n, None, [CONTINUE];
            0x13, Const16, const_16, "const/16", K21s, None, [CONTINUE];
            0x14, Const, const_, "const", K31i, None, [CONTINUE];
            0x15, ConstHigh16, const_high16, "const/high16", K21h, None, [CONTINUE];
            0x16, ConstWide16, const_wide_16, "const-wide/16", K21s, None, [CONTINUE];
            0x17, ConstWide32, const_wide_32, "const-wide/32", K31i, None, [CONTINUE];
            0x18, ConstWide, const_wide, "const-wide", K51l, None, [CONTINUE];
            0x19, ConstWideHigh16, const_wide_high16, "const-wide/high16", K21h, None, [CONTINUE];
            0x1a, ConstString, const_string, "const-string", K21c, StringRef, [CONTINUE THROW];
            0x1b, ConstStringJumbo, const_string_jumbo, "const-string/jumbo", K31c, StringRef, [CONTINUE THROW];
            0x1c, ConstClass, const_class, "const-class", K21c, TypeRef, [CONTINUE THROW];
            0x1d, MonitorEnter, monitor_enter, "monitor-enter", K11x, None, [CONTINUE THROW];
            0x1e, MonitorExit, monitor_exit, "monitor-exit", K11x, None, [CONTINUE THROW];
            0x1f, CheckCast, check_cast, "check-cast", K21c, TypeRef, [CONTINUE THROW];
            0x20, InstanceOf, instance_of, "instance-of", K22c, TypeRef, [CONTINUE THROW];
            0x21, ArrayLength, array_length, "array-length", K12x, None, [CONTINUE THROW];
            0x22, NewInstance, new_instance, "new-instance", K21c, TypeRef, [CONTINUE THROW];
            0x23, NewArray, new_array, "new-array", K22c, TypeRef, [CONTINUE THROW];
            0x24, FilledNewArray, filled_new_array, "filled-new-array", K35c, TypeRef, [CONTINUE THROW];
            0x25, FilledNewArrayRange, filled_new_array_range, "filled-new-array/range", K3rc, TypeRef, [CONTINUE THROW];
            0x26, FillArrayData, fill_array_data, "fill-array-data", K31t, None, [CONTINUE THROW];
            0x27, Throw, throw_op, "throw", K11x, None, [THROW];
            0x28, Goto, goto, "goto", K10t, None, [BRANCH];
            0x29, Goto16, goto_16, "goto/16", K20t, None, [BRANCH];
            0x2a, Goto32, goto_32, "goto/32", K30t, None, [BRANCH];
            0x2b, PackedSwitch, packed_switch, "packed-switch", K31t, None, [CONTINUE SWITCH];
            0x2c, SparseSwitch, sparse_switch, "sparse-switch", K31t, None, [CONTINUE SWITCH];
            0x2d, CmplFloat, cmpl_float, "cmpl-float", K23x, None, [CONTINUE];
            0x2e, CmpgFloat, cmpg_float, "cmpg-float", K23x, None, [CONTINUE];
            0x2f, CmplDouble, cmpl_double, "cmpl-double", K23x, None, [CONTINUE];
            0x30, CmpgDouble, cmpg_double, "cmpg-double", K23x, None, [CONTINUE];
            0x31, CmpLong, cmp_long, "cmp-long", K23x, None, [CONTINUE];
            0x32, IfEq, if_eq, "if-eq", K22t, None, [CONTINUE BRANCH];
            0x33, IfNe, if_ne, "if-ne", K22t, None, [CONTINUE BRANCH];
            0x34, IfLt, if_lt, "if-lt", K22t, None, [CONTINUE BRANCH];
            0x35, IfGe, if_ge, "if-ge", K22t, None, [CONTINUE BRANCH];
            0x36, IfGt, if_gt, "if-gt", K22t, None, [CONTINUE BRANCH];
            0x37, IfLe, if_le, "if-le", K22t, None, [CONTINUE BRANCH];
            0x38, IfEqz, if_eqz, "if-eqz", K21t, None, [CONTINUE BRANCH];
            0x39, IfNez, if_nez, "if-nez", K21t, None, [CONTINUE BRANCH];
            0x3a, IfLtz, if_ltz, "if-ltz", K21t, None, [CONTINUE BRANCH];
            0x3b, IfGez, if_gez, "if-gez", K21t, None, [CONTINUE BRANCH];
            0x3c, IfGtz, if_gtz, "if-gtz", K21t, None, [CONTINUE BRANCH];
            0x3d, IfLez, if_lez, "if-lez", K21t, None, [CONTINUE BRANCH];
            0x3e, Unused3E, unused, "unused-3e", K10x, None, [];
            0x3f, Unused3F, unused, "unused-3f", K10x, None, [];
            0x40, Unused40, unused, "unused-40", K10x, None, [];
            0x41, Unused41, unused, "unused-41", K10x, None, [];
            0x42, Unused42, unused, "unused-42", K10x, None, [];
            0x43, Unused43, unused, "unused-43", K10x, None, [];
            0x44, Aget, aget, "aget", K23x, None, [CONTINUE THROW];
            0x45, AgetWide, aget_wide, "aget-wide", K23x, None, [CONTINUE THROW];
            0x46, AgetObject, aget_object, "aget-object", K23x, None, [CONTINUE THROW];
            0x47, AgetBoolean, aget_boolean, "aget-boolean", K23x, None, [CONTINUE THROW];
            0x48, AgetByte, aget_byte, "aget-byte", K23x, None, [CONTINUE THROW];
            0x49, AgetChar, aget_char, "aget-char", K23x, None, [CONTINUE THROW];
            0x4a, AgetShort, aget_short, "aget-short", K23x, None, [CONTINUE THROW];
            0x4b, Aput, aput, "aput", K23x, None, [CONTINUE THROW];
            0x4c, AputWide, aput_wide, "aput-wide", K23x, None, [CONTINUE THROW];
            0x4d, AputObject, aput_object, "aput-object", K23x, None, [CONTINUE THROW];
            0x4e, AputBoolean, aput_boolean, "aput-boolean", K23x, None, [CONTINUE THROW];
            0x4f, AputByte, aput_byte, "aput-byte", K23x, None, [CONTINUE THROW];
            0x50, AputChar, aput_char, "aput-char", K23x, None, [CONTINUE THROW];
            0x51, AputShort, aput_short, "aput-short", K23x, None, [CONTINUE THROW];
            0x52, Iget, iget, "iget", K22c, FieldRef, [CONTINUE THROW];
            0x53, IgetWide, iget_wide, "iget-wide", K22c, FieldRef, [CONTINUE THROW];
            0x54, IgetObject, iget_object, "iget-object", K22c, FieldRef, [CONTINUE THROW];
            0x55, IgetBoolean, iget_boolean, "iget-boolean", K22c, FieldRef, [CONTINUE THROW];
            0x56, IgetByte, iget_byte, "iget-byte", K22c, FieldRef, [CONTINUE THROW];
            0x57, IgetChar, iget_char, "iget-char", K22c, FieldRef, [CONTINUE THROW];
            0x58, IgetShort, iget_short, "iget-short", K22c, FieldRef, [CONTINUE THROW];
            0x59, Iput, iput, "iput", K22c, FieldRef, [CONTINUE THROW];
            0x5a, IputWide, iput_wide, "iput-wide", K22c, FieldRef, [CONTINUE THROW];
            0x5b, IputObject, iput_object, "iput-object", K22c, FieldRef, [CONTINUE THROW];
            0x5c, IputBoolean, iput_boolean, "iput-boolean", K22c, FieldRef, [CONTINUE THROW];
            0x5d, IputByte, iput_byte, "iput-byte", K22c, FieldRef, [CONTINUE THROW];
            0x5e, IputChar, iput_char, "iput-char", K22c, FieldRef, [CONTINUE THROW];
            0x5f, IputShort, iput_short, "iput-short", K22c, FieldRef, [CONTINUE THROW];
            0x60, Sget, sget, "sget", K21c, FieldRef, [CONTINUE THROW];
            0x61, SgetWide, sget_wide, "sget-wide", K21c, FieldRef, [CONTINUE THROW];
            0x62, SgetObject, sget_object, "sget-object", K21c, FieldRef, [CONTINUE THROW];
            0x63, SgetBoolean, sget_boolean, "sget-boolean", K21c, FieldRef, [CONTINUE THROW];
            0x64, SgetByte, sget_byte, "sget-byte", K21c, FieldRef, [CONTINUE THROW];
            0x65, SgetChar, sget_char, "sget-char", K21c, FieldRef, [CONTINUE THROW];
            0x66, SgetShort, sget_short, "sget-short", K21c, FieldRef, [CONTINUE THROW];
            0x67, Sput, sput, "sput", K21c, FieldRef, [CONTINUE THROW];
            0x68, SputWide, sput_wide, "sput-wide", K21c, FieldRef, [CONTINUE THROW];
            0x69, SputObject, sput_object, "sput-object", K21c, FieldRef, [CONTINUE THROW];
            0x6a, SputBoolean, sput_boolean, "sput-boolean", K21c, FieldRef, [CONTINUE THROW];
            0x6b, SputByte, sput_byte, "sput-byte", K21c, FieldRef, [CONTINUE THROW];
            0x6c, SputChar, sput_char, "sput-char", K21c, FieldRef, [CONTINUE THROW];
            0x6d, SputShort, sput_short, "sput-short", K21c, FieldRef, [CONTINUE THROW];
            0x6e, InvokeVirtual, invoke_virtual, "invoke-virtual", K35c, MethodRef, [CONTINUE THROW INVOKE];
            0x6f, InvokeSuper, invoke_super, "invoke-super", K35c, MethodRef, [CONTINUE THROW INVOKE];
            0x70, InvokeDirect, invoke_direct, "invoke-direct", K35c, MethodRef, [CONTINUE THROW INVOKE];
            0x71, InvokeStatic, invoke_static, "invoke-static", K35c, MethodRef, [CONTINUE THROW INVOKE];
            0x72, InvokeInterface, invoke_interface, "invoke-interface", K35c, MethodRef, [CONTINUE THROW INVOKE];
            0x73, Unused73, unused, "unused-73", K10x, None, [];
            0x74, InvokeVirtualRange, invoke_virtual_range, "invoke-virtual/range", K3rc, MethodRef, [CONTINUE THROW INVOKE];
            0x75, InvokeSuperRange, invoke_super_range, "invoke-super/range", K3rc, MethodRef, [CONTINUE THROW INVOKE];
            0x76, InvokeDirectRange, invoke_direct_range, "invoke-direct/range", K3rc, MethodRef, [CONTINUE THROW INVOKE];
            0x77, InvokeStaticRange, invoke_static_range, "invoke-static/range", K3rc, MethodRef, [CONTINUE THROW INVOKE];
            0x78, InvokeInterfaceRange, invoke_interface_range, "invoke-interface/range", K3rc, MethodRef, [CONTINUE THROW INVOKE];
            0x79, Unused79, unused, "unused-79", K10x, None, [];
            0x7a, Unused7A, unused, "unused-7a", K10x, None, [];
            0x7b, NegInt, neg_int, "neg-int", K12x, None, [CONTINUE];
            0x7c, NotInt, not_int, "not-int", K12x, None, [CONTINUE];
            0x7d, NegLong, neg_long, "neg-long", K12x, None, [CONTINUE];
            0x7e, NotLong, not_long, "not-long", K12x, None, [CONTINUE];
            0x7f, NegFloat, neg_float, "neg-float", K12x, None, [CONTINUE];
            0x80, NegDouble, neg_double, "neg-double", K12x, None, [CONTINUE];
            0x81, IntToLong, int_to_long, "int-to-long", K12x, None, [CONTINUE];
            0x82, IntToFloat, int_to_float, "int-to-float", K12x, None, [CONTINUE];
            0x83, IntToDouble, int_to_double, "int-to-double", K12x, None, [CONTINUE];
            0x84, LongToInt, long_to_int, "long-to-int", K12x, None, [CONTINUE];
            0x85, LongToFloat, long_to_float, "long-to-float", K12x, None, [CONTINUE];
            0x86, LongToDouble, long_to_double, "long-to-double", K12x, None, [CONTINUE];
            0x87, FloatToInt, float_to_int, "float-to-int", K12x, None, [CONTINUE];
            0x88, FloatToLong, float_to_long, "float-to-long", K12x, None, [CONTINUE];
            0x89, FloatToDouble, float_to_double, "float-to-double", K12x, None, [CONTINUE];
            0x8a, DoubleToInt, double_to_int, "double-to-int", K12x, None, [CONTINUE];
            0x8b, DoubleToLong, double_to_long, "double-to-long", K12x, None, [CONTINUE];
            0x8c, DoubleToFloat, double_to_float, "double-to-float", K12x, None, [CONTINUE];
            0x8d, IntToByte, int_to_byte, "int-to-byte", K12x, None, [CONTINUE];
            0x8e, IntToChar, int_to_char, "int-to-char", K12x, None, [CONTINUE];
            0x8f, IntToShort, int_to_short, "int-to-short", K12x, None, [CONTINUE];
            0x90, AddInt, add_int, "add-int", K23x, None, [CONTINUE];
            0x91, SubInt, sub_int, "sub-int", K23x, None, [CONTINUE];
            0x92, MulInt, mul_int, "mul-int", K23x, None, [CONTINUE];
            0x93, DivInt, div_int, "div-int", K23x, None, [CONTINUE THROW];
            0x94, RemInt, rem_int, "rem-int", K23x, None, [CONTINUE THROW];
            0x95, AndInt, and_int, "and-int", K23x, None, [CONTINUE];
            0x96, OrInt, or_int, "or-int", K23x, None, [CONTINUE];
            0x97, XorInt, xor_int, "xor-int", K23x, None, [CONTINUE];
            0x98, ShlInt, shl_int, "shl-int", K23x, None, [CONTINUE];
            0x99, ShrInt, shr_int, "shr-int", K23x, None, [CONTINUE];
            0x9a, UshrInt, ushr_int, "ushr-int", K23x, None, [CONTINUE];
            0x9b, AddLong, add_long, "add-long", K23x, None, [CONTINUE];
            0x9c, SubLong, sub_long, "sub-long", K23x, None, [CONTINUE];
            0x9d, MulLong, mul_long, "mul-long", K23x, None, [CONTINUE];
            0x9e, DivLong, div_long, "div-long", K23x, None, [CONTINUE THROW];
            0x9f, RemLong, rem_long, "rem-long", K23x, None, [CONTINUE THROW];
            0xa0, AndLong, and_long, "and-long", K23x, None, [CONTINUE];
            0xa1, OrLong, or_long, "or-long", K23x, None, [CONTINUE];
            0xa2, XorLong, xor_long, "xor-long", K23x, None, [CONTINUE];
            0xa3, ShlLong, shl_long, "shl-long", K23x, None, [CONTINUE];
            0xa4, ShrLong, shr_long, "shr-long", K23x, None, [CONTINUE];
            0xa5, UshrLong, ushr_long, "ushr-long", K23x, None, [CONTINUE];
            0xa6, AddFloat, add_float, "add-float", K23x, None, [CONTINUE];
            0xa7, SubFloat, sub_float, "sub-float", K23x, None, [CONTINUE];
            0xa8, MulFloat, mul_float, "mul-float", K23x, None, [CONTINUE];
            0xa9, DivFloat, div_float, "div-float", K23x, None, [CONTINUE];
            0xaa, RemFloat, rem_float, "rem-float", K23x, None, [CONTINUE];
            0xab, AddDouble, add_double, "add-double", K23x, None, [CONTINUE];
            0xac, SubDouble, sub_double, "sub-double", K23x, None, [CONTINUE];
            0xad, MulDouble, mul_double, "mul-double", K23x, None, [CONTINUE];
            0xae, DivDouble, div_double, "div-double", K23x, None, [CONTINUE];
            0xaf, RemDouble, rem_double, "rem-double", K23x, None, [CONTINUE];
            0xb0, AddInt2Addr, add_int_2addr, "add-int/2addr", K12x, None, [CONTINUE];
            0xb1, SubInt2Addr, sub_int_2addr, "sub-int/2addr", K12x, None, [CONTINUE];
            0xb2, MulInt2Addr, mul_int_2addr, "mul-int/2addr", K12x, None, [CONTINUE];
            0xb3, DivInt2Addr, div_int_2addr, "div-int/2addr", K12x, None, [CONTINUE THROW];
            0xb4, RemInt2Addr, rem_int_2addr, "rem-int/2addr", K12x, None, [CONTINUE THROW];
            0xb5, AndInt2Addr, and_int_2addr, "and-int/2addr", K12x, None, [CONTINUE];
            0xb6, OrInt2Addr, or_int_2addr, "or-int/2addr", K12x, None, [CONTINUE];
            0xb7, XorInt2Addr, xor_int_2addr, "xor-int/2addr", K12x, None, [CONTINUE];
            0xb8, ShlInt2Addr, shl_int_2addr, "shl-int/2addr", K12x, None, [CONTINUE];
            0xb9, ShrInt2Addr, shr_int_2addr, "shr-int/2addr", K12x, None, [CONTINUE];
            0xba, UshrInt2Addr, ushr_int_2addr, "ushr-int/2addr", K12x, None, [CONTINUE];
            0xbb, AddLong2Addr, add_long_2addr, "add-long/2addr", K12x, None, [CONTINUE];
            0xbc, SubLong2Addr, sub_long_2addr, "sub-long/2addr", K12x, None, [CONTINUE];
            0xbd, MulLong2Addr, mul_long_2addr, "mul-long/2addr", K12x, None, [CONTINUE];
            0xbe, DivLong2Addr, div_long_2addr, "div-long/2addr", K12x, None, [CONTINUE THROW];
            0xbf, RemLong2Addr, rem_long_2addr, "rem-long/2addr", K12x, None, [CONTINUE THROW];
            0xc0, AndLong2Addr, and_long_2addr, "and-long/2addr", K12x, None, [CONTINUE];
            0xc1, OrLong2Addr, or_long_2addr, "or-long/2addr", K12x, None, [CONTINUE];
            0xc2, XorLong2Addr, xor_long_2addr, "xor-long/2addr", K12x, None, [CONTINUE];
            0xc3, ShlLong2Addr, shl_long_2addr, "shl-long/2addr", K12x, None, [CONTINUE];
            0xc4, ShrLong2Addr, shr_long_2addr, "shr-long/2addr", K12x, None, [CONTINUE];
            0xc5, UshrLong2Addr, ushr_long_2addr, "ushr-long/2addr", K12x, None, [CONTINUE];
            0xc6, AddFloat2Addr, add_float_2addr, "add-float/2addr", K12x, None, [CONTINUE];
            0xc7, SubFloat2Addr, sub_float_2addr, "sub-float/2addr", K12x, None, [CONTINUE];
            0xc8, MulFloat2Addr, mul_float_2addr, "mul-float/2addr", K12x, None, [CONTINUE];
            0xc9, DivFloat2Addr, div_float_2addr, "div-float/2addr", K12x, None, [CONTINUE];
            0xca, RemFloat2Addr, rem_float_2addr, "rem-float/2addr", K12x, None, [CONTINUE];
            0xcb, AddDouble2Addr, add_double_2addr, "add-double/2addr", K12x, None, [CONTINUE];
            0xcc, SubDouble2Addr, sub_double_2addr, "sub-double/2addr", K12x, None, [CONTINUE];
            0xcd, MulDouble2Addr, mul_double_2addr, "mul-double/2addr", K12x, None, [CONTINUE];
            0xce, DivDouble2Addr, div_double_2addr, "div-double/2addr", K12x, None, [CONTINUE];
            0xcf, RemDouble2Addr, rem_double_2addr, "rem-double/2addr", K12x, None, [CONTINUE];
            0xd0, AddIntLit16, add_int_lit16, "add-int/lit16", K22s, None, [CONTINUE];
            0xd1, RsubInt, rsub_int, "rsub-int", K22s, None, [CONTINUE];
            0xd2, MulIntLit16, mul_int_lit16, "mul-int/lit16", K22s, None, [CONTINUE];
            0xd3, DivIntLit16, div_int_lit16, "div-int/lit16", K22s, None, [CONTINUE THROW];
            0xd4, RemIntLit16, rem_int_lit16, "rem-int/lit16", K22s, None, [CONTINUE THROW];
            0xd5, AndIntLit16, and_int_lit16, "and-int/lit16", K22s, None, [CONTINUE];
            0xd6, OrIntLit16, or_int_lit16, "or-int/lit16", K22s, None, [CONTINUE];
            0xd7, XorIntLit16, xor_int_lit16, "xor-int/lit16", K22s, None, [CONTINUE];
            0xd8, AddIntLit8, add_int_lit8, "add-int/lit8", K22b, None, [CONTINUE];
            0xd9, RsubIntLit8, rsub_int_lit8, "rsub-int/lit8", K22b, None, [CONTINUE];
            0xda, MulIntLit8, mul_int_lit8, "mul-int/lit8", K22b, None, [CONTINUE];
            0xdb, DivIntLit8, div_int_lit8, "div-int/lit8", K22b, None, [CONTINUE THROW];
            0xdc, RemIntLit8, rem_int_lit8, "rem-int/lit8", K22b, None, [CONTINUE THROW];
            0xdd, AndIntLit8, and_int_lit8, "and-int/lit8", K22b, None, [CONTINUE];
            0xde, OrIntLit8, or_int_lit8, "or-int/lit8", K22b, None, [CONTINUE];
            0xdf, XorIntLit8, xor_int_lit8, "xor-int/lit8", K22b, None, [CONTINUE];
            0xe0, ShlIntLit8, shl_int_lit8, "shl-int/lit8", K22b, None, [CONTINUE];
            0xe1, ShrIntLit8, shr_int_lit8, "shr-int/lit8", K22b, None, [CONTINUE];
            0xe2, UshrIntLit8, ushr_int_lit8, "ushr-int/lit8", K22b, None, [CONTINUE];
            0xe3, UnusedE3, unused, "unused-e3", K10x, None, [];
            0xe4, UnusedE4, unused, "unused-e4", K10x, None, [];
            0xe5, UnusedE5, unused, "unused-e5", K10x, None, [];
            0xe6, UnusedE6, unused, "unused-e6", K10x, None, [];
            0xe7, UnusedE7, unused, "unused-e7", K10x, None, [];
            0xe8, UnusedE8, unused, "unused-e8", K10x, None, [];
            0xe9, UnusedE9, unused, "unused-e9", K10x, None, [];
            0xea, UnusedEA, unused, "unused-ea", K10x, None, [];
            0xeb, UnusedEB, unused, "unused-eb", K10x, None, [];
            0xec, UnusedEC, unused, "unused-ec", K10x, None, [];
            0xed, UnusedED, unused, "unused-ed", K10x, None, [];
            0xee, UnusedEE, unused, "unused-ee", K10x, None, [];
            0xef, UnusedEF, unused, "unused-ef", K10x, None, [];
            0xf0, UnusedF0, unused, "unused-f0", K10x, None, [];
            0xf1, UnusedF1, unused, "unused-f1", K10x, None, [];
            0xf2, UnusedF2, unused, "unused-f2", K10x, None, [];
            0xf3, UnusedF3, unused, "unused-f3", K10x, None, [];
            0xf4, UnusedF4, unused, "unused-f4", K10x, None, [];
            0xf5, UnusedF5, unused, "unused-f5", K10x, None, [];
            0xf6, UnusedF6, unused, "unused-f6", K10x, None, [];
            0xf7, UnusedF7, unused, "unused-f7", K10x, None, [];
            0xf8, UnusedF8, unused, "unused-f8", K10x, None, [];
            0xf9, UnusedF9, unused, "unused-f9", K10x, None, [];
            0xfa, InvokePolymorphic, invoke_polymorphic, "invoke-polymorphic", K45cc, MethodAndProtoRef, [CONTINUE THROW INVOKE];
            0xfb, InvokePolymorphicRange, invoke_polymorphic_range, "invoke-polymorphic/range", K4rcc, MethodAndProtoRef, [CONTINUE THROW INVOKE];
            0xfc, InvokeCustom, invoke_custom, "invoke-custom", K35c, CallSiteRef, [CONTINUE THROW INVOKE];
            0xfd, InvokeCustomRange, invoke_custom_range, "invoke-custom/range", K3rc, CallSiteRef, [CONTINUE THROW INVOKE];
            0xfe, ConstMethodHandle, const_method_handle, "const-method-handle", K21c, MethodHandleRef, [CONTINUE THROW];
            0xff, ConstMethodType, const_method_type, "const-method-type", K21c, ProtoRef, [CONTINUE THROW];
        }
    };
}

pub(crate) use dex_instruction_list;

// =============================================================================
// Opcode
// =============================================================================

macro_rules! define_opcodes {
    ($($value:literal, $variant:ident, $handler:ident, $name:literal, $format:ident, $index:ident, [$($flag:ident)*];)*) => {
        /// A dex opcode. All 256 values are represented; unused slots
        /// decode to `Unused*` variants.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant = $value,)*
        }

        const OPCODE_TABLE: [Opcode; 256] = [$(Opcode::$variant,)*];

        const OPCODE_NAMES: [&str; 256] = [$($name,)*];

        const OPCODE_FORMATS: [InstructionFormat; 256] = [$(InstructionFormat::$format,)*];

        const OPCODE_INDEX_TYPES: [IndexType; 256] = [$(IndexType::$index,)*];

        const OPCODE_FLAGS: [InstructionFlags; 256] = [
            $(InstructionFlags::empty()$(.union(InstructionFlags::$flag))*,)*
        ];
    };
}

dex_instruction_list!(define_opcodes);

impl Opcode {
    /// Decode an opcode byte. Total: unused bytes map to `Unused*`.
    #[inline(always)]
    pub const fn from_u8(byte: u8) -> Self {
        OPCODE_TABLE[byte as usize]
    }

    /// Mnemonic as printed by disassemblers.
    #[inline]
    pub const fn name(self) -> &'static str {
        OPCODE_NAMES[self as usize]
    }

    /// Encoding format.
    #[inline]
    pub const fn format(self) -> InstructionFormat {
        OPCODE_FORMATS[self as usize]
    }

    /// What the index operand refers to.
    #[inline]
    pub const fn index_type(self) -> IndexType {
        OPCODE_INDEX_TYPES[self as usize]
    }

    /// Control-flow flags.
    #[inline]
    pub const fn flags(self) -> InstructionFlags {
        OPCODE_FLAGS[self as usize]
    }

    /// Whether the slot is unassigned.
    #[inline]
    pub const fn is_unused(self) -> bool {
        self.flags().is_empty()
    }

    #[inline]
    pub const fn is_invoke(self) -> bool {
        self.flags().contains(InstructionFlags::INVOKE)
    }

    #[inline]
    pub const fn is_return(self) -> bool {
        self.flags().contains(InstructionFlags::RETURN)
    }

    #[inline]
    pub const fn is_branch(self) -> bool {
        self.flags().contains(InstructionFlags::BRANCH)
    }

    #[inline]
    pub const fn can_throw(self) -> bool {
        self.flags().contains(InstructionFlags::THROW)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_dense() {
        for byte in 0..=255u8 {
            assert_eq!(Opcode::from_u8(byte) as u8, byte, "{:#x}", byte);
        }
    }

    #[test]
    fn test_properties() {
        assert_eq!(Opcode::from_u8(0x90), Opcode::AddInt);
        assert_eq!(Opcode::AddInt.name(), "add-int");
        assert_eq!(Opcode::AddInt.format(), InstructionFormat::K23x);
        assert_eq!(Opcode::ConstWide.format().size_in_code_units(), 5);
        assert!(Opcode::InvokeStaticRange.is_invoke());
        assert!(Opcode::ReturnObject.is_return());
        assert!(Opcode::IfLez.is_branch());
        assert!(Opcode::DivIntLit8.can_throw());
        assert!(!Opcode::AddIntLit8.can_throw());
        assert!(Opcode::Unused73.is_unused());
        assert!(!Opcode::Nop.is_unused());
        assert_eq!(Opcode::InvokePolymorphic.index_type(), IndexType::MethodAndProtoRef);
    }

    #[test]
    fn test_unused_slots() {
        let unused = (0..=255u8).filter(|&b| Opcode::from_u8(b).is_unused()).count();
        // 3e-43, 73, 79-7a, e3-f9
        assert_eq!(unused, 6 + 1 + 2 + 23);
    }
}
