//! The instruction model: opcode tables and the `Instruction` sum type.
//!
//! The two `opcodes!`/`ext_opcodes!` tables are the single source of truth
//! for opcode identities. Binary and text codecs consult them by name;
//! nothing else in the crate hard-codes an opcode byte.

use crate::module::ValType;

macro_rules! opcodes {
    ($( $name:ident = $byte:literal, $mnemonic:literal; )*) => {
        /// A primary-range opcode recognized by this crate.
        ///
        /// The set is exactly the MVP instruction set plus the
        /// sign-extension operators; the `0xFC` family lives in
        /// [`ExtOpcode`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $(
                #[doc = concat!("`", $mnemonic, "`")]
                $name = $byte,
            )*
        }

        impl Opcode {
            /// Look an opcode up by its encoding byte.
            pub fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $( $byte => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// The canonical text-format mnemonic.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Look an opcode up by mnemonic, accepting the historical
            /// `rotl_s`/`rotr_u` spellings as aliases for `rotl`/`rotr`.
            pub fn from_mnemonic(mnemonic: &str) -> Option<Opcode> {
                match mnemonic {
                    $( $mnemonic => Some(Opcode::$name), )*
                    "i32.rotl_s" => Some(Opcode::I32Rotl),
                    "i32.rotr_u" => Some(Opcode::I32Rotr),
                    "i64.rotl_s" => Some(Opcode::I64Rotl),
                    "i64.rotr_u" => Some(Opcode::I64Rotr),
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Unreachable = 0x00, "unreachable";
    Nop = 0x01, "nop";
    Block = 0x02, "block";
    Loop = 0x03, "loop";
    If = 0x04, "if";
    Else = 0x05, "else";
    End = 0x0b, "end";
    Br = 0x0c, "br";
    BrIf = 0x0d, "br_if";
    BrTable = 0x0e, "br_table";
    Return = 0x0f, "return";
    Call = 0x10, "call";
    CallIndirect = 0x11, "call_indirect";
    Drop = 0x1a, "drop";
    Select = 0x1b, "select";
    LocalGet = 0x20, "local.get";
    LocalSet = 0x21, "local.set";
    LocalTee = 0x22, "local.tee";
    GlobalGet = 0x23, "global.get";
    GlobalSet = 0x24, "global.set";
    I32Load = 0x28, "i32.load";
    I64Load = 0x29, "i64.load";
    F32Load = 0x2a, "f32.load";
    F64Load = 0x2b, "f64.load";
    I32Load8S = 0x2c, "i32.load8_s";
    I32Load8U = 0x2d, "i32.load8_u";
    I32Load16S = 0x2e, "i32.load16_s";
    I32Load16U = 0x2f, "i32.load16_u";
    I64Load8S = 0x30, "i64.load8_s";
    I64Load8U = 0x31, "i64.load8_u";
    I64Load16S = 0x32, "i64.load16_s";
    I64Load16U = 0x33, "i64.load16_u";
    I64Load32S = 0x34, "i64.load32_s";
    I64Load32U = 0x35, "i64.load32_u";
    I32Store = 0x36, "i32.store";
    I64Store = 0x37, "i64.store";
    F32Store = 0x38, "f32.store";
    F64Store = 0x39, "f64.store";
    I32Store8 = 0x3a, "i32.store8";
    I32Store16 = 0x3b, "i32.store16";
    I64Store8 = 0x3c, "i64.store8";
    I64Store16 = 0x3d, "i64.store16";
    I64Store32 = 0x3e, "i64.store32";
    MemorySize = 0x3f, "memory.size";
    MemoryGrow = 0x40, "memory.grow";
    I32Const = 0x41, "i32.const";
    I64Const = 0x42, "i64.const";
    F32Const = 0x43, "f32.const";
    F64Const = 0x44, "f64.const";
    I32Eqz = 0x45, "i32.eqz";
    I32Eq = 0x46, "i32.eq";
    I32Ne = 0x47, "i32.ne";
    I32LtS = 0x48, "i32.lt_s";
    I32LtU = 0x49, "i32.lt_u";
    I32GtS = 0x4a, "i32.gt_s";
    I32GtU = 0x4b, "i32.gt_u";
    I32LeS = 0x4c, "i32.le_s";
    I32LeU = 0x4d, "i32.le_u";
    I32GeS = 0x4e, "i32.ge_s";
    I32GeU = 0x4f, "i32.ge_u";
    I64Eqz = 0x50, "i64.eqz";
    I64Eq = 0x51, "i64.eq";
    I64Ne = 0x52, "i64.ne";
    I64LtS = 0x53, "i64.lt_s";
    I64LtU = 0x54, "i64.lt_u";
    I64GtS = 0x55, "i64.gt_s";
    I64GtU = 0x56, "i64.gt_u";
    I64LeS = 0x57, "i64.le_s";
    I64LeU = 0x58, "i64.le_u";
    I64GeS = 0x59, "i64.ge_s";
    I64GeU = 0x5a, "i64.ge_u";
    F32Eq = 0x5b, "f32.eq";
    F32Ne = 0x5c, "f32.ne";
    F32Lt = 0x5d, "f32.lt";
    F32Gt = 0x5e, "f32.gt";
    F32Le = 0x5f, "f32.le";
    F32Ge = 0x60, "f32.ge";
    F64Eq = 0x61, "f64.eq";
    F64Ne = 0x62, "f64.ne";
    F64Lt = 0x63, "f64.lt";
    F64Gt = 0x64, "f64.gt";
    F64Le = 0x65, "f64.le";
    F64Ge = 0x66, "f64.ge";
    I32Clz = 0x67, "i32.clz";
    I32Ctz = 0x68, "i32.ctz";
    I32Popcnt = 0x69, "i32.popcnt";
    I32Add = 0x6a, "i32.add";
    I32Sub = 0x6b, "i32.sub";
    I32Mul = 0x6c, "i32.mul";
    I32DivS = 0x6d, "i32.div_s";
    I32DivU = 0x6e, "i32.div_u";
    I32RemS = 0x6f, "i32.rem_s";
    I32RemU = 0x70, "i32.rem_u";
    I32And = 0x71, "i32.and";
    I32Or = 0x72, "i32.or";
    I32Xor = 0x73, "i32.xor";
    I32Shl = 0x74, "i32.shl";
    I32ShrS = 0x75, "i32.shr_s";
    I32ShrU = 0x76, "i32.shr_u";
    I32Rotl = 0x77, "i32.rotl";
    I32Rotr = 0x78, "i32.rotr";
    I64Clz = 0x79, "i64.clz";
    I64Ctz = 0x7a, "i64.ctz";
    I64Popcnt = 0x7b, "i64.popcnt";
    I64Add = 0x7c, "i64.add";
    I64Sub = 0x7d, "i64.sub";
    I64Mul = 0x7e, "i64.mul";
    I64DivS = 0x7f, "i64.div_s";
    I64DivU = 0x80, "i64.div_u";
    I64RemS = 0x81, "i64.rem_s";
    I64RemU = 0x82, "i64.rem_u";
    I64And = 0x83, "i64.and";
    I64Or = 0x84, "i64.or";
    I64Xor = 0x85, "i64.xor";
    I64Shl = 0x86, "i64.shl";
    I64ShrS = 0x87, "i64.shr_s";
    I64ShrU = 0x88, "i64.shr_u";
    I64Rotl = 0x89, "i64.rotl";
    I64Rotr = 0x8a, "i64.rotr";
    F32Abs = 0x8b, "f32.abs";
    F32Neg = 0x8c, "f32.neg";
    F32Ceil = 0x8d, "f32.ceil";
    F32Floor = 0x8e, "f32.floor";
    F32Trunc = 0x8f, "f32.trunc";
    F32Nearest = 0x90, "f32.nearest";
    F32Sqrt = 0x91, "f32.sqrt";
    F32Add = 0x92, "f32.add";
    F32Sub = 0x93, "f32.sub";
    F32Mul = 0x94, "f32.mul";
    F32Div = 0x95, "f32.div";
    F32Min = 0x96, "f32.min";
    F32Max = 0x97, "f32.max";
    F32Copysign = 0x98, "f32.copysign";
    F64Abs = 0x99, "f64.abs";
    F64Neg = 0x9a, "f64.neg";
    F64Ceil = 0x9b, "f64.ceil";
    F64Floor = 0x9c, "f64.floor";
    F64Trunc = 0x9d, "f64.trunc";
    F64Nearest = 0x9e, "f64.nearest";
    F64Sqrt = 0x9f, "f64.sqrt";
    F64Add = 0xa0, "f64.add";
    F64Sub = 0xa1, "f64.sub";
    F64Mul = 0xa2, "f64.mul";
    F64Div = 0xa3, "f64.div";
    F64Min = 0xa4, "f64.min";
    F64Max = 0xa5, "f64.max";
    F64Copysign = 0xa6, "f64.copysign";
    I32WrapI64 = 0xa7, "i32.wrap_i64";
    I32TruncF32S = 0xa8, "i32.trunc_f32_s";
    I32TruncF32U = 0xa9, "i32.trunc_f32_u";
    I32TruncF64S = 0xaa, "i32.trunc_f64_s";
    I32TruncF64U = 0xab, "i32.trunc_f64_u";
    I64ExtendI32S = 0xac, "i64.extend_i32_s";
    I64ExtendI32U = 0xad, "i64.extend_i32_u";
    I64TruncF32S = 0xae, "i64.trunc_f32_s";
    I64TruncF32U = 0xaf, "i64.trunc_f32_u";
    I64TruncF64S = 0xb0, "i64.trunc_f64_s";
    I64TruncF64U = 0xb1, "i64.trunc_f64_u";
    F32ConvertI32S = 0xb2, "f32.convert_i32_s";
    F32ConvertI32U = 0xb3, "f32.convert_i32_u";
    F32ConvertI64S = 0xb4, "f32.convert_i64_s";
    F32ConvertI64U = 0xb5, "f32.convert_i64_u";
    F32DemoteF64 = 0xb6, "f32.demote_f64";
    F64ConvertI32S = 0xb7, "f64.convert_i32_s";
    F64ConvertI32U = 0xb8, "f64.convert_i32_u";
    F64ConvertI64S = 0xb9, "f64.convert_i64_s";
    F64ConvertI64U = 0xba, "f64.convert_i64_u";
    F64PromoteF32 = 0xbb, "f64.promote_f32";
    I32ReinterpretF32 = 0xbc, "i32.reinterpret_f32";
    I64ReinterpretF64 = 0xbd, "i64.reinterpret_f64";
    F32ReinterpretI32 = 0xbe, "f32.reinterpret_i32";
    F64ReinterpretI64 = 0xbf, "f64.reinterpret_i64";
    I32Extend8S = 0xc0, "i32.extend8_s";
    I32Extend16S = 0xc1, "i32.extend16_s";
    I64Extend8S = 0xc2, "i64.extend8_s";
    I64Extend16S = 0xc3, "i64.extend16_s";
    I64Extend32S = 0xc4, "i64.extend32_s";
}

/// The byte that prefixes the extended opcode space.
pub const EXT_PREFIX: u8 = 0xfc;

macro_rules! ext_opcodes {
    ($( $name:ident = $value:literal, $mnemonic:literal; )*) => {
        /// An opcode in the `0xFC` extended space: the non-trapping
        /// float-to-int conversions and the two bulk-memory operators.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum ExtOpcode {
            $(
                #[doc = concat!("`", $mnemonic, "`")]
                $name = $value,
            )*
        }

        impl ExtOpcode {
            /// Look an extended opcode up by its LEB-encoded value.
            pub fn from_value(value: u32) -> Option<ExtOpcode> {
                match value {
                    $( $value => Some(ExtOpcode::$name), )*
                    _ => None,
                }
            }

            /// The canonical text-format mnemonic.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( ExtOpcode::$name => $mnemonic, )*
                }
            }

            /// Look an extended opcode up by mnemonic.
            pub fn from_mnemonic(mnemonic: &str) -> Option<ExtOpcode> {
                match mnemonic {
                    $( $mnemonic => Some(ExtOpcode::$name), )*
                    _ => None,
                }
            }
        }
    };
}

ext_opcodes! {
    I32TruncSatF32S = 0, "i32.trunc_sat_f32_s";
    I32TruncSatF32U = 1, "i32.trunc_sat_f32_u";
    I32TruncSatF64S = 2, "i32.trunc_sat_f64_s";
    I32TruncSatF64U = 3, "i32.trunc_sat_f64_u";
    I64TruncSatF32S = 4, "i64.trunc_sat_f32_s";
    I64TruncSatF32U = 5, "i64.trunc_sat_f32_u";
    I64TruncSatF64S = 6, "i64.trunc_sat_f64_s";
    I64TruncSatF64U = 7, "i64.trunc_sat_f64_u";
    MemoryCopy = 10, "memory.copy";
    MemoryFill = 11, "memory.fill";
}

/// The optional result type of a `block`/`loop`/`if`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlockType {
    /// No result value.
    Empty,
    /// A single result value.
    Value(ValType),
}

/// A function operand: a concrete index into the unified function index
/// space, or a `$name` still waiting to be linked against the host module.
#[derive(Debug, Clone, PartialEq)]
pub enum FuncRef {
    /// A resolved function index.
    Index(u32),
    /// A symbolic reference; the binary encoder refuses this form.
    Symbol(String),
}

/// A global operand, resolved or symbolic.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalRef {
    /// A resolved global index.
    Index(u32),
    /// A symbolic reference; the binary encoder refuses this form.
    Symbol(String),
}

/// The operand of an `i32.const`.
///
/// `DataOffset`/`DataLength` carry the late-binding relocation markers. A
/// resolved relocation keeps its tag with `value` filled in, so
/// [`CodeEntry::insert_after_relocating`](crate::module::CodeEntry) can
/// still locate the instructions it applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum I32Operand {
    /// A plain constant.
    Value(i32),
    /// `offset($symbol)` — the segment's placed address minus the link
    /// base, filled in by `resolve_relocations`.
    DataOffset {
        /// The `$`-prefixed data segment name.
        symbol: String,
        /// The resolved constant, absent until relocation.
        value: Option<i32>,
    },
    /// `length($symbol)` — the segment's byte length, filled in by
    /// `resolve_lengths`.
    DataLength {
        /// The `$`-prefixed data segment name.
        symbol: String,
        /// The resolved constant, absent until resolution.
        value: Option<i32>,
    },
}

/// A single decoded instruction, one variant per operand family.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Any primary opcode with no immediate. Includes `memory.size` and
    /// `memory.grow`; their reserved byte lives in the codec, not here.
    Op(Opcode),
    /// Any `0xFC` opcode; reserved bytes likewise live in the codec.
    Ext(ExtOpcode),
    /// `block`
    Block(BlockType),
    /// `loop`
    Loop(BlockType),
    /// `if`
    If(BlockType),
    /// `br`
    Br(u32),
    /// `br_if`
    BrIf(u32),
    /// `br_table`
    BrTable {
        /// The explicit branch targets.
        labels: Vec<u32>,
        /// The fallthrough target.
        default: u32,
    },
    /// `call`
    Call(FuncRef),
    /// `call_indirect`
    CallIndirect {
        /// Index into the type section.
        type_index: u32,
        /// The table holding the function references.
        table_index: u32,
    },
    /// `local.get`/`local.set`/`local.tee`
    Local {
        /// Which of the three local operators.
        op: Opcode,
        /// The local index.
        index: u32,
    },
    /// `global.get`/`global.set`
    Global {
        /// Which of the two global operators.
        op: Opcode,
        /// The global operand, resolved or symbolic.
        target: GlobalRef,
    },
    /// Any memory load or store.
    Memory {
        /// Which load/store operator.
        op: Opcode,
        /// The alignment exponent.
        align: u32,
        /// The constant address offset.
        offset: u64,
    },
    /// `i32.const`
    I32Const(I32Operand),
    /// `i64.const`
    I64Const(i64),
    /// `f32.const`
    F32Const(f32),
    /// `f64.const`
    F64Const(f64),
}

impl Instruction {
    /// True when this instruction still carries a symbolic or unresolved
    /// operand that the binary encoder would refuse.
    pub fn needs_linking(&self) -> bool {
        match self {
            Instruction::Call(FuncRef::Symbol(_)) => true,
            Instruction::Global {
                target: GlobalRef::Symbol(_),
                ..
            } => true,
            Instruction::I32Const(
                I32Operand::DataOffset { value: None, .. }
                | I32Operand::DataLength { value: None, .. },
            ) => true,
            _ => false,
        }
    }

    /// True for instructions that were marked as needing data relocation,
    /// resolved or not.
    pub fn is_relocating(&self) -> bool {
        matches!(
            self,
            Instruction::I32Const(I32Operand::DataOffset { .. })
        )
    }
}

/// An instruction plus the byte offset it was decoded from.
///
/// `pc` is the offset of the opcode byte within the code section payload,
/// the address space DWARF line and location data is expressed in. For
/// instructions synthesized from text there is no meaningful offset and
/// `pc` is [`Expression::NO_PC`].
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    /// The instruction itself.
    pub instr: Instruction,
    /// Code-section byte offset, or [`Expression::NO_PC`].
    pub pc: u64,
}

impl Expression {
    /// The `pc` of an instruction that was never decoded from binary.
    pub const NO_PC: u64 = u64::MAX;

    /// Wrap an instruction with no binary provenance.
    pub fn synthetic(instr: Instruction) -> Expression {
        Expression {
            instr,
            pc: Self::NO_PC,
        }
    }
}

impl From<Instruction> for Expression {
    fn from(instr: Instruction) -> Expression {
        Expression::synthetic(instr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_table_is_bijective() {
        for byte in 0..=0xff_u16 {
            if let Some(op) = Opcode::from_byte(byte as u8) {
                assert_eq!(op as u8, byte as u8);
                assert_eq!(Opcode::from_mnemonic(op.mnemonic()), Some(op));
            }
        }
    }

    #[test]
    fn ext_table_is_bijective() {
        for value in 0..16 {
            if let Some(op) = ExtOpcode::from_value(value) {
                assert_eq!(op as u32, value);
                assert_eq!(ExtOpcode::from_mnemonic(op.mnemonic()), Some(op));
            }
        }
        assert_eq!(ExtOpcode::from_value(8), None);
        assert_eq!(ExtOpcode::from_value(12), None);
    }

    #[test]
    fn rot_aliases_parse_to_canonical() {
        assert_eq!(Opcode::from_mnemonic("i32.rotl_s"), Some(Opcode::I32Rotl));
        assert_eq!(Opcode::from_mnemonic("i64.rotr_u"), Some(Opcode::I64Rotr));
        assert_eq!(Opcode::I32Rotl.mnemonic(), "i32.rotl");
        assert_eq!(Opcode::I64Rotr.mnemonic(), "i64.rotr");
    }

    #[test]
    fn linking_flags() {
        assert!(Instruction::Call(FuncRef::Symbol("$f".into())).needs_linking());
        assert!(!Instruction::Call(FuncRef::Index(3)).needs_linking());
        let resolved = Instruction::I32Const(I32Operand::DataOffset {
            symbol: "$d".into(),
            value: Some(16),
        });
        assert!(!resolved.needs_linking());
        assert!(resolved.is_relocating());
    }
}
