//! Binary round-trip laws and boundary-case encodings.

use anyhow::Result;
use wasm_splice::{Expression, ExtOpcode, I32Operand, Instruction, Module, Opcode, SectionId};

/// Text → binary → model → binary must be byte-stable.
fn assert_binary_stable(wat: &str) -> Result<Module> {
    let module = Module::from_wat(wat)?;
    let bytes = module.encode_binary()?;
    let decoded = Module::parse(&bytes)?;
    let bytes2 = decoded.encode_binary()?;
    assert_eq!(bytes, bytes2, "encode(decode(encode(M))) != encode(M)");
    Ok(decoded)
}

#[test]
fn empty_module() -> Result<()> {
    let decoded = assert_binary_stable("(module)")?;
    assert!(decoded.code.is_empty());
    Ok(())
}

#[test]
fn full_section_spread() -> Result<()> {
    let decoded = assert_binary_stable(
        r#"
        (module
          (type (func (param i32 i32) (result i32)))
          (import "env" "log" (func $log (type 0)))
          (func $add (type 0)
            local.get 0
            local.get 1
            i32.add
          )
          (func $main (type 0)
            local.get 0
            local.get 1
            call $add
            call $log
          )
          (table 2 2 funcref)
          (memory 1 4)
          (global $g (mut i32) (i32.const 64))
          (export "add" (func $add))
          (export "mem" (memory 0))
          (elem (i32.const 0) func $add $main)
          (data $greeting (i32.const 1024) "hello\00world")
        )
        "#,
    )?;
    assert_eq!(decoded.types.len(), 1);
    assert_eq!(decoded.imports.len(), 1);
    assert_eq!(decoded.code.len(), 2);
    assert_eq!(decoded.elements[0].indexes, vec![1, 2]);
    assert_eq!(decoded.data[0].data, b"hello\x00world");
    Ok(())
}

#[test]
fn code_section_pcs_are_consistent() -> Result<()> {
    let module = Module::from_wat(
        r#"
        (module
          (func $a i32.const 1 drop)
          (func $b (result i32) i64.const -1 drop i32.const 7)
        )
        "#,
    )?;
    let bytes = module.encode_binary()?;
    let decoded = Module::parse(&bytes)?;

    // Each body's ptr + len lands exactly on the next body's first
    // instruction.
    for pair in decoded.code.windows(2) {
        let end = pair[0].code_section_ptr + pair[0].code_section_len;
        // The next entry's ptr is past its body-size varint and locals.
        assert!(pair[1].code_section_ptr > end);
        assert!(pair[1].expression[0].pc == pair[1].code_section_ptr);
    }
    for code in &decoded.code {
        assert!(code.pc_valid);
        for expr in &code.expression {
            assert!(expr.pc >= code.code_section_ptr);
            assert!(expr.pc < code.code_section_ptr + code.code_section_len);
        }
    }
    Ok(())
}

#[test]
fn i32_const_minus_one_roundtrips() -> Result<()> {
    let decoded = assert_binary_stable("(module (func $f i32.const -1 drop))")?;
    assert_eq!(
        decoded.code[0].expression[0].instr,
        Instruction::I32Const(I32Operand::Value(-1)),
    );
    Ok(())
}

#[test]
fn br_table_with_only_default_roundtrips() -> Result<()> {
    let decoded = assert_binary_stable(
        r#"
        (module
          (func $f
            block
              i32.const 0
              br_table 0
            end
          )
        )
        "#,
    )?;
    let instrs = &decoded.code[0].expression;
    assert!(instrs.iter().any(|e| e.instr
        == Instruction::BrTable {
            labels: Vec::new(),
            default: 0
        }));
    Ok(())
}

#[test]
fn empty_body_is_a_single_end_byte() -> Result<()> {
    let decoded = assert_binary_stable("(module (func $empty))")?;
    let code = &decoded.code[0];
    assert!(code.expression.is_empty());
    assert_eq!(code.code_section_len, 1);
    Ok(())
}

#[test]
fn bulk_memory_reserved_bytes() -> Result<()> {
    let decoded = assert_binary_stable(
        r#"
        (module
          (memory 1)
          (func $f
            i32.const 0
            i32.const 16
            i32.const 32
            memory.copy
            i32.const 0
            i32.const 0
            i32.const 64
            memory.fill
          )
        )
        "#,
    )?;
    let bytes = decoded.encode_binary()?;
    // memory.copy is 0xFC 10 followed by two reserved zero bytes,
    // memory.fill 0xFC 11 followed by one.
    let copy_at = bytes
        .windows(4)
        .position(|w| w == [0xfc, 10, 0x00, 0x00])
        .expect("memory.copy encoding not found");
    assert!(bytes[copy_at + 4..]
        .windows(3)
        .any(|w| w == [0xfc, 11, 0x00]));
    Ok(())
}

#[test]
fn reserved_bytes_are_permissive_on_decode() -> Result<()> {
    let module = Module::from_wat("(module (memory 1) (func $f memory.size drop))")?;
    let mut bytes = module.encode_binary()?;
    // Corrupt the reserved byte after memory.size (0x3F); the decoder
    // must not care.
    let at = bytes
        .windows(2)
        .position(|w| w == [0x3f, 0x00])
        .expect("memory.size encoding not found");
    bytes[at + 1] = 0x01;
    let decoded = Module::parse(&bytes)?;
    assert!(decoded.code[0]
        .expression
        .iter()
        .any(|e| e.instr == Instruction::Op(Opcode::MemorySize)));
    Ok(())
}

#[test]
fn sign_extension_and_trunc_sat_roundtrip() -> Result<()> {
    let decoded = assert_binary_stable(
        r#"
        (module
          (func $f (param i64) (result i64)
            local.get 0
            i64.extend8_s
            f64.const 1.5
            i64.trunc_sat_f64_s
            i64.add
          )
        )
        "#,
    )?;
    assert!(decoded.code[0]
        .expression
        .iter()
        .any(|e| e.instr == Instruction::Ext(ExtOpcode::I64TruncSatF64S)));
    Ok(())
}

#[test]
fn float_bit_patterns_roundtrip() -> Result<()> {
    let decoded = assert_binary_stable(
        "(module (func $f f32.const 1.5 drop f64.const -0.001 drop))",
    )?;
    let values: Vec<&Expression> = decoded.code[0].expression.iter().collect();
    assert_eq!(values[0].instr, Instruction::F32Const(1.5));
    assert_eq!(values[2].instr, Instruction::F64Const(-0.001));
    Ok(())
}

#[test]
fn name_section_survives_renumbering_roundtrip() -> Result<()> {
    let module = Module::from_wat(
        r#"
        (module
          (func $alpha)
          (func $beta call $alpha)
          (global $counter (mut i32) (i32.const 0))
          (data $blob (i32.const 0) "abc")
        )
        "#,
    )?;
    let bytes = module.encode_binary()?;

    let mut decoded = Module::parse(&bytes)?;
    assert!(decoded.function_names.is_empty());
    decoded.parse_name()?;
    assert_eq!(decoded.lookup_function_id("$beta"), Some(1));
    assert_eq!(decoded.lookup_global_id("$counter"), Some(0));
    assert_eq!(decoded.lookup_data_id("$blob"), Some(0));

    // Re-encoding after parse_name regenerates the same name section.
    let bytes2 = decoded.encode_binary()?;
    assert_eq!(bytes, bytes2);
    Ok(())
}

/// Custom sections may sit anywhere between standard sections; the
/// model records the slot and re-encoding puts each one back where the
/// decoder found it, byte for byte.
#[test]
fn custom_sections_keep_their_positions() -> Result<()> {
    fn custom_section(name: &str, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![name.len() as u8];
        payload.extend_from_slice(name.as_bytes());
        payload.extend_from_slice(data);
        let mut out = vec![0x00, payload.len() as u8];
        out.extend_from_slice(&payload);
        out
    }

    let base = Module::from_wat(r#"(module (func nop) (memory 1) (data (i32.const 0) "x"))"#)?
        .encode_binary()?;
    assert_eq!(base[8], SectionId::Type as u8);

    // Walk the section headers to find where the data section starts.
    // Every payload in this fixture is under 128 bytes, so each length
    // varint is a single byte.
    let mut at = 8;
    let mut data_start = 0;
    while at < base.len() {
        if base[at] == SectionId::Data as u8 {
            data_start = at;
        }
        at += 2 + base[at + 1] as usize;
    }
    assert!(data_start > 8);

    // One custom section ahead of the type section, one wedged between
    // the code and data sections, the way toolchains place `producers`
    // and `target_features`.
    let mut spliced = base[..8].to_vec();
    spliced.extend_from_slice(&custom_section("producers", &[1, 2, 3]));
    spliced.extend_from_slice(&base[8..data_start]);
    spliced.extend_from_slice(&custom_section("target_features", &[9]));
    spliced.extend_from_slice(&base[data_start..]);

    let decoded = Module::parse(&spliced)?;
    assert_eq!(decoded.custom.len(), 2);
    assert_eq!(decoded.custom[0].name, "producers");
    assert_eq!(decoded.custom[0].after, None);
    assert_eq!(decoded.custom[1].name, "target_features");
    assert_eq!(decoded.custom[1].after, Some(SectionId::Code));

    assert_eq!(decoded.encode_binary()?, spliced);
    Ok(())
}

#[test]
fn malformed_inputs_are_rejected() {
    use wasm_splice::Error;

    assert!(matches!(Module::parse(b"\0foo"), Err(Error::BadMagic)));
    assert!(matches!(
        Module::parse(&[0x00, 0x61, 0x73, 0x6d, 0x02, 0x00, 0x00, 0x00]),
        Err(Error::BadVersion(2)),
    ));
    // Section id 13 does not exist.
    assert!(matches!(
        Module::parse(&[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, 0x0d, 0x00]),
        Err(Error::UnknownSection(13)),
    ));
    // A type section whose payload runs out mid-count.
    assert!(matches!(
        Module::parse(&[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01, 0x80]),
        Err(Error::MalformedVarint),
    ));
}
