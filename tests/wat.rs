//! Text round-trip and annotation behavior.

use anyhow::Result;
use std::collections::HashMap;
use wasm_splice::{
    CodeEntry, Error, Expression, FuncRef, FunctionEntry, I32Operand, Instruction, LineInfo,
    LocalName, Module, Opcode, TypeEntry, ValType,
};

const KITCHEN_SINK: &str = r#"
(module
  (type (func (param i32 i32) (result i32)))
  (import "env" "log" (func $log (type 0)))
  (func $add (type 0)
    local.get 0
    local.get 1
    i32.add
  )
  (func $busy (param i32) (result i32)
    (local i32 i64)
    block (result i32)
      local.get 0
      i32.const -1
      i32.add
      br_if 0
      loop
        local.get 1
        i32.const 1
        i32.sub
        local.tee 1
        br_if 0
      end
      local.get 0
    end
    i32.load offset=8 align=4
  )
  (table 1 1 funcref)
  (memory 1)
  (global $g (mut i32) (i32.const 4))
  (export "add" (func $add))
  (elem (i32.const 0) func $add)
  (data $d (i32.const 16) "\01\02three")
)
"#;

/// Law 2: text decode of an emitted text form reproduces the module.
#[test]
fn wat_roundtrip_is_lossless() -> Result<()> {
    let module = Module::from_wat(KITCHEN_SINK)?;
    let text = module.encode_wat();
    let module2 = Module::from_wat(&text)?;
    assert_eq!(module, module2);
    Ok(())
}

/// Law 2 through the binary decoder: a binary-decoded module prints,
/// reparses and reprints to the identical text.
#[test]
fn wat_roundtrip_from_binary() -> Result<()> {
    let bytes = Module::from_wat(KITCHEN_SINK)?.encode_binary()?;
    let mut module = Module::parse(&bytes)?;
    module.parse_name()?;

    let text = module.encode_wat();
    let module2 = Module::from_wat(&text)?;
    assert_eq!(module2.encode_wat(), text);

    // And the reparsed module still encodes to the same binary.
    assert_eq!(module2.encode_binary()?, bytes);
    Ok(())
}

#[test]
fn rot_mnemonic_aliases_accepted_canonical_emitted() -> Result<()> {
    let module = Module::from_wat(
        "(module (func $f (param i32) (result i32) local.get 0 local.get 0 i32.rotl_s))",
    )?;
    assert!(module.code[0]
        .expression
        .iter()
        .any(|e| e.instr == Instruction::Op(Opcode::I32Rotl)));
    assert!(module.encode_wat().contains("i32.rotl\n"));
    Ok(())
}

#[test]
fn unresolved_symbols_stay_symbolic_until_encode() -> Result<()> {
    let module = Module::from_wat(
        r#"
        (module
          (func $f
            call $not_here_yet
            global.get $neither
            drop
          )
        )
        "#,
    )?;
    assert_eq!(
        module.code[0].expression[0].instr,
        Instruction::Call(FuncRef::Symbol("$not_here_yet".to_string())),
    );
    assert!(matches!(
        module.encode_binary(),
        Err(Error::UnresolvedFunction(name)) if name == "$not_here_yet",
    ));
    Ok(())
}

#[test]
fn offset_and_length_pseudo_operators() -> Result<()> {
    let module = Module::from_wat(
        r#"
        (module
          (data $blob (i32.const 0) "xyz")
          (func $f
            i32.const offset($blob)
            i32.const length($blob)
            drop
            drop
          )
        )
        "#,
    )?;
    assert_eq!(
        module.code[0].expression[0].instr,
        Instruction::I32Const(I32Operand::DataOffset {
            symbol: "$blob".to_string(),
            value: None,
        }),
    );
    assert_eq!(
        module.code[0].expression[1].instr,
        Instruction::I32Const(I32Operand::DataLength {
            symbol: "$blob".to_string(),
            value: None,
        }),
    );
    // The symbolic form survives printing.
    let text = module.encode_wat();
    assert!(text.contains("i32.const offset($blob)"));
    assert!(text.contains("i32.const length($blob)"));
    Ok(())
}

#[test]
fn from_wat_with_data_substitutes_and_appends() -> Result<()> {
    let mut data_map = HashMap::new();
    data_map.insert("$file_content".to_string(), b"real bytes".to_vec());
    data_map.insert("$added".to_string(), b"fresh".to_vec());

    let module = Module::from_wat_with_data(
        r#"(module (data $file_content "placeholder"))"#,
        &data_map,
    )?;
    let existing = module.lookup_data_id("$file_content").unwrap();
    assert_eq!(module.data[existing as usize].data, b"real bytes");

    let added = module.lookup_data_id("$added").unwrap();
    assert_eq!(module.data[added as usize].data, b"fresh");
    assert_eq!(module.data[added as usize].const_offset()?, 0);
    Ok(())
}

#[test]
fn named_params_and_locals_resolve() -> Result<()> {
    let module = Module::from_wat(
        r#"
        (module
          (func $f (param $x i32) (param $y i32) (result i32)
            (local $tmp i32)
            local.get $x
            local.get $y
            i32.add
            local.tee $tmp
          )
        )
        "#,
    )?;
    let body = &module.code[0].expression;
    assert_eq!(body[0].instr, Instruction::Local { op: Opcode::LocalGet, index: 0 });
    assert_eq!(body[1].instr, Instruction::Local { op: Opcode::LocalGet, index: 1 });
    assert_eq!(body[3].instr, Instruction::Local { op: Opcode::LocalTee, index: 2 });
    Ok(())
}

#[test]
fn parse_errors_carry_positions() {
    let err = Module::from_wat("(module\n  (func $f\n    i32.fake\n  )\n)").unwrap_err();
    match err {
        Error::Parse { line, message, .. } => {
            assert_eq!(line, 3);
            assert!(message.contains("i32.fake"));
        }
        other => panic!("expected parse error, got {other:?}"),
    }
}

/// Scenario S6: the annotated line for an instruction with both a line
/// record and a covering local-name record.
#[test]
fn wat_comment_annotation() {
    let mut module = Module::new();
    let type_index = module.intern_type(TypeEntry {
        params: Vec::new(),
        results: Vec::new(),
    });
    module.functions.push(FunctionEntry { type_index });
    let mut code = CodeEntry::new(
        Vec::new(),
        vec![
            Expression {
                instr: Instruction::Local {
                    op: Opcode::LocalGet,
                    index: 2,
                },
                pc: 42,
            },
            Expression {
                instr: Instruction::Op(Opcode::Drop),
                pc: 44,
            },
        ],
    );
    code.pc_valid = true;
    code.code_section_ptr = 40;
    code.code_section_len = 8;
    module.code.push(code);

    module.debug.line_info.insert(
        42,
        LineInfo {
            file: "a.go".to_string(),
            line: 10,
            column: 3,
        },
    );
    module.debug.local_names.push(LocalName {
        start_pc: 40,
        end_pc: 44,
        index: 2,
        name: "x".to_string(),
        type_name: "int".to_string(),
    });

    let text = module.encode_wat();
    assert!(
        text.contains("local.get 2 ;; Src = a.go:10.3 ;; Variable x"),
        "missing annotation in:\n{text}"
    );
    // The drop at pc 44 has no line record and no comment.
    assert!(text.contains("drop\n"));

    assert_eq!(module.local_var_name(42, 2), Some("x"));
    assert_eq!(module.local_var_type(42, 2), Some("int"));
    assert_eq!(module.local_var_name(200, 2), None);
}

#[test]
fn indentation_follows_nesting() -> Result<()> {
    let module = Module::from_wat(
        r#"
        (module
          (func $f
            block
              loop
                br 0
              end
            end
          )
        )
        "#,
    )?;
    let text = module.encode_wat();
    assert!(text.contains("\n    block\n"));
    assert!(text.contains("\n      loop\n"));
    assert!(text.contains("\n        br 0\n"));
    assert!(text.contains("\n      end\n"));
    assert!(text.contains("\n    end\n"));
    Ok(())
}

#[test]
fn intern_type_is_idempotent_across_text_and_model() -> Result<()> {
    let mut module = Module::from_wat(KITCHEN_SINK)?;
    let count = module.types.len();
    let again = module.intern_type(TypeEntry {
        params: vec![ValType::I32, ValType::I32],
        results: vec![ValType::I32],
    });
    assert_eq!(again, 0);
    assert_eq!(module.types.len(), count);
    Ok(())
}
