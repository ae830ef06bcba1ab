//! Merge, relocation and resolution scenarios for the link engine.

use anyhow::Result;
use std::collections::HashMap;
use wasm_splice::{
    Error, ExternalKind, FuncRef, GlobalRef, I32Operand, ImportEntry, ImportKind, Instruction,
    Module, Opcode,
};

fn host_with_two_imports() -> Result<Module> {
    Ok(Module::from_wat(
        r#"
        (module
          (import "env" "a" (func $a))
          (import "env" "b" (func $b))
          (func $main call $main)
          (export "main" (func $main))
        )
        "#,
    )?)
}

fn call_operands(module: &Module, code_index: usize) -> Vec<FuncRef> {
    module.code[code_index]
        .expression
        .iter()
        .filter_map(|e| match &e.instr {
            Instruction::Call(target) => Some(target.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn import_insertion_shifts_every_reference() -> Result<()> {
    let mut host = host_with_two_imports()?;
    assert_eq!(call_operands(&host, 0), vec![FuncRef::Index(2)]);

    let mut donor = Module::from_wat(r#"(module (import "c" "c" (func $c)))"#)?;
    let mut remaps: Vec<HashMap<u32, u32>> = Vec::new();
    host.add_funcs_from(&mut donor, |remap| remaps.push(remap.clone()))?;

    assert_eq!(host.imports.len(), 3);
    assert_eq!(host.imports[2].key(), "c:c");

    // The self-call moved from 2 to 3, and so did the export.
    assert_eq!(call_operands(&host, 0), vec![FuncRef::Index(3)]);
    let export = &host.exports[0];
    assert_eq!(export.kind, ExternalKind::Func);
    assert_eq!(export.index, 3);
    assert_eq!(host.function_name(3), Some("$main"));
    assert_eq!(host.lookup_function_id("$c"), Some(2));

    // The callback observed the one universal remap.
    assert_eq!(remaps.len(), 1);
    assert_eq!(remaps[0].get(&2), Some(&3));
    assert_eq!(remaps[0].get(&0), Some(&0));
    Ok(())
}

#[test]
fn existing_import_is_reused() -> Result<()> {
    let mut host = host_with_two_imports()?;
    let mut donor = Module::from_wat(
        r#"
        (module
          (import "env" "a" (func $donor_a))
          (func $helper call $donor_a)
        )
        "#,
    )?;
    host.add_funcs_from(&mut donor, |_| panic!("no import insert expected"))?;

    // No new import, and the donor body's call retargeted to the host's
    // existing index for env:a.
    assert_eq!(host.imports.len(), 2);
    assert_eq!(host.code.len(), 2);
    assert_eq!(call_operands(&host, 1), vec![FuncRef::Index(0)]);
    assert_eq!(host.lookup_function_id("$helper"), Some(3));
    Ok(())
}

#[test]
fn merge_leaves_no_dangling_references() -> Result<()> {
    let mut host = host_with_two_imports()?;
    let mut donor = Module::from_wat(
        r#"
        (module
          (import "c" "c" (func $c))
          (global $dg (mut i32) (i32.const 5))
          (func $one call $two call $c global.get $dg drop)
          (func $two call $one)
        )
        "#,
    )?;
    host.add_funcs_from(&mut donor, |_| {})?;

    let limit = host.num_funcs();
    for (index, code) in host.code.iter().enumerate() {
        for target in call_operands(&host, index) {
            match target {
                FuncRef::Index(i) => assert!(i < limit, "dangling call to {i}"),
                FuncRef::Symbol(s) => panic!("unexpected symbolic call {s}"),
            }
        }
        for expr in &code.expression {
            if let Instruction::Global {
                target: GlobalRef::Index(i),
                ..
            } = &expr.instr
            {
                assert!((*i as usize) < host.globals.len());
            }
        }
    }

    // Donor self- and cross-calls remapped into the appended positions:
    // imports [a b c], then main=3, one=4, two=5.
    assert_eq!(call_operands(&host, 1), vec![
        FuncRef::Index(5),
        FuncRef::Index(2),
    ]);
    assert_eq!(call_operands(&host, 2), vec![FuncRef::Index(4)]);
    Ok(())
}

#[test]
fn type_dedup_on_merge() -> Result<()> {
    let mut host = Module::from_wat(
        "(module (func $f (param i32 i32) (result i32) local.get 0))",
    )?;
    let before = host.types.len();
    let mut donor = Module::from_wat(
        "(module (func $g (param i32 i32) (result i32) local.get 1))",
    )?;
    host.add_funcs_from(&mut donor, |_| {})?;
    assert_eq!(host.types.len(), before);
    assert_eq!(host.functions[0].type_index, host.functions[1].type_index);
    Ok(())
}

#[test]
fn data_relocation_scenario() -> Result<()> {
    let mut host = Module::from_wat(
        r#"
        (module
          (memory 1)
          (global $base (mut i32) (i32.const 0))
        )
        "#,
    )?;
    let mut donor = Module::from_wat(
        r#"
        (module
          (data $D0 (i32.const 0) "hello")
          (func $f
            i32.const offset($D0)
            drop
          )
        )
        "#,
    )?;

    let next = host.add_data_from(65536, &mut donor);
    assert_eq!(host.data[0].const_offset()?, 65536);
    // 65536 + 5 rounded up to the next 8-byte boundary.
    assert_eq!(next, 65544);
    assert_eq!(host.lookup_data_id("$D0"), Some(0));

    host.add_funcs_from(&mut donor, |_| {})?;

    // Unresolved relocations refuse to encode.
    assert!(matches!(
        host.encode_binary(),
        Err(Error::UnresolvedData(_)),
    ));

    host.resolve_relocations(0, 65536)?;
    assert_eq!(
        host.code[0].expression[0].instr,
        Instruction::I32Const(I32Operand::DataOffset {
            symbol: "$D0".to_string(),
            value: Some(0),
        }),
    );

    host.insert_after_relocating(0, "global.get $base\ni32.add")?;
    let instrs: Vec<&Instruction> = host.code[0]
        .expression
        .iter()
        .map(|e| &e.instr)
        .collect();
    assert_eq!(instrs.len(), 4);
    assert!(matches!(
        instrs[0],
        Instruction::I32Const(I32Operand::DataOffset { value: Some(0), .. }),
    ));
    assert_eq!(
        *instrs[1],
        Instruction::Global {
            op: Opcode::GlobalGet,
            target: GlobalRef::Index(0),
        },
    );
    assert_eq!(*instrs[2], Instruction::Op(Opcode::I32Add));
    assert_eq!(*instrs[3], Instruction::Op(Opcode::Drop));

    // Everything resolved now; the binary encoder accepts it.
    host.encode_binary()?;
    Ok(())
}

#[test]
fn resolve_lengths_and_functions() -> Result<()> {
    let mut module = Module::from_wat(
        r#"
        (module
          (data $blob (i32.const 0) "four")
          (func $target)
          (func $f
            i32.const length($blob)
            drop
            call $later
          )
        )
        "#,
    )?;

    // `$later` does not exist yet; resolution fails by name.
    assert!(matches!(
        module.resolve_functions(1),
        Err(Error::UnresolvedFunction(name)) if name == "$later",
    ));

    // Once something by that name exists, resolution collapses the
    // symbol to its index.
    module.function_names.insert(0, "$later".to_string());
    module.resolve_functions(1)?;
    assert_eq!(call_operands(&module, 1), vec![FuncRef::Index(0)]);

    module.resolve_lengths(1)?;
    assert_eq!(
        module.code[1].expression[0].instr,
        Instruction::I32Const(I32Operand::DataLength {
            symbol: "$blob".to_string(),
            value: Some(4),
        }),
    );
    Ok(())
}

#[test]
fn replace_and_wrap_instructions() -> Result<()> {
    let mut module = Module::from_wat(
        r#"
        (module
          (memory 1)
          (func $grow_wrapper (param i32) (result i32)
            local.get 0
            memory.grow
          )
          (func $f (param i32) (result i32)
            local.get 0
            memory.grow
          )
        )
        "#,
    )?;

    module.replace_instruction(1, "memory.grow", "call $grow_wrapper")?;
    assert_eq!(call_operands(&module, 1), vec![FuncRef::Index(0)]);
    // The wrapper itself keeps its real memory.grow.
    assert!(module.code[0]
        .expression
        .iter()
        .any(|e| e.instr == Instruction::Op(Opcode::MemoryGrow)));

    module.insert_at_func_start(1, "block (result i32)\ni32.const 9\ndrop")?;
    module.insert_at_func_end(1, "end")?;
    let body = &module.code[1].expression;
    assert!(matches!(body[0].instr, Instruction::Block(_)));
    assert_eq!(body.last().unwrap().instr, Instruction::Op(Opcode::End));

    module.encode_binary()?;
    Ok(())
}

#[test]
fn set_global_rewrites_initializer() -> Result<()> {
    let mut module = Module::from_wat(
        "(module (global $debug_start_mem (mut i32) (i32.const 0)))",
    )?;
    module.set_global("$debug_start_mem", wasm_splice::ValType::I32, "i32.const 65536")?;
    assert_eq!(
        module.globals[0].init[0].instr,
        Instruction::I32Const(I32Operand::Value(65536)),
    );
    assert!(matches!(
        module.set_global("$missing", wasm_splice::ValType::I32, "i32.const 0"),
        Err(Error::UnresolvedGlobal(_)),
    ));
    Ok(())
}

#[test]
fn duplicate_import_is_rejected() -> Result<()> {
    let mut module = host_with_two_imports()?;
    let entry = ImportEntry {
        module: "env".to_string(),
        field: "a".to_string(),
        kind: ImportKind::Func { type_index: 0 },
    };
    assert!(matches!(
        module.add_import(entry),
        Err(Error::DuplicateImport(key)) if key == "env:a",
    ));

    let fresh = ImportEntry {
        module: "env".to_string(),
        field: "fresh".to_string(),
        kind: ImportKind::Func { type_index: 0 },
    };
    assert_eq!(module.add_import(fresh)?, 2);
    Ok(())
}
