//! DWARF sidecar extraction over a synthetic debug-info fixture.
//!
//! The fixture is assembled with gimli's write API rather than hand-laid
//! bytes: one compile unit with a line program, a subprogram `foo` whose
//! parameter `x` lives in wasm local 0 over PC range [100, 120), and a
//! translation-unit-scope variable `counter` pinned at address 4096.

use anyhow::Result;
use gimli::write::{
    Address, AttributeValue, DwarfUnit, EndianVec, Expression, LineProgram, LineString, Location,
    LocationList, Sections,
};
use gimli::{Encoding, Format, LineEncoding, LittleEndian};
use wasm_splice::{CustomEntry, Module, SectionId};

fn fixture() -> Result<Module> {
    let encoding = Encoding {
        format: Format::Dwarf32,
        version: 4,
        address_size: 4,
    };
    let mut dwarf = DwarfUnit::new(encoding);

    let mut program = LineProgram::new(
        encoding,
        LineEncoding::default(),
        LineString::String(Vec::new()),
        LineString::String(b"a.go".to_vec()),
        None,
    );
    let dir = program.default_directory();
    let file = program.add_file(LineString::String(b"a.go".to_vec()), dir, None);
    program.begin_sequence(Some(Address::Constant(100)));
    program.row().address_offset = 0;
    program.row().file = file;
    program.row().line = 10;
    program.row().column = 3;
    program.generate_row();
    program.row().address_offset = 10;
    program.row().file = file;
    program.row().line = 11;
    program.row().column = 1;
    program.generate_row();
    program.end_sequence(30);
    dwarf.unit.line_program = program;

    // `x` lives in wasm local 0 while PC is within [100, 120).
    let x_locations = dwarf.unit.locations.add(LocationList(vec![Location::StartEnd {
        begin: Address::Constant(100),
        end: Address::Constant(120),
        data: Expression::raw(vec![0xed, 0x00, 0x00]),
    }]));

    let root = dwarf.unit.root();

    let int_type = dwarf.unit.add(root, gimli::DW_TAG_base_type);
    dwarf
        .unit
        .get_mut(int_type)
        .set(gimli::DW_AT_name, AttributeValue::String(b"int".to_vec()));
    dwarf
        .unit
        .get_mut(int_type)
        .set(gimli::DW_AT_byte_size, AttributeValue::Udata(4));

    let sub = dwarf.unit.add(root, gimli::DW_TAG_subprogram);
    dwarf
        .unit
        .get_mut(sub)
        .set(gimli::DW_AT_name, AttributeValue::String(b"foo".to_vec()));
    dwarf.unit.get_mut(sub).set(
        gimli::DW_AT_low_pc,
        AttributeValue::Address(Address::Constant(100)),
    );

    let param = dwarf.unit.add(sub, gimli::DW_TAG_formal_parameter);
    dwarf
        .unit
        .get_mut(param)
        .set(gimli::DW_AT_name, AttributeValue::String(b"x".to_vec()));
    dwarf
        .unit
        .get_mut(param)
        .set(gimli::DW_AT_type, AttributeValue::UnitRef(int_type));
    dwarf.unit.get_mut(param).set(
        gimli::DW_AT_location,
        AttributeValue::LocationListRef(x_locations),
    );

    let counter = dwarf.unit.add(root, gimli::DW_TAG_variable);
    dwarf.unit.get_mut(counter).set(
        gimli::DW_AT_name,
        AttributeValue::String(b"counter".to_vec()),
    );
    dwarf
        .unit
        .get_mut(counter)
        .set(gimli::DW_AT_type, AttributeValue::UnitRef(int_type));
    let mut addr_expr = vec![0x03];
    addr_expr.extend_from_slice(&4096u32.to_le_bytes());
    dwarf.unit.get_mut(counter).set(
        gimli::DW_AT_location,
        AttributeValue::Exprloc(Expression::raw(addr_expr)),
    );

    let mut sections = Sections::new(EndianVec::new(LittleEndian));
    dwarf.write(&mut sections)?;

    // A host module whose one function covers the fixture's PC range, so
    // subprogram data can be pinned to a function index.
    let mut module = Module::from_wat("(module (func $foo nop))")?;
    module.code[0].pc_valid = true;
    module.code[0].code_section_ptr = 90;
    module.code[0].code_section_len = 40;

    sections.for_each(|id, data| {
        if !data.slice().is_empty() {
            module.custom.push(CustomEntry {
                name: id.name().to_string(),
                data: data.slice().to_vec(),
                after: Some(SectionId::Code),
            });
        }
        Ok::<(), gimli::Error>(())
    })?;

    module.parse_dwarf()?;
    module.parse_dwarf_line_numbers()?;
    module.parse_dwarf_variables()?;
    Ok(module)
}

#[test]
fn line_numbers_extracted() -> Result<()> {
    let module = fixture()?;
    assert_eq!(module.source_location(100).as_deref(), Some("a.go:10.3"));
    assert_eq!(module.source_location(110).as_deref(), Some("a.go:11.1"));
    assert_eq!(module.source_location(131), None);
    Ok(())
}

/// Scenario S3: the PC-range × local-index join.
#[test]
fn local_name_join() -> Result<()> {
    let module = fixture()?;
    assert_eq!(module.local_var_name(110, 0), Some("x"));
    assert_eq!(module.local_var_name(110, 1), None);
    assert_eq!(module.local_var_name(200, 0), None);
    assert_eq!(module.local_var_type(110, 0), Some("int"));
    Ok(())
}

#[test]
fn subprogram_signature_lands_on_function() -> Result<()> {
    let module = fixture()?;
    assert_eq!(module.function_signature(0), Some("foo(x(int))"));
    assert_eq!(module.function_debug(0), Some(";; foo(x(int))\n"));
    Ok(())
}

#[test]
fn tu_scope_global_with_addr_expression() -> Result<()> {
    let module = fixture()?;
    let counter = module.global_address("counter").expect("global missing");
    assert_eq!(counter.address, 4096);
    assert_eq!(counter.size, 4);
    assert_eq!(counter.type_name, "int");
    Ok(())
}

#[test]
fn line_range_summarizes_per_file() -> Result<()> {
    let module = fixture()?;
    let summary = module.line_range(&module.code[0]);
    assert_eq!(summary.as_deref(), Some("a.go(10-11)"));
    Ok(())
}

#[test]
fn line_number_before_scans_backward() -> Result<()> {
    let module = fixture()?;
    let code = &module.code[0];
    assert_eq!(
        module.line_number_before(code, 105).as_deref(),
        Some("a.go:10.3"),
    );
    assert_eq!(module.line_number_before(code, 95), None);
    Ok(())
}

#[test]
fn modules_without_dwarf_parse_quietly() -> Result<()> {
    let mut module = Module::from_wat("(module (func $f nop))")?;
    module.parse_dwarf()?;
    module.parse_dwarf_line_numbers()?;
    module.parse_dwarf_variables()?;
    assert!(module.debug.line_info.is_empty());
    assert!(module.debug.local_names.is_empty());
    assert!(module.debug.global_addresses.is_empty());
    Ok(())
}
