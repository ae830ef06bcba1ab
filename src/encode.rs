//! Encoding the module model back into wasm binary bytes.
//!
//! Every section, and every length-prefixed sub-payload inside a section
//! (code bodies, data segments, custom payloads), is emitted into a
//! scratch buffer first and then written length-prefixed, mirroring the
//! decoder exactly. The encoder is byte-stable over its own output.
//!
//! Encoding refuses to proceed while any instruction still carries a
//! symbolic operand; the linker's `resolve_*` passes must run first.

use crate::error::{Error, Result};
use crate::instr::{
    BlockType, Expression, ExtOpcode, FuncRef, GlobalRef, I32Operand, Instruction, Opcode,
    EXT_PREFIX,
};
use crate::leb128;
use crate::module::{
    CodeEntry, DataEntry, ElemEntry, GlobalEntry, ImportKind, Module, SectionId, TableEntry,
    TypeEntry, ValType, WASM_MAGIC, WASM_VERSION,
};
use crate::names;

const FUNC_TYPE_PREFIX: u8 = 0x60;
const BLOCK_TYPE_EMPTY: u8 = 0x40;
const END_OPCODE: u8 = Opcode::End as u8;

impl Module {
    /// Encode this module as wasm binary bytes.
    ///
    /// Fails with the matching `Unresolved*` error if any instruction in
    /// any code body or initializer expression still needs linking.
    pub fn encode_binary(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&WASM_MAGIC);
        out.extend_from_slice(&WASM_VERSION.to_le_bytes());

        // Custom sections are re-emitted in the slot they were decoded
        // from, keeping the binary section order byte-identical. If name
        // maps are populated (parse_name ran, or the linker added names)
        // the stored `name` payload is stale, so it is regenerated from
        // the maps wherever it sits.
        let generated_names = names::encode_name_section(self);
        let mut emitted_names = false;
        self.write_customs(&mut out, None, &generated_names, &mut emitted_names);

        if !self.types.is_empty() {
            let mut buf = Vec::new();
            leb128::write_u64(&mut buf, self.types.len() as u64);
            for entry in &self.types {
                write_type_entry(&mut buf, entry);
            }
            write_section(&mut out, SectionId::Type, &buf);
        }
        self.write_customs(&mut out, Some(SectionId::Type), &generated_names, &mut emitted_names);

        if !self.imports.is_empty() {
            let mut buf = Vec::new();
            leb128::write_u64(&mut buf, self.imports.len() as u64);
            for import in &self.imports {
                leb128::write_string(&mut buf, &import.module);
                leb128::write_string(&mut buf, &import.field);
                match &import.kind {
                    ImportKind::Func { type_index } => {
                        buf.push(0x00);
                        leb128::write_u32(&mut buf, *type_index);
                    }
                    ImportKind::Table(table) => {
                        buf.push(0x01);
                        write_table_entry(&mut buf, table);
                    }
                    ImportKind::Memory(memory) => {
                        buf.push(0x02);
                        write_limits(&mut buf, memory.limit_min, memory.limit_max);
                    }
                    ImportKind::Global { valtype, mutable } => {
                        buf.push(0x03);
                        buf.push(*valtype as u8);
                        buf.push(u8::from(*mutable));
                    }
                }
            }
            write_section(&mut out, SectionId::Import, &buf);
        }
        self.write_customs(
            &mut out,
            Some(SectionId::Import),
            &generated_names,
            &mut emitted_names,
        );

        if !self.functions.is_empty() {
            let mut buf = Vec::new();
            leb128::write_u64(&mut buf, self.functions.len() as u64);
            for function in &self.functions {
                leb128::write_u32(&mut buf, function.type_index);
            }
            write_section(&mut out, SectionId::Function, &buf);
        }
        self.write_customs(
            &mut out,
            Some(SectionId::Function),
            &generated_names,
            &mut emitted_names,
        );

        if !self.tables.is_empty() {
            let mut buf = Vec::new();
            leb128::write_u64(&mut buf, self.tables.len() as u64);
            for table in &self.tables {
                write_table_entry(&mut buf, table);
            }
            write_section(&mut out, SectionId::Table, &buf);
        }
        self.write_customs(&mut out, Some(SectionId::Table), &generated_names, &mut emitted_names);

        if !self.memories.is_empty() {
            let mut buf = Vec::new();
            leb128::write_u64(&mut buf, self.memories.len() as u64);
            for memory in &self.memories {
                write_limits(&mut buf, memory.limit_min, memory.limit_max);
            }
            write_section(&mut out, SectionId::Memory, &buf);
        }
        self.write_customs(
            &mut out,
            Some(SectionId::Memory),
            &generated_names,
            &mut emitted_names,
        );

        if !self.globals.is_empty() {
            let mut buf = Vec::new();
            leb128::write_u64(&mut buf, self.globals.len() as u64);
            for global in &self.globals {
                write_global_entry(&mut buf, global)?;
            }
            write_section(&mut out, SectionId::Global, &buf);
        }
        self.write_customs(
            &mut out,
            Some(SectionId::Global),
            &generated_names,
            &mut emitted_names,
        );

        if !self.exports.is_empty() {
            let mut buf = Vec::new();
            leb128::write_u64(&mut buf, self.exports.len() as u64);
            for export in &self.exports {
                leb128::write_string(&mut buf, &export.name);
                buf.push(export.kind as u8);
                leb128::write_u32(&mut buf, export.index);
            }
            write_section(&mut out, SectionId::Export, &buf);
        }
        self.write_customs(
            &mut out,
            Some(SectionId::Export),
            &generated_names,
            &mut emitted_names,
        );
        // The start section is dropped on decode, but a custom section
        // recorded after it keeps its slot.
        self.write_customs(&mut out, Some(SectionId::Start), &generated_names, &mut emitted_names);

        if !self.elements.is_empty() {
            let mut buf = Vec::new();
            leb128::write_u64(&mut buf, self.elements.len() as u64);
            for element in &self.elements {
                write_elem_entry(&mut buf, element)?;
            }
            write_section(&mut out, SectionId::Elem, &buf);
        }
        self.write_customs(&mut out, Some(SectionId::Elem), &generated_names, &mut emitted_names);
        // Likewise for the dropped data-count section, which sits
        // between the element and code sections.
        self.write_customs(
            &mut out,
            Some(SectionId::DataCount),
            &generated_names,
            &mut emitted_names,
        );

        if !self.code.is_empty() {
            let mut buf = Vec::new();
            leb128::write_u64(&mut buf, self.code.len() as u64);
            for code in &self.code {
                write_code_entry(&mut buf, code)?;
            }
            write_section(&mut out, SectionId::Code, &buf);
        }
        self.write_customs(&mut out, Some(SectionId::Code), &generated_names, &mut emitted_names);

        if !self.data.is_empty() {
            let mut buf = Vec::new();
            leb128::write_u64(&mut buf, self.data.len() as u64);
            for data in &self.data {
                write_data_entry(&mut buf, data)?;
            }
            write_section(&mut out, SectionId::Data, &buf);
        }

        self.write_customs(&mut out, Some(SectionId::Data), &generated_names, &mut emitted_names);

        // Name maps with no raw `name` section to replace get a fresh
        // section at the end.
        if !emitted_names {
            if let Some(payload) = generated_names {
                let mut buf = Vec::new();
                leb128::write_string(&mut buf, "name");
                buf.extend_from_slice(&payload);
                write_section(&mut out, SectionId::Custom, &buf);
            }
        }

        Ok(out)
    }

    /// Emit the custom sections recorded in the given slot, substituting
    /// the regenerated `name` payload for a stale one.
    fn write_customs(
        &self,
        out: &mut Vec<u8>,
        slot: Option<SectionId>,
        generated_names: &Option<Vec<u8>>,
        emitted_names: &mut bool,
    ) {
        for custom in self.custom.iter().filter(|c| c.after == slot) {
            let mut buf = Vec::new();
            leb128::write_string(&mut buf, &custom.name);
            if custom.name == "name" {
                *emitted_names = true;
                match generated_names {
                    Some(payload) => buf.extend_from_slice(payload),
                    None => buf.extend_from_slice(&custom.data),
                }
            } else {
                buf.extend_from_slice(&custom.data);
            }
            write_section(out, SectionId::Custom, &buf);
        }
    }
}

fn write_section(out: &mut Vec<u8>, id: SectionId, payload: &[u8]) {
    out.push(id as u8);
    leb128::write_bytes(out, payload);
}

fn write_type_entry(out: &mut Vec<u8>, entry: &TypeEntry) {
    out.push(FUNC_TYPE_PREFIX);
    leb128::write_u64(out, entry.params.len() as u64);
    for param in &entry.params {
        out.push(*param as u8);
    }
    leb128::write_u64(out, entry.results.len() as u64);
    for result in &entry.results {
        out.push(*result as u8);
    }
}

fn write_table_entry(out: &mut Vec<u8>, table: &TableEntry) {
    out.push(table.table_type);
    write_limits(out, table.limit_min, table.limit_max);
}

fn write_limits(out: &mut Vec<u8>, min: u32, max: Option<u32>) {
    match max {
        None => {
            out.push(0x00);
            leb128::write_u32(out, min);
        }
        Some(max) => {
            out.push(0x01);
            leb128::write_u32(out, min);
            leb128::write_u32(out, max);
        }
    }
}

fn write_global_entry(out: &mut Vec<u8>, global: &GlobalEntry) -> Result<()> {
    out.push(global.valtype as u8);
    out.push(u8::from(global.mutable));
    write_expression(out, &global.init)?;
    out.push(END_OPCODE);
    Ok(())
}

fn write_elem_entry(out: &mut Vec<u8>, element: &ElemEntry) -> Result<()> {
    leb128::write_u32(out, element.table_index);
    write_expression(out, &element.offset)?;
    out.push(END_OPCODE);
    leb128::write_u64(out, element.indexes.len() as u64);
    for index in &element.indexes {
        leb128::write_u32(out, *index);
    }
    Ok(())
}

fn write_data_entry(out: &mut Vec<u8>, data: &DataEntry) -> Result<()> {
    leb128::write_u32(out, data.mem_index);
    write_expression(out, &data.offset)?;
    out.push(END_OPCODE);
    leb128::write_bytes(out, &data.data);
    Ok(())
}

fn write_code_entry(out: &mut Vec<u8>, code: &CodeEntry) -> Result<()> {
    let mut buf = Vec::new();

    // Locals are stored flattened; regroup into maximal runs.
    let runs = local_runs(&code.locals);
    leb128::write_u64(&mut buf, runs.len() as u64);
    for (count, valtype) in runs {
        leb128::write_u64(&mut buf, u64::from(count));
        buf.push(valtype as u8);
    }

    write_expression(&mut buf, &code.expression)?;
    buf.push(END_OPCODE);

    leb128::write_bytes(out, &buf);
    Ok(())
}

fn local_runs(locals: &[ValType]) -> Vec<(u32, ValType)> {
    let mut runs: Vec<(u32, ValType)> = Vec::new();
    for &valtype in locals {
        match runs.last_mut() {
            Some((count, last)) if *last == valtype => *count += 1,
            _ => runs.push((1, valtype)),
        }
    }
    runs
}

fn write_expression(out: &mut Vec<u8>, expression: &[Expression]) -> Result<()> {
    for expr in expression {
        write_instruction(out, expr)?;
    }
    Ok(())
}

fn write_block_type(out: &mut Vec<u8>, block_type: BlockType) {
    match block_type {
        BlockType::Empty => out.push(BLOCK_TYPE_EMPTY),
        BlockType::Value(valtype) => out.push(valtype as u8),
    }
}

fn write_instruction(out: &mut Vec<u8>, expr: &Expression) -> Result<()> {
    match &expr.instr {
        Instruction::Op(op) => {
            out.push(*op as u8);
            if matches!(op, Opcode::MemorySize | Opcode::MemoryGrow) {
                // Mandatory reserved memory index: strict zero on encode.
                out.push(0x00);
            }
        }
        Instruction::Ext(op) => {
            out.push(EXT_PREFIX);
            leb128::write_u32(out, *op as u32);
            match op {
                ExtOpcode::MemoryCopy => out.extend_from_slice(&[0x00, 0x00]),
                ExtOpcode::MemoryFill => out.push(0x00),
                _ => {}
            }
        }
        Instruction::Block(bt) => {
            out.push(Opcode::Block as u8);
            write_block_type(out, *bt);
        }
        Instruction::Loop(bt) => {
            out.push(Opcode::Loop as u8);
            write_block_type(out, *bt);
        }
        Instruction::If(bt) => {
            out.push(Opcode::If as u8);
            write_block_type(out, *bt);
        }
        Instruction::Br(label) => {
            out.push(Opcode::Br as u8);
            leb128::write_u32(out, *label);
        }
        Instruction::BrIf(label) => {
            out.push(Opcode::BrIf as u8);
            leb128::write_u32(out, *label);
        }
        Instruction::BrTable { labels, default } => {
            out.push(Opcode::BrTable as u8);
            leb128::write_u64(out, labels.len() as u64);
            for label in labels {
                leb128::write_u32(out, *label);
            }
            leb128::write_u32(out, *default);
        }
        Instruction::Call(target) => match target {
            FuncRef::Index(index) => {
                out.push(Opcode::Call as u8);
                leb128::write_u32(out, *index);
            }
            FuncRef::Symbol(symbol) => {
                return Err(Error::UnresolvedFunction(symbol.clone()));
            }
        },
        Instruction::CallIndirect {
            type_index,
            table_index,
        } => {
            out.push(Opcode::CallIndirect as u8);
            leb128::write_u32(out, *type_index);
            leb128::write_u32(out, *table_index);
        }
        Instruction::Local { op, index } => {
            out.push(*op as u8);
            leb128::write_u32(out, *index);
        }
        Instruction::Global { op, target } => match target {
            GlobalRef::Index(index) => {
                out.push(*op as u8);
                leb128::write_u32(out, *index);
            }
            GlobalRef::Symbol(symbol) => {
                return Err(Error::UnresolvedGlobal(symbol.clone()));
            }
        },
        Instruction::Memory { op, align, offset } => {
            out.push(*op as u8);
            leb128::write_u32(out, *align);
            leb128::write_u64(out, *offset);
        }
        Instruction::I32Const(operand) => {
            let value = match operand {
                I32Operand::Value(value) => *value,
                I32Operand::DataOffset {
                    value: Some(value), ..
                }
                | I32Operand::DataLength {
                    value: Some(value), ..
                } => *value,
                I32Operand::DataOffset { symbol, value: None }
                | I32Operand::DataLength { symbol, value: None } => {
                    return Err(Error::UnresolvedData(symbol.clone()));
                }
            };
            out.push(Opcode::I32Const as u8);
            leb128::write_i32(out, value);
        }
        Instruction::I64Const(value) => {
            out.push(Opcode::I64Const as u8);
            leb128::write_i64(out, *value);
        }
        Instruction::F32Const(value) => {
            out.push(Opcode::F32Const as u8);
            leb128::write_f32(out, *value);
        }
        Instruction::F64Const(value) => {
            out.push(Opcode::F64Const as u8);
            leb128::write_f64(out, *value);
        }
    }
    Ok(())
}
