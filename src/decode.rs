//! Decoding wasm binaries into the module model.
//!
//! The decoder consumes the `\0asm` header and then one section at a time.
//! Code bodies are decoded instruction-by-instruction with each
//! instruction stamped with its byte offset inside the code section
//! payload; that offset is the address space DWARF talks about, so it is
//! what lets the sidecar join line and variable data back onto
//! instructions.

use crate::error::{Error, Result};
use crate::instr::{
    BlockType, Expression, ExtOpcode, FuncRef, GlobalRef, I32Operand, Instruction, Opcode,
    EXT_PREFIX,
};
use crate::leb128;
use crate::module::{
    CodeEntry, CustomEntry, DataEntry, ElemEntry, ExportEntry, ExternalKind, FunctionEntry,
    GlobalEntry, ImportEntry, ImportKind, MemoryEntry, Module, SectionId, TableEntry, TypeEntry,
    ValType, WASM_MAGIC, WASM_VERSION,
};

const FUNC_TYPE_PREFIX: u8 = 0x60;
const BLOCK_TYPE_EMPTY: u8 = 0x40;

impl Module {
    /// Decode a wasm binary into a fresh module.
    pub fn parse(bytes: &[u8]) -> Result<Module> {
        let mut pos = 0usize;

        let magic = bytes.get(0..4).ok_or(Error::BadMagic)?;
        if magic != WASM_MAGIC {
            return Err(Error::BadMagic);
        }
        pos += 4;
        let version = leb128::read_u32_le(bytes, &mut pos)?;
        if version != WASM_VERSION {
            return Err(Error::BadVersion(version));
        }

        let mut module = Module::new();
        let mut last_standard = None;
        while pos < bytes.len() {
            let id_byte = bytes[pos];
            pos += 1;
            let id = SectionId::from_byte(id_byte).ok_or(Error::UnknownSection(id_byte))?;
            let payload = leb128::read_bytes(bytes, &mut pos)?;
            module.decode_section(id, payload, last_standard)?;
            if id != SectionId::Custom {
                last_standard = Some(id);
            }
        }
        Ok(module)
    }

    fn decode_section(
        &mut self,
        id: SectionId,
        payload: &[u8],
        preceding: Option<SectionId>,
    ) -> Result<()> {
        let pos = &mut 0usize;
        match id {
            SectionId::Custom => {
                let name = leb128::read_string(payload, pos)?;
                self.custom.push(CustomEntry {
                    name,
                    data: payload[*pos..].to_vec(),
                    after: preceding,
                });
            }
            SectionId::Type => {
                let count = leb128::read_u32(payload, pos)?;
                for _ in 0..count {
                    self.types.push(read_type_entry(payload, pos)?);
                }
            }
            SectionId::Import => {
                let count = leb128::read_u32(payload, pos)?;
                for _ in 0..count {
                    self.imports.push(read_import_entry(payload, pos)?);
                }
            }
            SectionId::Function => {
                let count = leb128::read_u32(payload, pos)?;
                for _ in 0..count {
                    let type_index = leb128::read_u32(payload, pos)?;
                    self.functions.push(FunctionEntry { type_index });
                }
            }
            SectionId::Table => {
                let count = leb128::read_u32(payload, pos)?;
                for _ in 0..count {
                    self.tables.push(read_table_entry(payload, pos)?);
                }
            }
            SectionId::Memory => {
                let count = leb128::read_u32(payload, pos)?;
                for _ in 0..count {
                    let (limit_min, limit_max) = read_limits(payload, pos)?;
                    self.memories.push(MemoryEntry {
                        limit_min,
                        limit_max,
                    });
                }
            }
            SectionId::Global => {
                let count = leb128::read_u32(payload, pos)?;
                for _ in 0..count {
                    let valtype = read_valtype(payload, pos)?;
                    let mutable = read_byte(payload, pos)? != 0;
                    let init = read_init_expression(payload, pos)?;
                    self.globals.push(GlobalEntry {
                        valtype,
                        mutable,
                        init,
                    });
                }
            }
            SectionId::Export => {
                let count = leb128::read_u32(payload, pos)?;
                for _ in 0..count {
                    let name = leb128::read_string(payload, pos)?;
                    let kind_byte = read_byte(payload, pos)?;
                    let kind = ExternalKind::from_byte(kind_byte)
                        .ok_or(Error::UnknownOpcode(kind_byte))?;
                    let index = leb128::read_u32(payload, pos)?;
                    self.exports.push(ExportEntry { name, kind, index });
                }
            }
            // A start function is of no use to an instrumentation pass;
            // tolerated and dropped, like the data-count section.
            SectionId::Start | SectionId::DataCount => {}
            SectionId::Elem => {
                let count = leb128::read_u32(payload, pos)?;
                for _ in 0..count {
                    let table_index = leb128::read_u32(payload, pos)?;
                    let offset = read_init_expression(payload, pos)?;
                    let n = leb128::read_u32(payload, pos)?;
                    let mut indexes = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        indexes.push(leb128::read_u32(payload, pos)?);
                    }
                    self.elements.push(ElemEntry {
                        table_index,
                        offset,
                        indexes,
                    });
                }
            }
            SectionId::Code => {
                let count = leb128::read_u32(payload, pos)?;
                for _ in 0..count {
                    self.code.push(read_code_entry(payload, pos)?);
                }
            }
            SectionId::Data => {
                let count = leb128::read_u32(payload, pos)?;
                for _ in 0..count {
                    let mem_index = leb128::read_u32(payload, pos)?;
                    let offset = read_init_expression(payload, pos)?;
                    let data = leb128::read_bytes(payload, pos)?.to_vec();
                    self.data.push(DataEntry {
                        mem_index,
                        offset,
                        data,
                    });
                }
            }
        }
        Ok(())
    }
}

fn read_byte(data: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *data.get(*pos).ok_or(Error::TruncatedSection)?;
    *pos += 1;
    Ok(byte)
}

fn read_valtype(data: &[u8], pos: &mut usize) -> Result<ValType> {
    let byte = read_byte(data, pos)?;
    ValType::from_byte(byte).ok_or(Error::UnknownOpcode(byte))
}

fn read_limits(data: &[u8], pos: &mut usize) -> Result<(u32, Option<u32>)> {
    let flag = read_byte(data, pos)?;
    let min = leb128::read_u32(data, pos)?;
    match flag {
        0x00 => Ok((min, None)),
        0x01 => Ok((min, Some(leb128::read_u32(data, pos)?))),
        other => Err(Error::UnknownOpcode(other)),
    }
}

fn read_type_entry(data: &[u8], pos: &mut usize) -> Result<TypeEntry> {
    let prefix = read_byte(data, pos)?;
    if prefix != FUNC_TYPE_PREFIX {
        return Err(Error::UnknownOpcode(prefix));
    }
    let nparams = leb128::read_u32(data, pos)?;
    let mut params = Vec::with_capacity(nparams as usize);
    for _ in 0..nparams {
        params.push(read_valtype(data, pos)?);
    }
    let nresults = leb128::read_u32(data, pos)?;
    let mut results = Vec::with_capacity(nresults as usize);
    for _ in 0..nresults {
        results.push(read_valtype(data, pos)?);
    }
    Ok(TypeEntry { params, results })
}

fn read_table_entry(data: &[u8], pos: &mut usize) -> Result<TableEntry> {
    let table_type = read_byte(data, pos)?;
    let (limit_min, limit_max) = read_limits(data, pos)?;
    Ok(TableEntry {
        table_type,
        limit_min,
        limit_max,
    })
}

fn read_import_entry(data: &[u8], pos: &mut usize) -> Result<ImportEntry> {
    let module = leb128::read_string(data, pos)?;
    let field = leb128::read_string(data, pos)?;
    let kind_byte = read_byte(data, pos)?;
    let kind = match kind_byte {
        0x00 => ImportKind::Func {
            type_index: leb128::read_u32(data, pos)?,
        },
        0x01 => ImportKind::Table(read_table_entry(data, pos)?),
        0x02 => {
            let (limit_min, limit_max) = read_limits(data, pos)?;
            ImportKind::Memory(MemoryEntry {
                limit_min,
                limit_max,
            })
        }
        0x03 => {
            let valtype = read_valtype(data, pos)?;
            let mutable = read_byte(data, pos)? != 0;
            ImportKind::Global { valtype, mutable }
        }
        other => return Err(Error::UnknownOpcode(other)),
    };
    Ok(ImportEntry {
        module,
        field,
        kind,
    })
}

fn read_code_entry(data: &[u8], pos: &mut usize) -> Result<CodeEntry> {
    let body = leb128::read_bytes(data, pos)?;
    let body_start = *pos - body.len();

    let inner = &mut 0usize;
    let nruns = leb128::read_u32(body, inner)?;
    let mut locals = Vec::new();
    for _ in 0..nruns {
        let count = leb128::read_u32(body, inner)?;
        let valtype = read_valtype(body, inner)?;
        for _ in 0..count {
            locals.push(valtype);
        }
    }

    let code_section_ptr = (body_start + *inner) as u64;
    let mut expression = Vec::new();
    let mut depth = 0usize;
    loop {
        let pc = (body_start + *inner) as u64;
        let expr = read_instruction(body, inner, pc)?;
        match expr.instr {
            Instruction::Op(Opcode::End) if depth == 0 => break,
            Instruction::Op(Opcode::End) => depth -= 1,
            Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_) => depth += 1,
            _ => {}
        }
        expression.push(expr);
    }
    if *inner != body.len() {
        return Err(Error::TruncatedSection);
    }

    Ok(CodeEntry {
        locals,
        pc_valid: true,
        code_section_ptr,
        code_section_len: (body_start + *inner) as u64 - code_section_ptr,
        expression,
    })
}

/// Read a constant initializer expression up to and including its
/// terminating `end`; the terminator is consumed but not kept.
fn read_init_expression(data: &[u8], pos: &mut usize) -> Result<Vec<Expression>> {
    let mut expression = Vec::new();
    let mut depth = 0usize;
    loop {
        let expr = read_instruction(data, pos, Expression::NO_PC)?;
        match expr.instr {
            Instruction::Op(Opcode::End) if depth == 0 => return Ok(expression),
            Instruction::Op(Opcode::End) => depth -= 1,
            Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_) => depth += 1,
            _ => {}
        }
        expression.push(expr);
    }
}

fn read_block_type(data: &[u8], pos: &mut usize) -> Result<BlockType> {
    let byte = read_byte(data, pos)?;
    if byte == BLOCK_TYPE_EMPTY {
        return Ok(BlockType::Empty);
    }
    ValType::from_byte(byte)
        .map(BlockType::Value)
        .ok_or(Error::UnknownOpcode(byte))
}

fn read_instruction(data: &[u8], pos: &mut usize, pc: u64) -> Result<Expression> {
    let byte = read_byte(data, pos)?;

    if byte == EXT_PREFIX {
        let value = leb128::read_u32(data, pos)?;
        let op = ExtOpcode::from_value(value).ok_or(Error::UnknownExtOpcode(value))?;
        // The reserved memory-index bytes are accepted with any value.
        match op {
            ExtOpcode::MemoryCopy => {
                read_byte(data, pos)?;
                read_byte(data, pos)?;
            }
            ExtOpcode::MemoryFill => {
                read_byte(data, pos)?;
            }
            _ => {}
        }
        return Ok(Expression {
            instr: Instruction::Ext(op),
            pc,
        });
    }

    let op = Opcode::from_byte(byte).ok_or(Error::UnknownOpcode(byte))?;
    let instr = match op {
        Opcode::Block => Instruction::Block(read_block_type(data, pos)?),
        Opcode::Loop => Instruction::Loop(read_block_type(data, pos)?),
        Opcode::If => Instruction::If(read_block_type(data, pos)?),
        Opcode::Br => Instruction::Br(leb128::read_u32(data, pos)?),
        Opcode::BrIf => Instruction::BrIf(leb128::read_u32(data, pos)?),
        Opcode::BrTable => {
            let n = leb128::read_u32(data, pos)?;
            let mut labels = Vec::with_capacity(n as usize);
            for _ in 0..n {
                labels.push(leb128::read_u32(data, pos)?);
            }
            let default = leb128::read_u32(data, pos)?;
            Instruction::BrTable { labels, default }
        }
        Opcode::Call => Instruction::Call(FuncRef::Index(leb128::read_u32(data, pos)?)),
        Opcode::CallIndirect => Instruction::CallIndirect {
            type_index: leb128::read_u32(data, pos)?,
            table_index: leb128::read_u32(data, pos)?,
        },
        Opcode::LocalGet | Opcode::LocalSet | Opcode::LocalTee => Instruction::Local {
            op,
            index: leb128::read_u32(data, pos)?,
        },
        Opcode::GlobalGet | Opcode::GlobalSet => Instruction::Global {
            op,
            target: GlobalRef::Index(leb128::read_u32(data, pos)?),
        },
        Opcode::MemorySize | Opcode::MemoryGrow => {
            // Reserved memory index, any value accepted.
            read_byte(data, pos)?;
            Instruction::Op(op)
        }
        Opcode::I32Const => {
            Instruction::I32Const(I32Operand::Value(leb128::read_i32(data, pos)?))
        }
        Opcode::I64Const => Instruction::I64Const(leb128::read_i64(data, pos)?),
        Opcode::F32Const => Instruction::F32Const(leb128::read_f32(data, pos)?),
        Opcode::F64Const => Instruction::F64Const(leb128::read_f64(data, pos)?),
        op if is_load_store(op) => Instruction::Memory {
            op,
            align: leb128::read_u32(data, pos)?,
            offset: leb128::read_u64(data, pos)?,
        },
        op => Instruction::Op(op),
    };
    Ok(Expression { instr, pc })
}

pub(crate) fn is_load_store(op: Opcode) -> bool {
    (op as u8) >= Opcode::I32Load as u8 && (op as u8) <= Opcode::I64Store32 as u8
}
