//! Emitting the module model as readable wasm text.
//!
//! One instruction per line, two spaces of indent per nesting level, with
//! inline comments joined from the DWARF sidecar: `;; Src = file:line.col`
//! wherever the instruction's PC has a line-table row, and `;; Variable
//! <name>` on `local.*` instructions covered by a location-list entry.

use crate::instr::{
    BlockType, Expression, FuncRef, GlobalRef, I32Operand, Instruction, Opcode,
};
use crate::module::{ExternalKind, ImportKind, Module, TypeEntry, ValType};
use std::fmt::Write;

impl Module {
    /// Render the whole module as wasm text.
    pub fn encode_wat(&self) -> String {
        let mut out = String::new();
        out.push_str("(module\n");

        for (index, entry) in self.types.iter().enumerate() {
            let _ = writeln!(out, "  (type (;{index};) (func{}))", signature_text(entry));
        }

        let mut func_index = 0u32;
        for import in &self.imports {
            let desc = match &import.kind {
                ImportKind::Func { type_index } => {
                    let name = match self.function_name(func_index) {
                        Some(name) => format!("{name} "),
                        None => String::new(),
                    };
                    func_index += 1;
                    format!("func {name}(type {type_index})")
                }
                ImportKind::Table(table) => format!(
                    "table {}funcref",
                    limits_text(table.limit_min, table.limit_max)
                ),
                ImportKind::Memory(memory) => format!(
                    "memory {}",
                    limits_text(memory.limit_min, memory.limit_max).trim_end()
                ),
                ImportKind::Global { valtype, mutable } => {
                    format!("global {}", global_type_text(*valtype, *mutable))
                }
            };
            let _ = writeln!(
                out,
                "  (import \"{}\" \"{}\" ({desc}))",
                import.module, import.field
            );
        }

        for (defined, code) in self.code.iter().enumerate() {
            let func_index = self.num_imported_funcs() + defined as u32;
            let type_index = self
                .functions
                .get(defined)
                .map(|f| f.type_index)
                .unwrap_or(0);
            let name = match self.function_name(func_index) {
                Some(name) => format!("{name} "),
                None => String::new(),
            };
            let signature = self
                .types
                .get(type_index as usize)
                .map(signature_text)
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "  (func {name}(;{func_index};) (type {type_index}){signature}"
            );

            if let Some(debug) = self.function_debug(func_index) {
                for line in debug.lines() {
                    let _ = writeln!(out, "    {line}");
                }
            }

            if !code.locals.is_empty() {
                let mut locals = String::from("    (local");
                for local in &code.locals {
                    locals.push(' ');
                    locals.push_str(local.name());
                }
                locals.push(')');
                let _ = writeln!(out, "{locals}");
            }

            let mut depth = 0usize;
            for expr in &code.expression {
                let dedent = matches!(
                    expr.instr,
                    Instruction::Op(Opcode::End) | Instruction::Op(Opcode::Else)
                );
                let indent = if dedent { depth.saturating_sub(1) } else { depth };
                let _ = writeln!(
                    out,
                    "    {:indent$}{}",
                    "",
                    instruction_line(self, expr),
                    indent = indent * 2
                );
                match expr.instr {
                    Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_) => {
                        depth += 1
                    }
                    Instruction::Op(Opcode::End) => depth = depth.saturating_sub(1),
                    _ => {}
                }
            }
            out.push_str("  )\n");
        }

        for (index, table) in self.tables.iter().enumerate() {
            let _ = writeln!(
                out,
                "  (table (;{index};) {}funcref)",
                limits_text(table.limit_min, table.limit_max)
            );
        }

        for (index, memory) in self.memories.iter().enumerate() {
            let _ = writeln!(
                out,
                "  (memory (;{index};) {})",
                limits_text(memory.limit_min, memory.limit_max).trim_end()
            );
        }

        for (index, global) in self.globals.iter().enumerate() {
            let name = match self.global_names.get(&(index as u32)) {
                Some(name) => format!("{name} "),
                None => String::new(),
            };
            let _ = writeln!(
                out,
                "  (global {name}(;{index};) {} ({}))",
                global_type_text(global.valtype, global.mutable),
                folded_text(self, &global.init)
            );
        }

        for export in &self.exports {
            let target = match export.kind {
                ExternalKind::Func => ("func", self.function_identifier(export.index)),
                ExternalKind::Table => ("table", export.index.to_string()),
                ExternalKind::Memory => ("memory", export.index.to_string()),
                ExternalKind::Global => ("global", self.global_identifier(export.index)),
            };
            let _ = writeln!(
                out,
                "  (export \"{}\" ({} {}))",
                export.name, target.0, target.1
            );
        }

        for (index, element) in self.elements.iter().enumerate() {
            let mut line = format!(
                "  (elem (;{index};) ({}) func",
                folded_text(self, &element.offset)
            );
            for func in &element.indexes {
                line.push(' ');
                line.push_str(&self.function_identifier(*func));
            }
            line.push(')');
            let _ = writeln!(out, "{line}");
        }

        for (index, data) in self.data.iter().enumerate() {
            let name = match self.data_names.get(&(index as u32)) {
                Some(name) => format!("{name} "),
                None => String::new(),
            };
            let _ = writeln!(
                out,
                "  (data {name}(;{index};) ({}) \"{}\")",
                folded_text(self, &data.offset),
                escape_bytes(&data.data)
            );
        }

        out.push_str(")\n");
        out
    }
}

fn signature_text(entry: &TypeEntry) -> String {
    let mut out = String::new();
    if !entry.params.is_empty() {
        out.push_str(" (param");
        for param in &entry.params {
            out.push(' ');
            out.push_str(param.name());
        }
        out.push(')');
    }
    if !entry.results.is_empty() {
        out.push_str(" (result");
        for result in &entry.results {
            out.push(' ');
            out.push_str(result.name());
        }
        out.push(')');
    }
    out
}

fn limits_text(min: u32, max: Option<u32>) -> String {
    match max {
        Some(max) => format!("{min} {max} "),
        None => format!("{min} "),
    }
}

fn global_type_text(valtype: ValType, mutable: bool) -> String {
    if mutable {
        format!("(mut {})", valtype.name())
    } else {
        valtype.name().to_string()
    }
}

/// The bare text of a single-instruction initializer, `(...)` contents.
fn folded_text(module: &Module, expression: &[Expression]) -> String {
    expression
        .iter()
        .map(|expr| bare_text(module, expr))
        .collect::<Vec<_>>()
        .join(" ")
}

fn fmt_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        if value < 0.0 { "-inf" } else { "inf" }.to_string()
    } else {
        format!("{value}")
    }
}

/// The instruction itself, without comments or indentation.
fn bare_text(module: &Module, expr: &Expression) -> String {
    match &expr.instr {
        Instruction::Op(op) => op.mnemonic().to_string(),
        Instruction::Ext(op) => op.mnemonic().to_string(),
        Instruction::Block(bt) => block_text("block", *bt),
        Instruction::Loop(bt) => block_text("loop", *bt),
        Instruction::If(bt) => block_text("if", *bt),
        Instruction::Br(label) => format!("br {label}"),
        Instruction::BrIf(label) => format!("br_if {label}"),
        Instruction::BrTable { labels, default } => {
            let mut out = String::from("br_table");
            for label in labels {
                let _ = write!(out, " {label}");
            }
            let _ = write!(out, " {default}");
            out
        }
        Instruction::Call(FuncRef::Index(index)) => {
            format!("call {}", module.function_identifier(*index))
        }
        Instruction::Call(FuncRef::Symbol(symbol)) => format!("call {symbol}"),
        Instruction::CallIndirect { type_index, .. } => {
            format!("call_indirect (type {type_index})")
        }
        Instruction::Local { op, index } => format!("{} {index}", op.mnemonic()),
        Instruction::Global { op, target } => match target {
            GlobalRef::Index(index) => {
                format!("{} {}", op.mnemonic(), module.global_identifier(*index))
            }
            GlobalRef::Symbol(symbol) => format!("{} {symbol}", op.mnemonic()),
        },
        Instruction::Memory { op, align, offset } => {
            let mut out = op.mnemonic().to_string();
            if *offset != 0 {
                let _ = write!(out, " offset={offset}");
            }
            let _ = write!(out, " align={}", 1u64 << align);
            out
        }
        Instruction::I32Const(operand) => match operand {
            I32Operand::Value(value) => format!("i32.const {value}"),
            I32Operand::DataOffset {
                value: Some(value), ..
            }
            | I32Operand::DataLength {
                value: Some(value), ..
            } => format!("i32.const {value}"),
            I32Operand::DataOffset { symbol, value: None } => {
                format!("i32.const offset({symbol})")
            }
            I32Operand::DataLength { symbol, value: None } => {
                format!("i32.const length({symbol})")
            }
        },
        Instruction::I64Const(value) => format!("i64.const {value}"),
        Instruction::F32Const(value) => {
            format!("f32.const {}", fmt_float(f64::from(*value)))
        }
        Instruction::F64Const(value) => format!("f64.const {}", fmt_float(*value)),
    }
}

fn block_text(keyword: &str, block_type: BlockType) -> String {
    match block_type {
        BlockType::Empty => keyword.to_string(),
        BlockType::Value(valtype) => format!("{keyword} (result {})", valtype.name()),
    }
}

/// One full instruction line: the instruction plus its debug comments.
pub(crate) fn instruction_line(module: &Module, expr: &Expression) -> String {
    let mut line = bare_text(module, expr);
    if let Some(location) = module.source_location(expr.pc) {
        let _ = write!(line, " ;; Src = {location}");
    }
    if let Instruction::Local { index, .. } = expr.instr {
        if let Some(name) = module.local_var_name(expr.pc, index) {
            let _ = write!(line, " ;; Variable {name}");
        }
    }
    line
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        match byte {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(byte as char),
            _ => {
                let _ = write!(out, "\\{byte:02x}");
            }
        }
    }
    out
}
