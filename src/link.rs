//! The link/instrument engine: merging donor modules into a host and
//! editing code in place.
//!
//! Merging appends donor globals, imports, functions and code to the
//! host while rewriting every cross-reference into the host's index
//! spaces. Inserting an import is the delicate case: it lands at the end
//! of the import block, which shifts every already-defined function up
//! by one, so a universal remap is applied to call operands, element
//! segments, function exports and the debug side-tables in one step
//! before anything else moves.
//!
//! Symbolic references that cannot be resolved during a merge stay
//! marked; the `resolve_*` passes collapse them (or fail) before the
//! binary encoder will accept the module.

use crate::error::{Error, Result};
use crate::instr::{Expression, FuncRef, GlobalRef, I32Operand, Instruction};
use crate::module::{CodeEntry, ImportEntry, ImportKind, Module};
use crate::wat;
use std::collections::HashMap;

impl CodeEntry {
    /// Rewrite every resolved `call` operand through `remap`.
    pub fn modify_all_calls(&mut self, remap: &HashMap<u32, u32>) {
        for expr in &mut self.expression {
            if let Instruction::Call(FuncRef::Index(index)) = &mut expr.instr {
                if let Some(new_index) = remap.get(index) {
                    *index = *new_index;
                }
            }
        }
    }

    /// Rewrite every resolved `global.get`/`global.set` operand through
    /// `remap`.
    pub fn modify_all_globals(&mut self, remap: &HashMap<u32, u32>) {
        for expr in &mut self.expression {
            if let Instruction::Global {
                target: GlobalRef::Index(index),
                ..
            } = &mut expr.instr
            {
                if let Some(new_index) = remap.get(index) {
                    *index = *new_index;
                }
            }
        }
    }

    /// Rewrite every resolved `call_indirect` type operand through
    /// `remap`.
    pub fn modify_all_types(&mut self, remap: &HashMap<u32, u32>) {
        for expr in &mut self.expression {
            if let Instruction::CallIndirect { type_index, .. } = &mut expr.instr {
                if let Some(new_index) = remap.get(type_index) {
                    *type_index = *new_index;
                }
            }
        }
    }

    /// Retarget still-symbolic `call` operands through a name-to-name
    /// rename table. A rename to a numeric string resolves the call
    /// outright.
    pub fn modify_unresolved_functions(&mut self, renames: &HashMap<String, String>) {
        for expr in &mut self.expression {
            let Instruction::Call(target) = &mut expr.instr else {
                continue;
            };
            let FuncRef::Symbol(symbol) = target else {
                continue;
            };
            if let Some(new_name) = renames.get(symbol.as_str()) {
                *target = if new_name.starts_with('$') {
                    FuncRef::Symbol(new_name.clone())
                } else {
                    match new_name.parse() {
                        Ok(index) => FuncRef::Index(index),
                        Err(_) => FuncRef::Symbol(new_name.clone()),
                    }
                };
            }
        }
    }
}

impl Module {
    fn code_entry_mut(&mut self, code_index: usize) -> Result<&mut CodeEntry> {
        let limit = self.code.len() as u64;
        self.code
            .get_mut(code_index)
            .ok_or(Error::IndexOutOfRange {
                kind: "code",
                index: code_index as u64,
                limit,
            })
    }

    /// Add an import that must not already exist, returning its function
    /// index for `ImportKind::Func` entries.
    pub fn add_import(&mut self, import: ImportEntry) -> Result<u32> {
        let key = import.key();
        if self.imports.iter().any(|i| i.key() == key) {
            return Err(Error::DuplicateImport(key));
        }
        let index = self.num_imported_funcs();
        self.imports.push(import);
        Ok(index)
    }

    /// Merge every donor global, function import, defined function and
    /// code body into this module, leaving the donor drained.
    ///
    /// `on_remap` fires once per inserted import with the universal
    /// function remap just applied, so callers tracking function indices
    /// of their own can follow along.
    pub fn add_funcs_from(
        &mut self,
        donor: &mut Module,
        mut on_remap: impl FnMut(&HashMap<u32, u32>),
    ) -> Result<()> {
        // Donor globals land at the end of the host's global space.
        let mut global_remap = HashMap::new();
        let donor_global_names = std::mem::take(&mut donor.global_names);
        for (index, global) in std::mem::take(&mut donor.globals).into_iter().enumerate() {
            let new_index = self.globals.len() as u32;
            global_remap.insert(index as u32, new_index);
            self.globals.push(global);
            if let Some(name) = donor_global_names.get(&(index as u32)) {
                self.global_names.insert(new_index, name.clone());
            }
        }

        // Donor types are interned up front so signatures and
        // call_indirect operands can be rewritten with one map.
        let mut type_remap = HashMap::new();
        for (index, entry) in std::mem::take(&mut donor.types).into_iter().enumerate() {
            type_remap.insert(index as u32, self.intern_type(entry));
        }

        let mut call_remap: HashMap<u32, u32> = HashMap::new();
        let mut import_renames: HashMap<String, String> = HashMap::new();

        let donor_imports = std::mem::take(&mut donor.imports);
        let donor_function_names = std::mem::take(&mut donor.function_names);
        let mut donor_func_index = 0u32;
        for import in donor_imports {
            let ImportKind::Func { type_index } = import.kind else {
                log::warn!("skipping non-function donor import `{}`", import.key());
                continue;
            };
            let index = donor_func_index;
            donor_func_index += 1;

            if let Some(existing) = self.lookup_import(&import.key()) {
                // Already imported; retarget symbolic references from the
                // donor's name for it to the host's.
                let from = donor_function_names
                    .get(&index)
                    .cloned()
                    .unwrap_or_else(|| index.to_string());
                let to = self.function_identifier(existing);
                log::debug!("mapping donor import {from} => {to}");
                import_renames.insert(from, to);
                call_remap.insert(index, existing);
                continue;
            }

            // A fresh import: insert at the end of the import block and
            // shift every function at or above it up by one, everywhere
            // at once.
            let insert_pos = self.num_imported_funcs();
            let new_type = *type_remap
                .get(&type_index)
                .ok_or(Error::IndexOutOfRange {
                    kind: "type",
                    index: u64::from(type_index),
                    limit: type_remap.len() as u64,
                })?;
            self.imports.push(ImportEntry {
                kind: ImportKind::Func {
                    type_index: new_type,
                },
                ..import
            });
            call_remap.insert(index, insert_pos);

            let mut remap = HashMap::new();
            for i in 0..self.num_funcs() {
                remap.insert(i, if i >= insert_pos { i + 1 } else { i });
            }

            self.renumber_functions(&remap);
            if let Some(name) = donor_function_names.get(&index) {
                self.function_names.insert(insert_pos, name.clone());
            }
            for export in &mut self.exports {
                if export.kind == crate::module::ExternalKind::Func && export.index >= insert_pos {
                    export.index += 1;
                }
            }
            for code in &mut self.code {
                code.modify_all_calls(&remap);
            }
            for element in &mut self.elements {
                for func in &mut element.indexes {
                    if let Some(new_index) = remap.get(func) {
                        *func = *new_index;
                    }
                }
            }
            on_remap(&remap);
        }

        // Donor defined functions append after the host's.
        for (index, function) in std::mem::take(&mut donor.functions).into_iter().enumerate() {
            let new_index = self.num_imported_funcs() + self.functions.len() as u32;
            let new_type = *type_remap
                .get(&function.type_index)
                .ok_or(Error::IndexOutOfRange {
                    kind: "type",
                    index: u64::from(function.type_index),
                    limit: type_remap.len() as u64,
                })?;
            self.functions.push(crate::module::FunctionEntry {
                type_index: new_type,
            });
            let old_index = donor_func_index + index as u32;
            if let Some(name) = donor_function_names.get(&old_index) {
                self.function_names.insert(new_index, name.clone());
            }
            call_remap.insert(old_index, new_index);
        }

        // Donor bodies, rewritten into the host's index spaces. The full
        // function remap exists before any body moves, so donor
        // self-calls are remapped exactly once.
        for mut code in std::mem::take(&mut donor.code) {
            code.modify_all_calls(&call_remap);
            code.modify_all_globals(&global_remap);
            code.modify_all_types(&type_remap);
            code.modify_unresolved_functions(&import_renames);
            self.code.push(code);
        }

        Ok(())
    }

    /// Append every donor data segment, relocated to successive 8-byte
    /// aligned offsets from `base_ptr`, and return the next free
    /// address. Segment names follow their segments.
    pub fn add_data_from(&mut self, base_ptr: i32, donor: &mut Module) -> i32 {
        let donor_names = std::mem::take(&mut donor.data_names);
        let mut ptr = base_ptr;
        for (index, mut segment) in std::mem::take(&mut donor.data).into_iter().enumerate() {
            segment.offset = vec![Instruction::I32Const(I32Operand::Value(ptr)).into()];
            ptr += segment.data.len() as i32;
            ptr = (ptr + 7) & -8;

            let new_index = self.data.len() as u32;
            self.data.push(segment);
            if let Some(name) = donor_names.get(&(index as u32)) {
                self.data_names.insert(new_index, name.clone());
            }
        }
        ptr
    }

    /// Resolve symbolic `global.*` operands in one code body.
    pub fn resolve_globals(&mut self, code_index: usize) -> Result<()> {
        let code = self.code_entry_mut(code_index)?;
        let mut fixes = Vec::new();
        for (i, expr) in code.expression.iter().enumerate() {
            if let Instruction::Global {
                target: GlobalRef::Symbol(symbol),
                ..
            } = &expr.instr
            {
                fixes.push((i, symbol.clone()));
            }
        }
        for (i, symbol) in fixes {
            let index = self
                .lookup_global_id(&symbol)
                .ok_or(Error::UnresolvedGlobal(symbol))?;
            if let Instruction::Global { target, .. } =
                &mut self.code[code_index].expression[i].instr
            {
                *target = GlobalRef::Index(index);
            }
        }
        Ok(())
    }

    /// Resolve symbolic `call` operands in one code body.
    pub fn resolve_functions(&mut self, code_index: usize) -> Result<()> {
        let code = self.code_entry_mut(code_index)?;
        let mut fixes = Vec::new();
        for (i, expr) in code.expression.iter().enumerate() {
            if let Instruction::Call(FuncRef::Symbol(symbol)) = &expr.instr {
                fixes.push((i, symbol.clone()));
            }
        }
        for (i, symbol) in fixes {
            let index = self
                .lookup_function_id(&symbol)
                .ok_or(Error::UnresolvedFunction(symbol))?;
            if let Instruction::Call(target) = &mut self.code[code_index].expression[i].instr {
                *target = FuncRef::Index(index);
            }
        }
        Ok(())
    }

    /// Fill in `length($name)` operands from the named segments' sizes.
    pub fn resolve_lengths(&mut self, code_index: usize) -> Result<()> {
        let code = self.code_entry_mut(code_index)?;
        let mut fixes = Vec::new();
        for (i, expr) in code.expression.iter().enumerate() {
            if let Instruction::I32Const(I32Operand::DataLength { symbol, .. }) = &expr.instr {
                fixes.push((i, symbol.clone()));
            }
        }
        for (i, symbol) in fixes {
            let index = self
                .lookup_data_id(&symbol)
                .ok_or_else(|| Error::UnresolvedData(symbol.clone()))?;
            let length = self.data[index as usize].data.len() as i32;
            if let Instruction::I32Const(I32Operand::DataLength { value, .. }) =
                &mut self.code[code_index].expression[i].instr
            {
                *value = Some(length);
            }
        }
        Ok(())
    }

    /// Fill in `offset($name)` operands with each named segment's placed
    /// address minus `base_ptr`; at runtime the spliced relocation code
    /// adds the base back.
    pub fn resolve_relocations(&mut self, code_index: usize, base_ptr: i32) -> Result<()> {
        let code = self.code_entry_mut(code_index)?;
        let mut fixes = Vec::new();
        for (i, expr) in code.expression.iter().enumerate() {
            if let Instruction::I32Const(I32Operand::DataOffset { symbol, .. }) = &expr.instr {
                fixes.push((i, symbol.clone()));
            }
        }
        for (i, symbol) in fixes {
            let index = self
                .lookup_data_id(&symbol)
                .ok_or_else(|| Error::UnresolvedData(symbol.clone()))?;
            let offset = self.data[index as usize].const_offset()?;
            if let Instruction::I32Const(I32Operand::DataOffset { value, .. }) =
                &mut self.code[code_index].expression[i].instr
            {
                *value = Some(offset - base_ptr);
            }
        }
        Ok(())
    }

    /// Replace every instruction in one body whose comment-stripped text
    /// form equals `from` with the parsed instructions of `to`.
    pub fn replace_instruction(&mut self, code_index: usize, from: &str, to: &str) -> Result<()> {
        let replacement = wat::parse_snippet(to, self)?;
        let code = self.code.get(code_index).ok_or(Error::IndexOutOfRange {
            kind: "code",
            index: code_index as u64,
            limit: self.code.len() as u64,
        })?;

        let mut adjusted: Vec<Expression> = Vec::with_capacity(code.expression.len());
        for expr in &code.expression {
            let mut text = wat::instruction_line(self, expr);
            if let Some(comment) = text.find(";;") {
                text.truncate(comment);
            }
            if text.trim() == from.trim() {
                adjusted.extend(replacement.iter().cloned());
            } else {
                adjusted.push(expr.clone());
            }
        }
        self.code[code_index].expression = adjusted;
        Ok(())
    }

    /// Prepend a parsed snippet to one body.
    pub fn insert_at_func_start(&mut self, code_index: usize, snippet: &str) -> Result<()> {
        let new_exprs = wat::parse_snippet(snippet, self)?;
        let code = self.code_entry_mut(code_index)?;
        code.expression.splice(0..0, new_exprs);
        Ok(())
    }

    /// Append a parsed snippet to one body. The stored body carries no
    /// function terminator, so this is plain concatenation.
    pub fn insert_at_func_end(&mut self, code_index: usize, snippet: &str) -> Result<()> {
        let mut new_exprs = wat::parse_snippet(snippet, self)?;
        let code = self.code_entry_mut(code_index)?;
        code.expression.append(&mut new_exprs);
        Ok(())
    }

    /// Splice a parsed snippet after every instruction that carries a
    /// data-relocation marker, resolved or pending. This is how donor
    /// constants that are relative to donor data get `base + offset`
    /// arithmetic patched in at the only moment the engine can still
    /// tell which constants those are.
    pub fn insert_after_relocating(&mut self, code_index: usize, snippet: &str) -> Result<()> {
        let new_exprs = wat::parse_snippet(snippet, self)?;
        let code = self.code_entry_mut(code_index)?;
        let mut adjusted = Vec::with_capacity(code.expression.len());
        for expr in code.expression.drain(..) {
            let relocating = expr.instr.is_relocating();
            adjusted.push(expr);
            if relocating {
                adjusted.extend(new_exprs.iter().cloned());
            }
        }
        code.expression = adjusted;
        Ok(())
    }
}
