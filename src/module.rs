//! Data structures for representing decoded wasm modules.
//!
//! A [`Module`] keeps one owned vector per wasm section in binary section
//! order, plus the name maps recovered from the `name` custom section and
//! the DWARF-derived [`DebugInfo`] sidecar. Cross-section references are
//! plain integer indices into the single unified index space per entity
//! kind, so renumbering is one integer-map application.

use crate::error::{Error, Result};
use crate::instr::{Expression, Instruction, I32Operand};
use indexmap::IndexMap;
use std::collections::HashMap;

/// The `\0asm` magic at the start of every wasm binary.
pub const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];

/// The only binary format version this crate understands.
pub const WASM_VERSION: u32 = 1;

/// A wasm value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValType {
    /// 32-bit integer.
    I32 = 0x7f,
    /// 64-bit integer.
    I64 = 0x7e,
    /// 32-bit float.
    F32 = 0x7d,
    /// 64-bit float.
    F64 = 0x7c,
}

impl ValType {
    /// Decode a value-type byte.
    pub fn from_byte(byte: u8) -> Option<ValType> {
        match byte {
            0x7f => Some(ValType::I32),
            0x7e => Some(ValType::I64),
            0x7d => Some(ValType::F32),
            0x7c => Some(ValType::F64),
            _ => None,
        }
    }

    /// The text-format keyword.
    pub fn name(self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        }
    }

    /// Parse a text-format keyword.
    pub fn from_name(name: &str) -> Option<ValType> {
        match name {
            "i32" => Some(ValType::I32),
            "i64" => Some(ValType::I64),
            "f32" => Some(ValType::F32),
            "f64" => Some(ValType::F64),
            _ => None,
        }
    }
}

/// Numeric section ids in the order the binary format fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionId {
    /// Id 0, name-keyed payloads.
    Custom = 0,
    /// Id 1.
    Type = 1,
    /// Id 2.
    Import = 2,
    /// Id 3.
    Function = 3,
    /// Id 4.
    Table = 4,
    /// Id 5.
    Memory = 5,
    /// Id 6.
    Global = 6,
    /// Id 7.
    Export = 7,
    /// Id 8, tolerated and dropped.
    Start = 8,
    /// Id 9.
    Elem = 9,
    /// Id 10.
    Code = 10,
    /// Id 11.
    Data = 11,
    /// Id 12, tolerated and dropped.
    DataCount = 12,
}

impl SectionId {
    /// Decode a section id byte.
    pub fn from_byte(byte: u8) -> Option<SectionId> {
        use SectionId::*;
        Some(match byte {
            0 => Custom,
            1 => Type,
            2 => Import,
            3 => Function,
            4 => Table,
            5 => Memory,
            6 => Global,
            7 => Export,
            8 => Start,
            9 => Elem,
            10 => Code,
            11 => Data,
            12 => DataCount,
            _ => return None,
        })
    }
}

/// What kind of entity an export names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExternalKind {
    /// A function.
    Func = 0,
    /// A table.
    Table = 1,
    /// A linear memory.
    Memory = 2,
    /// A global.
    Global = 3,
}

impl ExternalKind {
    /// Decode an external-kind byte.
    pub fn from_byte(byte: u8) -> Option<ExternalKind> {
        match byte {
            0 => Some(ExternalKind::Func),
            1 => Some(ExternalKind::Table),
            2 => Some(ExternalKind::Memory),
            3 => Some(ExternalKind::Global),
            _ => None,
        }
    }
}

/// An entry in the function section: the signature of one defined function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionEntry {
    /// Index into [`Module::types`].
    pub type_index: u32,
}

/// A function signature. Structural equality is the dedup criterion used
/// by [`Module::intern_type`].
#[derive(Debug, Clone, PartialEq)]
pub struct TypeEntry {
    /// Parameter types, in order.
    pub params: Vec<ValType>,
    /// Result types, in order.
    pub results: Vec<ValType>,
}

/// A custom section carried through round-trip untouched.
///
/// The binary format allows custom sections anywhere between standard
/// sections; `after` pins the slot this one occupied so the encoder can
/// put it back exactly where the decoder found it.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomEntry {
    /// The section name, e.g. `name` or `.debug_info`.
    pub name: String,
    /// The raw payload after the name.
    pub data: Vec<u8>,
    /// The standard section this one immediately followed in the
    /// decoded binary; `None` when it preceded every standard section
    /// (and for sections created in memory, which encode at the front).
    pub after: Option<SectionId>,
}

/// What an import brings into the module.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportKind {
    /// A function with a signature in the type section.
    Func {
        /// Index into [`Module::types`].
        type_index: u32,
    },
    /// A table.
    Table(TableEntry),
    /// A linear memory.
    Memory(MemoryEntry),
    /// A global.
    Global {
        /// The global's value type.
        valtype: ValType,
        /// Whether the global is mutable.
        mutable: bool,
    },
}

/// An entry in the import section.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportEntry {
    /// The module namespace, e.g. `wasi_snapshot_preview1`.
    pub module: String,
    /// The field name within that namespace.
    pub field: String,
    /// What is imported.
    pub kind: ImportKind,
}

impl ImportEntry {
    /// The `module:name` key used by [`Module::lookup_import`].
    pub fn key(&self) -> String {
        format!("{}:{}", self.module, self.field)
    }
}

/// An entry in the export section.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportEntry {
    /// The exported name.
    pub name: String,
    /// What kind of entity is exported.
    pub kind: ExternalKind,
    /// Index into the corresponding index space.
    pub index: u32,
}

/// An entry in the table section.
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntry {
    /// The element type byte; `0x70` (funcref) is the only MVP value.
    pub table_type: u8,
    /// Minimum size.
    pub limit_min: u32,
    /// Optional maximum size.
    pub limit_max: Option<u32>,
}

/// An entry in the memory section, limits in 64KiB pages.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    /// Minimum page count.
    pub limit_min: u32,
    /// Optional maximum page count.
    pub limit_max: Option<u32>,
}

/// An entry in the global section.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalEntry {
    /// The global's value type.
    pub valtype: ValType,
    /// Whether the global is mutable.
    pub mutable: bool,
    /// The constant initializer expression, without its terminating `end`.
    pub init: Vec<Expression>,
}

/// One function body from the code section.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeEntry {
    /// Declared locals, flattened from the binary's run-length groups.
    pub locals: Vec<ValType>,
    /// Whether `code_section_ptr`/`code_section_len` and per-instruction
    /// PCs were populated by the binary decoder.
    pub pc_valid: bool,
    /// Offset of the first instruction within the code section payload.
    pub code_section_ptr: u64,
    /// Bytes from the first instruction through the terminating `end`.
    pub code_section_len: u64,
    /// The body, without the function-terminator `end`.
    pub expression: Vec<Expression>,
}

impl CodeEntry {
    /// An empty body with no binary provenance.
    pub fn new(locals: Vec<ValType>, expression: Vec<Expression>) -> CodeEntry {
        CodeEntry {
            locals,
            pc_valid: false,
            code_section_ptr: 0,
            code_section_len: 0,
            expression,
        }
    }
}

/// One data segment.
#[derive(Debug, Clone, PartialEq)]
pub struct DataEntry {
    /// The memory it initializes; 0 in MVP modules.
    pub mem_index: u32,
    /// The offset expression, without its terminating `end`.
    pub offset: Vec<Expression>,
    /// The payload bytes.
    pub data: Vec<u8>,
}

impl DataEntry {
    /// The placed address when the offset is a single resolved
    /// `i32.const`, otherwise [`Error::NonConstantDataOffset`].
    pub fn const_offset(&self) -> Result<i32> {
        match self.offset.as_slice() {
            [Expression {
                instr: Instruction::I32Const(I32Operand::Value(v)),
                ..
            }] => Ok(*v),
            _ => Err(Error::NonConstantDataOffset),
        }
    }
}

/// One element segment: function indices written into a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ElemEntry {
    /// The table it initializes; 0 in MVP modules.
    pub table_index: u32,
    /// The offset expression, without its terminating `end`.
    pub offset: Vec<Expression>,
    /// Function indices in the unified index space.
    pub indexes: Vec<u32>,
}

/// One row of the DWARF line-number table.
#[derive(Debug, Clone, PartialEq)]
pub struct LineInfo {
    /// Source file path as recorded by the compiler.
    pub file: String,
    /// 1-based source line.
    pub line: u64,
    /// Column, 0 meaning left edge.
    pub column: u64,
}

/// A named local variable valid over a PC range, from DWARF location
/// lists.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalName {
    /// First covered PC, inclusive.
    pub start_pc: u64,
    /// Last covered PC, inclusive.
    pub end_pc: u64,
    /// The wasm local index the variable lives in.
    pub index: u32,
    /// The source-level variable name.
    pub name: String,
    /// A printable rendition of the variable's type, possibly empty.
    pub type_name: String,
}

/// A source-level global variable pinned to a linear-memory address.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalAddress {
    /// The address from the `DW_OP_addr` expression.
    pub address: u64,
    /// The type's byte size, 0 when unknown.
    pub size: u64,
    /// A printable rendition of the type, possibly empty.
    pub type_name: String,
}

/// Debug metadata derived from the DWARF custom sections.
///
/// Everything here is advisory: lookups return `Option`/empty and the
/// parsing passes skip entries they cannot make sense of.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DebugInfo {
    /// PC to source location, from the line-number programs.
    pub line_info: HashMap<u64, LineInfo>,
    /// Named locals with their PC validity ranges.
    pub local_names: Vec<LocalName>,
    /// Printable `name(params)` signature per function index.
    pub function_signature: HashMap<u32, String>,
    /// Multi-line comment block (signature plus locals) per function index.
    pub function_debug: HashMap<u32, String>,
    /// Source-level globals by name, in DWARF declaration order.
    pub global_addresses: IndexMap<String, GlobalAddress>,
    /// The raw `.debug_loc` payload, walked lazily by location lookups.
    pub debug_loc: Vec<u8>,
}

/// A structured, mutable in-memory form of one wasm binary.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Module {
    /// The type section.
    pub types: Vec<TypeEntry>,
    /// The import section.
    pub imports: Vec<ImportEntry>,
    /// The function section (signatures of defined functions).
    pub functions: Vec<FunctionEntry>,
    /// The table section.
    pub tables: Vec<TableEntry>,
    /// The memory section.
    pub memories: Vec<MemoryEntry>,
    /// The global section.
    pub globals: Vec<GlobalEntry>,
    /// The export section.
    pub exports: Vec<ExportEntry>,
    /// The element section.
    pub elements: Vec<ElemEntry>,
    /// The code section, parallel to `functions`.
    pub code: Vec<CodeEntry>,
    /// The data section.
    pub data: Vec<DataEntry>,
    /// Custom sections in the order they appeared.
    pub custom: Vec<CustomEntry>,

    /// The module's own name from name-subsection 0, if any.
    pub module_name: Option<String>,
    /// `$`-prefixed function names by unified function index.
    pub function_names: HashMap<u32, String>,
    /// `$`-prefixed global names by global index.
    pub global_names: HashMap<u32, String>,
    /// `$`-prefixed data segment names by segment index.
    pub data_names: HashMap<u32, String>,
    /// Raw local names from name-subsection 2, carried for round-trip.
    pub local_name_map: HashMap<u32, Vec<(u32, String)>>,

    /// The DWARF-derived sidecar.
    pub debug: DebugInfo,
}

impl Module {
    /// An empty module.
    pub fn new() -> Module {
        Module::default()
    }

    /// The number of imported functions, i.e. the index of the first
    /// defined function in the unified function index space.
    pub fn num_imported_funcs(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Func { .. }))
            .count() as u32
    }

    /// One past the largest valid function index.
    pub fn num_funcs(&self) -> u32 {
        self.num_imported_funcs() + self.code.len() as u32
    }

    /// The payload of the first custom section with the given name.
    pub fn custom_section(&self, name: &str) -> Option<&[u8]> {
        self.custom
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.data.as_slice())
    }

    /// Find the defined function whose body covers `pc` and return its
    /// unified function index. Only entries the binary decoder stamped
    /// (`pc_valid`) participate; the interval is closed on both ends.
    pub fn find_function_containing_pc(&self, pc: u64) -> Option<u32> {
        let imports = self.num_imported_funcs();
        self.code.iter().position(|c| {
            c.pc_valid
                && pc >= c.code_section_ptr
                && pc <= c.code_section_ptr + c.code_section_len
        })
        .map(|idx| imports + idx as u32)
    }

    /// Resolve a `$name` to a unified function index.
    pub fn lookup_function_id(&self, name: &str) -> Option<u32> {
        self.function_names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(idx, _)| *idx)
    }

    /// Resolve a `$name` to a global index.
    pub fn lookup_global_id(&self, name: &str) -> Option<u32> {
        self.global_names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(idx, _)| *idx)
    }

    /// Resolve a `$name` to a data segment index.
    pub fn lookup_data_id(&self, name: &str) -> Option<u32> {
        self.data_names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(idx, _)| *idx)
    }

    /// Resolve a `module:name` pair to the function index of an import.
    pub fn lookup_import(&self, key: &str) -> Option<u32> {
        let mut func_index = 0u32;
        for import in &self.imports {
            if let ImportKind::Func { .. } = import.kind {
                if import.key() == key {
                    return Some(func_index);
                }
                func_index += 1;
            }
        }
        None
    }

    /// The `$name` of a function if one is known.
    pub fn function_name(&self, index: u32) -> Option<&str> {
        self.function_names.get(&index).map(|s| s.as_str())
    }

    /// The `$name` of a function, or its numeric index rendered as text.
    pub fn function_identifier(&self, index: u32) -> String {
        match self.function_name(index) {
            Some(name) => name.to_string(),
            None => index.to_string(),
        }
    }

    /// The `$name` of a global, or its numeric index rendered as text.
    pub fn global_identifier(&self, index: u32) -> String {
        match self.global_names.get(&index) {
            Some(name) => name.clone(),
            None => index.to_string(),
        }
    }

    /// Add a type unless a structurally equal one exists; either way
    /// return the index it lives at.
    pub fn intern_type(&mut self, entry: TypeEntry) -> u32 {
        if let Some(idx) = self.types.iter().position(|t| *t == entry) {
            return idx as u32;
        }
        self.types.push(entry);
        (self.types.len() - 1) as u32
    }

    /// Apply an old-index to new-index remap to the debug side tables
    /// that are keyed by function index. Old keys not present in the
    /// remap are dropped.
    pub fn renumber_functions(&mut self, remap: &HashMap<u32, u32>) {
        fn apply(map: &mut HashMap<u32, String>, remap: &HashMap<u32, u32>) {
            let old = std::mem::take(map);
            for (index, value) in old {
                if let Some(new_index) = remap.get(&index) {
                    map.insert(*new_index, value);
                }
            }
        }
        apply(&mut self.function_names, remap);
        apply(&mut self.debug.function_debug, remap);
        apply(&mut self.debug.function_signature, remap);
    }

    /// Append a named data segment, 8-byte aligned past the end of the
    /// last existing segment, and return its index.
    pub fn add_data(&mut self, name: &str, bytes: &[u8]) -> u32 {
        let mut ptr = 0i32;
        if let Some(prev) = self.data.last() {
            if let Ok(offset) = prev.const_offset() {
                ptr = offset + prev.data.len() as i32;
            }
        }
        ptr = (ptr + 7) & -8;

        let index = self.data.len() as u32;
        self.data.push(DataEntry {
            mem_index: 0,
            offset: vec![Instruction::I32Const(I32Operand::Value(ptr)).into()],
            data: bytes.to_vec(),
        });
        self.data_names.insert(index, name.to_string());
        index
    }

    /// Overwrite the type and initializer of the global named `name`.
    ///
    /// The initializer is a single-line text-format expression such as
    /// `i32.const 1`, resolved against this module's name maps.
    pub fn set_global(&mut self, name: &str, valtype: ValType, init: &str) -> Result<()> {
        let index = self
            .lookup_global_id(name)
            .ok_or_else(|| Error::UnresolvedGlobal(name.to_string()))?;
        let init = crate::wat::parse_snippet(init, self)?;
        let global = &mut self.globals[index as usize];
        global.valtype = valtype;
        global.init = init;
        Ok(())
    }

    /// Record a driver-supplied printable signature for a function, used
    /// when instrumentation wraps imports that DWARF knows nothing about.
    pub fn set_function_signature(&mut self, index: u32, signature: &str) {
        self.debug
            .function_signature
            .insert(index, signature.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(params: &[ValType], results: &[ValType]) -> TypeEntry {
        TypeEntry {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }

    #[test]
    fn intern_type_dedups() {
        let mut module = Module::new();
        let a = module.intern_type(ty(&[ValType::I32, ValType::I32], &[ValType::I32]));
        let b = module.intern_type(ty(&[ValType::I32, ValType::I32], &[ValType::I32]));
        assert_eq!(a, b);
        assert_eq!(module.types.len(), 1);

        let c = module.intern_type(ty(&[ValType::I32], &[ValType::I32]));
        assert_ne!(a, c);
        assert_eq!(module.types.len(), 2);
    }

    #[test]
    fn renumber_functions_moves_names() {
        let mut module = Module::new();
        module.function_names.insert(3, "$main".to_string());
        module.function_names.insert(4, "$aux".to_string());
        let remap = HashMap::from([(3, 4), (4, 5)]);
        module.renumber_functions(&remap);
        assert_eq!(module.function_name(4), Some("$main"));
        assert_eq!(module.function_name(5), Some("$aux"));
        assert_eq!(module.function_name(3), None);
    }

    #[test]
    fn add_data_aligns_to_eight() {
        let mut module = Module::new();
        module.add_data("$a", b"hello");
        module.add_data("$b", b"!");
        assert_eq!(module.data[0].const_offset().unwrap(), 0);
        assert_eq!(module.data[1].const_offset().unwrap(), 8);
        assert_eq!(module.lookup_data_id("$b"), Some(1));
    }

    #[test]
    fn find_function_by_pc() {
        let mut module = Module::new();
        module.imports.push(ImportEntry {
            module: "env".to_string(),
            field: "x".to_string(),
            kind: ImportKind::Func { type_index: 0 },
        });
        let mut body = CodeEntry::new(Vec::new(), Vec::new());
        body.pc_valid = true;
        body.code_section_ptr = 100;
        body.code_section_len = 20;
        module.code.push(body);
        assert_eq!(module.find_function_containing_pc(100), Some(1));
        assert_eq!(module.find_function_containing_pc(120), Some(1));
        assert_eq!(module.find_function_containing_pc(121), None);
    }
}
