//! Read, instrument and re-emit WebAssembly modules with their DWARF
//! debug info.
//!
//! This crate is the core of a wasm instrumentation toolchain: it
//! decodes a compiled module into a structured, mutable form, joins the
//! DWARF custom sections back onto the code as PC-keyed line and
//! variable tables, merges instrumentation code from a donor module
//! while renumbering every cross-reference, and re-encodes the result as
//! a valid binary or as annotated text. It deliberately is not a
//! runtime, a validator or an optimizer.
//!
//! The flagship flow:
//!
//! ```no_run
//! # fn main() -> wasm_splice::Result<()> {
//! use wasm_splice::Module;
//!
//! let bytes = std::fs::read("app.wasm").unwrap();
//! let mut host = Module::parse(&bytes)?;
//! host.parse_name()?;
//! host.parse_dwarf()?;
//! host.parse_dwarf_line_numbers()?;
//! host.parse_dwarf_variables()?;
//!
//! let trace_wat = r#"
//!     (module
//!       (func $trace_memory_grow (param i32) (result i32)
//!         local.get 0
//!         memory.grow))
//! "#;
//! let mut donor = Module::from_wat(trace_wat)?;
//! let base = (host.memories[0].limit_min << 16) as i32;
//! host.add_data_from(base, &mut donor);
//! host.add_funcs_from(&mut donor, |_remap| {})?;
//!
//! for i in 0..host.code.len() {
//!     host.replace_instruction(i, "memory.grow", "call $trace_memory_grow")?;
//!     host.resolve_relocations(i, base)?;
//! }
//!
//! std::fs::write("app.traced.wasm", host.encode_binary()?).unwrap();
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

mod decode;
mod dwarf;
mod encode;
mod error;
mod instr;
mod leb128;
mod link;
mod module;
mod names;
mod wat;

pub use crate::dwarf::{LocationRange, WasmLocation, WasmLocationKind};
pub use crate::error::{Error, Result};
pub use crate::instr::{
    BlockType, Expression, ExtOpcode, FuncRef, GlobalRef, I32Operand, Instruction, Opcode,
    EXT_PREFIX,
};
pub use crate::module::{
    CodeEntry, CustomEntry, DataEntry, DebugInfo, ElemEntry, ExportEntry, ExternalKind,
    FunctionEntry, GlobalAddress, GlobalEntry, ImportEntry, ImportKind, LineInfo, LocalName,
    MemoryEntry, Module, SectionId, TableEntry, TypeEntry, ValType, WASM_MAGIC, WASM_VERSION,
};

/// Low-level varint and scalar codecs, public for tools that need to
/// peek into payloads this crate carries opaquely.
pub mod varint {
    pub use crate::leb128::*;
}
