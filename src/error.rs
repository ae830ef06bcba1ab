//! Error types for decoding, encoding and linking.

use thiserror::Error;

/// A convenient alias for a `Result` that uses [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced while decoding, encoding, linking or reading debug
/// info from a WebAssembly module.
///
/// Every error is fatal to the operation that produced it; nothing is
/// retried internally. Malformed *advisory* data (name subsections, single
/// DWARF entries) is skipped with a `log::warn!` instead of surfacing here.
#[derive(Debug, Error)]
pub enum Error {
    /// The input did not start with the `\0asm` magic bytes.
    #[error("bad magic: not a wasm module")]
    BadMagic,

    /// The module header declared an unsupported version.
    #[error("unsupported wasm version {0}")]
    BadVersion(u32),

    /// A section or sub-payload ended before its declared length.
    #[error("truncated section or payload")]
    TruncatedSection,

    /// A LEB128 varint was malformed or ran off the end of the input.
    #[error("malformed varint")]
    MalformedVarint,

    /// An opcode byte outside the recognized instruction set.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// An unrecognized opcode in the 0xFC extended space.
    #[error("unknown extended opcode 0xfc {0}")]
    UnknownExtOpcode(u32),

    /// A section id this decoder does not understand.
    #[error("unknown section id {0}")]
    UnknownSection(u8),

    /// A symbolic function reference that no name map entry satisfies.
    #[error("unresolved function reference `{0}`")]
    UnresolvedFunction(String),

    /// A symbolic global reference that no name map entry satisfies.
    #[error("unresolved global reference `{0}`")]
    UnresolvedGlobal(String),

    /// A symbolic data-segment reference that no name map entry satisfies.
    #[error("unresolved data reference `{0}`")]
    UnresolvedData(String),

    /// A data segment whose offset is not a single `i32.const` expression.
    #[error("data offset is not a single i32.const expression")]
    NonConstantDataOffset,

    /// Two imports of the same `module:name` pair where one was required
    /// to be fresh.
    #[error("duplicate import `{0}`")]
    DuplicateImport(String),

    /// An operand index that does not fit its index space.
    #[error("{kind} index {index} out of range (limit {limit})")]
    IndexOutOfRange {
        /// Which index space overflowed.
        kind: &'static str,
        /// The offending index.
        index: u64,
        /// One past the largest valid index.
        limit: u64,
    },

    /// A syntax error in the text format.
    #[error("parse error at {line}:{col}: {message}")]
    Parse {
        /// 1-based source line.
        line: usize,
        /// 0-based source column.
        col: usize,
        /// What went wrong.
        message: String,
    },

    /// An error reported by the DWARF reader.
    #[error("dwarf error: {0}")]
    Dwarf(#[from] gimli::Error),
}

impl Error {
    pub(crate) fn parse(line: usize, col: usize, message: impl Into<String>) -> Error {
        Error::Parse {
            line,
            col,
            message: message.into(),
        }
    }
}
