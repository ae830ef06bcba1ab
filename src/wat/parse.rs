//! Parsing the wasm text format into the module model.
//!
//! The grammar covered is the subset the binary side can express:
//! `module` wrapping `type`/`import`/`func`/`table`/`memory`/`global`/
//! `export`/`elem`/`data`/`start` elements, with plain (non-folded)
//! instruction sequences in function bodies. Symbolic `$name` operands
//! that cannot be resolved against the module being built are left as
//! tagged symbolic variants for the linker, never failed; the
//! `offset($name)`/`length($name)` pseudo-operators produce the data
//! relocation markers.
//!
//! Parsing is two-phase: every element is scanned once to register
//! types, signatures and names, and function bodies are only parsed
//! afterwards, so in-file forward references resolve without a linker
//! pass.

use super::lexer::{Lexer, Pos, Token};
use crate::decode::is_load_store;
use crate::error::Result;
use crate::instr::{
    BlockType, Expression, ExtOpcode, FuncRef, GlobalRef, I32Operand, Instruction, Opcode,
};
use crate::module::{
    CodeEntry, DataEntry, ElemEntry, ExportEntry, ExternalKind, FunctionEntry, GlobalEntry,
    ImportEntry, ImportKind, MemoryEntry, Module, TableEntry, TypeEntry, ValType,
};
use std::collections::HashMap;

/// A cursor over a token slice.
pub(crate) struct Cursor<'a> {
    tokens: &'a [(Pos, Token)],
    index: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(tokens: &'a [(Pos, Token)]) -> Cursor<'a> {
        Cursor { tokens, index: 0 }
    }

    fn pos(&self) -> Pos {
        self.tokens
            .get(self.index)
            .or_else(|| self.tokens.last())
            .map(|(pos, _)| *pos)
            .unwrap_or(Pos { line: 1, col: 0 })
    }

    pub(crate) fn done(&self) -> bool {
        self.index >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index).map(|(_, t)| t)
    }

    /// True when the next tokens are `(` followed by the given keyword.
    fn peek_list(&self, keyword: &str) -> bool {
        match (self.tokens.get(self.index), self.tokens.get(self.index + 1)) {
            (Some((_, Token::LParen)), Some((_, Token::Atom(a)))) => a == keyword,
            _ => false,
        }
    }

    fn next(&mut self) -> Result<&'a Token> {
        let token = self
            .tokens
            .get(self.index)
            .ok_or_else(|| self.pos().err("unexpected end of input"))?;
        self.index += 1;
        Ok(&token.1)
    }

    fn expect_lparen(&mut self) -> Result<()> {
        let pos = self.pos();
        match self.next()? {
            Token::LParen => Ok(()),
            other => Err(pos.err(format!("expected `(`, found {other:?}"))),
        }
    }

    fn expect_rparen(&mut self) -> Result<()> {
        let pos = self.pos();
        match self.next()? {
            Token::RParen => Ok(()),
            other => Err(pos.err(format!("expected `)`, found {other:?}"))),
        }
    }

    fn atom(&mut self) -> Result<(Pos, &'a str)> {
        let pos = self.pos();
        match self.next()? {
            Token::Atom(a) => Ok((pos, a.as_str())),
            other => Err(pos.err(format!("expected atom, found {other:?}"))),
        }
    }

    fn string(&mut self) -> Result<&'a [u8]> {
        let pos = self.pos();
        match self.next()? {
            Token::Str(bytes) => Ok(bytes.as_slice()),
            other => Err(pos.err(format!("expected string, found {other:?}"))),
        }
    }

    fn peek_atom(&self) -> Option<&'a str> {
        match self.tokens.get(self.index) {
            Some((_, Token::Atom(a))) => Some(a.as_str()),
            _ => None,
        }
    }

    /// Consume a `$name` if one is next.
    fn maybe_id(&mut self) -> Option<String> {
        match self.peek_atom() {
            Some(a) if a.starts_with('$') => {
                let id = a.to_string();
                self.index += 1;
                Some(id)
            }
            _ => None,
        }
    }

    /// Skip a balanced list starting at the current `(`.
    fn skip_list(&mut self) -> Result<()> {
        self.expect_lparen()?;
        let mut depth = 1usize;
        while depth > 0 {
            match self.next()? {
                Token::LParen => depth += 1,
                Token::RParen => depth -= 1,
                _ => {}
            }
        }
        Ok(())
    }
}

fn parse_u32_atom(pos: Pos, s: &str) -> Result<u32> {
    let digits = s.replace('_', "");
    let parsed = if let Some(hex) = digits.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        digits.parse()
    };
    parsed.map_err(|_| pos.err(format!("expected unsigned integer, found `{s}`")))
}

fn parse_i64_atom(pos: Pos, s: &str) -> Result<i64> {
    let digits = s.replace('_', "");
    let (neg, rest) = match digits.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, digits.as_str()),
    };
    let magnitude = if let Some(hex) = rest.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        rest.parse()
    }
    .map_err(|_| pos.err(format!("expected integer, found `{s}`")))?;
    if neg {
        0i64.checked_sub_unsigned(magnitude)
            .ok_or_else(|| pos.err(format!("integer out of range: `{s}`")))
    } else {
        i64::try_from(magnitude).map_err(|_| pos.err(format!("integer out of range: `{s}`")))
    }
}

fn parse_i32_atom(pos: Pos, s: &str) -> Result<i32> {
    let wide = parse_i64_atom(pos, s)?;
    if let Ok(v) = i32::try_from(wide) {
        return Ok(v);
    }
    // Values in u32 range are accepted with wrapping, matching the
    // binary format's two's-complement storage.
    u32::try_from(wide)
        .map(|v| v as i32)
        .map_err(|_| pos.err(format!("i32 constant out of range: `{s}`")))
}

fn parse_f64_atom(pos: Pos, s: &str) -> Result<f64> {
    match s {
        "nan" | "+nan" => return Ok(f64::NAN),
        "-nan" => return Ok(-f64::NAN),
        "inf" | "+inf" => return Ok(f64::INFINITY),
        "-inf" => return Ok(f64::NEG_INFINITY),
        _ => {}
    }
    if s.starts_with("nan:") || s.starts_with("-nan:") {
        return Ok(f64::NAN);
    }
    s.replace('_', "")
        .parse()
        .map_err(|_| pos.err(format!("expected float, found `{s}`")))
}

fn parse_valtype(pos: Pos, s: &str) -> Result<ValType> {
    ValType::from_name(s).ok_or_else(|| pos.err(format!("expected value type, found `{s}`")))
}

/// The width in bytes of a load/store access, for default alignment.
fn access_width(op: Opcode) -> u32 {
    use Opcode::*;
    match op {
        I32Load8S | I32Load8U | I64Load8S | I64Load8U | I32Store8 | I64Store8 => 1,
        I32Load16S | I32Load16U | I64Load16S | I64Load16U | I32Store16 | I64Store16 => 2,
        I32Load | F32Load | I64Load32S | I64Load32U | I32Store | F32Store | I64Store32 => 4,
        _ => 8,
    }
}

/// Name-resolution context for instruction parsing.
pub(crate) struct InstrCtx<'a> {
    pub(crate) module: &'a Module,
    pub(crate) locals: Option<&'a HashMap<String, u32>>,
    pub(crate) types: Option<&'a HashMap<String, u32>>,
}

impl InstrCtx<'_> {
    fn func_ref(&self, operand: &str) -> FuncRef {
        match self.module.lookup_function_id(operand) {
            Some(index) => FuncRef::Index(index),
            None => FuncRef::Symbol(operand.to_string()),
        }
    }

    fn global_ref(&self, operand: &str) -> GlobalRef {
        match self.module.lookup_global_id(operand) {
            Some(index) => GlobalRef::Index(index),
            None => GlobalRef::Symbol(operand.to_string()),
        }
    }
}

fn parse_block_type(c: &mut Cursor) -> Result<BlockType> {
    if !c.peek_list("result") {
        return Ok(BlockType::Empty);
    }
    c.expect_lparen()?;
    c.atom()?; // `result`
    let (pos, name) = c.atom()?;
    let valtype = parse_valtype(pos, name)?;
    c.expect_rparen()?;
    Ok(BlockType::Value(valtype))
}

/// Parse one instruction from the cursor.
pub(crate) fn parse_instruction(c: &mut Cursor, ctx: &InstrCtx) -> Result<Instruction> {
    let (pos, mnemonic) = c.atom()?;

    if let Some(ext) = ExtOpcode::from_mnemonic(mnemonic) {
        return Ok(Instruction::Ext(ext));
    }

    let op = Opcode::from_mnemonic(mnemonic)
        .ok_or_else(|| pos.err(format!("unknown instruction `{mnemonic}`")))?;

    let instr = match op {
        Opcode::Block => Instruction::Block(parse_block_type(c)?),
        Opcode::Loop => Instruction::Loop(parse_block_type(c)?),
        Opcode::If => Instruction::If(parse_block_type(c)?),
        Opcode::Br | Opcode::BrIf => {
            let (pos, label) = c.atom()?;
            let label = parse_u32_atom(pos, label)?;
            if op == Opcode::Br {
                Instruction::Br(label)
            } else {
                Instruction::BrIf(label)
            }
        }
        Opcode::BrTable => {
            let mut labels = Vec::new();
            let (pos, first) = c.atom()?;
            labels.push(parse_u32_atom(pos, first)?);
            while let Some(next) = c.peek_atom() {
                if next.chars().next().is_some_and(|ch| ch.is_ascii_digit()) {
                    let (pos, label) = c.atom()?;
                    labels.push(parse_u32_atom(pos, label)?);
                } else {
                    break;
                }
            }
            let default = labels.pop().unwrap();
            Instruction::BrTable { labels, default }
        }
        Opcode::Call => {
            let (pos, operand) = c.atom()?;
            if operand.starts_with('$') {
                Instruction::Call(ctx.func_ref(operand))
            } else {
                Instruction::Call(FuncRef::Index(parse_u32_atom(pos, operand)?))
            }
        }
        Opcode::CallIndirect => {
            let mut type_index = 0;
            if c.peek_list("type") {
                c.expect_lparen()?;
                c.atom()?; // `type`
                let (pos, operand) = c.atom()?;
                type_index = if let Some(types) = ctx.types.filter(|_| operand.starts_with('$')) {
                    *types
                        .get(operand)
                        .ok_or_else(|| pos.err(format!("unknown type `{operand}`")))?
                } else {
                    parse_u32_atom(pos, operand)?
                };
                c.expect_rparen()?;
            }
            Instruction::CallIndirect {
                type_index,
                table_index: 0,
            }
        }
        Opcode::LocalGet | Opcode::LocalSet | Opcode::LocalTee => {
            let (pos, operand) = c.atom()?;
            let index = if operand.starts_with('$') {
                *ctx.locals
                    .and_then(|locals| locals.get(operand))
                    .ok_or_else(|| pos.err(format!("unknown local `{operand}`")))?
            } else {
                parse_u32_atom(pos, operand)?
            };
            Instruction::Local { op, index }
        }
        Opcode::GlobalGet | Opcode::GlobalSet => {
            let (pos, operand) = c.atom()?;
            let target = if operand.starts_with('$') {
                ctx.global_ref(operand)
            } else {
                GlobalRef::Index(parse_u32_atom(pos, operand)?)
            };
            Instruction::Global { op, target }
        }
        Opcode::I32Const => {
            let (pos, operand) = c.atom()?;
            let operand = match operand {
                "offset" | "length" => {
                    c.expect_lparen()?;
                    let (id_pos, id) = c.atom()?;
                    if !id.starts_with('$') {
                        return Err(id_pos.err("expected `$name` data reference"));
                    }
                    c.expect_rparen()?;
                    if operand == "offset" {
                        I32Operand::DataOffset {
                            symbol: id.to_string(),
                            value: None,
                        }
                    } else {
                        I32Operand::DataLength {
                            symbol: id.to_string(),
                            value: None,
                        }
                    }
                }
                _ => I32Operand::Value(parse_i32_atom(pos, operand)?),
            };
            Instruction::I32Const(operand)
        }
        Opcode::I64Const => {
            let (pos, operand) = c.atom()?;
            Instruction::I64Const(parse_i64_atom(pos, operand)?)
        }
        Opcode::F32Const => {
            let (pos, operand) = c.atom()?;
            Instruction::F32Const(parse_f64_atom(pos, operand)? as f32)
        }
        Opcode::F64Const => {
            let (pos, operand) = c.atom()?;
            Instruction::F64Const(parse_f64_atom(pos, operand)?)
        }
        op if is_load_store(op) => {
            let mut align = access_width(op).trailing_zeros();
            let mut offset = 0u64;
            while let Some(operand) = c.peek_atom() {
                if let Some(value) = operand.strip_prefix("offset=") {
                    let (pos, _) = c.atom()?;
                    offset = u64::from(parse_u32_atom(pos, value)?);
                } else if let Some(value) = operand.strip_prefix("align=") {
                    let (pos, _) = c.atom()?;
                    let value = parse_u32_atom(pos, value)?;
                    if !value.is_power_of_two() {
                        return Err(pos.err(format!("alignment must be a power of two: {value}")));
                    }
                    align = value.trailing_zeros();
                } else {
                    break;
                }
            }
            Instruction::Memory { op, align, offset }
        }
        op => Instruction::Op(op),
    };
    Ok(instr)
}

/// Parse a multi-line instrumentation snippet against `module`'s name
/// maps. Each non-empty line after comment stripping is one instruction.
pub(crate) fn parse_snippet(text: &str, module: &Module) -> Result<Vec<Expression>> {
    let ctx = InstrCtx {
        module,
        locals: None,
        types: None,
    };
    let mut out = Vec::new();
    for line in text.lines() {
        let line = match line.find(";;") {
            Some(comment) => &line[..comment],
            None => line,
        };
        if line.trim().is_empty() {
            continue;
        }
        let tokens = Lexer::new(line).tokenize()?;
        let mut cursor = Cursor::new(&tokens);
        let instr = parse_instruction(&mut cursor, &ctx)?;
        if !cursor.done() {
            return Err(cursor
                .pos()
                .err(format!("trailing tokens after instruction `{}`", line.trim())));
        }
        out.push(Expression::synthetic(instr));
    }
    Ok(out)
}

/// A `func` element whose body parse is deferred until names exist.
struct PendingFunc<'a> {
    locals: Vec<ValType>,
    local_names: HashMap<String, u32>,
    body: &'a [(Pos, Token)],
}

struct WatParser<'a> {
    module: Module,
    type_names: HashMap<String, u32>,
    pending: Vec<PendingFunc<'a>>,
}

impl Module {
    /// Parse a text-format module.
    pub fn from_wat(text: &str) -> Result<Module> {
        Module::from_wat_with_data(text, &HashMap::new())
    }

    /// Parse a text-format module, then substitute or append the given
    /// named data segments. A name present in the module has its bytes
    /// replaced; a new name is appended at offset 0 for a later
    /// `add_data_from` relocation to place.
    pub fn from_wat_with_data(
        text: &str,
        data_map: &HashMap<String, Vec<u8>>,
    ) -> Result<Module> {
        let tokens = Lexer::new(text).tokenize()?;
        let mut cursor = Cursor::new(&tokens);
        cursor.expect_lparen()?;
        let (pos, head) = cursor.atom()?;
        if head != "module" {
            return Err(pos.err(format!("expected `module`, found `{head}`")));
        }

        let mut elements: Vec<&[(Pos, Token)]> = Vec::new();
        loop {
            if cursor.done() {
                return Err(cursor.pos().err("unterminated module"));
            }
            if let Some(Token::RParen) = cursor.peek() {
                cursor.next()?;
                break;
            }
            let start = cursor.index;
            cursor.skip_list()?;
            elements.push(&tokens[start..cursor.index]);
        }

        let mut parser = WatParser {
            module: Module::new(),
            type_names: HashMap::new(),
            pending: Vec::new(),
        };

        // Types first so `(type $t)` references resolve anywhere.
        for &element in &elements {
            if element_head(element)? == "type" {
                parser.parse_type(element)?;
            }
        }
        // Imports next; they come first in the function index space.
        for &element in &elements {
            if element_head(element)? == "import" {
                parser.parse_import(element)?;
            }
        }
        // Function signatures and names, bodies deferred.
        for &element in &elements {
            if element_head(element)? == "func" {
                parser.parse_func_header(element)?;
            }
        }
        // Everything else; globals and data register the names function
        // bodies may reference.
        for &element in &elements {
            match element_head(element)? {
                "type" | "import" | "func" => {}
                "table" => parser.parse_table(element)?,
                "memory" => parser.parse_memory(element)?,
                "global" => parser.parse_global(element)?,
                "export" => parser.parse_export(element)?,
                "elem" => parser.parse_elem(element)?,
                "data" => parser.parse_data(element)?,
                "start" => {} // of no use to an instrumentation pass
                other => {
                    return Err(element_pos(element)
                        .err(format!("unknown module element `{other}`")));
                }
            }
        }

        parser.parse_bodies()?;

        let mut module = parser.module;
        for (name, bytes) in data_map {
            match module.lookup_data_id(name) {
                Some(index) => module.data[index as usize].data = bytes.clone(),
                None => {
                    let index = module.data.len() as u32;
                    module.data.push(DataEntry {
                        mem_index: 0,
                        offset: vec![Instruction::I32Const(I32Operand::Value(0)).into()],
                        data: bytes.clone(),
                    });
                    module.data_names.insert(index, name.clone());
                }
            }
        }
        Ok(module)
    }
}

fn element_head<'a>(element: &'a [(Pos, Token)]) -> Result<&'a str> {
    match element.get(1) {
        Some((_, Token::Atom(a))) => Ok(a.as_str()),
        _ => Err(element_pos(element).err("expected element keyword")),
    }
}

fn element_pos(element: &[(Pos, Token)]) -> Pos {
    element
        .first()
        .map(|(pos, _)| *pos)
        .unwrap_or(Pos { line: 1, col: 0 })
}

/// A cursor over an element's contents, header and trailing paren
/// stripped.
fn element_cursor<'a>(element: &'a [(Pos, Token)]) -> Cursor<'a> {
    Cursor::new(&element[2..element.len() - 1])
}

impl<'a> WatParser<'a> {
    fn parse_type(&mut self, element: &'a [(Pos, Token)]) -> Result<()> {
        let mut c = element_cursor(element);
        let name = c.maybe_id();
        c.expect_lparen()?;
        let (pos, head) = c.atom()?;
        if head != "func" {
            return Err(pos.err(format!("expected `func` in type, found `{head}`")));
        }
        let (params, results) = parse_params_results(&mut c, None)?;
        c.expect_rparen()?;
        let index = self.module.types.len() as u32;
        self.module.types.push(TypeEntry { params, results });
        if let Some(name) = name {
            self.type_names.insert(name, index);
        }
        Ok(())
    }

    fn parse_import(&mut self, element: &'a [(Pos, Token)]) -> Result<()> {
        let mut c = element_cursor(element);
        let module_name = String::from_utf8_lossy(c.string()?).into_owned();
        let field = String::from_utf8_lossy(c.string()?).into_owned();
        c.expect_lparen()?;
        let (pos, desc) = c.atom()?;
        let kind = match desc {
            "func" => {
                let id = c.maybe_id();
                let type_index = self.parse_type_use(&mut c)?;
                let func_index = self.module.num_imported_funcs();
                if let Some(id) = id {
                    self.module.function_names.insert(func_index, id);
                }
                ImportKind::Func { type_index }
            }
            "memory" => {
                c.maybe_id();
                let (min, max) = parse_limits(&mut c)?;
                ImportKind::Memory(MemoryEntry {
                    limit_min: min,
                    limit_max: max,
                })
            }
            "table" => {
                c.maybe_id();
                let (min, max) = parse_limits(&mut c)?;
                c.atom()?; // `funcref`
                ImportKind::Table(TableEntry {
                    table_type: 0x70,
                    limit_min: min,
                    limit_max: max,
                })
            }
            "global" => {
                c.maybe_id();
                let (valtype, mutable) = parse_global_type(&mut c)?;
                ImportKind::Global { valtype, mutable }
            }
            other => return Err(pos.err(format!("unknown import kind `{other}`"))),
        };
        c.expect_rparen()?;
        self.module.imports.push(ImportEntry {
            module: module_name,
            field,
            kind,
        });
        Ok(())
    }

    /// Parse `(type N)`, inline `(param ...)`/`(result ...)`, or both;
    /// the resulting signature is interned.
    fn parse_type_use(&mut self, c: &mut Cursor) -> Result<u32> {
        let mut type_index = None;
        if c.peek_list("type") {
            c.expect_lparen()?;
            c.atom()?;
            let (pos, operand) = c.atom()?;
            let index = if operand.starts_with('$') {
                *self
                    .type_names
                    .get(operand)
                    .ok_or_else(|| pos.err(format!("unknown type `{operand}`")))?
            } else {
                parse_u32_atom(pos, operand)?
            };
            c.expect_rparen()?;
            type_index = Some(index);
        }
        let (params, results) = parse_params_results(c, None)?;
        match type_index {
            Some(index) => Ok(index),
            None => Ok(self.module.intern_type(TypeEntry { params, results })),
        }
    }

    fn parse_func_header(&mut self, element: &'a [(Pos, Token)]) -> Result<()> {
        let mut c = element_cursor(element);
        let func_index = self.module.num_imported_funcs() + self.module.functions.len() as u32;
        if let Some(id) = c.maybe_id() {
            self.module.function_names.insert(func_index, id);
        }

        while c.peek_list("export") {
            c.expect_lparen()?;
            c.atom()?;
            let name = String::from_utf8_lossy(c.string()?).into_owned();
            c.expect_rparen()?;
            self.module.exports.push(ExportEntry {
                name,
                kind: ExternalKind::Func,
                index: func_index,
            });
        }

        let mut local_names = HashMap::new();
        let mut type_index = None;
        if c.peek_list("type") {
            c.expect_lparen()?;
            c.atom()?;
            let (pos, operand) = c.atom()?;
            let index = if operand.starts_with('$') {
                *self
                    .type_names
                    .get(operand)
                    .ok_or_else(|| pos.err(format!("unknown type `{operand}`")))?
            } else {
                parse_u32_atom(pos, operand)?
            };
            c.expect_rparen()?;
            type_index = Some(index);
        }
        let (params, results) = parse_params_results(&mut c, Some(&mut local_names))?;
        let type_index = match type_index {
            Some(index) => index,
            None => self.module.intern_type(TypeEntry { params, results }),
        };

        let mut locals = Vec::new();
        let nparams = self
            .module
            .types
            .get(type_index as usize)
            .map(|t| t.params.len() as u32)
            .unwrap_or(local_names.len() as u32);
        while c.peek_list("local") {
            c.expect_lparen()?;
            c.atom()?;
            if let Some(id) = c.maybe_id() {
                local_names.insert(id, nparams + locals.len() as u32);
                let (pos, name) = c.atom()?;
                locals.push(parse_valtype(pos, name)?);
            } else {
                while let Some(name) = c.peek_atom() {
                    let (pos, _) = c.atom()?;
                    locals.push(parse_valtype(pos, name)?);
                }
            }
            c.expect_rparen()?;
        }

        self.module.functions.push(FunctionEntry { type_index });
        self.pending.push(PendingFunc {
            locals,
            local_names,
            body: &c.tokens[c.index..],
        });
        Ok(())
    }

    fn parse_bodies(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for func in pending {
            let mut expression = Vec::new();
            {
                let ctx = InstrCtx {
                    module: &self.module,
                    locals: Some(&func.local_names),
                    types: Some(&self.type_names),
                };
                let mut c = Cursor::new(func.body);
                while !c.done() {
                    expression.push(Expression::synthetic(parse_instruction(&mut c, &ctx)?));
                }
            }
            self.module
                .code
                .push(CodeEntry::new(func.locals, expression));
        }
        Ok(())
    }

    fn parse_table(&mut self, element: &'a [(Pos, Token)]) -> Result<()> {
        let mut c = element_cursor(element);
        c.maybe_id();
        let (min, max) = parse_limits(&mut c)?;
        c.atom()?; // `funcref`
        self.module.tables.push(TableEntry {
            table_type: 0x70,
            limit_min: min,
            limit_max: max,
        });
        Ok(())
    }

    fn parse_memory(&mut self, element: &'a [(Pos, Token)]) -> Result<()> {
        let mut c = element_cursor(element);
        c.maybe_id();
        let (min, max) = parse_limits(&mut c)?;
        self.module.memories.push(MemoryEntry {
            limit_min: min,
            limit_max: max,
        });
        Ok(())
    }

    fn parse_global(&mut self, element: &'a [(Pos, Token)]) -> Result<()> {
        let mut c = element_cursor(element);
        let index = self.module.globals.len() as u32;
        if let Some(id) = c.maybe_id() {
            self.module.global_names.insert(index, id);
        }
        let (valtype, mutable) = parse_global_type(&mut c)?;
        let init = self.parse_folded_instruction(&mut c)?;
        self.module.globals.push(GlobalEntry {
            valtype,
            mutable,
            init,
        });
        Ok(())
    }

    /// Parse a single parenthesized instruction such as `(i32.const 0)`.
    fn parse_folded_instruction(&mut self, c: &mut Cursor) -> Result<Vec<Expression>> {
        c.expect_lparen()?;
        let ctx = InstrCtx {
            module: &self.module,
            locals: None,
            types: Some(&self.type_names),
        };
        let instr = parse_instruction(c, &ctx)?;
        c.expect_rparen()?;
        Ok(vec![Expression::synthetic(instr)])
    }

    fn parse_export(&mut self, element: &'a [(Pos, Token)]) -> Result<()> {
        let mut c = element_cursor(element);
        let name = String::from_utf8_lossy(c.string()?).into_owned();
        c.expect_lparen()?;
        let (pos, desc) = c.atom()?;
        let kind = match desc {
            "func" => ExternalKind::Func,
            "table" => ExternalKind::Table,
            "memory" => ExternalKind::Memory,
            "global" => ExternalKind::Global,
            other => return Err(pos.err(format!("unknown export kind `{other}`"))),
        };
        let (operand_pos, operand) = c.atom()?;
        let index = if operand.starts_with('$') {
            match kind {
                ExternalKind::Func => self.module.lookup_function_id(operand),
                ExternalKind::Global => self.module.lookup_global_id(operand),
                _ => None,
            }
            .ok_or_else(|| operand_pos.err(format!("unknown export target `{operand}`")))?
        } else {
            parse_u32_atom(operand_pos, operand)?
        };
        c.expect_rparen()?;
        self.module.exports.push(ExportEntry { name, kind, index });
        Ok(())
    }

    fn parse_elem(&mut self, element: &'a [(Pos, Token)]) -> Result<()> {
        let mut c = element_cursor(element);
        c.maybe_id();
        let mut table_index = 0;
        if let Some(operand) = c.peek_atom() {
            if operand != "func" {
                let (pos, _) = c.atom()?;
                table_index = parse_u32_atom(pos, operand)?;
            }
        }
        let offset = self.parse_folded_instruction(&mut c)?;
        if c.peek_atom() == Some("func") {
            c.atom()?;
        }
        let mut indexes = Vec::new();
        while !c.done() {
            let (pos, operand) = c.atom()?;
            let index = if operand.starts_with('$') {
                self.module
                    .lookup_function_id(operand)
                    .ok_or_else(|| pos.err(format!("unknown function `{operand}`")))?
            } else {
                parse_u32_atom(pos, operand)?
            };
            indexes.push(index);
        }
        self.module.elements.push(ElemEntry {
            table_index,
            offset,
            indexes,
        });
        Ok(())
    }

    fn parse_data(&mut self, element: &'a [(Pos, Token)]) -> Result<()> {
        let mut c = element_cursor(element);
        let index = self.module.data.len() as u32;
        if let Some(id) = c.maybe_id() {
            self.module.data_names.insert(index, id);
        }
        let mut mem_index = 0;
        if let Some(operand) = c.peek_atom() {
            let (pos, _) = c.atom()?;
            mem_index = parse_u32_atom(pos, operand)?;
        }
        let offset = if matches!(c.peek(), Some(Token::LParen)) {
            self.parse_folded_instruction(&mut c)?
        } else {
            // A bare `(data $name "...")` template segment; placed at 0
            // until relocation.
            vec![Instruction::I32Const(I32Operand::Value(0)).into()]
        };
        let mut data = Vec::new();
        while !c.done() {
            data.extend_from_slice(c.string()?);
        }
        self.module.data.push(DataEntry {
            mem_index,
            offset,
            data,
        });
        Ok(())
    }
}

fn parse_limits(c: &mut Cursor) -> Result<(u32, Option<u32>)> {
    let (pos, min) = c.atom()?;
    let min = parse_u32_atom(pos, min)?;
    let max = match c.peek_atom() {
        Some(operand) if operand.chars().next().is_some_and(|ch| ch.is_ascii_digit()) => {
            let (pos, _) = c.atom()?;
            Some(parse_u32_atom(pos, operand)?)
        }
        _ => None,
    };
    Ok((min, max))
}

fn parse_global_type(c: &mut Cursor) -> Result<(ValType, bool)> {
    if c.peek_list("mut") {
        c.expect_lparen()?;
        c.atom()?;
        let (pos, name) = c.atom()?;
        let valtype = parse_valtype(pos, name)?;
        c.expect_rparen()?;
        Ok((valtype, true))
    } else {
        let (pos, name) = c.atom()?;
        Ok((parse_valtype(pos, name)?, false))
    }
}

/// Parse zero or more `(param ...)` groups then zero or more
/// `(result ...)` groups. Named params are recorded into `names` when
/// provided.
fn parse_params_results(
    c: &mut Cursor,
    mut names: Option<&mut HashMap<String, u32>>,
) -> Result<(Vec<ValType>, Vec<ValType>)> {
    let mut params = Vec::new();
    let mut results = Vec::new();
    while c.peek_list("param") {
        c.expect_lparen()?;
        c.atom()?;
        if let Some(id) = c.maybe_id() {
            if let Some(names) = names.as_deref_mut() {
                names.insert(id, params.len() as u32);
            }
            let (pos, name) = c.atom()?;
            params.push(parse_valtype(pos, name)?);
        } else {
            while let Some(name) = c.peek_atom() {
                let (pos, _) = c.atom()?;
                params.push(parse_valtype(pos, name)?);
            }
        }
        c.expect_rparen()?;
    }
    while c.peek_list("result") {
        c.expect_lparen()?;
        c.atom()?;
        while let Some(name) = c.peek_atom() {
            let (pos, _) = c.atom()?;
            results.push(parse_valtype(pos, name)?);
        }
        c.expect_rparen()?;
    }
    Ok((params, results))
}
