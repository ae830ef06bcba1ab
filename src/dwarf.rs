//! The DWARF sidecar: joining `.debug_*` custom sections back onto code.
//!
//! Three passes populate [`DebugInfo`](crate::module::DebugInfo): line
//! numbers from each compile unit's line program, local-variable names
//! from subprogram DIEs and their location lists, and source-level
//! globals from `DW_OP_addr` expressions. The generic DIE walking is
//! gimli's; the `.debug_loc` walk and the `0xED` wasm location opcode are
//! decoded by hand since they sit outside gimli's expression model.
//!
//! All of this data is advisory. A DIE or location entry that cannot be
//! decoded is logged and skipped, leaving the corresponding lookup empty;
//! only structurally broken section data surfaces as [`Error::Dwarf`].

use crate::error::Result;
use crate::leb128;
use crate::module::{CodeEntry, GlobalAddress, LineInfo, LocalName, Module};
use gimli::constants::{
    DW_AT_byte_size, DW_AT_location, DW_AT_low_pc, DW_AT_name, DW_AT_type, DW_TAG_array_type,
    DW_TAG_base_type, DW_TAG_class_type, DW_TAG_const_type, DW_TAG_enumeration_type,
    DW_TAG_formal_parameter, DW_TAG_pointer_type, DW_TAG_structure_type, DW_TAG_subprogram,
    DW_TAG_typedef, DW_TAG_union_type, DW_TAG_variable, DW_TAG_volatile_type,
};
use gimli::{AttributeValue, EndianSlice, LittleEndian, UnitOffset};
use std::collections::HashMap;

type Reader<'a> = EndianSlice<'a, LittleEndian>;
type Dwarf<'a> = gimli::Dwarf<Reader<'a>>;
type Unit<'a> = gimli::Unit<Reader<'a>>;

const DW_OP_ADDR: u8 = 0x03;
const DW_OP_PIECE: u8 = 0x93;
const DW_OP_STACK_VALUE: u8 = 0x9f;
const DW_OP_WASM_LOCATION: u8 = 0xed;

/// Where a DWARF location expression places a value at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmLocationKind {
    /// A function local, by index.
    Local,
    /// A wasm global, by index.
    Global,
    /// An operand-stack slot, 0 being the bottom.
    Stack,
}

/// One decoded `0xED` wasm location operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WasmLocation {
    /// What kind of slot the value lives in.
    pub kind: WasmLocationKind,
    /// The local/global/stack index.
    pub index: u64,
}

/// One `(start, end, expression)` row of a `.debug_loc` location list.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRange {
    /// First covered PC.
    pub start: u32,
    /// One past (in DWARF terms) the covered range; treated as closed by
    /// the spatial join, matching the producer side.
    pub end: u32,
    /// The raw DWARF expression bytes for this range.
    pub expr: Vec<u8>,
}

impl Module {
    fn load_dwarf(&self) -> Result<Dwarf<'_>> {
        let dwarf = gimli::Dwarf::load(|id| -> gimli::Result<Reader<'_>> {
            Ok(EndianSlice::new(
                self.custom_section(id.name()).unwrap_or(&[]),
                LittleEndian,
            ))
        })?;
        Ok(dwarf)
    }

    /// Stash the `.debug_loc` payload and verify the DWARF sections are
    /// loadable. Absent sections are fine; the later passes simply find
    /// nothing.
    pub fn parse_dwarf(&mut self) -> Result<()> {
        self.debug.debug_loc = self
            .custom_section(".debug_loc")
            .map(|d| d.to_vec())
            .unwrap_or_default();

        let dwarf = self.load_dwarf()?;
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let _ = dwarf.unit(header)?;
        }
        Ok(())
    }

    /// Populate the PC to source-location table from every compile
    /// unit's line-number program.
    pub fn parse_dwarf_line_numbers(&mut self) -> Result<()> {
        let mut table = HashMap::new();
        {
            let dwarf = self.load_dwarf()?;
            let mut units = dwarf.units();
            while let Some(header) = units.next()? {
                let unit = dwarf.unit(header)?;
                let program = match unit.line_program.clone() {
                    Some(program) => program,
                    None => continue,
                };
                let mut rows = program.rows();
                while let Some((header, row)) = rows.next_row()? {
                    if row.end_sequence() {
                        continue;
                    }
                    let file = match row.file(header) {
                        Some(file) => {
                            let name = dwarf
                                .attr_string(&unit, file.path_name())
                                .map(|s| s.to_string_lossy().into_owned())
                                .unwrap_or_default();
                            let dir = file
                                .directory(header)
                                .and_then(|d| dwarf.attr_string(&unit, d).ok())
                                .map(|s| s.to_string_lossy().into_owned());
                            match dir {
                                Some(dir) if !dir.is_empty() && !name.starts_with('/') => {
                                    format!("{dir}/{name}")
                                }
                                _ => name,
                            }
                        }
                        None => String::new(),
                    };
                    table.insert(
                        row.address(),
                        LineInfo {
                            file,
                            line: row.line().map(|l| l.get()).unwrap_or(0),
                            column: match row.column() {
                                gimli::ColumnType::LeftEdge => 0,
                                gimli::ColumnType::Column(c) => c.get(),
                            },
                        },
                    );
                }
            }
        }
        self.debug.line_info = table;
        Ok(())
    }

    /// Walk every DIE tree collecting subprogram signatures, named
    /// local-variable ranges and `DW_OP_addr`-addressed globals.
    pub fn parse_dwarf_variables(&mut self) -> Result<()> {
        let mut harvest = Harvest::default();
        {
            let dwarf = self.load_dwarf()?;
            let mut units = dwarf.units();
            while let Some(header) = units.next()? {
                let unit = dwarf.unit(header)?;
                harvest_unit(&dwarf, &unit, &self.debug.debug_loc, &mut harvest)?;
            }
        }

        for (name, address) in harvest.globals {
            self.debug.global_addresses.insert(name, address);
        }
        self.debug.local_names.extend(harvest.locals);
        for sub in harvest.subprograms {
            if let Some(fid) = self.find_function_containing_pc(sub.low_pc) {
                self.debug
                    .function_signature
                    .insert(fid, format!("{}({})", sub.name, sub.params));
                self.debug.function_debug.insert(
                    fid,
                    format!(";; {}({})\n{}", sub.name, sub.params, sub.locals),
                );
            }
        }
        Ok(())
    }

    /// The `file:line.col` rendering of a PC's line-table row, if any.
    pub fn source_location(&self, pc: u64) -> Option<String> {
        let info = self.debug.line_info.get(&pc)?;
        Some(format!("{}:{}.{}", info.file, info.line, info.column))
    }

    /// The source name of the variable living in `index` at `pc`.
    pub fn local_var_name(&self, pc: u64, index: u32) -> Option<&str> {
        self.debug
            .local_names
            .iter()
            .find(|l| l.index == index && pc >= l.start_pc && pc <= l.end_pc)
            .map(|l| l.name.as_str())
    }

    /// The printable type of the variable living in `index` at `pc`.
    pub fn local_var_type(&self, pc: u64, index: u32) -> Option<&str> {
        self.debug
            .local_names
            .iter()
            .find(|l| l.index == index && pc >= l.start_pc && pc <= l.end_pc)
            .map(|l| l.type_name.as_str())
    }

    /// The DWARF-derived comment block for a function, if any.
    pub fn function_debug(&self, index: u32) -> Option<&str> {
        self.debug.function_debug.get(&index).map(|s| s.as_str())
    }

    /// The printable `name(params)` signature for a function, if any.
    pub fn function_signature(&self, index: u32) -> Option<&str> {
        self.debug
            .function_signature
            .get(&index)
            .map(|s| s.as_str())
    }

    /// A source-level global by name.
    pub fn global_address(&self, name: &str) -> Option<&GlobalAddress> {
        self.debug.global_addresses.get(name)
    }

    /// A per-file `file(min-max)` summary of the source lines a body
    /// covers, files sorted for stable output.
    pub fn line_range(&self, code: &CodeEntry) -> Option<String> {
        if !code.pc_valid {
            return None;
        }
        let lo = code.code_section_ptr;
        let hi = code.code_section_ptr + code.code_section_len;
        let mut ranges: HashMap<&str, (u64, u64)> = HashMap::new();
        for (pc, info) in &self.debug.line_info {
            if *pc < lo || *pc >= hi {
                continue;
            }
            let entry = ranges
                .entry(info.file.as_str())
                .or_insert((info.line, info.line));
            entry.0 = entry.0.min(info.line);
            entry.1 = entry.1.max(info.line);
        }
        if ranges.is_empty() {
            return None;
        }
        let mut files: Vec<_> = ranges.into_iter().collect();
        files.sort_by_key(|(file, _)| *file);
        Some(
            files
                .into_iter()
                .map(|(file, (min, max))| format!("{file}({min}-{max})"))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// The nearest line-table row at or before `pc` within a body.
    pub fn line_number_before(&self, code: &CodeEntry, pc: u64) -> Option<String> {
        if !code.pc_valid || pc < code.code_section_ptr {
            return None;
        }
        let mut cursor = pc;
        loop {
            if let Some(location) = self.source_location(cursor) {
                return Some(location);
            }
            if cursor == code.code_section_ptr {
                return None;
            }
            cursor -= 1;
        }
    }
}

#[derive(Debug)]
struct Subprogram {
    name: String,
    low_pc: u64,
    params: String,
    locals: String,
}

#[derive(Debug, Default)]
struct Harvest {
    subprograms: Vec<Subprogram>,
    locals: Vec<LocalName>,
    globals: Vec<(String, GlobalAddress)>,
}

fn harvest_unit(
    dwarf: &Dwarf<'_>,
    unit: &Unit<'_>,
    debug_loc: &[u8],
    harvest: &mut Harvest,
) -> Result<()> {
    let mut entries = unit.entries();
    let mut depth = 0isize;
    // Depth of the subprogram currently being read, if any; entries
    // deeper than this are its parameters and variables.
    let mut sub_depth = None::<isize>;

    while let Some((delta, entry)) = entries.next_dfs()? {
        depth += delta;
        if let Some(d) = sub_depth {
            if depth <= d {
                sub_depth = None;
            }
        }

        match entry.tag() {
            DW_TAG_subprogram => {
                let name = attr_name(dwarf, unit, entry).unwrap_or_else(|| "<unknown>".to_string());
                let low_pc = attr_low_pc(dwarf, unit, entry).unwrap_or(0);
                harvest.subprograms.push(Subprogram {
                    name,
                    low_pc,
                    params: String::new(),
                    locals: String::new(),
                });
                sub_depth = Some(depth);
            }
            DW_TAG_formal_parameter | DW_TAG_variable if sub_depth.is_some() => {
                let sub = match harvest.subprograms.last_mut() {
                    Some(sub) => sub,
                    None => continue,
                };
                let name = attr_name(dwarf, unit, entry).unwrap_or_else(|| "<unknown>".to_string());
                let type_name = attr_type_name(dwarf, unit, entry).unwrap_or_default();

                let ranges = location_ranges(entry, debug_loc, sub.low_pc);
                for range in &ranges {
                    for location in extract_wasm_locations(&range.expr) {
                        if location.kind == WasmLocationKind::Local {
                            harvest.locals.push(LocalName {
                                start_pc: u64::from(range.start),
                                end_pc: u64::from(range.end),
                                index: location.index as u32,
                                name: name.clone(),
                                type_name: type_name.clone(),
                            });
                        }
                    }
                }

                if entry.tag() == DW_TAG_formal_parameter {
                    if !sub.params.is_empty() {
                        sub.params.push_str(", ");
                    }
                    sub.params.push_str(&format!("{name}({type_name})"));
                } else {
                    sub.locals.push_str(&format!(";; local {name} {type_name}\n"));
                }
            }
            DW_TAG_variable => {
                // Translation-unit scope: a candidate source-level global.
                if depth == 1 {
                    if let Some((name, address)) = harvest_global(dwarf, unit, entry) {
                        harvest.globals.push((name, address));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn attr_name(
    dwarf: &Dwarf<'_>,
    unit: &Unit<'_>,
    entry: &gimli::DebuggingInformationEntry<Reader<'_>>,
) -> Option<String> {
    let value = entry.attr_value(DW_AT_name).ok()??;
    let s = dwarf.attr_string(unit, value).ok()?;
    Some(s.to_string_lossy().into_owned())
}

fn attr_low_pc(
    dwarf: &Dwarf<'_>,
    unit: &Unit<'_>,
    entry: &gimli::DebuggingInformationEntry<Reader<'_>>,
) -> Option<u64> {
    match entry.attr_value(DW_AT_low_pc).ok()?? {
        AttributeValue::Addr(addr) => Some(addr),
        AttributeValue::DebugAddrIndex(index) => dwarf.address(unit, index).ok(),
        AttributeValue::Udata(value) => Some(value),
        _ => None,
    }
}

fn attr_type_name(
    dwarf: &Dwarf<'_>,
    unit: &Unit<'_>,
    entry: &gimli::DebuggingInformationEntry<Reader<'_>>,
) -> Option<String> {
    match entry.attr_value(DW_AT_type).ok()?? {
        AttributeValue::UnitRef(offset) => type_name(dwarf, unit, offset, 0),
        _ => None,
    }
}

/// A printable name for a type DIE; follows pointer/const/typedef chains
/// a bounded number of steps and gives up quietly on anything exotic.
fn type_name(
    dwarf: &Dwarf<'_>,
    unit: &Unit<'_>,
    offset: UnitOffset<usize>,
    depth: usize,
) -> Option<String> {
    if depth > 8 {
        return None;
    }
    let entry = unit.entry(offset).ok()?;
    let referent = || match entry.attr_value(DW_AT_type).ok()? {
        Some(AttributeValue::UnitRef(inner)) => type_name(dwarf, unit, inner, depth + 1),
        _ => None,
    };
    match entry.tag() {
        DW_TAG_base_type
        | DW_TAG_typedef
        | DW_TAG_structure_type
        | DW_TAG_class_type
        | DW_TAG_union_type
        | DW_TAG_enumeration_type => attr_name(dwarf, unit, &entry),
        DW_TAG_pointer_type => Some(format!(
            "*{}",
            referent().unwrap_or_else(|| "void".to_string())
        )),
        DW_TAG_const_type => Some(format!("const {}", referent().unwrap_or_default())),
        DW_TAG_volatile_type => referent(),
        DW_TAG_array_type => Some(format!("[]{}", referent().unwrap_or_default())),
        _ => attr_name(dwarf, unit, &entry).or_else(referent),
    }
}

fn attr_type_size(unit: &Unit<'_>, entry: &gimli::DebuggingInformationEntry<Reader<'_>>) -> u64 {
    let offset = match entry.attr_value(DW_AT_type) {
        Ok(Some(AttributeValue::UnitRef(offset))) => offset,
        _ => return 0,
    };
    let entry = match unit.entry(offset) {
        Ok(entry) => entry,
        Err(_) => return 0,
    };
    match entry.attr_value(DW_AT_byte_size) {
        Ok(Some(AttributeValue::Udata(size))) => size,
        _ => 0,
    }
}

/// The location ranges of a variable DIE: either a direct expression
/// applied over the enclosing subprogram, or a `.debug_loc` offset
/// walked manually.
fn location_ranges(
    entry: &gimli::DebuggingInformationEntry<Reader<'_>>,
    debug_loc: &[u8],
    sub_low_pc: u64,
) -> Vec<LocationRange> {
    match entry.attr_value(DW_AT_location) {
        Ok(Some(AttributeValue::Exprloc(expr))) => vec![LocationRange {
            start: sub_low_pc as u32,
            end: sub_low_pc as u32,
            expr: expr.0.slice().to_vec(),
        }],
        Ok(Some(AttributeValue::SecOffset(offset))) => {
            read_location_list(debug_loc, offset as u64)
        }
        Ok(Some(AttributeValue::LocationListsRef(offset))) => {
            read_location_list(debug_loc, offset.0 as u64)
        }
        Ok(_) => Vec::new(),
        Err(e) => {
            log::warn!("unreadable DW_AT_location, skipping entry: {e}");
            Vec::new()
        }
    }
}

fn harvest_global(
    dwarf: &Dwarf<'_>,
    unit: &Unit<'_>,
    entry: &gimli::DebuggingInformationEntry<Reader<'_>>,
) -> Option<(String, GlobalAddress)> {
    let name = attr_name(dwarf, unit, entry)?;
    let expr = match entry.attr_value(DW_AT_location).ok()?? {
        AttributeValue::Exprloc(expr) => expr.0.slice().to_vec(),
        _ => return None,
    };
    // Only the single form `DW_OP_addr <u32 LE>` is recognized.
    if expr.len() != 5 || expr[0] != DW_OP_ADDR {
        return None;
    }
    let address = u64::from(u32::from_le_bytes(expr[1..5].try_into().unwrap()));
    Some((
        name,
        GlobalAddress {
            address,
            size: attr_type_size(unit, entry),
            type_name: attr_type_name(dwarf, unit, entry).unwrap_or_default(),
        },
    ))
}

/// Walk a `.debug_loc` location list starting at `offset`.
///
/// The list is `(low u32, high u32, expr_len u16, expr bytes)` rows
/// terminated by a double zero; a row with `low == 0xFFFFFFFF` updates
/// the base address instead. A truncated list yields what was collected.
pub(crate) fn read_location_list(debug_loc: &[u8], offset: u64) -> Vec<LocationRange> {
    let mut ranges = Vec::new();
    let mut base = 0u32;
    let mut ptr = offset as usize;

    let read_u32 = |at: usize| -> Option<u32> {
        debug_loc
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    };

    loop {
        let (low, high) = match (read_u32(ptr), read_u32(ptr + 4)) {
            (Some(low), Some(high)) => (low, high),
            _ => {
                log::warn!("truncated .debug_loc list at offset {ptr}");
                return ranges;
            }
        };
        ptr += 8;
        if low == 0 && high == 0 {
            return ranges;
        }
        if low == 0xffff_ffff {
            base = high;
            continue;
        }
        let expr_len = match debug_loc.get(ptr..ptr + 2) {
            Some(b) => u16::from_le_bytes(b.try_into().unwrap()) as usize,
            None => {
                log::warn!("truncated .debug_loc expression length at offset {ptr}");
                return ranges;
            }
        };
        ptr += 2;
        let expr = match debug_loc.get(ptr..ptr + expr_len) {
            Some(expr) => expr.to_vec(),
            None => {
                log::warn!("truncated .debug_loc expression at offset {ptr}");
                return ranges;
            }
        };
        ptr += expr_len;
        ranges.push(LocationRange {
            start: base + low,
            end: base + high,
            expr,
        });
    }
}

/// Decode the wasm-targeted subset of a DWARF location expression.
///
/// `DW_OP_stack_value` and `DW_OP_piece` are skipped; each `0xED` wasm
/// location op yields one [`WasmLocation`]. An unknown opcode ends the
/// decode, returning what was collected so far.
pub(crate) fn extract_wasm_locations(data: &[u8]) -> Vec<WasmLocation> {
    let mut locations = Vec::new();
    let pos = &mut 0usize;
    while *pos < data.len() {
        let opcode = data[*pos];
        *pos += 1;
        match opcode {
            DW_OP_STACK_VALUE => {}
            DW_OP_PIECE => {
                if leb128::read_u64(data, pos).is_err() {
                    return locations;
                }
            }
            DW_OP_WASM_LOCATION => {
                let kind_byte = match data.get(*pos) {
                    Some(b) => *b,
                    None => return locations,
                };
                *pos += 1;
                let index = if kind_byte == 3 {
                    match data.get(*pos..*pos + 4) {
                        Some(b) => {
                            *pos += 4;
                            u64::from(u32::from_le_bytes(b.try_into().unwrap()))
                        }
                        None => return locations,
                    }
                } else {
                    match leb128::read_u64(data, pos) {
                        Ok(v) => v,
                        Err(_) => return locations,
                    }
                };
                let kind = match kind_byte {
                    0 => WasmLocationKind::Local,
                    1 | 3 => WasmLocationKind::Global,
                    2 => WasmLocationKind::Stack,
                    other => {
                        log::warn!("unknown wasm location kind {other}");
                        return locations;
                    }
                };
                locations.push(WasmLocation { kind, index });
            }
            _ => return locations,
        }
    }
    locations
}
