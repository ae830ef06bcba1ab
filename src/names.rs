//! The standard `name` custom section.
//!
//! Subsections 0 (module), 1 (function names), 2 (local names), 7 (global
//! names) and 9 (data names) are decoded into the module's name maps and
//! re-generated on binary encode so identifiers survive renumbering.
//! Everything here is advisory; a malformed subsection is logged and
//! skipped rather than failing the module.

use crate::error::Result;
use crate::leb128;
use crate::module::Module;
use std::collections::HashMap;

const SUBSECTION_MODULE: u8 = 0;
const SUBSECTION_FUNCTION: u8 = 1;
const SUBSECTION_LOCAL: u8 = 2;
const SUBSECTION_GLOBAL: u8 = 7;
const SUBSECTION_DATA: u8 = 9;

impl Module {
    /// Populate the name maps from the `name` custom section, if present.
    pub fn parse_name(&mut self) -> Result<()> {
        let payload = match self.custom_section("name") {
            Some(payload) => payload.to_vec(),
            None => return Ok(()),
        };

        let pos = &mut 0usize;
        while *pos < payload.len() {
            let id = payload[*pos];
            *pos += 1;
            let sub = match leb128::read_bytes(&payload, pos) {
                Ok(sub) => sub,
                Err(e) => {
                    log::warn!("truncated name subsection {id}: {e}");
                    break;
                }
            };
            if let Err(e) = self.parse_name_subsection(id, sub) {
                log::warn!("failed to parse name subsection {id}: {e}");
            }
        }
        Ok(())
    }

    fn parse_name_subsection(&mut self, id: u8, sub: &[u8]) -> Result<()> {
        let pos = &mut 0usize;
        match id {
            SUBSECTION_MODULE => {
                self.module_name = Some(leb128::read_string(sub, pos)?);
            }
            SUBSECTION_FUNCTION => {
                let count = leb128::read_u32(sub, pos)?;
                for _ in 0..count {
                    let index = leb128::read_u32(sub, pos)?;
                    let name = leb128::read_string(sub, pos)?;
                    self.function_names.insert(index, format!("${name}"));
                }
            }
            SUBSECTION_LOCAL => {
                let nfuncs = leb128::read_u32(sub, pos)?;
                for _ in 0..nfuncs {
                    let func_index = leb128::read_u32(sub, pos)?;
                    let count = leb128::read_u32(sub, pos)?;
                    let mut names = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let index = leb128::read_u32(sub, pos)?;
                        let name = leb128::read_string(sub, pos)?;
                        names.push((index, name));
                    }
                    self.local_name_map.insert(func_index, names);
                }
            }
            SUBSECTION_GLOBAL => {
                let count = leb128::read_u32(sub, pos)?;
                for _ in 0..count {
                    let index = leb128::read_u32(sub, pos)?;
                    let name = leb128::read_string(sub, pos)?;
                    self.global_names.insert(index, format!("${name}"));
                }
            }
            SUBSECTION_DATA => {
                let count = leb128::read_u32(sub, pos)?;
                for _ in 0..count {
                    let index = leb128::read_u32(sub, pos)?;
                    let name = leb128::read_string(sub, pos)?;
                    self.data_names.insert(index, format!("${name}"));
                }
            }
            other => {
                log::warn!("unknown name subsection id {other}, skipped");
            }
        }
        Ok(())
    }
}

fn sorted(map: &HashMap<u32, String>) -> Vec<(u32, &str)> {
    let mut entries: Vec<(u32, &str)> = map
        .iter()
        .map(|(index, name)| (*index, name.strip_prefix('$').unwrap_or(name)))
        .collect();
    entries.sort_by_key(|(index, _)| *index);
    entries
}

fn write_name_map(out: &mut Vec<u8>, id: u8, entries: &[(u32, &str)]) {
    let mut sub = Vec::new();
    leb128::write_u64(&mut sub, entries.len() as u64);
    for (index, name) in entries {
        leb128::write_u32(&mut sub, *index);
        leb128::write_string(&mut sub, name);
    }
    out.push(id);
    leb128::write_bytes(out, &sub);
}

/// Regenerate the `name` custom section payload from the module's maps,
/// or `None` when there is nothing to emit.
pub(crate) fn encode_name_section(module: &Module) -> Option<Vec<u8>> {
    let mut out = Vec::new();

    if let Some(name) = &module.module_name {
        let mut sub = Vec::new();
        leb128::write_string(&mut sub, name);
        out.push(SUBSECTION_MODULE);
        leb128::write_bytes(&mut out, &sub);
    }

    if !module.function_names.is_empty() {
        write_name_map(&mut out, SUBSECTION_FUNCTION, &sorted(&module.function_names));
    }

    if !module.local_name_map.is_empty() {
        let mut funcs: Vec<(&u32, &Vec<(u32, String)>)> = module.local_name_map.iter().collect();
        funcs.sort_by_key(|(index, _)| **index);
        let mut sub = Vec::new();
        leb128::write_u64(&mut sub, funcs.len() as u64);
        for (func_index, names) in funcs {
            leb128::write_u32(&mut sub, *func_index);
            leb128::write_u64(&mut sub, names.len() as u64);
            for (index, name) in names {
                leb128::write_u32(&mut sub, *index);
                leb128::write_string(&mut sub, name);
            }
        }
        out.push(SUBSECTION_LOCAL);
        leb128::write_bytes(&mut out, &sub);
    }

    if !module.global_names.is_empty() {
        write_name_map(&mut out, SUBSECTION_GLOBAL, &sorted(&module.global_names));
    }

    if !module.data_names.is_empty() {
        write_name_map(&mut out, SUBSECTION_DATA, &sorted(&module.data_names));
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
