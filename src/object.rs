//! ObjectParser: turns a byte buffer into a structured view of one ELF64 LE
//! x86-64 relocatable object.
//!
//! Each [`InputObject`] owns its bytes outright; every view it hands back
//! (`InputSection::data`, `SymbolEntry`, `RelocationEntry`) is an independent,
//! owned copy rather than a borrow, so there are no lifetimes and no back-
//! pointers into the parsed tables.

use crate::error::{LinkError, Result};
use goblin::container::{Container, Ctx, Endian};
use goblin::elf::header;
use goblin::elf::reloc::Reloc;
use goblin::elf::section_header::{self, SectionHeader};
use goblin::elf::sym::Sym;
use scroll::Pread;
use std::collections::HashMap;

/// The only `Ctx` this linker ever parses or emits: 64-bit, little-endian.
/// (goblin's `Container::Big` denotes the 64-bit word size, not endianness.)
pub const ELF_CTX: Ctx = Ctx::new(Container::Big, Endian::Little);

fn st_bind(info: u8) -> u8 {
    info >> 4
}

fn st_type(info: u8) -> u8 {
    info & 0xf
}

/// One section of one input object: name, type, flags, alignment, and its
/// own copy of the section's bytes.
#[derive(Debug, Clone)]
pub struct InputSection {
    /// Section name, e.g. `.text`.
    pub name: String,
    /// `sh_type` (`SHT_*`).
    pub sh_type: u32,
    /// `sh_flags` (`SHF_*`).
    pub flags: u64,
    /// `sh_addralign`.
    pub align: u64,
    /// The section's raw bytes.
    pub data: Vec<u8>,
    /// This section's index in its owning object's section header table.
    pub index: usize,
}

impl InputSection {
    /// Whether `SHF_ALLOC` is set.
    pub fn is_alloc(&self) -> bool {
        self.flags & u64::from(section_header::SHF_ALLOC) != 0
    }
}

/// One entry of one input object's symbol table, with its name already
/// resolved (section symbols are named after the section they reference).
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    /// Resolved symbol name.
    pub name: String,
    /// `ELF64_ST_BIND(st_info)`.
    pub binding: u8,
    /// `ELF64_ST_TYPE(st_info)`.
    pub sym_type: u8,
    /// `st_shndx`: the defining section's index, or `SHN_UNDEF`/`SHN_ABS`.
    pub shndx: usize,
    /// `st_value`.
    pub value: u64,
    /// `st_size`.
    pub size: u64,
    /// Filename of the object this symbol came from.
    pub owner: String,
}

impl SymbolEntry {
    /// Whether this is an external reference (`st_shndx == SHN_UNDEF`).
    pub fn is_undefined(&self) -> bool {
        self.shndx == section_header::SHN_UNDEF as usize
    }
}

/// One relocation entry, read from a `.rela<section>` table, with its
/// referenced symbol name already resolved.
#[derive(Debug, Clone)]
pub struct RelocationEntry {
    /// Byte offset within the patched section.
    pub offset: usize,
    /// `r_type` (`R_X86_64_*`).
    pub r_type: u32,
    /// Name of the referenced symbol.
    pub symbol: String,
    /// `r_addend`.
    pub addend: i64,
}

/// A parsed ELF64 LE x86-64 relocatable object.
#[derive(Debug)]
pub struct InputObject {
    /// The filename this object was parsed from, used in diagnostics.
    pub file: String,
    /// Every section, in file order.
    pub sections: Vec<InputSection>,
    /// Every defined-or-undefined symbol table entry, in file order.
    pub symbols: Vec<SymbolEntry>,
    /// Relocation tables, keyed by the name of the section they patch.
    pub relocations: HashMap<String, Vec<RelocationEntry>>,
}

impl InputObject {
    /// Find an input section by name.
    pub fn section(&self, name: &str) -> Option<&InputSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Parse `bytes`, tagging any error with `file` for diagnostics.
    pub fn parse(bytes: &[u8], file: &str) -> Result<InputObject> {
        let malformed = |reason: String| LinkError::MalformedObject {
            file: file.to_string(),
            reason,
        };
        let unsupported = |reason: String| LinkError::UnsupportedObject {
            file: file.to_string(),
            reason,
        };

        if bytes.len() < header::header64::SIZEOF_EHDR {
            return Err(malformed("file too small for an ELF64 header".into()));
        }
        if &bytes[0..4] != header::ELFMAG {
            return Err(malformed("bad ELF magic".into()));
        }
        if bytes[4] != header::ELFCLASS64 {
            return Err(unsupported("not ELFCLASS64".into()));
        }
        if bytes[5] != header::ELFDATA2LSB {
            return Err(unsupported("not little-endian (ELFDATA2LSB)".into()));
        }

        let ctx = ELF_CTX;
        let hdr: header::Header = bytes
            .pread_with(0, ctx)
            .map_err(|e| malformed(format!("could not parse ELF header: {}", e)))?;

        if hdr.e_machine != header::EM_X86_64 {
            return Err(unsupported(format!(
                "e_machine {} is not EM_X86_64",
                hdr.e_machine
            )));
        }
        if hdr.e_type != header::ET_REL {
            return Err(unsupported(format!(
                "e_type {} is not ET_REL",
                hdr.e_type
            )));
        }

        log::debug!(
            "{}: e_shoff {:#x} e_shnum {} e_shentsize {} e_shstrndx {}",
            file, hdr.e_shoff, hdr.e_shnum, hdr.e_shentsize, hdr.e_shstrndx
        );

        let shnum = hdr.e_shnum as usize;
        let shentsize = hdr.e_shentsize as usize;
        let shoff = hdr.e_shoff as usize;
        let table_len = shnum
            .checked_mul(shentsize)
            .ok_or_else(|| malformed("section header table size overflows".into()))?;
        let table_end = shoff
            .checked_add(table_len)
            .ok_or_else(|| malformed("section header table end overflows".into()))?;
        if table_end > bytes.len() {
            return Err(malformed(format!(
                "section header table [{:#x}, {:#x}) overruns file of size {:#x}",
                shoff,
                table_end,
                bytes.len()
            )));
        }

        let mut raw_headers = Vec::with_capacity(shnum);
        for i in 0..shnum {
            let shdr: SectionHeader = bytes
                .pread_with(shoff + i * shentsize, ctx)
                .map_err(|e| malformed(format!("could not parse section header {}: {}", i, e)))?;
            raw_headers.push(shdr);
        }

        let mut raw_data = Vec::with_capacity(shnum);
        for (i, shdr) in raw_headers.iter().enumerate() {
            let off = shdr.sh_offset as usize;
            let size = shdr.sh_size as usize;
            if shdr.sh_type == section_header::SHT_NULL {
                raw_data.push(Vec::new());
                continue;
            }
            let end = off
                .checked_add(size)
                .ok_or_else(|| malformed(format!("section {} end overflows", i)))?;
            if end > bytes.len() {
                return Err(malformed(format!(
                    "section {} [{:#x}, {:#x}) overruns file of size {:#x}",
                    i,
                    off,
                    end,
                    bytes.len()
                )));
            }
            raw_data.push(bytes[off..end].to_vec());
        }

        let shstrndx = hdr.e_shstrndx as usize;
        let shstrtab = raw_data
            .get(shstrndx)
            .ok_or_else(|| malformed("e_shstrndx out of range".into()))?;

        let mut names = Vec::with_capacity(shnum);
        for shdr in &raw_headers {
            names.push(read_cstr(shstrtab, shdr.sh_name as usize, file)?);
        }

        if !names.iter().any(|n| n == ".shstrtab") {
            return Err(malformed("missing .shstrtab section".into()));
        }
        if !names.iter().any(|n| n == ".strtab") {
            return Err(malformed("missing .strtab section".into()));
        }
        let symtab_idx = names
            .iter()
            .position(|n| n == ".symtab")
            .ok_or_else(|| malformed("missing .symtab section".into()))?;
        log::debug!("{}: .symtab is section {}", file, symtab_idx);

        let sym_entsize = Sym::size(ctx.container);
        if raw_headers[symtab_idx].sh_entsize as usize != sym_entsize {
            return Err(malformed(format!(
                ".symtab sh_entsize {} does not match Sym size {}",
                raw_headers[symtab_idx].sh_entsize, sym_entsize
            )));
        }

        let strtab_idx = names.iter().position(|n| n == ".strtab").unwrap();
        let strtab = &raw_data[strtab_idx];

        let symtab_bytes = &raw_data[symtab_idx];
        let symbol_count = symtab_bytes.len() / sym_entsize;
        log::debug!(
            "{}: .symtab is {:#x} bytes, sym_entsize {:#x}, {} entries",
            file, symtab_bytes.len(), sym_entsize, symbol_count
        );
        let mut symbols = Vec::with_capacity(symbol_count);
        for i in 0..symbol_count {
            let sym: Sym = symtab_bytes
                .pread_with(i * sym_entsize, ctx)
                .map_err(|e| malformed(format!("could not parse symbol {}: {}", i, e)))?;
            let sym_type = st_type(sym.st_info);
            let name = if sym_type == goblin::elf::sym::STT_SECTION {
                names
                    .get(sym.st_shndx)
                    .cloned()
                    .ok_or_else(|| malformed(format!("symbol {} has out-of-range st_shndx", i)))?
            } else {
                read_cstr(strtab, sym.st_name, file)?
            };
            symbols.push(SymbolEntry {
                name,
                binding: st_bind(sym.st_info),
                sym_type,
                shndx: sym.st_shndx,
                value: sym.st_value,
                size: sym.st_size,
                owner: file.to_string(),
            });
        }

        let reloc_entsize = Reloc::size(true, ctx);
        let mut sections = Vec::with_capacity(shnum);
        let mut relocations = HashMap::new();
        for (i, shdr) in raw_headers.iter().enumerate() {
            let name = names[i].clone();
            if shdr.sh_type == section_header::SHT_RELA {
                if let Some(target_name) = name.strip_prefix(".rela") {
                    if !names.iter().any(|n| n == target_name) {
                        return Err(malformed(format!(
                            "relocation section {} patches nonexistent section {}",
                            name, target_name
                        )));
                    }
                    if shdr.sh_entsize as usize != reloc_entsize {
                        return Err(malformed(format!(
                            "{} sh_entsize {} does not match Rela size {}",
                            name, shdr.sh_entsize, reloc_entsize
                        )));
                    }
                    let bytes = &raw_data[i];
                    let count = bytes.len() / reloc_entsize;
                    let mut entries = Vec::with_capacity(count);
                    for j in 0..count {
                        let reloc: Reloc = bytes
                            .pread_with(j * reloc_entsize, (true, ctx))
                            .map_err(|e| {
                                malformed(format!("could not parse relocation {} in {}: {}", j, name, e))
                            })?;
                        let symbol = symbols
                            .get(reloc.r_sym)
                            .map(|s| s.name.clone())
                            .ok_or_else(|| {
                                malformed(format!(
                                    "relocation {} in {} references out-of-range symbol {}",
                                    j, name, reloc.r_sym
                                ))
                            })?;
                        entries.push(RelocationEntry {
                            offset: reloc.r_offset,
                            r_type: reloc.r_type,
                            symbol,
                            addend: reloc.r_addend as i64,
                        });
                    }
                    log::debug!(
                        "{}: {} patches {} with {} entries (entsize {:#x})",
                        file, name, target_name, count, reloc_entsize
                    );
                    relocations.insert(target_name.to_string(), entries);
                }
            }
            sections.push(InputSection {
                name,
                sh_type: shdr.sh_type,
                flags: shdr.sh_flags,
                align: shdr.sh_addralign,
                data: raw_data[i].clone(),
                index: i,
            });
        }

        log::debug!(
            "{}: parsed {} sections, {} symbols, {} relocation table(s)",
            file, sections.len(), symbols.len(), relocations.len()
        );
        Ok(InputObject {
            file: file.to_string(),
            sections,
            symbols,
            relocations,
        })
    }
}

/// Read a NUL-terminated string out of `table` starting at `offset`.
/// No fixed window: read until the first NUL, and error if the table ends first.
fn read_cstr(table: &[u8], offset: usize, file: &str) -> Result<String> {
    let slice = table.get(offset..).ok_or_else(|| LinkError::MalformedObject {
        file: file.to_string(),
        reason: format!("string offset {:#x} out of range", offset),
    })?;
    let end = slice
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| LinkError::MalformedObject {
            file: file.to_string(),
            reason: format!("unterminated string at offset {:#x}", offset),
        })?;
    Ok(String::from_utf8_lossy(&slice[..end]).into_owned())
}
