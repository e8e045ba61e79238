//! Layout & Resolver: decide where each output section sits in the file and
//! in memory, then assign final virtual addresses to every defined symbol.

use crate::error::{LinkError, Result};
use crate::object::InputObject;
use crate::symtab::SymbolTable;
use goblin::elf::section_header::{self, SHF_ALLOC, SHF_EXECINSTR};
use goblin::elf::sym::STT_FILE;
use std::collections::HashMap;

/// Default load address of the first loadable section, per spec.
pub const DEFAULT_BASE_VADDR: u64 = 0x80000;

/// A contiguous output section: the concatenation of every contributing
/// input object's fragment for that section name.
#[derive(Debug, Clone)]
pub struct OutputSection {
    /// Section name, e.g. `.text`.
    pub name: String,
    /// `sh_type`.
    pub sh_type: u32,
    /// `sh_flags`.
    pub flags: u64,
    /// `sh_addralign`.
    pub align: u64,
    /// Virtual address; zero for non-`ALLOC` sections.
    pub vaddr: u64,
    /// Section content. Starts as the concatenated input fragments; the
    /// Relocator patches bytes in place, and for `.symtab`/`.strtab`/
    /// `.shstrtab` the Emitter fills this in once the rest of layout
    /// (and therefore every section's size) is fixed.
    pub data: Vec<u8>,
    /// File offset, assigned by `Layout::build`.
    pub file_offset: u64,
    /// Byte offset within `data` at which each contributing object's
    /// fragment begins, keyed by that object's filename.
    pub fragment_offsets: HashMap<String, usize>,
}

impl OutputSection {
    fn is_alloc(&self) -> bool {
        self.flags & u64::from(SHF_ALLOC) != 0
    }
}

/// The complete, finalized shape of the output executable: every output
/// section, in emission order, plus the program header description and
/// entry point. Produced once by `Layout::build` + `resolve`, consumed by
/// the Relocator and the Emitter.
#[derive(Debug)]
pub struct ImageLayout {
    /// Output sections, in file order: NULL, `.text`, optional `.rodata`,
    /// `.symtab`, `.strtab`, `.shstrtab`.
    pub sections: Vec<OutputSection>,
    /// Resolved address of `_start`, filled in by `resolve`.
    pub entry: u64,
}

/// First-to-last output section names that may be reserved by Layout before
/// the final sizes of `.symtab`/`.strtab` are known; `.rodata` is only
/// present when some input contributes it.
const TEXT: &str = ".text";
const RODATA: &str = ".rodata";
const SYMTAB: &str = ".symtab";
const STRTAB: &str = ".strtab";
const SHSTRTAB: &str = ".shstrtab";

impl ImageLayout {
    /// Find an output section by name.
    pub fn section(&self, name: &str) -> Option<&OutputSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Mutable lookup, used by the Relocator to patch bytes.
    pub fn section_mut(&mut self, name: &str) -> Option<&mut OutputSection> {
        self.sections.iter_mut().find(|s| s.name == name)
    }
}

/// Concatenate every contributing object's fragment for `section_name`, in
/// `objects` order, with no inter-fragment padding. Returns `None` if no
/// object contributes this section.
fn concatenate(
    objects: &[InputObject],
    section_name: &str,
) -> Option<(Vec<u8>, HashMap<String, usize>, u64, u64)> {
    let mut data = Vec::new();
    let mut fragment_offsets = HashMap::new();
    let mut flags = 0u64;
    let mut align = 1u64;
    let mut any = false;
    for obj in objects {
        if let Some(section) = obj.section(section_name) {
            any = true;
            fragment_offsets.insert(obj.file.clone(), data.len());
            data.extend_from_slice(&section.data);
            flags |= section.flags;
            align = align.max(section.align.max(1));
        }
    }
    if any {
        Some((data, fragment_offsets, flags, align))
    } else {
        None
    }
}

/// Build the output section list and assign virtual addresses and file
/// offsets. Symbol addresses are not yet resolved; call `resolve` next.
pub fn build(objects: &[InputObject], symtab: &SymbolTable, base_vaddr: u64) -> Result<ImageLayout> {
    let mut sections = Vec::new();

    sections.push(OutputSection {
        name: String::new(),
        sh_type: section_header::SHT_NULL,
        flags: 0,
        align: 0,
        vaddr: 0,
        data: Vec::new(),
        file_offset: 0,
        fragment_offsets: HashMap::new(),
    });

    let (text_data, text_fragments, text_flags, _text_align) = concatenate(objects, TEXT)
        .ok_or_else(|| LinkError::LayoutInvariant {
            detail: "no input object contributes a .text section".into(),
        })?;
    sections.push(OutputSection {
        name: TEXT.to_string(),
        sh_type: section_header::SHT_PROGBITS,
        flags: text_flags | u64::from(SHF_ALLOC) | u64::from(SHF_EXECINSTR),
        align: 1,
        vaddr: base_vaddr,
        data: text_data,
        file_offset: 0,
        fragment_offsets: text_fragments,
    });
    log::debug!(".text: vaddr {:#x} size {:#x}", base_vaddr, sections[1].data.len());

    if let Some((rodata_data, rodata_fragments, rodata_flags, _rodata_align)) =
        concatenate(objects, RODATA)
    {
        let text_end = base_vaddr + sections[1].data.len() as u64;
        log::debug!(".rodata: vaddr {:#x} size {:#x}", text_end, rodata_data.len());
        sections.push(OutputSection {
            name: RODATA.to_string(),
            sh_type: section_header::SHT_PROGBITS,
            flags: rodata_flags | u64::from(SHF_ALLOC),
            align: 1,
            vaddr: text_end,
            data: rodata_data,
            file_offset: 0,
            fragment_offsets: rodata_fragments,
        });
    }

    let sym_entsize = goblin::elf::sym::Sym::size(crate::object::ELF_CTX.container);
    let symtab_size = sym_entsize * (symtab.iter().count());
    log::debug!(
        ".symtab: entsize {:#x}, {} entries, size {:#x}",
        sym_entsize, symtab.iter().count(), symtab_size
    );
    sections.push(OutputSection {
        name: SYMTAB.to_string(),
        sh_type: section_header::SHT_SYMTAB,
        flags: 0,
        align: 8,
        vaddr: 0,
        data: vec![0u8; symtab_size],
        file_offset: 0,
        fragment_offsets: HashMap::new(),
    });

    // Leading NUL plus one NUL-terminated name per non-empty symbol; the
    // NULL symbol's empty name shares that leading NUL rather than getting
    // its own byte (matches what build_strtab in emit.rs actually writes).
    let strtab_size: usize = 1 + symtab
        .emission_order()
        .iter()
        .filter(|s| !s.name.is_empty())
        .map(|s| s.name.len() + 1)
        .sum::<usize>();
    log::debug!(".strtab: reserved size {:#x}", strtab_size);
    sections.push(OutputSection {
        name: STRTAB.to_string(),
        sh_type: section_header::SHT_STRTAB,
        flags: 0,
        align: 1,
        vaddr: 0,
        data: vec![0u8; strtab_size],
        file_offset: 0,
        fragment_offsets: HashMap::new(),
    });

    // Same leading-NUL sharing as .strtab above, plus .shstrtab's own name
    // (not yet pushed into `sections` at this point).
    let shstrtab_size: usize = 1 + sections
        .iter()
        .filter(|s| !s.name.is_empty())
        .map(|s| s.name.len() + 1)
        .sum::<usize>()
        + SHSTRTAB.len()
        + 1;
    log::debug!(".shstrtab: reserved size {:#x}", shstrtab_size);
    sections.push(OutputSection {
        name: SHSTRTAB.to_string(),
        sh_type: section_header::SHT_STRTAB,
        flags: 0,
        align: 1,
        vaddr: 0,
        data: vec![0u8; shstrtab_size],
        file_offset: 0,
        fragment_offsets: HashMap::new(),
    });

    assign_file_offsets(&mut sections);
    for section in &sections {
        log::debug!(
            "{}: file_offset {:#x} size {:#x}",
            if section.name.is_empty() { "NULL" } else { &section.name },
            section.file_offset,
            section.data.len()
        );
    }

    Ok(ImageLayout { sections, entry: 0 })
}

/// First loadable byte begins at file offset `0x1000`; everything after is
/// packed with each section's own alignment.
const FIRST_SECTION_OFFSET: u64 = 0x1000;

fn assign_file_offsets(sections: &mut [OutputSection]) {
    let mut cursor = FIRST_SECTION_OFFSET;
    for section in sections.iter_mut() {
        if section.sh_type == section_header::SHT_NULL {
            section.file_offset = 0;
            continue;
        }
        let align = if section.align <= 1 { 1 } else { section.align };
        cursor = round_up(cursor, align);
        section.file_offset = cursor;
        cursor += section.data.len() as u64;
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        (value + align - 1) / align * align
    }
}


/// Resolve every defined symbol's final virtual address, and locate `_start`
/// as the executable's entry point.
pub fn resolve(objects: &[InputObject], symtab: &mut SymbolTable, layout: &mut ImageLayout) -> Result<()> {
    let names: Vec<String> = symtab.iter().map(|s| s.name.clone()).collect();
    for name in names {
        if name.is_empty() {
            continue;
        }
        let (owner, shndx, value, sym_type) = {
            let sym = symtab.get_mut(&name).expect("symbol present");
            (
                sym.owner.clone(),
                sym.entry.shndx,
                sym.entry.value,
                sym.entry.sym_type,
            )
        };
        if sym_type == STT_FILE {
            continue;
        }
        let owner_obj = objects
            .iter()
            .find(|o| o.file == owner)
            .ok_or_else(|| LinkError::LayoutInvariant {
                detail: format!("symbol `{}` claims owner `{}` which is not an input", name, owner),
            })?;
        let section_name = owner_obj
            .sections
            .get(shndx)
            .map(|s| s.name.clone())
            .ok_or_else(|| LinkError::LayoutInvariant {
                detail: format!("symbol `{}` in `{}` has out-of-range section index {}", name, owner, shndx),
            })?;
        let output_section = layout.section(&section_name).ok_or_else(|| LinkError::LayoutInvariant {
            detail: format!(
                "symbol `{}` in `{}` belongs to section `{}`, which has no output section",
                name, owner, section_name
            ),
        })?;
        let fragment_offset = *output_section
            .fragment_offsets
            .get(&owner)
            .ok_or_else(|| LinkError::LayoutInvariant {
                detail: format!(
                    "object `{}` has no recorded fragment offset in section `{}`",
                    owner, section_name
                ),
            })? as u64;
        let address = output_section.vaddr + fragment_offset + value;
        log::debug!(
            "{}: {:#x} = section {} vaddr {:#x} + fragment_offset {:#x} + st_value {:#x}",
            name, address, section_name, output_section.vaddr, fragment_offset, value
        );
        symtab.get_mut(&name).expect("symbol present").address = address;
    }

    let start = symtab
        .iter()
        .find(|s| s.name == "_start")
        .ok_or(LinkError::MissingEntryPoint)?;
    if start.entry.is_undefined() {
        return Err(LinkError::MissingEntryPoint);
    }
    layout.entry = start.address;
    log::debug!("e_entry {:#x} (_start)", layout.entry);
    Ok(())
}

/// The address of an output section's byte at `P` = `vaddr + fragment_offset + within-section offset`,
/// used by the Relocator to compute `P` for `S + A - P`.
pub fn patch_address(output_section: &OutputSection, owner: &str, within_section_offset: usize) -> Result<u64> {
    let fragment_offset = *output_section
        .fragment_offsets
        .get(owner)
        .ok_or_else(|| LinkError::LayoutInvariant {
            detail: format!(
                "object `{}` has no recorded fragment offset in section `{}`",
                owner, output_section.name
            ),
        })?;
    Ok(output_section.vaddr + fragment_offset as u64 + within_section_offset as u64)
}
