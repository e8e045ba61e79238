//! Emitter: materializes the final ELF64 executable bytes.
//!
//! Every running file offset is computed up front (mirroring the
//! compute-then-write structure faerie's own ELF writer uses), then the
//! header, program header, padding, sections, and section header table are
//! written in that exact order, with the cursor position checked against
//! the precomputed offsets at each step.

use crate::error::{LinkError, Result};
use crate::layout::ImageLayout;
use crate::object::{InputObject, ELF_CTX};
use crate::symtab::SymbolTable;
use goblin::elf::header::{self, Header};
use goblin::elf::program_header::{self, ProgramHeader};
use goblin::elf::section_header::{self, SectionHeader};
use goblin::elf::sym::{Sym, STT_FILE};
use scroll::Pwrite;
use std::collections::HashMap;

fn st_info(binding: u8, sym_type: u8) -> u8 {
    (binding << 4) | (sym_type & 0xf)
}

/// Build the `.strtab` payload (leading NUL, then each emitted symbol's name
/// NUL-terminated) and a map from symbol name to its byte offset in that
/// payload.
fn build_strtab(symtab: &SymbolTable) -> (Vec<u8>, HashMap<String, usize>) {
    let mut bytes = vec![0u8];
    let mut offsets = HashMap::new();
    for sym in symtab.emission_order() {
        if sym.name.is_empty() {
            offsets.insert(sym.name.clone(), 0);
            continue;
        }
        offsets.insert(sym.name.clone(), bytes.len());
        bytes.extend_from_slice(sym.name.as_bytes());
        bytes.push(0);
    }
    (bytes, offsets)
}

/// Build the `.symtab` payload, resolving each symbol's `st_shndx` to the
/// position of its owning output section in `layout.sections`.
fn build_symtab(
    objects: &[InputObject],
    symtab: &SymbolTable,
    layout: &ImageLayout,
    name_offsets: &HashMap<String, usize>,
) -> Result<Vec<u8>> {
    let entsize = Sym::size(ELF_CTX.container);
    let order = symtab.emission_order();
    let mut bytes = vec![0u8; entsize * order.len()];
    for (i, merged) in order.iter().enumerate() {
        let (st_shndx, st_value, st_size) = if merged.name.is_empty() {
            (0usize, 0u64, 0u64)
        } else if merged.entry.sym_type == STT_FILE {
            (section_header::SHN_ABS as usize, 0, 0)
        } else if merged.entry.is_undefined() {
            (section_header::SHN_UNDEF as usize, 0, 0)
        } else {
            let owner = objects
                .iter()
                .find(|o| o.file == merged.owner)
                .ok_or_else(|| LinkError::LayoutInvariant {
                    detail: format!("symbol `{}` owner `{}` is not an input object", merged.name, merged.owner),
                })?;
            let section_name = owner
                .sections
                .get(merged.entry.shndx)
                .map(|s| s.name.clone())
                .ok_or_else(|| LinkError::LayoutInvariant {
                    detail: format!("symbol `{}` has out-of-range section index", merged.name),
                })?;
            let idx = layout
                .sections
                .iter()
                .position(|s| s.name == section_name)
                .ok_or_else(|| LinkError::LayoutInvariant {
                    detail: format!("symbol `{}` section `{}` has no output section", merged.name, section_name),
                })?;
            (idx, merged.address, merged.entry.size)
        };
        let name_offset = *name_offsets.get(&merged.name).unwrap_or(&0);
        let sym = Sym {
            st_name: name_offset,
            st_info: st_info(merged.entry.binding, merged.entry.sym_type),
            st_other: 0,
            st_shndx,
            st_value,
            st_size,
        };
        bytes
            .pwrite_with(sym, i * entsize, ELF_CTX)
            .map_err(|e| LinkError::LayoutInvariant {
                detail: format!("could not write symbol {}: {}", i, e),
            })?;
    }
    Ok(bytes)
}

/// Build the `.shstrtab` payload and a map from section name to its byte
/// offset within it.
fn build_shstrtab(layout: &ImageLayout) -> (Vec<u8>, HashMap<String, usize>) {
    let mut bytes = vec![0u8];
    let mut offsets = HashMap::new();
    for section in &layout.sections {
        if section.name.is_empty() {
            offsets.insert(section.name.clone(), 0);
            continue;
        }
        offsets.insert(section.name.clone(), bytes.len());
        bytes.extend_from_slice(section.name.as_bytes());
        bytes.push(0);
    }
    (bytes, offsets)
}

/// Produce the final executable bytes for `layout`, whose symbol and
/// relocation content has already been finalized by `resolve`/`apply`.
pub fn emit(objects: &[InputObject], symtab: &SymbolTable, layout: &mut ImageLayout) -> Result<Vec<u8>> {
    let (strtab_bytes, name_offsets) = build_strtab(symtab);
    log::debug!("built .strtab payload: {:#x} bytes", strtab_bytes.len());
    let symtab_bytes = build_symtab(objects, symtab, layout, &name_offsets)?;
    log::debug!("built .symtab payload: {:#x} bytes", symtab_bytes.len());

    {
        let strtab_section = layout
            .section_mut(".strtab")
            .expect(".strtab was reserved by Layout::build");
        if strtab_bytes.len() != strtab_section.data.len() {
            return Err(LinkError::LayoutInvariant {
                detail: format!(
                    ".strtab size mismatch: reserved {}, built {}",
                    strtab_section.data.len(),
                    strtab_bytes.len()
                ),
            });
        }
        strtab_section.data = strtab_bytes;
    }
    {
        let symtab_section = layout
            .section_mut(".symtab")
            .expect(".symtab was reserved by Layout::build");
        if symtab_bytes.len() != symtab_section.data.len() {
            return Err(LinkError::LayoutInvariant {
                detail: format!(
                    ".symtab size mismatch: reserved {}, built {}",
                    symtab_section.data.len(),
                    symtab_bytes.len()
                ),
            });
        }
        symtab_section.data = symtab_bytes;
    }

    let (shstrtab_bytes, section_name_offsets) = build_shstrtab(layout);
    log::debug!("built .shstrtab payload: {:#x} bytes", shstrtab_bytes.len());
    {
        let shstrtab_section = layout
            .section_mut(".shstrtab")
            .expect(".shstrtab was reserved by Layout::build");
        if shstrtab_bytes.len() != shstrtab_section.data.len() {
            return Err(LinkError::LayoutInvariant {
                detail: format!(
                    ".shstrtab size mismatch: reserved {}, built {}",
                    shstrtab_section.data.len(),
                    shstrtab_bytes.len()
                ),
            });
        }
        shstrtab_section.data = shstrtab_bytes;
    }

    let strtab_idx = layout
        .sections
        .iter()
        .position(|s| s.name == ".strtab")
        .expect(".strtab is always present");
    let shstrtab_idx = layout.sections.len() - 1;
    debug_assert_eq!(layout.sections[shstrtab_idx].name, ".shstrtab");
    log::debug!(
        "strtab_idx {} shstrtab_idx {} (e_shstrndx)",
        strtab_idx, shstrtab_idx
    );

    let ctx = ELF_CTX;
    let ehdr_size = Header::size(&ctx);
    let phdr_size = ProgramHeader::size(&ctx);
    let shdr_size = SectionHeader::size(&ctx);
    log::debug!(
        "ehdr_size {:#x} phdr_size {:#x} shdr_size {:#x}",
        ehdr_size, phdr_size, shdr_size
    );

    let last = layout.sections.last().expect("at least NULL + .text");
    let shoff = last.file_offset + last.data.len() as u64;
    log::debug!("e_shoff {:#x} (last section {} ends here)", shoff, last.name);

    let text = layout.section(".text").expect(".text is always present");
    let (p_filesz, p_memsz) = match layout.section(".rodata") {
        // .rodata extends the same PT_LOAD rather than getting its own segment
        // (DESIGN.md); file size and memory size are computed independently
        // since file-offset space and vaddr space can diverge by alignment
        // padding even though they start from the same base.
        Some(rodata) => (
            (rodata.file_offset + rodata.data.len() as u64) - text.file_offset,
            (rodata.vaddr + rodata.data.len() as u64) - text.vaddr,
        ),
        None => (text.data.len() as u64, text.data.len() as u64),
    };
    log::debug!(
        "PT_LOAD p_filesz {:#x} p_memsz {:#x} (text.file_offset {:#x} text.vaddr {:#x})",
        p_filesz, p_memsz, text.file_offset, text.vaddr
    );

    let mut header = Header::new(ctx);
    header.e_type = header::ET_EXEC;
    header.e_machine = header::EM_X86_64;
    header.e_entry = layout.entry;
    header.e_phoff = ehdr_size as u64;
    header.e_shoff = shoff;
    header.e_phnum = 1;
    header.e_shnum = layout.sections.len() as u16;
    header.e_shstrndx = shstrtab_idx as u16;

    let program_header = ProgramHeader {
        p_type: program_header::PT_LOAD,
        p_flags: program_header::PF_R | program_header::PF_X,
        p_offset: text.file_offset,
        p_vaddr: text.vaddr,
        p_paddr: text.vaddr,
        p_filesz,
        p_memsz,
        p_align: 0x1000,
    };

    let mut section_headers = Vec::with_capacity(layout.sections.len());
    for section in &layout.sections {
        let sh_name = *section_name_offsets.get(&section.name).unwrap_or(&0);
        let mut shdr = SectionHeader {
            sh_name,
            sh_type: section.sh_type,
            sh_flags: section.flags,
            sh_addr: section.vaddr,
            sh_offset: section.file_offset,
            sh_size: section.data.len() as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: section.align,
            sh_entsize: 0,
        };
        if section.name == ".symtab" {
            shdr.sh_link = strtab_idx as u32;
            shdr.sh_info = symtab.count_local() as u32;
            shdr.sh_entsize = Sym::size(ctx.container) as u64;
        }
        section_headers.push(shdr);
    }

    let mut out = Vec::with_capacity(shoff as usize + section_headers.len() * shdr_size);
    out.resize(ehdr_size, 0);
    out.pwrite_with(header, 0, ctx).map_err(io_err)?;
    debug_assert_eq!(out.len(), ehdr_size);
    log::debug!("after_header {:#x}", out.len());

    out.resize(ehdr_size + phdr_size, 0);
    out.pwrite_with(program_header, ehdr_size, ctx).map_err(io_err)?;
    debug_assert!(out.len() as u64 <= text.file_offset, "program header overruns first section");
    log::debug!("after_phdr {:#x}, first section at {:#x}", out.len(), text.file_offset);

    // NUL padding up to the first section's file offset.
    out.resize(text.file_offset as usize, 0);

    for section in layout.sections.iter().skip(1) {
        if out.len() as u64 != section.file_offset {
            out.resize(section.file_offset as usize, 0);
        }
        log::debug!(
            "writing section {} at {:#x}, size {:#x}",
            section.name,
            out.len(),
            section.data.len()
        );
        out.extend_from_slice(&section.data);
    }
    log::debug!("after_sections {:#x}, expect e_shoff {:#x}", out.len(), shoff);

    if out.len() as u64 != shoff {
        return Err(LinkError::LayoutInvariant {
            detail: format!(
                "cursor {:#x} does not match computed e_shoff {:#x} before writing section headers",
                out.len(),
                shoff
            ),
        });
    }

    for shdr in &section_headers {
        let at = out.len();
        out.resize(at + shdr_size, 0);
        out.pwrite_with(shdr.clone(), at, ctx).map_err(io_err)?;
    }
    log::debug!("after_shdrs {:#x}, done", out.len());

    Ok(out)
}

fn io_err(e: scroll::Error) -> LinkError {
    LinkError::LayoutInvariant {
        detail: format!("failed to write ELF structure: {}", e),
    }
}
