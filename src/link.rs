//! Top-level driver: merges symbols across every input, then runs Layout,
//! Resolver, Relocator, and Emitter in sequence.

use crate::emit;
use crate::error::{LinkError, Result};
use crate::layout::{self, DEFAULT_BASE_VADDR};
use crate::object::InputObject;
use crate::reloc;
use crate::symtab::{MergedSymbol, SymbolTable};
use goblin::elf::section_header::SHN_UNDEF;
use goblin::elf::sym::{STT_NOTYPE, STT_SECTION};

/// Merge every input object's symbol table into one name-keyed table.
///
/// `STT_SECTION` entries are skipped entirely (relocations that target a
/// section reference it by section name, not by symtab entry). A
/// `STT_NOTYPE` entry is accepted only when it is undefined, i.e. a plain
/// external reference; a defined `STT_NOTYPE` entry has no meaning this
/// linker knows how to place and is rejected.
pub fn merge_symbols(objects: &[InputObject]) -> Result<SymbolTable> {
    let mut symtab = SymbolTable::init();
    for obj in objects {
        for sym in &obj.symbols {
            if sym.sym_type == STT_SECTION {
                continue;
            }
            if sym.name.is_empty() {
                continue;
            }
            if sym.sym_type == STT_NOTYPE && sym.shndx != SHN_UNDEF as usize {
                return Err(LinkError::UnsupportedSymbolType {
                    file: obj.file.clone(),
                    name: sym.name.clone(),
                    st_type: sym.sym_type,
                });
            }
            symtab.insert(MergedSymbol {
                name: sym.name.clone(),
                entry: sym.clone(),
                owner: obj.file.clone(),
                address: 0,
            })?;
        }
    }
    Ok(symtab)
}

/// Run the full pipeline over already-parsed objects and produce the final
/// executable's bytes, loading the first section at `base_vaddr`.
pub fn link_objects(objects: Vec<InputObject>, base_vaddr: u64) -> Result<Vec<u8>> {
    log::info!(
        "linking {} object(s) at base address {:#x}",
        objects.len(),
        base_vaddr
    );

    let mut symtab = merge_symbols(&objects)?;
    log::info!("merged symbol table: {} entries", symtab.iter().count());

    let mut image = layout::build(&objects, &symtab, base_vaddr)?;
    log::info!(
        "laid out {} output section(s)",
        image.sections.len()
    );

    layout::resolve(&objects, &mut symtab, &mut image)?;
    log::info!("entry point resolved to {:#x}", image.entry);

    reloc::apply(&objects, &symtab, &mut image)?;
    log::info!("relocations applied");

    let bytes = emit::emit(&objects, &symtab, &mut image)?;
    log::info!("emitted {} byte executable", bytes.len());

    Ok(bytes)
}

/// Parse every input file and run the pipeline with the default base address.
pub fn link(inputs: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    link_with_base(inputs, DEFAULT_BASE_VADDR)
}

/// Parse every input file and run the pipeline at a caller-chosen base address.
pub fn link_with_base(inputs: &[(String, Vec<u8>)], base_vaddr: u64) -> Result<Vec<u8>> {
    let mut objects = Vec::with_capacity(inputs.len());
    for (name, bytes) in inputs {
        log::info!("parsing {}", name);
        objects.push(InputObject::parse(bytes, name)?);
    }
    link_objects(objects, base_vaddr)
}
