//! Relocator: walks each input relocation, resolves its symbol, computes the
//! patch value, and writes it into the owning output section's bytes.

use crate::error::{LinkError, Result};
use crate::layout::{self, ImageLayout};
use crate::object::InputObject;
use crate::symtab::SymbolTable;
use goblin::elf::reloc::{R_X86_64_PC32, R_X86_64_PLT32};
use scroll::{Pwrite, LE};

/// Apply every relocation from every input object to the already-laid-out
/// and already-resolved output sections.
pub fn apply(objects: &[InputObject], symtab: &SymbolTable, layout: &mut ImageLayout) -> Result<()> {
    for obj in objects {
        for (section_name, relocations) in &obj.relocations {
            for reloc in relocations {
                let malformed = || LinkError::LayoutInvariant {
                    detail: format!(
                        "{}: relocation in {} at offset {:#x} targets a missing output section",
                        obj.file, section_name, reloc.offset
                    ),
                };

                if !matches!(reloc.r_type, R_X86_64_PLT32 | R_X86_64_PC32) {
                    return Err(LinkError::UnsupportedRelocation {
                        file: obj.file.clone(),
                        section: section_name.clone(),
                        r_type: reloc.r_type,
                    });
                }

                let output_section = layout.section(section_name).ok_or_else(malformed)?;
                let patch_addr = layout::patch_address(output_section, &obj.file, reloc.offset)?;

                // A symbol name starting with `.` denotes an STT_SECTION
                // reference that object.rs already rewrote to the section's
                // own name (section symbols are never inserted into the
                // merged symbol table).
                let symbol_addr = if reloc.symbol.starts_with('.') {
                    let target = layout.section(&reloc.symbol).ok_or_else(|| LinkError::UnresolvedSymbol {
                        name: reloc.symbol.clone(),
                        referenced_from: obj.file.clone(),
                    })?;
                    layout::patch_address(target, &obj.file, 0)?
                } else {
                    symtab.lookup(&reloc.symbol, &obj.file)?.address
                };

                let value = symbol_addr as i64 + reloc.addend - patch_addr as i64;
                log::debug!(
                    "{}: {} +{:#x}: S {:#x} A {:#x} P {:#x} -> {:#x}",
                    obj.file, section_name, reloc.offset, symbol_addr, reloc.addend, patch_addr, value
                );
                if value < i64::from(i32::MIN) || value > i64::from(i32::MAX) {
                    return Err(LinkError::RelocationOverflow {
                        file: obj.file.clone(),
                        section: section_name.clone(),
                        offset: reloc.offset,
                        value,
                    });
                }
                let patch = value as i32;

                let output_section = layout.section_mut(section_name).ok_or_else(malformed)?;
                if reloc.offset + 4 > output_section.data.len() {
                    return Err(LinkError::LayoutInvariant {
                        detail: format!(
                            "{}: relocation in {} at offset {:#x} is out of bounds (section is {} bytes)",
                            obj.file,
                            section_name,
                            reloc.offset,
                            output_section.data.len()
                        ),
                    });
                }
                output_section
                    .data
                    .pwrite_with::<i32>(patch, reloc.offset, LE)
                    .expect("bounds already checked");
            }
        }
    }
    Ok(())
}
