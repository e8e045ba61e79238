//! Hand-assembled ELF64 LE x86-64 `ET_REL` object files for exercising the
//! linking pipeline end to end without an assembler or compiler on hand.
//!
//! Every object built here is the minimum ELF a real `as`/`ld` would produce:
//! `.text` (and optionally `.rodata`), `.symtab`, `.strtab`, `.shstrtab`, and
//! an optional `.rela.text`. Byte layout mirrors `myld::emit`'s own
//! compute-offsets-then-write structure, just for a relocatable object
//! instead of an executable.

use goblin::container::{Container, Ctx, Endian};
use goblin::elf::header::{self, Header};
use goblin::elf::reloc::Reloc;
use goblin::elf::section_header::{self, SectionHeader};
use goblin::elf::sym::Sym;
use scroll::Pwrite;

pub const CTX: Ctx = Ctx::new(Container::Big, Endian::Little);

/// Which section a symbol is defined in, if any.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    Text,
    Rodata,
    Undef,
}

/// A symbol table entry to bake into a test object's `.symtab`.
pub struct SymDef {
    pub name: &'static str,
    pub binding: u8,
    pub sym_type: u8,
    pub loc: Loc,
    pub value: u64,
    pub size: u64,
}

pub fn func(name: &'static str, value: u64, size: u64) -> SymDef {
    SymDef {
        name,
        binding: goblin::elf::sym::STB_GLOBAL,
        sym_type: goblin::elf::sym::STT_FUNC,
        loc: Loc::Text,
        value,
        size,
    }
}

pub fn undef_func(name: &'static str) -> SymDef {
    SymDef {
        name,
        binding: goblin::elf::sym::STB_GLOBAL,
        sym_type: goblin::elf::sym::STT_NOTYPE,
        loc: Loc::Undef,
        value: 0,
        size: 0,
    }
}

pub fn file_sym(name: &'static str) -> SymDef {
    SymDef {
        name,
        binding: goblin::elf::sym::STB_LOCAL,
        sym_type: goblin::elf::sym::STT_FILE,
        loc: Loc::Undef,
        value: 0,
        size: 0,
    }
}

/// A `.rela.text` entry: `offset` is the byte offset of the 4-byte field to
/// patch, `symbol` names an entry in the `syms` list passed to `build`.
pub struct RelocDef {
    pub offset: usize,
    pub r_type: u32,
    pub symbol: &'static str,
    pub addend: i64,
}

pub fn plt32(offset: usize, symbol: &'static str, addend: i64) -> RelocDef {
    RelocDef {
        offset,
        r_type: goblin::elf::reloc::R_X86_64_PLT32,
        symbol,
        addend,
    }
}

/// Build a well-formed `ET_REL` object: `.text`, optional `.rodata`, the
/// given symbols, and (if non-empty) a `.rela.text` for the given
/// relocations. Section/symbol naming and offset bookkeeping follow the same
/// rules `myld::object::InputObject::parse` expects on the way back in.
pub fn build(text: &[u8], rodata: Option<&[u8]>, syms: &[SymDef], relocs: &[RelocDef]) -> Vec<u8> {
    let ctx = CTX;
    let ehdr_size = Header::size(&ctx);
    let shdr_size = SectionHeader::size(&ctx);
    let sym_size = Sym::size(ctx.container);
    let rela_size = Reloc::size(true, ctx);
    let has_rela = !relocs.is_empty();

    let mut section_names = vec![String::new(), ".text".to_string()];
    if rodata.is_some() {
        section_names.push(".rodata".to_string());
    }
    section_names.push(".symtab".to_string());
    section_names.push(".strtab".to_string());
    section_names.push(".shstrtab".to_string());
    if has_rela {
        section_names.push(".rela.text".to_string());
    }

    let text_idx = 1;
    let rodata_idx = if rodata.is_some() { Some(2) } else { None };
    let next_idx = if rodata.is_some() { 3 } else { 2 };
    let symtab_idx = next_idx;
    let strtab_idx = next_idx + 1;
    let shstrtab_idx = next_idx + 2;

    // .strtab: leading NUL, then each real symbol's name. Index 0 (the NULL
    // symbol entry) has an empty name pointing at offset 0.
    let mut strtab_bytes = vec![0u8];
    let mut name_offsets = Vec::with_capacity(syms.len());
    for s in syms {
        name_offsets.push(strtab_bytes.len());
        strtab_bytes.extend_from_slice(s.name.as_bytes());
        strtab_bytes.push(0);
    }

    // .symtab: NULL entry first, then one entry per SymDef, in order.
    let mut sym_records = vec![Sym {
        st_name: 0,
        st_info: 0,
        st_other: 0,
        st_shndx: 0,
        st_value: 0,
        st_size: 0,
    }];
    for (s, name_off) in syms.iter().zip(&name_offsets) {
        let st_shndx = match s.loc {
            Loc::Text => text_idx,
            Loc::Rodata => rodata_idx.expect("symbol references .rodata but none was built"),
            Loc::Undef => section_header::SHN_UNDEF as usize,
        };
        sym_records.push(Sym {
            st_name: *name_off,
            st_info: (s.binding << 4) | (s.sym_type & 0xf),
            st_other: 0,
            st_shndx,
            st_value: s.value,
            st_size: s.size,
        });
    }
    let mut symtab_bytes = vec![0u8; sym_size * sym_records.len()];
    for (i, sym) in sym_records.into_iter().enumerate() {
        symtab_bytes
            .pwrite_with(sym, i * sym_size, ctx)
            .expect("write symbol");
    }

    // .rela.text: one entry per RelocDef; `r_sym` is 1-based (entry 0 is the
    // synthetic NULL symbol), looked up by name among `syms`.
    let mut rela_bytes = Vec::new();
    if has_rela {
        rela_bytes.resize(rela_size * relocs.len(), 0u8);
        for (i, r) in relocs.iter().enumerate() {
            let sym_idx = 1 + syms
                .iter()
                .position(|s| s.name == r.symbol)
                .unwrap_or_else(|| panic!("relocation references unknown symbol {}", r.symbol));
            let reloc = Reloc {
                r_offset: r.offset,
                r_addend: r.addend as isize,
                r_sym: sym_idx,
                r_type: r.r_type,
                is_rela: true,
            };
            rela_bytes
                .pwrite_with(reloc, i * rela_size, (true, ctx))
                .expect("write relocation");
        }
    }

    // .shstrtab: leading NUL, then each section name in section-table order.
    let mut shstrtab_bytes = vec![0u8];
    let mut shname_offsets = Vec::with_capacity(section_names.len());
    for n in &section_names {
        if n.is_empty() {
            shname_offsets.push(0);
            continue;
        }
        shname_offsets.push(shstrtab_bytes.len());
        shstrtab_bytes.extend_from_slice(n.as_bytes());
        shstrtab_bytes.push(0);
    }

    // Lay out section bodies back to back right after the ELF header; no
    // alignment padding needed for a hand-built test fixture.
    let mut bodies: Vec<&[u8]> = vec![&[], text];
    if let Some(r) = rodata {
        bodies.push(r);
    }
    bodies.push(&symtab_bytes);
    bodies.push(&strtab_bytes);
    bodies.push(&shstrtab_bytes);
    if has_rela {
        bodies.push(&rela_bytes);
    }

    let mut offsets = Vec::with_capacity(bodies.len());
    let mut cursor = ehdr_size as u64;
    for body in &bodies {
        offsets.push(cursor);
        cursor += body.len() as u64;
    }
    let shoff = cursor;

    let mut header = Header::new(ctx);
    header.e_type = header::ET_REL;
    header.e_machine = header::EM_X86_64;
    header.e_entry = 0;
    header.e_phoff = 0;
    header.e_shoff = shoff;
    header.e_phnum = 0;
    header.e_shnum = section_names.len() as u16;
    header.e_shstrndx = shstrtab_idx as u16;

    let mut out = Vec::new();
    out.resize(ehdr_size, 0);
    out.pwrite_with(header, 0, ctx).expect("write ehdr");
    for (body, off) in bodies.iter().zip(&offsets) {
        out.resize(*off as usize, 0);
        out.extend_from_slice(*body);
    }
    assert_eq!(out.len() as u64, shoff);

    for (i, _name) in section_names.iter().enumerate() {
        let (sh_type, sh_flags, sh_link, sh_info, sh_entsize, sh_addralign) = if i == 0 {
            (section_header::SHT_NULL, 0u64, 0u32, 0u32, 0u64, 0u64)
        } else if i == text_idx {
            (
                section_header::SHT_PROGBITS,
                u64::from(section_header::SHF_ALLOC | section_header::SHF_EXECINSTR),
                0,
                0,
                0,
                1,
            )
        } else if Some(i) == rodata_idx {
            (
                section_header::SHT_PROGBITS,
                u64::from(section_header::SHF_ALLOC),
                0,
                0,
                0,
                1,
            )
        } else if i == symtab_idx {
            (
                section_header::SHT_SYMTAB,
                0,
                strtab_idx as u32,
                // one past the last LOCAL symbol: NULL + every FILE/LOCAL symbol
                // contributed, in this fixture's insertion order, are already
                // grouped first by the caller.
                local_count(syms) as u32 + 1,
                sym_size as u64,
                8,
            )
        } else if i == strtab_idx {
            (section_header::SHT_STRTAB, 0, 0, 0, 0, 1)
        } else if i == shstrtab_idx {
            (section_header::SHT_STRTAB, 0, 0, 0, 0, 1)
        } else {
            // .rela.text
            (
                section_header::SHT_RELA,
                0,
                symtab_idx as u32,
                text_idx as u32,
                rela_size as u64,
                8,
            )
        };
        let shdr = SectionHeader {
            sh_name: shname_offsets[i],
            sh_type,
            sh_flags,
            sh_addr: 0,
            sh_offset: offsets[i],
            sh_size: bodies[i].len() as u64,
            sh_link,
            sh_info,
            sh_addralign,
            sh_entsize,
        };
        let at = out.len();
        out.resize(at + shdr_size, 0);
        out.pwrite_with(shdr, at, ctx).expect("write shdr");
    }

    out
}

fn local_count(syms: &[SymDef]) -> usize {
    syms.iter()
        .take_while(|s| s.binding == goblin::elf::sym::STB_LOCAL)
        .count()
}
