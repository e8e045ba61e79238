#![deny(missing_docs)]
//! myld is a minimal static linker for ELF64 LE x86-64 relocatable objects.
//!
//! It consumes one or more `ET_REL` object files, merges their symbol
//! tables, lays out a single loadable image, resolves every symbol
//! reference and relocation, and emits a statically linked `ET_EXEC`
//! executable. The pipeline is a straight line: [`object`] parses inputs,
//! [`link::merge_symbols`] builds the merged table, [`layout`] places
//! sections and resolves addresses, [`reloc`] patches relocations, and
//! [`emit`] writes the final bytes.

extern crate goblin;
extern crate indexmap;
extern crate scroll;
#[macro_use]
extern crate log;
extern crate thiserror;

pub mod emit;
pub mod error;
pub mod layout;
pub mod link;
pub mod object;
pub mod reloc;
pub mod symtab;

pub use crate::error::{LinkError, Result};
pub use crate::layout::{ImageLayout, OutputSection, DEFAULT_BASE_VADDR};
pub use crate::link::{link, link_objects, link_with_base, merge_symbols};
pub use crate::object::InputObject;
pub use crate::symtab::{MergedSymbol, SymbolTable};
