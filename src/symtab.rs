//! SymbolTable: the merged, name-keyed table of symbols collected from every
//! input object.

use crate::error::{LinkError, Result};
use crate::object::SymbolEntry;
use goblin::elf::sym::{STB_LOCAL, STT_FILE};
use indexmap::IndexMap;

/// A symbol after merging: the original parsed entry, plus the address the
/// Resolver later writes into it.
#[derive(Debug, Clone)]
pub struct MergedSymbol {
    /// Symbol name (empty for the synthetic NULL entry at index 0).
    pub name: String,
    /// The symbol entry as parsed from its owning object.
    pub entry: SymbolEntry,
    /// Filename of the object this symbol came from.
    pub owner: String,
    /// Final virtual address. Zero until the Resolver runs.
    pub address: u64,
}

/// The merged, name-keyed symbol table.
#[derive(Debug)]
pub struct SymbolTable {
    entries: IndexMap<String, MergedSymbol>,
}

impl SymbolTable {
    /// Create a table containing only the mandatory NULL symbol at entry 0.
    pub fn init() -> Self {
        let mut entries = IndexMap::new();
        entries.insert(
            String::new(),
            MergedSymbol {
                name: String::new(),
                entry: SymbolEntry {
                    name: String::new(),
                    binding: STB_LOCAL,
                    sym_type: 0,
                    shndx: 0,
                    value: 0,
                    size: 0,
                    owner: String::new(),
                },
                owner: String::new(),
                address: 0,
            },
        );
        SymbolTable { entries }
    }

    /// Insert a merged symbol. A symbol with an undefined reference already
    /// on file is upgraded in place once its definition arrives; two
    /// definitions of the same name is a hard error.
    pub fn insert(&mut self, symbol: MergedSymbol) -> Result<()> {
        if symbol.name.is_empty() {
            return Ok(());
        }
        if let Some(existing) = self.entries.get(&symbol.name) {
            let existing_defined = !existing.entry.is_undefined();
            let new_defined = !symbol.entry.is_undefined();
            if existing_defined && new_defined {
                return Err(LinkError::DuplicateSymbol {
                    name: symbol.name.clone(),
                    first: existing.owner.clone(),
                    second: symbol.owner.clone(),
                });
            }
            if !existing_defined && new_defined {
                log::debug!("{}: definition from {} upgrades reference from {}", symbol.name, symbol.owner, existing.owner);
                self.entries.insert(symbol.name.clone(), symbol);
            }
            // existing defined / new undefined, or both undefined: keep the one on file.
            return Ok(());
        }
        log::debug!("{}: inserted from {} (index {})", symbol.name, symbol.owner, self.entries.len());
        self.entries.insert(symbol.name.clone(), symbol);
        Ok(())
    }

    /// Look up a defined symbol by name. `referenced_from` names the input
    /// that needed this symbol, for diagnostics.
    pub fn lookup(&self, name: &str, referenced_from: &str) -> Result<&MergedSymbol> {
        match self.entries.get(name) {
            Some(sym) if !sym.entry.is_undefined() => Ok(sym),
            _ => Err(LinkError::UnresolvedSymbol {
                name: name.to_string(),
                referenced_from: referenced_from.to_string(),
            }),
        }
    }

    /// Mutable lookup, used by the Resolver to write back resolved addresses.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut MergedSymbol> {
        self.entries.get_mut(name)
    }

    /// Every merged symbol, in insertion order (NULL first).
    pub fn iter(&self) -> impl Iterator<Item = &MergedSymbol> {
        self.entries.values()
    }

    /// The order symbols are written to the output SYMTAB in: the NULL entry,
    /// then FILE-typed entries, then LOCAL-binding entries, then everything
    /// else, each group internally stable in original insertion order. This
    /// keeps every LOCAL-binding symbol (FILE symbols are always STB_LOCAL)
    /// contiguous at the front of the table, which is what makes `sh_info`
    /// meaningful.
    pub fn emission_order(&self) -> Vec<&MergedSymbol> {
        let mut ordered: Vec<&MergedSymbol> = self.entries.values().collect();
        ordered.sort_by_key(|sym| emission_rank(sym));
        ordered
    }

    /// `sh_info` for the output SYMTAB: one past the index of the last
    /// LOCAL-binding symbol in emission order.
    pub fn count_local(&self) -> usize {
        let count = self
            .emission_order()
            .iter()
            .take_while(|sym| emission_rank(sym) <= 2)
            .count();
        log::debug!("count_local (sh_info) = {}", count);
        count
    }
}

fn emission_rank(sym: &MergedSymbol) -> u8 {
    if sym.name.is_empty() {
        0
    } else if sym.entry.sym_type == STT_FILE {
        1
    } else if sym.entry.binding == STB_LOCAL {
        2
    } else {
        3
    }
}
