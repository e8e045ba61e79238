//! Error types produced by every stage of the linking pipeline.

use thiserror::Error;

/// Every way the pipeline can fail. Each variant is fatal: the pipeline does not
/// attempt to recover or continue once one of these is returned.
#[derive(Error, Debug)]
pub enum LinkError {
    /// ELF parsing failed for a specific input file.
    #[error("{file}: malformed object: {reason}")]
    MalformedObject {
        /// The input file that failed to parse.
        file: String,
        /// Human-readable reason, naming the offending field or range.
        reason: String,
    },

    /// The input is well-formed ELF, but not the flavor this linker accepts.
    #[error("{file}: unsupported object: {reason}")]
    UnsupportedObject {
        /// The input file.
        file: String,
        /// e.g. "wrong class", "not little-endian", "not EM_X86_64", "not ET_REL".
        reason: String,
    },

    /// Two inputs both define the same non-weak global symbol.
    #[error("duplicate symbol `{name}`: defined in both {first} and {second}")]
    DuplicateSymbol {
        /// The symbol name.
        name: String,
        /// The file that defined it first.
        first: String,
        /// The file that redefined it.
        second: String,
    },

    /// A relocation (or the entry point search) referenced a name with no definition.
    #[error("unresolved symbol `{name}`, referenced from {referenced_from}")]
    UnresolvedSymbol {
        /// The undefined symbol name.
        name: String,
        /// The file whose relocation or request needed it.
        referenced_from: String,
    },

    /// No input defines `_start`.
    #[error("missing entry point: no input defines `_start`")]
    MissingEntryPoint,

    /// A symbol table entry used a type this linker does not merge.
    #[error("{file}: unsupported symbol type {st_type} for `{name}`")]
    UnsupportedSymbolType {
        /// The input file.
        file: String,
        /// The symbol name.
        name: String,
        /// The raw `ELF64_ST_TYPE(st_info)` value.
        st_type: u8,
    },

    /// A relocation entry used a type outside the supported minimum set.
    #[error("{file}: unsupported relocation type {r_type} in section {section}")]
    UnsupportedRelocation {
        /// The input file.
        file: String,
        /// The patched section's name.
        section: String,
        /// The raw `r_type` value.
        r_type: u32,
    },

    /// A computed PC-relative displacement did not fit in a signed 32-bit integer.
    #[error("{file}: relocation overflow in section {section} at offset {offset:#x}: value {value:#x} does not fit in i32")]
    RelocationOverflow {
        /// The input file.
        file: String,
        /// The patched section's name.
        section: String,
        /// The byte offset within the section being patched.
        offset: usize,
        /// The value that overflowed.
        value: i64,
    },

    /// An internal consistency check failed: alignment, offset, or size mismatch.
    #[error("layout invariant violated: {detail}")]
    LayoutInvariant {
        /// What failed, and the values involved.
        detail: String,
    },

    /// Reading an input file or writing the output executable failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LinkError>;
