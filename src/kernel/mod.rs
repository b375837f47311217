//! Collaborator traits (spec §6, §4.10): the abstract interfaces this
//! subsystem consumes but does not implement. A real caller backs
//! these with a DWARF-typed memory reader over a running kernel or a
//! core dump; tests back them with `mockall`-generated mocks.

pub mod build_id;
pub mod module_iterator;
pub mod sections;

use crate::error::Result;

/// Reads raw bytes out of kernel virtual or physical address space.
#[cfg_attr(test, mockall::automock)]
pub trait MemoryReader {
    fn read(&self, addr: u64, len: usize, is_physical: bool) -> Result<Vec<u8>>;
}

/// A type handle opaque to this subsystem; the DWARF type layer
/// resolves it into whatever it needs to chase further member
/// accesses through `TypedMemoryAccessor`.
pub type TypeHandle = u64;

/// Locates named kernel globals.
#[cfg_attr(test, mockall::automock)]
pub trait SymbolResolver {
    /// Returns the address and type of a global variable, or
    /// `Error::Lookup` if the symbol is not present in the debug info.
    fn find_variable(&self, name: &str) -> Result<(u64, TypeHandle)>;
}

/// Dereferences typed kernel memory: struct members by name,
/// container-of by member offset, and NUL-terminated strings.
///
/// Each lookup fails with `Error::Lookup` if the member name is
/// absent from the type's debug info (the signal that drives the
/// kernel-version fallbacks in `module_iterator` and `sections`), or
/// `Error::Os`/`Error::Other` if the underlying memory read fails.
#[cfg_attr(test, mockall::automock)]
pub trait TypedMemoryAccessor {
    /// Reads the value of `member` (an unsigned integer field, or a
    /// dotted path through nested anonymous/named structs such as
    /// `"core_layout.base"`) within the struct of type `ty` located
    /// at `addr`.
    fn read_member(&self, addr: u64, ty: TypeHandle, member: &str) -> Result<u64>;

    /// Resolves the address (not value) of `member` within the
    /// struct of type `ty` located at `addr`. Used for members that
    /// are themselves arrays or inline strings, e.g. `struct
    /// module`'s `name[MODULE_NAME_LEN]`.
    fn member_address(&self, addr: u64, ty: TypeHandle, member: &str) -> Result<u64>;

    /// Recovers the address of the struct of type `ty` that contains
    /// the given `member` at the given `member_addr`.
    fn container_of(&self, member_addr: u64, ty: TypeHandle, member: &str) -> Result<u64>;

    /// Reads a NUL-terminated string starting at `addr`, up to
    /// `max_len` bytes.
    fn read_cstring(&self, addr: u64, max_len: usize) -> Result<Vec<u8>>;

    /// Returns the type handle for the named kernel struct (e.g.
    /// `"module"`, `"module_sect_attrs"`), used to look up member
    /// offsets before dereferencing.
    fn type_of(&self, name: &str) -> Result<TypeHandle>;
}

/// The downstream consumer of discovered ELF handles (out of scope
/// per spec §1; modeled here only as the interface the pipeline
/// drives).
#[cfg_attr(test, mockall::automock)]
pub trait DwarfIndexer {
    /// Reports an ELF file to the indexer. `start`/`end` are zero for
    /// an unloaded (unmatched) binary. `name` is `None` for ELFs that
    /// are neither vmlinux nor a named module. `relocated_sections`
    /// carries the `(name, address)` pairs the section-address
    /// iterator produced for this module, already applied to an
    /// in-memory copy of the ELF's section headers by the relocator
    /// (spec §4.7) rather than written back to the on-disk file (a
    /// non-goal); empty for ELFs that were not relocated.
    ///
    /// Returns whether this ELF (by build ID) was newly indexed, as
    /// opposed to already known.
    #[allow(clippy::too_many_arguments)]
    fn report_elf(
        &mut self,
        path: String,
        fd: std::os::unix::io::RawFd,
        start: u64,
        end: u64,
        name: Option<String>,
        relocated_sections: Vec<(String, u64)>,
    ) -> Result<bool>;

    /// Whether a module or vmlinux with the given name is already
    /// indexed.
    fn is_indexed(&self, name: &str) -> bool;

    /// Flushes any ELFs reported so far into the downstream index,
    /// making their debug info available for subsequent lookups
    /// (spec §4.8 step 3: required before walking `struct module` in
    /// crash mode).
    fn flush(&mut self) -> Result<()>;

    /// Routes a per-file error to the error sink. Returns whether the
    /// pipeline must abort (`true`) or continue with the next file
    /// (`false`).
    fn report_error(&mut self, file: &str, message: &str) -> bool;
}
