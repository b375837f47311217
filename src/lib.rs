//! Linux kernel debug-info discovery: parses VMCOREINFO, enumerates
//! loaded kernel modules on live kernels and core dumps, matches them
//! against ELF files by GNU build ID, relocates section addresses,
//! and falls back to the `depmod` index when a module isn't supplied
//! by the caller.

pub mod buffer;
pub mod depmod;
pub mod elf_ident;
pub mod elf_notes;
pub mod error;
pub mod kernel;
pub mod pipeline;
pub mod util;
pub mod vmcoreinfo;

pub use error::{Error, Result};
pub use pipeline::{use_live_mode, Pipeline};
pub use vmcoreinfo::VmCoreInfo;
