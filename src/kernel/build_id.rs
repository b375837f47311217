//! Build-ID extraction (spec §4.5): live via `/sys/module/<name>/notes/*`,
//! crash via `mod->notes_attrs`.

use std::fs;
use std::path::Path;

use crate::elf_notes::find_gnu_build_id;
use crate::error::{Error, Result};
use crate::kernel::module_iterator::{ModuleHandle, ModuleRecord};
use crate::kernel::{MemoryReader, TypedMemoryAccessor};

/// Reads and concatenates every regular file under
/// `/sys/module/<name>/notes/`, returning the first GNU build-ID note
/// found in the concatenation.
pub fn live(module: &ModuleRecord) -> Result<Option<Vec<u8>>> {
    let dir = format!("/sys/module/{}/notes", module.name);
    find_in_sysfs_dir(Path::new(&dir))
}

fn find_in_sysfs_dir(dir: &Path) -> Result<Option<Vec<u8>>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::os("readdir", e, dir.display().to_string())),
    };

    for entry in entries {
        let entry = entry.map_err(|e| Error::os("readdir", e, dir.display().to_string()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let data = fs::read(entry.path())
            .map_err(|e| Error::os("read", e, entry.path().display().to_string()))?;
        if let Some(id) = find_gnu_build_id(&data) {
            return Ok(Some(id.to_vec()));
        }
    }
    Ok(None)
}

/// Crash mode: reads `mod->notes_attrs->notes` (count) and
/// `mod->notes_attrs->attrs` (array); for each entry, reads
/// `attr.private` for `attr.size` bytes from kernel memory and parses
/// it as a note buffer.
pub fn crash(
    module: &ModuleRecord,
    module_ty: crate::kernel::TypeHandle,
    mem: &dyn MemoryReader,
    accessor: &dyn TypedMemoryAccessor,
) -> Result<Option<Vec<u8>>> {
    let ModuleHandle::Crash { module_addr } = module.handle else {
        return Err(Error::Other(
            "build_id::crash called on a live-mode module".to_string(),
        ));
    };

    let notes_attrs = accessor.read_member(module_addr, module_ty, "notes_attrs")?;
    let notes_attrs_ty = accessor.type_of("module_notes_attrs")?;
    let count = accessor.read_member(notes_attrs, notes_attrs_ty, "notes")?;
    let attrs_base = accessor.read_member(notes_attrs, notes_attrs_ty, "attrs")?;
    let attr_ty = accessor.type_of("bin_attribute")?;
    let attr_size = 0x60u64; // Matches the `bin_attribute` layout on supported kernels.

    for i in 0..count {
        let attr_addr = attrs_base + i * attr_size;
        let private = accessor.read_member(attr_addr, attr_ty, "private")?;
        let size = accessor.read_member(attr_addr, attr_ty, "size")?;
        let data = mem.read(private, size as usize, false)?;
        if let Some(id) = find_gnu_build_id(&data) {
            return Ok(Some(id.to_vec()));
        }
    }
    Ok(None)
}
