//! Section-address iterator (spec §4.6): per-module `(name, address)`
//! pairs, live via `/sys/module/<name>/sections/*`, crash via
//! `sect_attrs`.

use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::sys::stat::{fstatat, FileStat, SFlag};

use crate::error::{Error, Result};
use crate::kernel::module_iterator::{ModuleHandle, ModuleRecord};
use crate::kernel::TypedMemoryAccessor;

/// Live mode: enumerates `/sys/module/<name>/sections/`, reading a
/// single hex address out of each regular file. `fstatat` disambiguates
/// files from subdirectories when the `dirent` type is unknown
/// (common for sysfs, which reports `DT_UNKNOWN`).
pub fn live(module: &ModuleRecord) -> Result<Vec<(String, u64)>> {
    let dir = format!("/sys/module/{}/sections", module.name);
    let dir = Path::new(&dir);

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::os("readdir", e, dir.display().to_string())),
    };

    let dir_file = fs::File::open(dir).map_err(|e| Error::os("open", e, dir.display().to_string()))?;

    let mut sections = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::os("readdir", e, dir.display().to_string()))?;
        let name = entry.file_name().to_string_lossy().into_owned();

        let is_file = match entry.file_type() {
            Ok(ft) if ft.is_file() => true,
            Ok(ft) if ft.is_dir() => false,
            _ => is_regular_file(&dir_file, &name)?,
        };
        if !is_file {
            continue;
        }

        let contents = fs::read_to_string(entry.path())
            .map_err(|e| Error::os("read", e, entry.path().display().to_string()))?;
        let addr = u64::from_str_radix(contents.trim().trim_start_matches("0x"), 16)
            .map_err(|_| Error::Other(format!("malformed section address in {name}")))?;
        sections.push((name, addr));
    }
    Ok(sections)
}

fn is_regular_file(dir: &fs::File, name: &str) -> Result<bool> {
    let stat: FileStat = fstatat(dir.as_raw_fd(), name, nix::fcntl::AtFlags::empty())
        .map_err(|e| Error::os("fstatat", std::io::Error::from(e), name.to_string()))?;
    Ok((stat.st_mode & SFlag::S_IFMT.bits()) == SFlag::S_IFREG.bits())
}

/// Crash mode: reads `mod->sect_attrs->nsections` and iterates
/// `mod->sect_attrs->attrs[i]`. Section names moved from
/// `attr.name` to `attr.battr.attr.name` in kernel 5.8; a `Lookup` on
/// the newer path triggers the older one.
pub fn crash(
    module: &ModuleRecord,
    module_ty: crate::kernel::TypeHandle,
    accessor: &dyn TypedMemoryAccessor,
) -> Result<Vec<(String, u64)>> {
    let ModuleHandle::Crash { module_addr } = module.handle else {
        return Err(Error::Other(
            "sections::crash called on a live-mode module".to_string(),
        ));
    };

    let sect_attrs = accessor.read_member(module_addr, module_ty, "sect_attrs")?;
    let sect_attrs_ty = accessor.type_of("module_sect_attrs")?;
    let nsections = accessor.read_member(sect_attrs, sect_attrs_ty, "nsections")?;
    let attrs_base = accessor.member_address(sect_attrs, sect_attrs_ty, "attrs")?;
    let attr_ty = accessor.type_of("module_sect_attr")?;
    let attr_size = 0x38u64; // Matches `module_sect_attr` layout on supported kernels.

    let mut sections = Vec::with_capacity(nsections as usize);
    for i in 0..nsections {
        let attr_addr = attrs_base + i * attr_size;
        let address = accessor.read_member(attr_addr, attr_ty, "address")?;

        let name_ptr = match accessor.read_member(attr_addr, attr_ty, "battr.attr.name") {
            Ok(ptr) => ptr,
            Err(Error::Lookup(_)) => accessor.read_member(attr_addr, attr_ty, "name")?,
            Err(e) => return Err(e),
        };
        let name_bytes = accessor.read_cstring(name_ptr, 64)?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();

        sections.push((name, address));
    }
    Ok(sections)
}
