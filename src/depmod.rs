//! Depmod index (spec §4.3): a memory-mapped `modules.dep.bin`, whose
//! body is a packed radix tree keyed by module name.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use scroll::{Endian, Pread, LE};

use crate::buffer::BinaryBuffer;
use crate::error::{Error, Result};

const MAGIC: u32 = 0xB007_F457;
const VERSION: u32 = 0x0002_0001;

const TAG_CHILDS: u32 = 0x2;
const TAG_VALUES: u32 = 0x4;
const TAG_PREFIX: u32 = 0x8;
const OFFSET_MASK: u32 = 0x0fff_ffff;

/// A memory-mapped `modules.dep.bin`, validated and ready for lookups.
pub struct DepmodIndex {
    mapping: Mmap,
    path: String,
}

impl DepmodIndex {
    /// Opens and validates `/lib/modules/<osrelease>/modules.dep.bin`.
    pub fn open(osrelease: &str) -> Result<Self> {
        let path = format!("/lib/modules/{osrelease}/modules.dep.bin");
        Self::open_path(Path::new(&path))
    }

    /// Opens and validates the index at an explicit path. Split out
    /// from [`Self::open`] for testing against fixture files.
    pub fn open_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::os("open", e, path.display().to_string()))?;
        // SAFETY: the mapping is read-only and this process does not
        // rely on the file's contents remaining stable if another
        // process truncates it concurrently; a resulting SIGBUS is
        // outside what this crate can prevent, matching depmod's own
        // consumers (modprobe, kmod).
        let mapping = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::os("mmap", e, path.display().to_string()))?;

        if mapping.len() < 8 {
            return Err(Error::Other(format!(
                "{} is too short to be a depmod index",
                path.display()
            )));
        }
        let magic: u32 = mapping.pread_with(0, LE).map_err(|_| Error::Other("truncated depmod header".to_string()))?;
        if magic != MAGIC {
            return Err(Error::Other(format!(
                "{} has wrong magic {magic:#x}",
                path.display()
            )));
        }
        let version: u32 = mapping.pread_with(4, LE).map_err(|_| Error::Other("truncated depmod header".to_string()))?;
        if version != VERSION {
            return Err(Error::Other(format!(
                "{} has unsupported version {version:#x}",
                path.display()
            )));
        }

        Ok(Self {
            mapping,
            path: path.display().to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Looks up `name` in the radix tree, returning the module's
    /// relative path (the text up to the first `:` in the matching
    /// value), or `None` if absent.
    pub fn find(&self, name: &str) -> Result<Option<String>> {
        find_in_tree(&self.mapping, 8, name.as_bytes())
    }
}

/// Number of immediate children spanned by a `first..=last` byte
/// range, or an error if the range is inverted (a corrupt node: the
/// on-disk format never emits `last < first`).
fn child_span(first: u8, last: u8, offset: usize) -> Result<usize> {
    if last < first {
        return Err(Error::Other(format!(
            "inverted child byte range ({first}..{last}) at offset {offset} in depmod index"
        )));
    }
    Ok(last as usize - first as usize + 1)
}

/// Walks the tree node at `node_offset` looking for `name`, per the
/// `PREFIX`/`CHILDS`/`VALUES` tag rules in spec §4.3. `name` is
/// consumed (advanced past matched prefixes/child bytes) as the walk
/// descends. All offsets are taken through a [`BinaryBuffer`], so a
/// corrupt node offset fails with `Error::Other` rather than a panic.
fn find_in_tree(data: &[u8], node_offset: usize, mut name: &[u8]) -> Result<Option<String>> {
    let mut buf = BinaryBuffer::new(data, Endian::Little);
    let mut node_offset = node_offset;
    loop {
        buf.seek_to(node_offset)?;
        let word = buf.read_u32()?;
        let tags = word >> 28;
        let mut cursor = (word & OFFSET_MASK) as usize;

        if tags & TAG_PREFIX != 0 {
            buf.seek_to(cursor)?;
            let prefix = buf.read_cstr()?;
            if !name.starts_with(prefix) {
                return Ok(None);
            }
            name = &name[prefix.len()..];
            cursor = buf.position();
        }

        if tags & TAG_CHILDS != 0 {
            buf.seek_to(cursor)?;
            let first = buf.read_u8()?;
            let last = buf.read_u8()?;
            let span = child_span(first, last, cursor)?;

            if let Some(&next_byte) = name.first() {
                if next_byte < first || next_byte > last {
                    return Ok(None);
                }
                let child_index = (next_byte - first) as usize;
                buf.seek_to(buf.position() + child_index * 4)?;
                let child_word = buf.read_u32()?;
                if child_word & OFFSET_MASK == 0 && child_word >> 28 == 0 {
                    return Ok(None);
                }
                name = &name[1..];
                node_offset = (child_word & OFFSET_MASK) as usize;
                continue;
            }
            // name exhausted at a node that also carries CHILDS: skip
            // the first/last bytes and the span's child-pointer array
            // before falling through to VALUES below.
            buf.skip(span * 4)?;
            cursor = buf.position();
        }

        if tags & TAG_VALUES != 0 {
            if !name.is_empty() {
                // VALUES but no selectable child and name not fully
                // consumed by a PREFIX match: no match.
                return Ok(None);
            }
            buf.seek_to(cursor)?;
            let count = buf.read_u32()?;
            if count == 0 {
                return Ok(None);
            }
            for i in 0..count {
                let _priority = buf.read_u32()?;
                let value = buf.read_cstr()?;
                if i == 0 {
                    // First value wins (spec doesn't document
                    // multi-value semantics beyond "for each value");
                    // depmod itself only ever emits one value per
                    // exact key in practice.
                    let path_len = value.iter().position(|&b| b == b':').unwrap_or(value.len());
                    return Ok(Some(String::from_utf8_lossy(&value[..path_len]).into_owned()));
                }
            }
            return Ok(None);
        }

        return Ok(None);
    }
}
