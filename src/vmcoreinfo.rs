//! Parses the VMCOREINFO metadata note (spec §4.1): a textual
//! `key=value` note embedded in crash dumps and live kernels, plus the
//! sysfs + physical-memory fallback used to recover it on kernels
//! older than 4.19 (which don't expose it as a PT_NOTE program header
//! in `/proc/kcore`).

use crate::error::{Error, Result};
use crate::kernel::MemoryReader;

/// Parsed VMCOREINFO fields (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmCoreInfo {
    pub osrelease: String,
    pub page_size: u64,
    pub kaslr_offset: u64,
    pub swapper_pg_dir: u64,
    pub pgtable_l5_enabled: bool,
}

const PREFIX_OSRELEASE: &str = "OSRELEASE=";
const PREFIX_PAGESIZE: &str = "PAGESIZE=";
const PREFIX_KERNELOFFSET: &str = "KERNELOFFSET=";
const PREFIX_SWAPPER_PG_DIR: &str = "SYMBOL(swapper_pg_dir)=";
const PREFIX_PGTABLE_L5: &str = "NUMBER(pgtable_l5_enabled)=";

/// Parses an integer with the given base, where base `0` means
/// "auto-detect a `0x` prefix, else decimal". Fails with
/// `Error::Overflow` if the value overflows `u64` or the entire
/// string is not consumed.
fn parse_int(value: &str, base: u32) -> Result<u64> {
    let (radix, digits) = if base == 0 {
        match value.strip_prefix("0x") {
            Some(hex) => (16, hex),
            None => (10, value),
        }
    } else {
        (base, value)
    };
    u64::from_str_radix(digits, radix).map_err(|_| Error::Overflow(value.to_string()))
}

/// Parses the VMCOREINFO note descriptor (spec §4.1).
///
/// Fails with `Error::Other` if a required field (`osrelease`,
/// `page_size`, `swapper_pg_dir`) is missing, and with
/// `Error::Overflow` if a numeric field fails to parse.
pub fn parse(descriptor: &[u8]) -> Result<VmCoreInfo> {
    let text = String::from_utf8_lossy(descriptor);

    let mut osrelease = None;
    let mut page_size = None;
    let mut kaslr_offset = 0u64;
    let mut swapper_pg_dir = None;
    let mut pgtable_l5_enabled = false;

    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix(PREFIX_OSRELEASE) {
            osrelease = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix(PREFIX_PAGESIZE) {
            page_size = Some(parse_int(rest, 0)?);
        } else if let Some(rest) = line.strip_prefix(PREFIX_KERNELOFFSET) {
            kaslr_offset = parse_int(rest, 16)?;
        } else if let Some(rest) = line.strip_prefix(PREFIX_SWAPPER_PG_DIR) {
            swapper_pg_dir = Some(parse_int(rest, 16)?);
        } else if let Some(rest) = line.strip_prefix(PREFIX_PGTABLE_L5) {
            pgtable_l5_enabled = parse_int(rest, 0)? != 0;
        }
        // Unknown prefixes are skipped.
    }

    let osrelease = osrelease.ok_or_else(|| Error::Other("missing OSRELEASE".to_string()))?;
    if osrelease.is_empty() {
        return Err(Error::Other("empty OSRELEASE".to_string()));
    }
    let page_size = page_size.ok_or_else(|| Error::Other("missing PAGESIZE".to_string()))?;
    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(Error::Other(format!(
            "PAGESIZE {page_size} is not a non-zero power of two"
        )));
    }
    let swapper_pg_dir = swapper_pg_dir
        .ok_or_else(|| Error::Other("missing SYMBOL(swapper_pg_dir)".to_string()))?;
    if swapper_pg_dir == 0 {
        return Err(Error::Other("swapper_pg_dir is zero".to_string()));
    }

    Ok(VmCoreInfo {
        osrelease,
        page_size,
        kaslr_offset,
        swapper_pg_dir,
        pgtable_l5_enabled,
    })
}

const NOTE_NAME: &str = "VMCOREINFO";
const NOTE_NAME_SIZE: u32 = 11; // "VMCOREINFO" + NUL
const NOTE_HEADER_SIZE: usize = 12; // n_namesz, n_descsz, n_type
const NOTE_DESC_OFFSET: usize = 24;

/// Recovers VMCOREINFO from a live, pre-4.19 kernel: reads
/// `(physical_address, size)` from `/sys/kernel/vmcoreinfo`, reads
/// that many bytes from physical memory through `reader`, and parses
/// the descriptor at byte offset 24 within it (spec §4.1).
pub fn read_live_fallback(sysfs_contents: &str, reader: &dyn MemoryReader) -> Result<VmCoreInfo> {
    let mut parts = sysfs_contents.split_whitespace();
    let paddr_str = parts
        .next()
        .ok_or_else(|| Error::Other("/sys/kernel/vmcoreinfo: missing address".to_string()))?;
    let size_str = parts
        .next()
        .ok_or_else(|| Error::Other("/sys/kernel/vmcoreinfo: missing size".to_string()))?;
    let paddr = parse_int(paddr_str, 16)?;
    let size = parse_int(size_str, 16)? as usize;

    let note = reader.read(paddr, size, true)?;

    if note.len() < NOTE_DESC_OFFSET {
        return Err(Error::Other(
            "VMCOREINFO note shorter than its header".to_string(),
        ));
    }

    let n_namesz = u32::from_ne_bytes(note[0..4].try_into().unwrap());
    if n_namesz != NOTE_NAME_SIZE {
        return Err(Error::Other(format!(
            "VMCOREINFO note has unexpected n_namesz {n_namesz}"
        )));
    }
    let name = &note[NOTE_HEADER_SIZE..NOTE_HEADER_SIZE + NOTE_NAME.len()];
    if name != NOTE_NAME.as_bytes() {
        return Err(Error::Other(
            "VMCOREINFO note has unexpected name".to_string(),
        ));
    }

    parse(&note[NOTE_DESC_OFFSET..])
}
