//! ELF classification and section relocation (spec §4.7).

use std::collections::HashMap;

use goblin::elf::{section_header::SHF_ALLOC, Elf};
use scroll::{Endian, Pwrite};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfKind {
    Vmlinux,
    Module,
    Other,
}

const SECTION_THIS_MODULE: &str = ".gnu.linkonce.this_module";
const SECTION_INIT_TEXT: &str = ".init.text";

/// Classifies an ELF by its section names (spec §4.7).
pub fn classify(elf: &Elf) -> ElfKind {
    let mut has_this_module = false;
    let mut has_init_text = false;
    for section in &elf.section_headers {
        match elf.shdr_strtab.get_at(section.sh_name) {
            Some(SECTION_THIS_MODULE) => has_this_module = true,
            Some(SECTION_INIT_TEXT) => has_init_text = true,
            _ => {}
        }
    }
    if has_this_module {
        ElfKind::Module
    } else if has_init_text {
        ElfKind::Vmlinux
    } else {
        ElfKind::Other
    }
}

/// Rewrites `sh_addr` in `elf_bytes`'s section headers for every
/// `(name, address)` pair in `sections` whose name is present among
/// the ELF's allocatable sections.
///
/// Sections without `SHF_ALLOC` are ignored when building the name
/// index. Sections reported by the kernel with no matching ELF
/// section are silently skipped. Per spec §9(b), when a name appears
/// more than once in the ELF's allocatable sections (unusual but
/// possible), only the first is relocated.
pub fn relocate_sections(elf_bytes: &mut [u8], sections: &[(String, u64)]) -> Result<usize> {
    let elf = Elf::parse(elf_bytes)
        .map_err(|e| Error::Other(format!("failed to parse ELF for relocation: {e}")))?;

    let mut offsets_by_name: HashMap<String, usize> = HashMap::new();
    for (index, section) in elf.section_headers.iter().enumerate() {
        if section.sh_flags as u32 & SHF_ALLOC == 0 {
            continue;
        }
        if let Some(name) = elf.shdr_strtab.get_at(section.sh_name) {
            // First write wins: a duplicate name is intentionally not
            // overwritten (spec §9, open question (b)).
            offsets_by_name
                .entry(name.to_string())
                .or_insert_with(|| elf.header.e_shoff as usize + index * elf.header.e_shentsize as usize);
        }
    }

    let endian = if elf.little_endian {
        Endian::Little
    } else {
        Endian::Big
    };
    // sh_addr is the third Elf64_Word-pair field of Elf64_Shdr: name,
    // type, flags, then addr, each 4/8 bytes depending on class.
    let sh_addr_offset = if elf.is_64 { 16 } else { 12 };

    let mut relocated = 0;
    for (name, addr) in sections {
        let Some(&shdr_offset) = offsets_by_name.get(name) else {
            continue;
        };
        let field_offset = shdr_offset + sh_addr_offset;
        if elf.is_64 {
            elf_bytes
                .pwrite_with(*addr, field_offset, endian)
                .map_err(|e| Error::Other(format!("failed to write sh_addr for {name}: {e}")))?;
        } else {
            elf_bytes
                .pwrite_with(*addr as u32, field_offset, endian)
                .map_err(|e| Error::Other(format!("failed to write sh_addr for {name}: {e}")))?;
        }
        relocated += 1;
    }
    Ok(relocated)
}

#[cfg(test)]
mod test {
    use super::*;
    use scroll::{Endian, Pwrite};

    const SHT_PROGBITS: u32 = 1;

    /// Builds a minimal valid little-endian 64-bit ELF with the given
    /// named, allocatable sections (plus a trailing shstrtab), for
    /// testing classification and relocation. Written directly as raw
    /// `Elf64_Ehdr`/`Elf64_Shdr` bytes rather than through goblin's
    /// writer types, which this crate only uses for reading.
    fn build_elf(section_names: &[&str]) -> Vec<u8> {
        let mut strtab = vec![0u8]; // index 0 is the empty string
        let mut name_offsets = Vec::new();
        for name in section_names {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }
        let shstrtab_name_offset = strtab.len() as u32;
        strtab.extend_from_slice(b".shstrtab\0");

        const EHSIZE: usize = 64;
        const SHENTSIZE: usize = 64;
        let shnum = section_names.len() + 2; // NULL section + named + shstrtab
        let shoff = EHSIZE;
        let strtab_off = shoff + shnum * SHENTSIZE;

        let mut buf = vec![0u8; strtab_off + strtab.len()];
        let endian = Endian::Little;

        // e_ident
        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // ELFDATA2LSB
        buf[6] = 1; // EV_CURRENT
        buf.pwrite_with::<u16>(2, 16, endian).unwrap(); // e_type = ET_EXEC
        buf.pwrite_with::<u16>(0x3e, 18, endian).unwrap(); // e_machine = EM_X86_64
        buf.pwrite_with::<u32>(1, 20, endian).unwrap(); // e_version
        buf.pwrite_with::<u64>(shoff as u64, 40, endian).unwrap(); // e_shoff
        buf.pwrite_with::<u16>(EHSIZE as u16, 52, endian).unwrap(); // e_ehsize
        buf.pwrite_with::<u16>(SHENTSIZE as u16, 58, endian).unwrap(); // e_shentsize
        buf.pwrite_with::<u16>(shnum as u16, 60, endian).unwrap(); // e_shnum
        buf.pwrite_with::<u16>((shnum - 1) as u16, 62, endian).unwrap(); // e_shstrndx

        let write_shdr = |buf: &mut Vec<u8>, idx: usize, name: u32, sh_type: u32, flags: u64, offset: u64, size: u64| {
            let base = shoff + idx * SHENTSIZE;
            buf.pwrite_with::<u32>(name, base, endian).unwrap(); // sh_name
            buf.pwrite_with::<u32>(sh_type, base + 4, endian).unwrap(); // sh_type
            buf.pwrite_with::<u64>(flags, base + 8, endian).unwrap(); // sh_flags
            buf.pwrite_with::<u64>(0u64, base + 16, endian).unwrap(); // sh_addr
            buf.pwrite_with::<u64>(offset, base + 24, endian).unwrap(); // sh_offset
            buf.pwrite_with::<u64>(size, base + 32, endian).unwrap(); // sh_size
        };

        write_shdr(&mut buf, 0, 0, 0, 0, 0, 0);
        for (i, &offset) in name_offsets.iter().enumerate() {
            write_shdr(&mut buf, i + 1, offset, SHT_PROGBITS, SHF_ALLOC as u64, 0, 0);
        }
        write_shdr(&mut buf, shnum - 1, shstrtab_name_offset, SHT_PROGBITS, 0, strtab_off as u64, strtab.len() as u64);

        buf[strtab_off..strtab_off + strtab.len()].copy_from_slice(&strtab);
        buf
    }

    #[test]
    fn test_classify_module() {
        let buf = build_elf(&[".text", ".gnu.linkonce.this_module"]);
        let elf = Elf::parse(&buf).unwrap();
        assert_eq!(classify(&elf), ElfKind::Module);
    }

    #[test]
    fn test_classify_vmlinux() {
        let buf = build_elf(&[".text", ".init.text"]);
        let elf = Elf::parse(&buf).unwrap();
        assert_eq!(classify(&elf), ElfKind::Vmlinux);
    }

    #[test]
    fn test_classify_other() {
        let buf = build_elf(&[".text", ".data"]);
        let elf = Elf::parse(&buf).unwrap();
        assert_eq!(classify(&elf), ElfKind::Other);
    }

    #[test]
    fn test_relocate_sections_round_trip() {
        let mut buf = build_elf(&[".text", ".data"]);
        let sections = vec![(".text".to_string(), 0xffff_0000u64), (".data".to_string(), 0xffff_2000)];
        let relocated = relocate_sections(&mut buf, &sections).unwrap();
        assert_eq!(relocated, 2);

        let elf = Elf::parse(&buf).unwrap();
        let text = elf
            .section_headers
            .iter()
            .find(|s| elf.shdr_strtab.get_at(s.sh_name) == Some(".text"))
            .unwrap();
        assert_eq!(text.sh_addr, 0xffff_0000);
        let data = elf
            .section_headers
            .iter()
            .find(|s| elf.shdr_strtab.get_at(s.sh_name) == Some(".data"))
            .unwrap();
        assert_eq!(data.sh_addr, 0xffff_2000);
    }

    #[test]
    fn test_relocate_sections_unmatched_kernel_section_is_skipped() {
        let mut buf = build_elf(&[".text"]);
        let sections = vec![(".text".to_string(), 0x1000u64), (".unknown".to_string(), 0x2000)];
        let relocated = relocate_sections(&mut buf, &sections).unwrap();
        assert_eq!(relocated, 1);
    }

    #[test]
    fn test_relocate_sections_untouched_sections_keep_original_addr() {
        let mut buf = build_elf(&[".text", ".data"]);
        let sections = vec![(".text".to_string(), 0x1000u64)];
        relocate_sections(&mut buf, &sections).unwrap();

        let elf = Elf::parse(&buf).unwrap();
        let data = elf
            .section_headers
            .iter()
            .find(|s| elf.shdr_strtab.get_at(s.sh_name) == Some(".data"))
            .unwrap();
        assert_eq!(data.sh_addr, 0);
    }
}
