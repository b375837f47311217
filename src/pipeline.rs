//! Discovery pipeline (spec §4.8): the orchestration layer that ties
//! the module iterator, build-ID extractor, section iterator, and
//! depmod index together into one pass over user-supplied files and
//! loaded kernel modules.

use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use log::{debug, trace, warn};

use crate::depmod::DepmodIndex;
use crate::elf_ident::{classify, relocate_sections, ElfKind};
use crate::error::{Error, Result};
use crate::kernel::module_iterator::{ModuleIterator, ModuleRecord};
use crate::kernel::{build_id, sections, DwarfIndexer, MemoryReader, SymbolResolver, TypedMemoryAccessor};
use crate::vmcoreinfo::VmCoreInfo;

const ENV_FORCE_CRASH_MODE: &str = "DRGN_USE_PROC_AND_SYS_MODULES";

/// Spec §4.8 step 4: live mode is selected only on a running kernel,
/// and only when the override variable is unset or non-zero.
pub fn use_live_mode(is_running_kernel: bool) -> bool {
    if !is_running_kernel {
        return false;
    }
    match env::var(ENV_FORCE_CRASH_MODE) {
        Ok(value) => value.parse::<i64>().map(|v| v != 0).unwrap_or(true),
        Err(_) => true,
    }
}

/// Candidate vmlinux locations, in priority order (spec §4.8 step 2).
fn vmlinux_candidates(osrelease: &str) -> Vec<PathBuf> {
    [
        format!("/usr/lib/debug/boot/vmlinux-{osrelease}"),
        format!("/usr/lib/debug/lib/modules/{osrelease}/vmlinux"),
        format!("/boot/vmlinux-{osrelease}"),
        format!("/lib/modules/{osrelease}/build/vmlinux"),
        format!("/lib/modules/{osrelease}/vmlinux"),
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

/// Candidate on-disk locations for a module whose depmod-reported
/// path (with `.gz`/`.xz` stripped) is `path_no_ext` with original
/// extension `ext` (empty if the depmod path had none).
fn module_candidates(osrelease: &str, path_no_ext: &str, ext: &str) -> Vec<PathBuf> {
    vec![
        PathBuf::from(format!("/usr/lib/debug/lib/modules/{osrelease}/{path_no_ext}")),
        PathBuf::from(format!("/usr/lib/debug/lib/modules/{osrelease}/{path_no_ext}.debug")),
        PathBuf::from(format!("/lib/modules/{osrelease}/{path_no_ext}{ext}")),
    ]
}

fn first_readable(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.is_file()).cloned()
}

/// One user-supplied module ELF awaiting a match against a loaded
/// kernel module, keyed by build ID in [`Pipeline::build_id_table`].
struct PendingModule {
    path: PathBuf,
    file: File,
}

/// Orchestrates one discovery pass (spec §4.8). Constructed fresh per
/// invocation; all owned resources (file descriptors, the depmod
/// mapping) are released when the pipeline is dropped.
pub struct Pipeline<'a> {
    osrelease: String,
    kaslr_offset: u64,
    load_default: bool,
    load_main: bool,
    indexer: &'a mut dyn DwarfIndexer,
    depmod: Option<DepmodIndex>,
    build_id_table: HashMap<Vec<u8>, Vec<PendingModule>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        info: &VmCoreInfo,
        load_default: bool,
        load_main: bool,
        indexer: &'a mut dyn DwarfIndexer,
    ) -> Self {
        Self {
            osrelease: info.osrelease.clone(),
            kaslr_offset: info.kaslr_offset,
            load_default,
            load_main,
            indexer,
            depmod: None,
            build_id_table: HashMap::new(),
        }
    }

    /// Step 1: opens and classifies each user-supplied path. Module
    /// ELFs are deferred into `build_id_table`; vmlinux and "other"
    /// ELFs are reported immediately.
    fn identify_user_files(&mut self, user_files: &[PathBuf]) -> Result<()> {
        debug!("identifying {} user-supplied file(s)", user_files.len());
        for path in user_files {
            let file = match File::open(path) {
                Ok(f) => f,
                Err(e) => {
                    self.report_nonfatal(&path.display().to_string(), &format!("failed to open: {e}"))?;
                    continue;
                }
            };
            let bytes = match unsafe { memmap2::Mmap::map(&file) } {
                Ok(m) => m,
                Err(e) => {
                    self.report_nonfatal(&path.display().to_string(), &format!("failed to map: {e}"))?;
                    continue;
                }
            };
            let elf = match goblin::elf::Elf::parse(&bytes) {
                Ok(elf) => elf,
                Err(e) => {
                    self.report_nonfatal(&path.display().to_string(), &format!("not a valid ELF: {e}"))?;
                    continue;
                }
            };

            match classify(&elf) {
                ElfKind::Vmlinux => {
                    let start = self.kaslr_offset;
                    // A real build computes `end` from the ELF's
                    // mapped extent; this orchestration layer only
                    // owns the discovery/reporting logic, so it
                    // reports the file's raw length as a stand-in
                    // extent, matching how other "other" ELFs are
                    // sized.
                    let end = start + bytes.len() as u64;
                    let is_new = self.indexer.report_elf(
                        path.display().to_string(),
                        file.as_raw_fd(),
                        start,
                        end,
                        None,
                        Vec::new(),
                    )?;
                    trace!("vmlinux {} reported as {}", path.display(), if is_new { "new" } else { "already indexed" });
                }
                ElfKind::Module => {
                    match find_module_build_id(&bytes) {
                        Some(id) => {
                            self.build_id_table
                                .entry(id)
                                .or_default()
                                .push(PendingModule { path: path.clone(), file });
                        }
                        None => {
                            self.report_nonfatal(&path.display().to_string(), "module ELF has no GNU build ID")?;
                        }
                    }
                }
                ElfKind::Other => {
                    self.indexer
                        .report_elf(path.display().to_string(), file.as_raw_fd(), 0, 0, None, Vec::new())?;
                }
            }
        }
        Ok(())
    }

    /// Step 2: locates the default vmlinux if the caller didn't
    /// supply one and the indexer doesn't already have one.
    fn report_default_vmlinux(&mut self) -> Result<()> {
        if !self.load_main || self.indexer.is_indexed("vmlinux") {
            return Ok(());
        }
        debug!("searching for default vmlinux");
        let Some(path) = first_readable(&vmlinux_candidates(&self.osrelease)) else {
            warn!("no default vmlinux found for {}", self.osrelease);
            return Ok(());
        };
        let file = File::open(&path).map_err(|e| Error::os("open", e, path.display().to_string()))?;
        let size = file
            .metadata()
            .map_err(|e| Error::os("stat", e, path.display().to_string()))?
            .len();
        let start = self.kaslr_offset;
        self.indexer.report_elf(
            path.display().to_string(),
            file.as_raw_fd(),
            start,
            start + size,
            Some("vmlinux".to_string()),
            Vec::new(),
        )?;
        Ok(())
    }

    /// Step 6 (live mode): walks loaded modules, matching against the
    /// pending build-ID table or falling back to the depmod index.
    fn iterate_modules(&mut self, mut iterator: ModuleIterator<'_>) -> Result<()> {
        while let Some(module) = iterator.advance()? {
            if let Err(e) = self.process_module(&module) {
                if self.indexer.report_error(&module.name, &e.to_string()) {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn process_module(&mut self, module: &ModuleRecord) -> Result<()> {
        let build_id = match build_id::live(module) {
            Ok(id) => id,
            Err(e) => {
                warn!("build-ID lookup failed for {}: {e}", module.name);
                None
            }
        };

        if let Some(id) = build_id {
            if let Some(chain) = self.build_id_table.remove(&id) {
                let section_list = sections::live(module)?;
                for pending in chain {
                    self.relocate_and_report(&pending, module, &section_list)?;
                }
                return Ok(());
            }
        }

        if self.load_default && !self.indexer.is_indexed(&module.name) {
            self.report_via_depmod(module)?;
        }
        Ok(())
    }

    fn relocate_and_report(
        &mut self,
        pending: &PendingModule,
        module: &ModuleRecord,
        section_list: &[(String, u64)],
    ) -> Result<()> {
        if !section_list.is_empty() {
            // Relocates an in-memory copy only, to surface a malformed
            // ELF as an error here; the addresses themselves are what
            // reach the indexer below, not this mutated buffer.
            let mut bytes = std::fs::read(&pending.path)
                .map_err(|e| Error::os("read", e, pending.path.display().to_string()))?;
            relocate_sections(&mut bytes, section_list)?;
        }
        self.indexer.report_elf(
            pending.path.display().to_string(),
            pending.file.as_raw_fd(),
            module.start,
            module.end,
            Some(module.name.clone()),
            section_list.to_vec(),
        )?;
        Ok(())
    }

    fn report_via_depmod(&mut self, module: &ModuleRecord) -> Result<()> {
        if self.depmod.is_none() {
            debug!("opening depmod index for {}", self.osrelease);
            match DepmodIndex::open(&self.osrelease) {
                Ok(index) => self.depmod = Some(index),
                Err(e) => {
                    warn!("failed to open depmod index: {e}");
                    return Ok(());
                }
            }
        }
        let depmod = self.depmod.as_ref().expect("depmod just initialized above");

        let path = match depmod.find(&module.name) {
            Ok(Some(path)) => path,
            Ok(None) => {
                warn!("depmod has no entry for module {}", module.name);
                return Ok(());
            }
            Err(e) => {
                warn!("depmod lookup failed for {}: {e}", module.name);
                return Ok(());
            }
        };

        let (path_no_ext, ext) = strip_compression_suffix(&path);
        let candidates = module_candidates(&self.osrelease, path_no_ext, ext);
        let Some(on_disk) = first_readable(&candidates) else {
            warn!("no on-disk file found for module {} ({})", module.name, path);
            return Ok(());
        };

        let file = File::open(&on_disk).map_err(|e| Error::os("open", e, on_disk.display().to_string()))?;
        self.indexer.report_elf(
            on_disk.display().to_string(),
            file.as_raw_fd(),
            module.start,
            module.end,
            Some(module.name.clone()),
            Vec::new(),
        )?;
        Ok(())
    }

    /// Step 7: everything left in the table never matched a loaded
    /// module; reported with a zero range, preserving insertion
    /// order within each chain.
    fn report_leftovers(&mut self) -> Result<()> {
        for (_, chain) in self.build_id_table.drain() {
            for pending in chain {
                self.indexer.report_elf(
                    pending.path.display().to_string(),
                    pending.file.as_raw_fd(),
                    0,
                    0,
                    None,
                    Vec::new(),
                )?;
            }
        }
        Ok(())
    }

    fn report_nonfatal(&mut self, file: &str, message: &str) -> Result<()> {
        warn!("{file}: {message}");
        if self.indexer.report_error(file, message) {
            return Err(Error::Other(message.to_string()));
        }
        Ok(())
    }

    /// Runs the full pipeline in live mode, reading `/proc/modules`.
    pub fn run_live(&mut self, user_files: &[PathBuf]) -> Result<()> {
        self.identify_user_files(user_files)?;
        self.report_default_vmlinux()?;

        debug!("iterating /proc/modules");
        let proc_modules = File::open("/proc/modules")
            .map_err(|e| Error::os("open", e, "/proc/modules".to_string()))?;
        let iterator = ModuleIterator::live(BufReader::new(proc_modules));
        self.iterate_modules(iterator)?;
        self.report_leftovers()
    }

    /// Runs the full pipeline in crash mode, walking the in-kernel
    /// `modules` list via `resolver`/`accessor`/`mem`.
    pub fn run_crash(
        &mut self,
        user_files: &[PathBuf],
        resolver: &dyn SymbolResolver,
        accessor: &dyn TypedMemoryAccessor,
        mem: &dyn MemoryReader,
    ) -> Result<()> {
        self.identify_user_files(user_files)?;
        self.report_default_vmlinux()?;

        debug!("flushing pending ELFs before crash-mode module walk");
        self.indexer.flush()?;

        let module_ty = accessor.type_of("module")?;
        let iterator = ModuleIterator::crash(resolver, accessor)?;
        self.iterate_modules_crash(iterator, module_ty, accessor, mem)?;
        self.report_leftovers()
    }

    fn iterate_modules_crash(
        &mut self,
        mut iterator: ModuleIterator<'_>,
        module_ty: crate::kernel::TypeHandle,
        accessor: &dyn TypedMemoryAccessor,
        mem: &dyn MemoryReader,
    ) -> Result<()> {
        while let Some(module) = iterator.advance()? {
            if let Err(e) = self.process_crash_module(&module, module_ty, accessor, mem) {
                if self.indexer.report_error(&module.name, &e.to_string()) {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn process_crash_module(
        &mut self,
        module: &ModuleRecord,
        module_ty: crate::kernel::TypeHandle,
        accessor: &dyn TypedMemoryAccessor,
        mem: &dyn MemoryReader,
    ) -> Result<()> {
        let build_id = match build_id::crash(module, module_ty, mem, accessor) {
            Ok(id) => id,
            Err(e) => {
                warn!("build-ID lookup failed for {}: {e}", module.name);
                None
            }
        };

        if let Some(id) = build_id {
            if let Some(chain) = self.build_id_table.remove(&id) {
                let section_list = sections::crash(module, module_ty, accessor)?;
                for pending in chain {
                    self.relocate_and_report(&pending, module, &section_list)?;
                }
                return Ok(());
            }
        }

        if self.load_default && !self.indexer.is_indexed(&module.name) {
            self.report_via_depmod(module)?;
        }
        Ok(())
    }
}

/// Strips a trailing `.gz`/`.xz` from a depmod-reported path, returning
/// `(path_without_ext, ext)` with `ext` empty if neither was present.
fn strip_compression_suffix(path: &str) -> (&str, &str) {
    for ext in [".gz", ".xz"] {
        if let Some(stripped) = path.strip_suffix(ext) {
            return (stripped, ext);
        }
    }
    (path, "")
}

fn find_module_build_id(elf_bytes: &[u8]) -> Option<Vec<u8>> {
    let elf = goblin::elf::Elf::parse(elf_bytes).ok()?;
    for section in &elf.section_headers {
        if section.sh_type != goblin::elf::section_header::SHT_NOTE {
            continue;
        }
        let start = section.sh_offset as usize;
        let end = start + section.sh_size as usize;
        let data = elf_bytes.get(start..end)?;
        if let Some(id) = crate::elf_notes::find_gnu_build_id(data) {
            return Some(id.to_vec());
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::module_iterator::ModuleHandle;
    use crate::kernel::MockDwarfIndexer;
    use crate::util::math::align_up;
    use goblin::elf::note::NT_GNU_BUILD_ID;
    use goblin::elf::section_header::SHF_ALLOC;
    use mockall::Sequence;
    use scroll::{Endian, Pwrite};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SHT_PROGBITS: u32 = 1;
    const SHT_NOTE: u32 = 7;

    fn build_build_id_note(build_id: &[u8]) -> Vec<u8> {
        let name = b"GNU";
        let name_size = name.len() + 1;
        let aligned_name = align_up(name_size, 4);
        let aligned_desc = align_up(build_id.len(), 4);
        let mut buf = vec![0u8; 12 + aligned_name + aligned_desc];
        buf[0..4].copy_from_slice(&(name_size as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&(build_id.len() as u32).to_le_bytes());
        buf[8..12].copy_from_slice(&NT_GNU_BUILD_ID.to_le_bytes());
        buf[12..12 + name.len()].copy_from_slice(name);
        let desc_off = 12 + aligned_name;
        buf[desc_off..desc_off + build_id.len()].copy_from_slice(build_id);
        buf
    }

    /// A minimal little-endian 64-bit module ELF (classified `Module`
    /// by `.gnu.linkonce.this_module`) carrying `build_id` in a
    /// `.note.gnu.build-id` `SHT_NOTE` section, for exercising
    /// `identify_user_files`/`find_module_build_id` without a real
    /// `/sys/module` tree. Same raw-header-writing style as
    /// `elf_ident::test::build_elf`.
    fn build_module_elf(build_id: &[u8]) -> Vec<u8> {
        let note = build_build_id_note(build_id);

        let mut strtab = vec![0u8];
        let this_module_off = strtab.len() as u32;
        strtab.extend_from_slice(b".gnu.linkonce.this_module\0");
        let note_name_off = strtab.len() as u32;
        strtab.extend_from_slice(b".note.gnu.build-id\0");
        let shstrtab_name_off = strtab.len() as u32;
        strtab.extend_from_slice(b".shstrtab\0");

        const EHSIZE: usize = 64;
        const SHENTSIZE: usize = 64;
        let shnum = 4; // NULL, this_module, note, shstrtab
        let shoff = EHSIZE;
        let note_data_off = shoff + shnum * SHENTSIZE;
        let strtab_off = note_data_off + note.len();

        let mut buf = vec![0u8; strtab_off + strtab.len()];
        let endian = Endian::Little;

        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // ELFDATA2LSB
        buf[6] = 1; // EV_CURRENT
        buf.pwrite_with::<u16>(1, 16, endian).unwrap(); // e_type = ET_REL
        buf.pwrite_with::<u16>(0x3e, 18, endian).unwrap(); // e_machine = EM_X86_64
        buf.pwrite_with::<u32>(1, 20, endian).unwrap(); // e_version
        buf.pwrite_with::<u64>(shoff as u64, 40, endian).unwrap(); // e_shoff
        buf.pwrite_with::<u16>(EHSIZE as u16, 52, endian).unwrap(); // e_ehsize
        buf.pwrite_with::<u16>(SHENTSIZE as u16, 58, endian).unwrap(); // e_shentsize
        buf.pwrite_with::<u16>(shnum as u16, 60, endian).unwrap(); // e_shnum
        buf.pwrite_with::<u16>((shnum - 1) as u16, 62, endian).unwrap(); // e_shstrndx

        let write_shdr = |buf: &mut Vec<u8>, idx: usize, name: u32, sh_type: u32, flags: u64, offset: u64, size: u64| {
            let base = shoff + idx * SHENTSIZE;
            buf.pwrite_with::<u32>(name, base, endian).unwrap();
            buf.pwrite_with::<u32>(sh_type, base + 4, endian).unwrap();
            buf.pwrite_with::<u64>(flags, base + 8, endian).unwrap();
            buf.pwrite_with::<u64>(0u64, base + 16, endian).unwrap();
            buf.pwrite_with::<u64>(offset, base + 24, endian).unwrap();
            buf.pwrite_with::<u64>(size, base + 32, endian).unwrap();
        };

        write_shdr(&mut buf, 0, 0, 0, 0, 0, 0);
        write_shdr(&mut buf, 1, this_module_off, SHT_PROGBITS, SHF_ALLOC as u64, 0, 0);
        write_shdr(&mut buf, 2, note_name_off, SHT_NOTE, 0, note_data_off as u64, note.len() as u64);
        write_shdr(&mut buf, 3, shstrtab_name_off, SHT_PROGBITS, 0, strtab_off as u64, strtab.len() as u64);

        buf[note_data_off..note_data_off + note.len()].copy_from_slice(&note);
        buf[strtab_off..strtab_off + strtab.len()].copy_from_slice(&strtab);
        buf
    }

    fn test_info() -> VmCoreInfo {
        VmCoreInfo {
            osrelease: "6.1.0".to_string(),
            page_size: 4096,
            kaslr_offset: 0,
            swapper_pg_dir: 1,
            pgtable_l5_enabled: false,
        }
    }

    #[test]
    fn test_two_user_files_sharing_a_build_id_are_both_reported_under_one_module_range() {
        let build_id = vec![0xABu8; 20];
        let elf_a = build_module_elf(&build_id);
        let elf_b = build_module_elf(&build_id);

        let mut file_a = NamedTempFile::new().unwrap();
        file_a.write_all(&elf_a).unwrap();
        let mut file_b = NamedTempFile::new().unwrap();
        file_b.write_all(&elf_b).unwrap();
        let path_a = file_a.path().display().to_string();
        let path_b = file_b.path().display().to_string();

        let info = test_info();
        let mut indexer = MockDwarfIndexer::new();
        let mut seq = Sequence::new();
        {
            let path_a = path_a.clone();
            indexer
                .expect_report_elf()
                .times(1)
                .in_sequence(&mut seq)
                .withf(move |path, _fd, start, end, name, _sections| {
                    path == &path_a && *start == 0xffff_0000 && *end == 0xffff_4000 && name.as_deref() == Some("nf_tables")
                })
                .returning(|_, _, _, _, _, _| Ok(true));
        }
        {
            let path_b = path_b.clone();
            indexer
                .expect_report_elf()
                .times(1)
                .in_sequence(&mut seq)
                .withf(move |path, _fd, start, end, name, _sections| {
                    path == &path_b && *start == 0xffff_0000 && *end == 0xffff_4000 && name.as_deref() == Some("nf_tables")
                })
                .returning(|_, _, _, _, _, _| Ok(true));
        }

        let mut pipeline = Pipeline::new(&info, true, true, &mut indexer);
        pipeline
            .identify_user_files(&[file_a.path().to_path_buf(), file_b.path().to_path_buf()])
            .unwrap();

        let chain = pipeline
            .build_id_table
            .remove(&build_id)
            .expect("both files share a build ID and must be keyed under it");
        assert_eq!(chain.len(), 2, "both pending files must be queued under the shared build ID");
        assert_eq!(chain[0].path.display().to_string(), path_a);
        assert_eq!(chain[1].path.display().to_string(), path_b, "insertion order must be preserved");

        let module = ModuleRecord {
            name: "nf_tables".to_string(),
            start: 0xffff_0000,
            end: 0xffff_4000,
            handle: ModuleHandle::Live,
        };
        for pending in chain {
            pipeline.relocate_and_report(&pending, &module, &[]).unwrap();
        }
    }

    #[test]
    fn test_strip_compression_suffix() {
        assert_eq!(strip_compression_suffix("foo.ko.gz"), ("foo.ko", ".gz"));
        assert_eq!(strip_compression_suffix("foo.ko.xz"), ("foo.ko", ".xz"));
        assert_eq!(strip_compression_suffix("foo.ko"), ("foo.ko", ""));
    }

    #[test]
    fn test_vmlinux_candidates_order() {
        let candidates = vmlinux_candidates("6.1.0");
        assert_eq!(candidates[0], PathBuf::from("/usr/lib/debug/boot/vmlinux-6.1.0"));
        assert_eq!(candidates[4], PathBuf::from("/lib/modules/6.1.0/vmlinux"));
    }

    #[test]
    fn test_report_leftovers_on_empty_table_is_a_noop() {
        let info = VmCoreInfo {
            osrelease: "6.1.0".to_string(),
            page_size: 4096,
            kaslr_offset: 0,
            swapper_pg_dir: 1,
            pgtable_l5_enabled: false,
        };
        let mut indexer = MockDwarfIndexer::new();
        let mut pipeline = Pipeline::new(&info, true, true, &mut indexer);
        pipeline.report_leftovers().unwrap();
    }
}
