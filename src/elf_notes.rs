//! ELF note parsing (spec §4.5): a concatenation of `{namesz, descsz,
//! type}` headers followed by 4-byte-aligned `name`/`desc` payloads.
//! Shared by the live (`/sys/module/*/notes/*`) and crash
//! (`notes_attrs`) build-ID extractor back ends.
//!
//! Narrowed from the teacher's general core-dump note decoder (which
//! also understands `NT_PRSTATUS`/`NT_FILE`/`NT_AUXV`, belonging to
//! core-dump capture) to the one note type this subsystem needs.

use goblin::elf::note::NT_GNU_BUILD_ID;
use scroll::Endian;

use crate::buffer::BinaryBuffer;
use crate::util::math::align_up;

const NOTE_NAME_GNU: &[u8] = b"GNU";

#[derive(Debug, PartialEq, Eq)]
pub enum ElfNote<'a> {
    GnuBuildId(&'a [u8]),
    Unknown,
}

/// Iterates over the notes in a buffer, one at a time, through the
/// same bounded cursor the depmod radix-tree parser uses. Malformed
/// notes (insufficient remaining data) stop the iteration rather than
/// producing an error: callers that need the first matching note
/// (this subsystem's only consumer) simply see no further notes.
pub struct ElfNoteIterator<'a> {
    buf: BinaryBuffer<'a>,
}

impl<'a> ElfNoteIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            buf: BinaryBuffer::new(data, Endian::Little),
        }
    }
}

impl<'a> Iterator for ElfNoteIterator<'a> {
    type Item = ElfNote<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.remaining() == 0 {
            return None;
        }
        let name_size = self.buf.read_u32().ok()? as usize;
        let desc_size = self.buf.read_u32().ok()? as usize;
        let note_type = self.buf.read_u32().ok()?;
        let aligned_name_size = align_up(name_size, 4);
        let aligned_desc_size = align_up(desc_size, 4);

        let name_bytes = self.buf.read_bytes(aligned_name_size).ok()?;
        let name = if name_size == 0 { &[][..] } else { &name_bytes[..name_size - 1] };
        let desc_bytes = self.buf.read_bytes(aligned_desc_size).ok()?;
        let desc = &desc_bytes[..desc_size];

        Some(match (name, note_type, desc.is_empty()) {
            (NOTE_NAME_GNU, NT_GNU_BUILD_ID, false) if name_size == 4 => ElfNote::GnuBuildId(desc),
            _ => ElfNote::Unknown,
        })
    }
}

/// Returns the first `NT_GNU_BUILD_ID` note body in `data`, if any
/// (spec §4.5's matching rule: `namesz == 4`, `name == "GNU\0"`,
/// `type == NT_GNU_BUILD_ID`, `descsz > 0`).
pub fn find_gnu_build_id(data: &[u8]) -> Option<&[u8]> {
    ElfNoteIterator::new(data).find_map(|note| match note {
        ElfNote::GnuBuildId(id) => Some(id),
        ElfNote::Unknown => None,
    })
}
