//! # ELF Header and Program-Header Reader
//!
//! A zero-copy view over the parts of an ELF file the patcher needs:
//!
//! ```text
//! +---------------------------+  offset 0
//! |  e_ident (class @ 4)      |
//! |  e_entry / e_phoff ...    |  field offsets depend on the class
//! +---------------------------+  e_phoff
//! |  program header [0]       |  32 bytes (ELF32) / 56 bytes (ELF64)
//! |  program header [1]       |
//! |  ...                      |
//! +---------------------------+
//! ```
//!
//! Only little-endian files are accepted. Section headers, symbols and
//! relocations are never looked at.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use serde::Serialize;

use crate::encoding;
use crate::error::{PatchError, PatchResult};

/// ELF magic bytes
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// Smallest image the reader accepts (size of an ELF64 header)
pub const MIN_IMAGE_SIZE: usize = 64;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;
pub const PT_PHDR: u32 = 6;
pub const PT_TLS: u32 = 7;
pub const PT_GNU_EH_FRAME: u32 = 0x6474_e550;
pub const PT_GNU_STACK: u32 = 0x6474_e551;
pub const PT_GNU_RELRO: u32 = 0x6474_e552;

/// Byte offsets of the ELF header fields we read
struct HeaderLayout {
    entry: usize,
    phoff: usize,
    phentsize: usize,
    phnum: usize,
}

/// Byte offsets within one program header record
struct PhdrLayout {
    size: usize,
    p_type: usize,
    p_flags: usize,
    p_offset: usize,
    p_vaddr: usize,
    p_filesz: usize,
    p_memsz: usize,
}

const HEADER32: HeaderLayout = HeaderLayout { entry: 24, phoff: 28, phentsize: 42, phnum: 44 };
const HEADER64: HeaderLayout = HeaderLayout { entry: 24, phoff: 32, phentsize: 54, phnum: 56 };

const PHDR32: PhdrLayout = PhdrLayout {
    size: 32,
    p_type: 0,
    p_offset: 4,
    p_vaddr: 8,
    p_filesz: 16,
    p_memsz: 20,
    p_flags: 24,
};

const PHDR64: PhdrLayout = PhdrLayout {
    size: 56,
    p_type: 0,
    p_flags: 4,
    p_offset: 8,
    p_vaddr: 16,
    p_filesz: 32,
    p_memsz: 40,
};

/// File class: fixes word size and every record width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl ElfClass {
    pub fn from_byte(class: u8) -> Option<Self> {
        match class {
            ELFCLASS32 => Some(ElfClass::Elf32),
            ELFCLASS64 => Some(ElfClass::Elf64),
            _ => None,
        }
    }

    /// Word size in bytes
    pub fn word_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 4,
            ElfClass::Elf64 => 8,
        }
    }

    /// Size of one program header record
    pub fn phdr_size(self) -> usize {
        self.phdr_layout().size
    }

    fn header_layout(self) -> &'static HeaderLayout {
        match self {
            ElfClass::Elf32 => &HEADER32,
            ElfClass::Elf64 => &HEADER64,
        }
    }

    fn phdr_layout(self) -> &'static PhdrLayout {
        match self {
            ElfClass::Elf32 => &PHDR32,
            ElfClass::Elf64 => &PHDR64,
        }
    }

    /// Read an address-sized field, widened to u64
    fn read_word(self, data: &[u8], offset: usize) -> PatchResult<u64> {
        match self {
            ElfClass::Elf32 => encoding::read_u32(data, offset).map(u64::from),
            ElfClass::Elf64 => encoding::read_u64(data, offset),
        }
    }
}

/// Parsed ELF header, borrowing the image
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader<'a> {
    data: &'a [u8],
    pub class: ElfClass,
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl<'a> ElfHeader<'a> {
    /// Parse the identification bytes and locate the program header table
    pub fn parse(data: &'a [u8]) -> PatchResult<Self> {
        if data.len() < MIN_IMAGE_SIZE {
            return Err(PatchError::MalformedHeader(format!(
                "image is {} bytes, need at least {}",
                data.len(),
                MIN_IMAGE_SIZE
            )));
        }

        if data[..4] != ELF_MAGIC {
            return Err(PatchError::MalformedHeader(format!(
                "bad magic {:02x?}",
                &data[..4]
            )));
        }

        let class = ElfClass::from_byte(data[EI_CLASS]).ok_or_else(|| {
            PatchError::MalformedHeader(format!("unknown class byte {}", data[EI_CLASS]))
        })?;

        if data[EI_DATA] != ELFDATA2LSB {
            return Err(PatchError::MalformedHeader(format!(
                "unsupported data encoding {} (little-endian only)",
                data[EI_DATA]
            )));
        }

        let layout = class.header_layout();
        let entry = class.read_word(data, layout.entry)?;
        let phoff = class.read_word(data, layout.phoff)?;
        let phentsize = encoding::read_u16(data, layout.phentsize)?;
        let phnum = encoding::read_u16(data, layout.phnum)?;

        let table_len = usize::from(phnum) * class.phdr_size();
        let table_end = usize::try_from(phoff)
            .ok()
            .and_then(|start| start.checked_add(table_len));
        match table_end {
            Some(end) if end <= data.len() => {}
            _ => {
                return Err(PatchError::MalformedHeader(format!(
                    "program header table 0x{:x}+{} exceeds image of {} bytes",
                    phoff,
                    table_len,
                    data.len()
                )))
            }
        }

        if phnum > 0 && usize::from(phentsize) != class.phdr_size() {
            debug!(
                "e_phentsize {} differs from {:?} record size {}",
                phentsize,
                class,
                class.phdr_size()
            );
        }

        debug!(
            "{:?} header: entry=0x{:x} phoff=0x{:x} phnum={}",
            class, entry, phoff, phnum
        );

        Ok(Self {
            data,
            class,
            entry,
            phoff,
            phentsize,
            phnum,
        })
    }

    /// Lazily walk the program header table
    pub fn program_headers(&self) -> impl Iterator<Item = ProgramHeaderEntry<'a>> + 'a {
        let data = self.data;
        let class = self.class;
        let size = class.phdr_size();
        // Bounds were checked in parse()
        let base = self.phoff as usize;

        (0..usize::from(self.phnum)).map(move |index| {
            let start = base + index * size;
            ProgramHeaderEntry {
                index,
                class,
                raw: &data[start..start + size],
            }
        })
    }

    /// First program header of the given type
    pub fn find(&self, p_type: u32) -> Option<ProgramHeaderEntry<'a>> {
        self.program_headers().find(|ph| ph.p_type() == p_type)
    }

    /// Map a virtual address to a file offset through the PT_LOAD segments
    pub fn vaddr_to_offset(&self, vaddr: u64) -> Option<u64> {
        self.program_headers()
            .filter(|ph| ph.p_type() == PT_LOAD)
            .find_map(|ph| {
                let delta = vaddr.checked_sub(ph.vaddr())?;
                (delta < ph.file_size()).then(|| ph.offset() + delta)
            })
    }
}

/// View over one fixed-width program header record
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeaderEntry<'a> {
    pub index: usize,
    class: ElfClass,
    raw: &'a [u8],
}

impl ProgramHeaderEntry<'_> {
    fn word(&self, offset: usize) -> u64 {
        match self.class {
            ElfClass::Elf32 => u64::from(LittleEndian::read_u32(&self.raw[offset..])),
            ElfClass::Elf64 => LittleEndian::read_u64(&self.raw[offset..]),
        }
    }

    pub fn p_type(&self) -> u32 {
        LittleEndian::read_u32(&self.raw[self.class.phdr_layout().p_type..])
    }

    pub fn flags(&self) -> u32 {
        LittleEndian::read_u32(&self.raw[self.class.phdr_layout().p_flags..])
    }

    pub fn offset(&self) -> u64 {
        self.word(self.class.phdr_layout().p_offset)
    }

    pub fn vaddr(&self) -> u64 {
        self.word(self.class.phdr_layout().p_vaddr)
    }

    pub fn file_size(&self) -> u64 {
        self.word(self.class.phdr_layout().p_filesz)
    }

    pub fn mem_size(&self) -> u64 {
        self.word(self.class.phdr_layout().p_memsz)
    }

    pub fn type_name(&self) -> &'static str {
        segment_type_name(self.p_type())
    }
}

/// Program header type names
pub fn segment_type_name(p_type: u32) -> &'static str {
    match p_type {
        PT_NULL => "NULL",
        PT_LOAD => "LOAD",
        PT_DYNAMIC => "DYNAMIC",
        PT_INTERP => "INTERP",
        PT_NOTE => "NOTE",
        PT_PHDR => "PHDR",
        PT_TLS => "TLS",
        PT_GNU_EH_FRAME => "GNU_EH_FRAME",
        PT_GNU_STACK => "GNU_STACK",
        PT_GNU_RELRO => "GNU_RELRO",
        _ => "UNKNOWN",
    }
}
