//! Synthetic ELF images for unit tests.

use byteorder::{ByteOrder, LittleEndian};

/// Entry point written into every fixture header
pub const FIXTURE_ENTRY: u64 = 0x1000;

/// ELF64 x86-64 shared object: a PT_LOAD mapping the whole file at vaddr 0
/// and a PT_INTERP of `capacity` bytes at `interp_offset` holding `path`.
pub fn elf64_with_interp(interp_offset: u64, capacity: usize, path: &[u8], total: usize) -> Vec<u8> {
    let mut data = vec![0u8; total];
    data[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    data[4] = 2; // ELFCLASS64
    data[5] = 1; // ELFDATA2LSB
    data[6] = 1; // EV_CURRENT

    LittleEndian::write_u16(&mut data[16..], 3); // ET_DYN
    LittleEndian::write_u16(&mut data[18..], 0x3E); // EM_X86_64
    LittleEndian::write_u32(&mut data[20..], 1);
    LittleEndian::write_u64(&mut data[24..], FIXTURE_ENTRY);
    LittleEndian::write_u64(&mut data[32..], 64); // e_phoff
    LittleEndian::write_u16(&mut data[52..], 64); // e_ehsize
    LittleEndian::write_u16(&mut data[54..], 56); // e_phentsize
    LittleEndian::write_u16(&mut data[56..], 2); // e_phnum
    LittleEndian::write_u16(&mut data[58..], 64); // e_shentsize

    let load = 64;
    LittleEndian::write_u32(&mut data[load..], 1); // PT_LOAD
    LittleEndian::write_u32(&mut data[load + 4..], 5); // R|X
    LittleEndian::write_u64(&mut data[load + 32..], total as u64);
    LittleEndian::write_u64(&mut data[load + 40..], total as u64);
    LittleEndian::write_u64(&mut data[load + 48..], 0x1000);

    let interp = 64 + 56;
    LittleEndian::write_u32(&mut data[interp..], 3); // PT_INTERP
    LittleEndian::write_u32(&mut data[interp + 4..], 4); // R
    LittleEndian::write_u64(&mut data[interp + 8..], interp_offset);
    LittleEndian::write_u64(&mut data[interp + 16..], interp_offset);
    LittleEndian::write_u64(&mut data[interp + 24..], interp_offset);
    LittleEndian::write_u64(&mut data[interp + 32..], capacity as u64);
    LittleEndian::write_u64(&mut data[interp + 40..], capacity as u64);
    LittleEndian::write_u64(&mut data[interp + 48..], 1);

    let start = interp_offset as usize;
    data[start..start + path.len()].copy_from_slice(path);
    data
}

/// ELF32 i386 executable with the same two segments
pub fn elf32_with_interp(interp_offset: u32, capacity: u32, path: &[u8], total: usize) -> Vec<u8> {
    let mut data = vec![0u8; total];
    data[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    data[4] = 1; // ELFCLASS32
    data[5] = 1;
    data[6] = 1;

    LittleEndian::write_u16(&mut data[16..], 2); // ET_EXEC
    LittleEndian::write_u16(&mut data[18..], 3); // EM_386
    LittleEndian::write_u32(&mut data[20..], 1);
    LittleEndian::write_u32(&mut data[24..], FIXTURE_ENTRY as u32);
    LittleEndian::write_u32(&mut data[28..], 52); // e_phoff
    LittleEndian::write_u16(&mut data[40..], 52);
    LittleEndian::write_u16(&mut data[42..], 32);
    LittleEndian::write_u16(&mut data[44..], 2);

    let load = 52;
    LittleEndian::write_u32(&mut data[load..], 1);
    LittleEndian::write_u32(&mut data[load + 16..], total as u32);
    LittleEndian::write_u32(&mut data[load + 20..], total as u32);
    LittleEndian::write_u32(&mut data[load + 24..], 5);

    let interp = 52 + 32;
    LittleEndian::write_u32(&mut data[interp..], 3);
    LittleEndian::write_u32(&mut data[interp + 4..], interp_offset);
    LittleEndian::write_u32(&mut data[interp + 8..], interp_offset);
    LittleEndian::write_u32(&mut data[interp + 16..], capacity);
    LittleEndian::write_u32(&mut data[interp + 20..], capacity);
    LittleEndian::write_u32(&mut data[interp + 24..], 4);

    let start = interp_offset as usize;
    data[start..start + path.len()].copy_from_slice(path);
    data
}

/// ELF64 loader-like image: entry code at 0x1000 (`mov rdi, rsp; call
/// 0x1800`) followed by filler, and a zeroed cave from 0x2000 to the end.
pub fn elf64_loader(total: usize) -> Vec<u8> {
    let mut data = elf64_with_interp(0x100, 28, b"/lib64/ld-linux-x86-64.so.2", total);
    let entry = FIXTURE_ENTRY as usize;
    // call rel32: 0x1800 - (0x1003 + 5) = 0x7f8
    data[entry..entry + 8].copy_from_slice(&[0x48, 0x89, 0xE7, 0xE8, 0xF8, 0x07, 0x00, 0x00]);
    for b in &mut data[entry + 8..0x2000] {
        *b = 0xCC;
    }
    data
}
