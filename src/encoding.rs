//! Little-endian field access and rel32 arithmetic.
//!
//! Every multi-byte read in the header parser and every displacement written
//! by the resolver and hook writer goes through these helpers.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{PatchError, PatchResult};

/// Width of a relative displacement field
pub const REL32_WIDTH: usize = 4;

fn field(data: &[u8], offset: usize, len: usize) -> PatchResult<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or(PatchError::OutOfBounds {
            offset: offset as u64,
            len,
            size: data.len(),
        })
}

pub fn read_u16(data: &[u8], offset: usize) -> PatchResult<u16> {
    Ok(LittleEndian::read_u16(field(data, offset, 2)?))
}

pub fn read_u32(data: &[u8], offset: usize) -> PatchResult<u32> {
    Ok(LittleEndian::read_u32(field(data, offset, 4)?))
}

pub fn read_u64(data: &[u8], offset: usize) -> PatchResult<u64> {
    Ok(LittleEndian::read_u64(field(data, offset, 8)?))
}

pub fn read_i32(data: &[u8], offset: usize) -> PatchResult<i32> {
    Ok(LittleEndian::read_i32(field(data, offset, REL32_WIDTH)?))
}

/// Overwrite a 4-byte signed field in place
pub fn write_i32(buf: &mut [u8], offset: usize, value: i32) -> PatchResult<()> {
    let size = buf.len();
    let dst = offset
        .checked_add(REL32_WIDTH)
        .and_then(|end| buf.get_mut(offset..end))
        .ok_or(PatchError::OutOfBounds {
            offset: offset as u64,
            len: REL32_WIDTH,
            size,
        })?;
    LittleEndian::write_i32(dst, value);
    Ok(())
}

/// Displacement stored in a rel32 field whose end lies at `next_ip`.
///
/// The CPU adds the displacement to the address of the byte following the
/// field, so `next_ip` is `field_vaddr + 4`.
pub fn rel32(next_ip: u64, target: u64) -> PatchResult<i32> {
    let delta = i128::from(target) - i128::from(next_ip);
    i32::try_from(delta).map_err(|_| PatchError::DisplacementOutOfRange {
        from: next_ip,
        target,
    })
}

/// Inverse of [`rel32`]
pub fn rel32_target(next_ip: u64, displacement: i32) -> u64 {
    next_ip.wrapping_add(i64::from(displacement) as u64)
}
