//! # PT_INTERP Locator and Patcher
//!
//! The dynamic linker path lives in a fixed-size, NUL-terminated field that
//! the PT_INTERP program header points at. Growing it would mean relocating
//! every later segment, so a replacement must fit the existing capacity and
//! the tail is zero-filled so no bytes of the old path survive.

use log::{debug, info};
use serde::Serialize;

use crate::elf::{ElfHeader, PT_INTERP};
use crate::error::{PatchError, PatchResult};
use crate::image::BinaryImage;

/// Location and capacity of the interpreter field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterpSegment {
    /// Index in the program header table
    pub index: usize,
    /// File offset of the path bytes
    pub offset: u64,
    /// Declared size (p_filesz), terminator included
    pub capacity: usize,
}

/// Outcome of a successful patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterpPatch {
    pub previous: String,
    pub current: String,
    /// Bytes written including the terminator
    pub written: usize,
    /// Zero bytes appended after the terminator
    pub padding: usize,
}

impl InterpSegment {
    /// Find the PT_INTERP segment
    pub fn locate(image: &BinaryImage) -> PatchResult<Self> {
        let header = ElfHeader::parse(image.as_bytes())?;
        let ph = header.find(PT_INTERP).ok_or(PatchError::SegmentNotFound)?;

        let capacity = usize::try_from(ph.file_size()).map_err(|_| PatchError::OutOfBounds {
            offset: ph.offset(),
            len: usize::MAX,
            size: image.len(),
        })?;
        // The field must lie inside the file before anything relies on it
        image.read(ph.offset(), capacity)?;

        debug!(
            "PT_INTERP at phdr[{}]: offset=0x{:x} size={}",
            ph.index,
            ph.offset(),
            capacity
        );

        Ok(Self {
            index: ph.index,
            offset: ph.offset(),
            capacity,
        })
    }

    /// Current interpreter path, up to the first NUL
    pub fn current_path(&self, image: &BinaryImage) -> PatchResult<String> {
        let field = image.read(self.offset, self.capacity)?;
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        Ok(String::from_utf8_lossy(&field[..end]).into_owned())
    }

    /// Path bytes plus a single terminator
    pub fn encode(new_path: &str) -> PatchResult<Vec<u8>> {
        if new_path.as_bytes().contains(&0) {
            return Err(PatchError::InvalidConfig(
                "interpreter path contains a NUL byte".to_string(),
            ));
        }

        let mut bytes = Vec::with_capacity(new_path.len() + 1);
        bytes.extend_from_slice(new_path.as_bytes());
        bytes.push(0);
        Ok(bytes)
    }

    /// Overwrite the field with `new_path`, zero-padding to capacity.
    ///
    /// On `FieldTooLarge` the image is left untouched.
    pub fn patch(&self, image: &mut BinaryImage, new_path: &str) -> PatchResult<InterpPatch> {
        let encoded = Self::encode(new_path)?;
        if encoded.len() > self.capacity {
            return Err(PatchError::FieldTooLarge {
                required: encoded.len(),
                capacity: self.capacity,
            });
        }

        let previous = self.current_path(image)?;

        let mut field = vec![0u8; self.capacity];
        field[..encoded.len()].copy_from_slice(&encoded);
        image.write(self.offset, &field)?;

        info!("Patched interpreter: {} -> {}", previous, new_path);

        Ok(InterpPatch {
            previous,
            current: new_path.to_string(),
            written: encoded.len(),
            padding: self.capacity - encoded.len(),
        })
    }
}
