//! In-memory binary container.
//!
//! The whole file is buffered on load; patches are same-size overwrites, so the
//! length never changes. Nothing touches the disk again until [`BinaryImage::save`].

use std::fs;
use std::io::Write;
use std::ops::Range;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::debug;
use tempfile::NamedTempFile;

use crate::error::{PatchError, PatchResult};

/// Mode applied to every written artifact
pub const OUTPUT_MODE: u32 = 0o755;

/// Owned, mutable copy of a binary file. Indices are file offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryImage {
    data: Vec<u8>,
}

impl BinaryImage {
    /// Buffer a file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> PatchResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PatchError::InputNotFound(path.to_path_buf()));
        }

        let data = fs::read(path)?;
        debug!("Loaded {} ({} bytes)", path.display(), data.len());
        Ok(Self { data })
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, offset: u64, len: usize) -> PatchResult<Range<usize>> {
        let out_of_bounds = || PatchError::OutOfBounds {
            offset,
            len,
            size: self.data.len(),
        };

        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > self.data.len() {
            return Err(out_of_bounds());
        }
        Ok(start..end)
    }

    /// Borrow `len` bytes at a file offset
    pub fn read(&self, offset: u64, len: usize) -> PatchResult<&[u8]> {
        let range = self.range(offset, len)?;
        Ok(&self.data[range])
    }

    /// Up to `len` bytes at `offset`, truncated at end of file
    pub fn peek(&self, offset: u64, len: usize) -> &[u8] {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        &self.data[start..end]
    }

    /// Overwrite bytes in place. Fails without touching the buffer if the
    /// region does not fit.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> PatchResult<()> {
        let range = self.range(offset, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Number of non-zero bytes in a region
    pub fn count_non_zero(&self, offset: u64, len: usize) -> PatchResult<usize> {
        Ok(self.read(offset, len)?.iter().filter(|&&b| b != 0).count())
    }

    /// Write the image to `path` and mark it executable.
    ///
    /// The bytes go to a sibling temp file that is flushed and chmodded
    /// before being renamed over `path`. An existing file at `path` is either
    /// replaced whole or left as it was.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> PatchResult<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(&self.data)?;
        staged.flush()?;
        staged.as_file().sync_all()?;
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(OUTPUT_MODE))?;
        staged.persist(path).map_err(|e| e.error)?;

        debug!("Wrote {} ({} bytes)", path.display(), self.data.len());
        Ok(())
    }
}
