//! # Code-Cave Injection and Entry Hook
//!
//! Copies a resolved fragment into unused bytes of the image, then redirects
//! the entry point to it with a 5-byte `jmp rel32`. Both writes are same-size
//! overwrites; nothing is inserted or shifted.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::asm::{HOOK_LEN, JMP_REL32};
use crate::encoding;
use crate::error::{PatchError, PatchResult};
use crate::image::BinaryImage;
use crate::resolve::ResolvedFragment;

/// Where the fragment goes, in both address spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InjectionSite {
    pub offset: u64,
    pub vaddr: u64,
}

/// Handling of a cave that is not all zeros
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CavePolicy {
    /// Warn and overwrite anyway
    #[default]
    Advisory,
    /// Refuse with `CaveNotEmpty`
    Strict,
}

/// Result of placing a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InjectReport {
    pub site: InjectionSite,
    pub len: usize,
    /// Non-zero bytes that were in the cave before the write
    pub non_zero_overwritten: usize,
}

impl InjectReport {
    pub fn cave_was_empty(&self) -> bool {
        self.non_zero_overwritten == 0
    }
}

/// Copy `fragment` into the image at `site`.
///
/// The fragment must have been resolved for `site.vaddr`; any other address
/// would leave every displacement off by the difference.
pub fn inject(
    image: &mut BinaryImage,
    site: InjectionSite,
    fragment: &ResolvedFragment,
    policy: CavePolicy,
) -> PatchResult<InjectReport> {
    if fragment.site_vaddr() != site.vaddr {
        return Err(PatchError::InvalidConfig(format!(
            "fragment resolved for 0x{:x} but cave is mapped at 0x{:x}",
            fragment.site_vaddr(),
            site.vaddr
        )));
    }

    let non_zero = image.count_non_zero(site.offset, fragment.len())?;
    if non_zero > 0 {
        match policy {
            CavePolicy::Strict => {
                return Err(PatchError::CaveNotEmpty {
                    offset: site.offset,
                    non_zero,
                });
            }
            CavePolicy::Advisory => warn!(
                "Code cave at 0x{:x} holds {} non-zero bytes; overwriting",
                site.offset, non_zero
            ),
        }
    }

    image.write(site.offset, fragment.bytes())?;
    info!(
        "Injected {} bytes at offset 0x{:x} (vaddr 0x{:x})",
        fragment.len(),
        site.offset,
        site.vaddr
    );

    Ok(InjectReport {
        site,
        len: fragment.len(),
        non_zero_overwritten: non_zero,
    })
}

/// `jmp rel32` from the entry to the cave
pub fn hook_bytes(entry_vaddr: u64, site_vaddr: u64) -> PatchResult<[u8; HOOK_LEN]> {
    let next_ip = entry_vaddr
        .checked_add(HOOK_LEN as u64)
        .ok_or(PatchError::DisplacementOutOfRange {
            from: entry_vaddr,
            target: site_vaddr,
        })?;
    let disp = encoding::rel32(next_ip, site_vaddr)?;

    let mut hook = [0u8; HOOK_LEN];
    hook[0] = JMP_REL32;
    hook[1..].copy_from_slice(&disp.to_le_bytes());
    Ok(hook)
}

/// Entry bytes before and after the hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHook {
    pub offset: u64,
    pub original: [u8; HOOK_LEN],
    pub patched: [u8; HOOK_LEN],
}

/// Overwrite the first `HOOK_LEN` bytes at `entry_offset`
pub fn write_hook(
    image: &mut BinaryImage,
    entry_offset: u64,
    hook: [u8; HOOK_LEN],
) -> PatchResult<EntryHook> {
    let mut original = [0u8; HOOK_LEN];
    original.copy_from_slice(image.read(entry_offset, HOOK_LEN)?);

    image.write(entry_offset, &hook)?;
    debug!(
        "Entry 0x{:x}: {} -> {}",
        entry_offset,
        hex::encode(original),
        hex::encode(hook)
    );

    Ok(EntryHook {
        offset: entry_offset,
        original,
        patched: hook,
    })
}
