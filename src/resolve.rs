//! # Offset Resolver
//!
//! Fixes every placeholder of a [`CodeFragment`] once the load address of the
//! cave is known. A rel32 field at fragment offset `p` inside a cave mapped at
//! `site` is relative to the byte after the field:
//!
//! ```text
//! displacement = target - (site + p + 4)
//! ```

use std::collections::HashSet;

use log::debug;
use serde::Serialize;

use crate::asm::{CodeFragment, PlaceholderKind};
use crate::config::LoaderConfig;
use crate::encoding::{self, REL32_WIDTH};
use crate::error::{PatchError, PatchResult};

/// Addresses a fragment is resolved against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveContext {
    /// Virtual address the fragment is loaded at
    pub site_vaddr: u64,
    /// Where the closing jmp lands (entry + displaced length)
    pub return_vaddr: u64,
    /// Where the re-issued call lands
    pub call_target: Option<u64>,
}

impl ResolveContext {
    pub fn from_config(config: &LoaderConfig) -> PatchResult<Self> {
        Ok(Self {
            site_vaddr: config.cave_vaddr(),
            return_vaddr: config.resume_vaddr()?,
            call_target: config.call_target,
        })
    }
}

/// One applied relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub position: usize,
    pub kind: PlaceholderKind,
    pub target: u64,
    pub displacement: i32,
}

/// Fully resolved, immutable code ready for injection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFragment {
    bytes: Vec<u8>,
    site_vaddr: u64,
    code_len: usize,
    resolutions: Vec<Resolution>,
}

impl ResolvedFragment {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Address the displacements were computed for
    pub fn site_vaddr(&self) -> u64 {
        self.site_vaddr
    }

    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    /// Decode the rel32 field at `position` back to an absolute address
    pub fn branch_target(&self, position: usize) -> PatchResult<u64> {
        let displacement = encoding::read_i32(&self.bytes, position)?;
        let next_ip = address_at(self.site_vaddr, position + REL32_WIDTH)?;
        Ok(encoding::rel32_target(next_ip, displacement))
    }
}

/// `site + offset`, failing instead of wrapping past the top of the
/// address space
fn address_at(site: u64, offset: usize) -> PatchResult<u64> {
    site.checked_add(offset as u64)
        .ok_or(PatchError::DisplacementOutOfRange {
            from: site,
            target: u64::MAX,
        })
}

/// Resolve every placeholder in a single pass.
///
/// Consumes the fragment, so no placeholder can be resolved twice.
pub fn resolve(fragment: CodeFragment, ctx: &ResolveContext) -> PatchResult<ResolvedFragment> {
    let mut seen = HashSet::new();
    let mut resolutions = Vec::with_capacity(fragment.placeholders().len());

    for ph in fragment.placeholders() {
        if ph.position + REL32_WIDTH > fragment.code_len() {
            return Err(PatchError::UnresolvedPlaceholder {
                position: ph.position,
                reason: "slot lies outside the code region".to_string(),
            });
        }
        if !seen.insert(ph.position) {
            return Err(PatchError::UnresolvedPlaceholder {
                position: ph.position,
                reason: "slot recorded twice".to_string(),
            });
        }

        let target = match ph.kind {
            PlaceholderKind::Data(label) => {
                let offset = fragment.data_offset(label).ok_or_else(|| {
                    PatchError::UnresolvedPlaceholder {
                        position: ph.position,
                        reason: format!("no {:?} literal in fragment", label),
                    }
                })?;
                address_at(ctx.site_vaddr, offset)?
            }
            PlaceholderKind::CallTarget => {
                ctx.call_target
                    .ok_or_else(|| PatchError::UnresolvedPlaceholder {
                        position: ph.position,
                        reason: "no call target configured".to_string(),
                    })?
            }
            PlaceholderKind::ReturnSite => ctx.return_vaddr,
        };

        let next_ip = address_at(ctx.site_vaddr, ph.position + REL32_WIDTH)?;
        let displacement = encoding::rel32(next_ip, target)?;

        debug!(
            "{} @+0x{:x}: 0x{:x} -> 0x{:x} (rel32 {:#x})",
            ph.kind, ph.position, next_ip, target, displacement
        );

        resolutions.push(Resolution {
            position: ph.position,
            kind: ph.kind,
            target,
            displacement,
        });
    }

    let code_len = fragment.code_len();
    let mut bytes = fragment.bytes;
    for r in &resolutions {
        encoding::write_i32(&mut bytes, r.position, r.displacement)?;
    }

    Ok(ResolvedFragment {
        bytes,
        site_vaddr: ctx.site_vaddr,
        code_len,
        resolutions,
    })
}
