//! # ELF Loader Hijacking Library
//!
//! Two in-place patch operations on ELF binaries:
//! - Rewriting the PT_INTERP field so a program starts under a different
//!   dynamic linker
//! - Injecting a position-independent payload into a code cave and diverting
//!   the entry point to it with a 5-byte `jmp rel32`
//!
//! Both are same-size overwrites. The output is a byte-for-byte copy of the
//! input except for the patched regions.
//!
//! ## Architecture
//!
//! ```text
//! +------------------+
//! |   ELF Reader     |  Header, program headers, PT_INTERP
//! +------------------+
//!          |
//! +------------------+
//! |   Assembler      |  Payload bytes + placeholder table
//! +------------------+
//!          |
//! +------------------+
//! |   Resolver       |  rel32 displacements for the cave address
//! +------------------+
//!          |
//! +------------------+
//! |   Injector       |  Cave write, entry hook
//! +------------------+
//! ```
//!
//! ## Security Note
//!
//! This library is for educational purposes. Only patch binaries you own or
//! have permission to modify.

pub mod asm;
pub mod config;
pub mod elf;
pub mod encoding;
pub mod error;
pub mod image;
pub mod inject;
pub mod interp;
pub mod output;
pub mod pipeline;
pub mod report;
pub mod resolve;

#[cfg(test)]
mod fixtures;

pub use asm::{assemble, Assembler, CodeFragment, DataLabel, PlaceholderKind, HOOK_LEN};
pub use config::LoaderConfig;
pub use elf::{ElfClass, ElfHeader, ProgramHeaderEntry};
pub use error::*;
pub use image::BinaryImage;
pub use inject::{hook_bytes, inject, write_hook, CavePolicy, InjectionSite};
pub use interp::InterpSegment;
pub use pipeline::{patch_interpreter, patch_loader, PatchRun, Stage};
pub use report::{InterpReport, LoaderReport};
pub use resolve::{resolve, ResolveContext, ResolvedFragment};
