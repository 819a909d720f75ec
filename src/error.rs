//! # Error Types for ELF Patching

use std::path::PathBuf;

use thiserror::Error;

/// Main error type
#[derive(Error, Debug)]
pub enum PatchError {
    /// Image too short, bad magic, or unrecognized class/encoding byte
    #[error("Malformed ELF header: {0}")]
    MalformedHeader(String),

    /// No PT_INTERP program header present
    #[error("PT_INTERP segment not found")]
    SegmentNotFound,

    /// Replacement value does not fit the fixed-capacity field
    #[error("New interpreter path too long ({required} > {capacity} bytes)")]
    FieldTooLarge { required: usize, capacity: usize },

    /// Relative displacement does not fit in a signed 32-bit field
    #[error("Displacement from 0x{from:x} to 0x{target:x} does not fit in rel32")]
    DisplacementOutOfRange { from: u64, target: u64 },

    /// Code cave contains non-zero bytes
    #[error("Code cave at offset 0x{offset:x} is not empty ({non_zero} non-zero bytes)")]
    CaveNotEmpty { offset: u64, non_zero: usize },

    /// Region lies (partly) outside the image
    #[error("Region 0x{offset:x}+{len} lies outside the {size}-byte image")]
    OutOfBounds { offset: u64, len: usize, size: usize },

    /// Placeholder could not be given a target
    #[error("Unresolved placeholder at fragment offset {position}: {reason}")]
    UnresolvedPlaceholder { position: usize, reason: String },

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input file missing
    #[error("Input binary {} not found", .0.display())]
    InputNotFound(PathBuf),

    /// Run step attempted out of order
    #[error("Invalid stage transition: {from} -> {to}")]
    InvalidStageTransition { from: String, to: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type PatchResult<T> = Result<T, PatchError>;

impl PatchError {
    /// Get a user-friendly suggestion for fixing the error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            PatchError::MalformedHeader(_) => Some(
                "Only little-endian ELF32/ELF64 files are supported"
            ),
            PatchError::SegmentNotFound => Some(
                "Statically linked binaries have no interpreter to replace"
            ),
            PatchError::FieldTooLarge { .. } => Some(
                "Use a shorter path, e.g. a symlink in /tmp"
            ),
            PatchError::DisplacementOutOfRange { .. } => Some(
                "Check cave_vaddr, entry_vaddr and call_target in the configuration"
            ),
            PatchError::CaveNotEmpty { .. } => Some(
                "Pick an alignment gap of zero bytes or set cave_policy = \"advisory\""
            ),
            _ => None,
        }
    }
}
