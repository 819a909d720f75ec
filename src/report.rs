//! Run reports
//!
//! Plain data gathered while patching, serializable for `--format json` and
//! rendered as text by [`crate::output`].

use std::path::PathBuf;

use serde::Serialize;

use crate::inject::{EntryHook, InjectReport, InjectionSite};
use crate::interp::{InterpPatch, InterpSegment};
use crate::resolve::Resolution;

/// Bytes shown around the entry point
pub const ENTRY_WINDOW: usize = 16;

/// Interpreter patch result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterpReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub segment: InterpSegment,
    pub previous: String,
    pub current: String,
    pub written: usize,
    pub padding: usize,
}

impl InterpReport {
    pub fn new(segment: InterpSegment, patch: InterpPatch) -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            segment,
            previous: patch.previous,
            current: patch.current,
            written: patch.written,
            padding: patch.padding,
        }
    }

    pub fn with_paths(mut self, input: PathBuf, output: PathBuf) -> Self {
        self.input = input;
        self.output = output;
        self
    }
}

/// Placeholder as it ended up in the cave
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaceholderEntry {
    pub position: usize,
    pub kind: String,
    pub target: u64,
    pub displacement: i32,
}

impl From<&Resolution> for PlaceholderEntry {
    fn from(r: &Resolution) -> Self {
        Self {
            position: r.position,
            kind: r.kind.to_string(),
            target: r.target,
            displacement: r.displacement,
        }
    }
}

/// Entry-hook run result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoaderReport {
    pub input: PathBuf,
    pub output: PathBuf,

    pub entry_vaddr: u64,
    pub entry_offset: u64,
    /// `e_entry` from the ELF header
    pub header_entry: u64,
    /// Entry file offset according to the PT_LOAD table
    pub mapped_entry_offset: Option<u64>,
    /// First original instruction executed after the cave
    pub return_vaddr: u64,

    pub site: InjectionSite,
    /// Cave file offset according to the PT_LOAD table
    pub mapped_cave_offset: Option<u64>,

    /// Hex of the first `ENTRY_WINDOW` bytes at the entry, before and after
    pub original_entry: String,
    pub patched_entry: String,
    pub hook: String,

    pub fragment_len: usize,
    pub code_len: usize,
    pub data_len: usize,
    pub placeholders: Vec<PlaceholderEntry>,

    /// Non-zero bytes overwritten in the cave
    pub cave_non_zero: usize,
    pub warnings: Vec<String>,
}

impl LoaderReport {
    /// Addresses filled in, byte sections empty
    pub fn new(
        entry_vaddr: u64,
        entry_offset: u64,
        header_entry: u64,
        return_vaddr: u64,
        site: InjectionSite,
    ) -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            entry_vaddr,
            entry_offset,
            header_entry,
            mapped_entry_offset: None,
            return_vaddr,
            site,
            mapped_cave_offset: None,
            original_entry: String::new(),
            patched_entry: String::new(),
            hook: String::new(),
            fragment_len: 0,
            code_len: 0,
            data_len: 0,
            placeholders: Vec::new(),
            cave_non_zero: 0,
            warnings: Vec::new(),
        }
    }

    pub fn with_paths(mut self, input: PathBuf, output: PathBuf) -> Self {
        self.input = input;
        self.output = output;
        self
    }

    pub fn record_injection(
        &mut self,
        inject: &InjectReport,
        code_len: usize,
        resolutions: &[Resolution],
    ) {
        self.fragment_len = inject.len;
        self.code_len = code_len;
        self.data_len = inject.len.saturating_sub(code_len);
        self.cave_non_zero = inject.non_zero_overwritten;
        self.placeholders = resolutions.iter().map(PlaceholderEntry::from).collect();

        if !inject.cave_was_empty() {
            self.warn(format!(
                "code cave held {} non-zero bytes before injection",
                inject.non_zero_overwritten
            ));
        }
    }

    pub fn record_hook(&mut self, hook: &EntryHook, original_window: &[u8], patched_window: &[u8]) {
        self.hook = hex::encode(hook.patched);
        self.original_entry = hex::encode(original_window);
        self.patched_entry = hex::encode(patched_window);
    }

    pub fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }
}
