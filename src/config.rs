//! Loader patch configuration
//!
//! Every address and payload constant the loader run needs lives in one
//! immutable value, so another target is handled by swapping the file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::asm::{CALL_LEN, HOOK_LEN};
use crate::error::{PatchError, PatchResult};
use crate::inject::{CavePolicy, InjectionSite};

/// `O_WRONLY | O_CREAT | O_APPEND`
pub const DEFAULT_OPEN_FLAGS: u32 = 0x441;

/// `0644`
pub const DEFAULT_OPEN_MODE: u32 = 0o644;

/// Configuration for the code-cave entry hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Binary to read
    pub input: PathBuf,
    /// Patched binary to write
    pub output: PathBuf,

    /// Virtual address of the hooked entry code
    pub entry_vaddr: u64,
    /// File offset of the entry code (defaults to `entry_vaddr`)
    pub entry_offset: Option<u64>,

    /// File offset of the code cave
    pub cave_offset: u64,
    /// Virtual address of the code cave (defaults to `cave_offset`)
    pub cave_vaddr: Option<u64>,

    /// Original instructions from the entry, re-executed verbatim in the cave
    pub replayed: Vec<u8>,
    /// Absolute target of a call displaced by the hook, re-issued from the cave
    pub call_target: Option<u64>,
    /// Bytes of original code the cave takes over; execution resumes at
    /// `entry_vaddr + displaced_len`
    pub displaced_len: usize,

    /// File the payload opens
    pub marker_path: String,
    /// Text the payload writes
    pub message: String,
    /// open(2) flags
    pub open_flags: u32,
    /// open(2) mode
    pub open_mode: u32,

    /// What to do when the cave holds non-zero bytes
    pub cave_policy: CavePolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("ld-evil.so.2"),
            output: PathBuf::from("ld-trojanized.so.2"),
            entry_vaddr: 0x1f540,
            entry_offset: None,
            cave_offset: 0x2b1a0,
            cave_vaddr: None,
            // mov rdi, rsp
            replayed: vec![0x48, 0x89, 0xe7],
            call_target: Some(0x201d0),
            displaced_len: 8,
            marker_path: "/tmp/PWNED_BY_LOADER".to_string(),
            message: "[TROJANIZED LOADER] Code executed before program start!\n".to_string(),
            open_flags: DEFAULT_OPEN_FLAGS,
            open_mode: DEFAULT_OPEN_MODE,
            cave_policy: CavePolicy::Advisory,
        }
    }
}

impl LoaderConfig {
    /// Load configuration from a TOML or JSON file
    pub fn load(path: &Path) -> PatchResult<Self> {
        let content = fs::read_to_string(path)?;

        let config: LoaderConfig = if path.extension().map_or(false, |ext| ext == "json") {
            serde_json::from_str(&content)
                .map_err(|e| PatchError::InvalidConfig(format!("{}: {}", path.display(), e)))?
        } else {
            toml::from_str(&content)
                .map_err(|e| PatchError::InvalidConfig(format!("{}: {}", path.display(), e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> PatchResult<()> {
        let content = if path.extension().map_or(false, |ext| ext == "json") {
            serde_json::to_string_pretty(self)
                .map_err(|e| PatchError::InvalidConfig(e.to_string()))?
        } else {
            toml::to_string_pretty(self).map_err(|e| PatchError::InvalidConfig(e.to_string()))?
        };

        fs::write(path, content)?;
        Ok(())
    }

    /// Default configuration rendered as TOML
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn entry_offset(&self) -> u64 {
        self.entry_offset.unwrap_or(self.entry_vaddr)
    }

    pub fn cave_vaddr(&self) -> u64 {
        self.cave_vaddr.unwrap_or(self.cave_offset)
    }

    pub fn site(&self) -> InjectionSite {
        InjectionSite {
            offset: self.cave_offset,
            vaddr: self.cave_vaddr(),
        }
    }

    /// First original instruction after the displaced region
    pub fn resume_vaddr(&self) -> PatchResult<u64> {
        self.entry_vaddr
            .checked_add(self.displaced_len as u64)
            .ok_or_else(|| PatchError::InvalidConfig("entry_vaddr + displaced_len overflows".into()))
    }

    /// Bytes of original code the cave re-executes: the replayed
    /// instructions plus the re-issued call
    pub fn replay_len(&self) -> usize {
        self.replayed.len() + if self.call_target.is_some() { CALL_LEN } else { 0 }
    }

    /// Describe a `displaced_len` that disagrees with what the cave replays.
    ///
    /// Advisory only; the run still proceeds.
    pub fn displacement_mismatch(&self) -> Option<String> {
        let replayed = self.replay_len();
        (replayed != self.displaced_len).then(|| {
            format!(
                "displaced_len is {} but the cave re-executes {} bytes ({} replayed{})",
                self.displaced_len,
                replayed,
                self.replayed.len(),
                if self.call_target.is_some() { " + call" } else { "" }
            )
        })
    }

    /// Reject values that would produce a broken binary we can detect.
    ///
    /// A `displaced_len` that does not match real instruction boundaries is
    /// NOT detectable here and yields a corrupt binary.
    pub fn validate(&self) -> PatchResult<()> {
        if self.displaced_len < HOOK_LEN {
            return Err(PatchError::InvalidConfig(format!(
                "displaced_len {} is shorter than the {}-byte hook",
                self.displaced_len, HOOK_LEN
            )));
        }

        if self.marker_path.is_empty() || self.marker_path.contains('\0') {
            return Err(PatchError::InvalidConfig(
                "marker_path must be non-empty and free of NUL bytes".into(),
            ));
        }

        if self.message.contains('\0') {
            return Err(PatchError::InvalidConfig("message contains a NUL byte".into()));
        }

        if self.message.len() > i32::MAX as usize {
            return Err(PatchError::InvalidConfig("message too long".into()));
        }

        if i32::try_from(self.open_flags).is_err() || i32::try_from(self.open_mode).is_err() {
            return Err(PatchError::InvalidConfig(
                "open_flags and open_mode must fit a sign-extended imm32".into(),
            ));
        }

        self.resume_vaddr()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = LoaderConfig::default();
        assert_eq!(config.entry_offset(), 0x1f540);
        assert_eq!(config.cave_vaddr(), 0x2b1a0);
        assert_eq!(config.resume_vaddr().unwrap(), 0x1f548);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_with_hex() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "entry_vaddr = 0x1000\ncave_offset = 0x5000\ncave_vaddr = 0x405000\ndisplaced_len = 5\nreplayed = []\n"
        )
        .unwrap();

        let config = LoaderConfig::load(file.path()).unwrap();
        assert_eq!(config.entry_vaddr, 0x1000);
        assert_eq!(config.cave_vaddr(), 0x405000);
        assert_eq!(config.resume_vaddr().unwrap(), 0x1005);
        // Unspecified fields fall back to defaults
        assert_eq!(config.marker_path, "/tmp/PWNED_BY_LOADER");
    }

    #[test]
    fn test_load_json_config() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"cave_policy": "strict", "call_target": null}}"#).unwrap();

        let config = LoaderConfig::load(file.path()).unwrap();
        assert_eq!(config.cave_policy, CavePolicy::Strict);
        assert_eq!(config.call_target, None);
    }

    #[test]
    fn test_save_and_load() {
        let config = LoaderConfig {
            entry_vaddr: 0x4000,
            ..Default::default()
        };
        let file = NamedTempFile::with_suffix(".toml").unwrap();

        config.save(file.path()).unwrap();
        let loaded = LoaderConfig::load(file.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_invalid_values() {
        let short = LoaderConfig {
            displaced_len: 3,
            ..Default::default()
        };
        assert!(matches!(short.validate(), Err(PatchError::InvalidConfig(_))));

        let nul = LoaderConfig {
            marker_path: "/tmp/a\0b".into(),
            ..Default::default()
        };
        assert!(nul.validate().is_err());

        let overflow = LoaderConfig {
            entry_vaddr: u64::MAX - 2,
            ..Default::default()
        };
        assert!(overflow.validate().is_err());
    }

    #[test]
    fn test_displacement_mismatch() {
        let config = LoaderConfig::default();
        assert_eq!(config.replay_len(), 8);
        assert!(config.displacement_mismatch().is_none());

        let no_call = LoaderConfig {
            call_target: None,
            ..Default::default()
        };
        assert_eq!(no_call.replay_len(), 3);
        let msg = no_call.displacement_mismatch().unwrap();
        assert!(msg.contains("displaced_len is 8"));
        // Still a valid config
        assert!(no_call.validate().is_ok());
    }

    #[test]
    fn test_sample_parses() {
        let sample = LoaderConfig::sample();
        let parsed: LoaderConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed, LoaderConfig::default());
    }
}
