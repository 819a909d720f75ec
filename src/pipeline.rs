//! # Patch Runs
//!
//! A [`PatchRun`] owns one buffered image and walks it through a fixed
//! sequence of stages:
//!
//! ```text
//! Loaded -> HeadersParsed -+-> FieldPatched ----------------------------------+-> Serialized
//!                          |                                                  |
//!                          +-> FragmentAssembled -> OffsetsResolved           |
//!                                  -> Injected -> HookWritten ----------------+
//! ```
//!
//! A failing step moves the run to `Failed`, and a failed or unfinished run
//! refuses to serialize, so a partially patched image never reaches disk.

use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::asm::assemble;
use crate::config::LoaderConfig;
use crate::elf::ElfHeader;
use crate::error::{PatchError, PatchResult};
use crate::image::BinaryImage;
use crate::inject::{hook_bytes, inject, write_hook};
use crate::interp::InterpSegment;
use crate::report::{InterpReport, LoaderReport, ENTRY_WINDOW};
use crate::resolve::{resolve, ResolveContext};

/// Run stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Loaded,
    HeadersParsed,
    FieldPatched,
    FragmentAssembled,
    OffsetsResolved,
    Injected,
    HookWritten,
    Serialized,
    Failed,
}

impl Stage {
    fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Loaded, HeadersParsed)
                | (HeadersParsed, FieldPatched)
                | (HeadersParsed, FragmentAssembled)
                | (FragmentAssembled, OffsetsResolved)
                | (OffsetsResolved, Injected)
                | (Injected, HookWritten)
                | (FieldPatched, Serialized)
                | (HookWritten, Serialized)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loaded => write!(f, "Loaded"),
            Self::HeadersParsed => write!(f, "HeadersParsed"),
            Self::FieldPatched => write!(f, "FieldPatched"),
            Self::FragmentAssembled => write!(f, "FragmentAssembled"),
            Self::OffsetsResolved => write!(f, "OffsetsResolved"),
            Self::Injected => write!(f, "Injected"),
            Self::HookWritten => write!(f, "HookWritten"),
            Self::Serialized => write!(f, "Serialized"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// One image moving through the patch stages
#[derive(Debug)]
pub struct PatchRun {
    image: BinaryImage,
    stage: Stage,
}

impl PatchRun {
    pub fn load<P: AsRef<Path>>(path: P) -> PatchResult<Self> {
        Ok(Self::from_image(BinaryImage::load(path)?))
    }

    pub fn from_image(image: BinaryImage) -> Self {
        Self {
            image,
            stage: Stage::Loaded,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn image(&self) -> &BinaryImage {
        &self.image
    }

    fn advance(&mut self, next: Stage) -> PatchResult<()> {
        if !self.stage.can_advance_to(next) {
            return Err(PatchError::InvalidStageTransition {
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Stage {} -> {}", self.stage, next);
        self.stage = next;
        Ok(())
    }

    fn track<T>(&mut self, result: PatchResult<T>) -> PatchResult<T> {
        if result.is_err() {
            debug!("Stage {} -> {}", self.stage, Stage::Failed);
            self.stage = Stage::Failed;
        }
        result
    }

    /// Replace the PT_INTERP path
    pub fn patch_interpreter(&mut self, new_path: &str) -> PatchResult<InterpReport> {
        let result = self.interpreter_steps(new_path);
        self.track(result)
    }

    fn interpreter_steps(&mut self, new_path: &str) -> PatchResult<InterpReport> {
        ElfHeader::parse(self.image.as_bytes())?;
        self.advance(Stage::HeadersParsed)?;

        let segment = InterpSegment::locate(&self.image)?;
        let patch = segment.patch(&mut self.image, new_path)?;
        self.advance(Stage::FieldPatched)?;

        Ok(InterpReport::new(segment, patch))
    }

    /// Inject the payload into the cave and hook the entry point
    pub fn hook_entry(&mut self, config: &LoaderConfig) -> PatchResult<LoaderReport> {
        let result = self.hook_steps(config);
        self.track(result)
    }

    fn hook_steps(&mut self, config: &LoaderConfig) -> PatchResult<LoaderReport> {
        config.validate()?;

        let site = config.site();
        let entry_offset = config.entry_offset();
        let mut report = {
            let header = ElfHeader::parse(self.image.as_bytes())?;
            let mut report = LoaderReport::new(
                config.entry_vaddr,
                entry_offset,
                header.entry,
                config.resume_vaddr()?,
                site,
            );
            report.mapped_entry_offset = header.vaddr_to_offset(config.entry_vaddr);
            report.mapped_cave_offset = header.vaddr_to_offset(site.vaddr);
            report
        };
        self.advance(Stage::HeadersParsed)?;
        check_addresses(&mut report);
        if let Some(msg) = config.displacement_mismatch() {
            warn!("{}", msg);
            report.warn(msg);
        }

        let original_window = self.image.peek(entry_offset, ENTRY_WINDOW).to_vec();

        let fragment = assemble(config);
        info!(
            "Assembled {} bytes ({} code, {} data, {} placeholders)",
            fragment.len(),
            fragment.code_len(),
            fragment.data_len(),
            fragment.placeholders().len()
        );
        self.advance(Stage::FragmentAssembled)?;

        let resolved = resolve(fragment, &ResolveContext::from_config(config)?)?;
        self.advance(Stage::OffsetsResolved)?;

        let injected = inject(&mut self.image, site, &resolved, config.cave_policy)?;
        report.record_injection(&injected, resolved.code_len(), resolved.resolutions());
        self.advance(Stage::Injected)?;

        let hook = write_hook(
            &mut self.image,
            entry_offset,
            hook_bytes(config.entry_vaddr, site.vaddr)?,
        )?;
        info!(
            "Hooked entry 0x{:x} -> cave 0x{:x}",
            config.entry_vaddr, site.vaddr
        );
        let patched_window = self.image.peek(entry_offset, ENTRY_WINDOW).to_vec();
        report.record_hook(&hook, &original_window, &patched_window);
        self.advance(Stage::HookWritten)?;

        Ok(report)
    }

    /// Write the patched image. Only a run that completed a patch may be saved.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> PatchResult<()> {
        if !self.stage.can_advance_to(Stage::Serialized) {
            return Err(PatchError::InvalidStageTransition {
                from: self.stage.to_string(),
                to: Stage::Serialized.to_string(),
            });
        }

        let result = self.image.save(path);
        self.track(result)?;
        self.advance(Stage::Serialized)
    }
}

/// Flag configured addresses the program headers disagree with
fn check_addresses(report: &mut LoaderReport) {
    if report.header_entry != report.entry_vaddr {
        let msg = format!(
            "hooked address 0x{:x} is not e_entry (0x{:x})",
            report.entry_vaddr, report.header_entry
        );
        warn!("{}", msg);
        report.warn(msg);
    }

    match report.mapped_entry_offset {
        Some(mapped) if mapped != report.entry_offset => {
            let msg = format!(
                "entry offset 0x{:x} differs from PT_LOAD mapping 0x{:x}",
                report.entry_offset, mapped
            );
            warn!("{}", msg);
            report.warn(msg);
        }
        None => {
            let msg = format!("entry 0x{:x} is not covered by a PT_LOAD segment", report.entry_vaddr);
            warn!("{}", msg);
            report.warn(msg);
        }
        _ => {}
    }

    if let Some(mapped) = report.mapped_cave_offset {
        if mapped != report.site.offset {
            let msg = format!(
                "cave offset 0x{:x} differs from PT_LOAD mapping 0x{:x}",
                report.site.offset, mapped
            );
            warn!("{}", msg);
            report.warn(msg);
        }
    }
}

/// Patch the interpreter of `input` and write the result to `output`
pub fn patch_interpreter(input: &Path, output: &Path, new_path: &str) -> PatchResult<InterpReport> {
    let mut run = PatchRun::load(input)?;
    let report = run.patch_interpreter(new_path)?;
    run.save(output)?;

    Ok(report.with_paths(PathBuf::from(input), PathBuf::from(output)))
}

/// Run the entry hook described by `config`, reading `config.input` and
/// writing `config.output`
pub fn patch_loader(config: &LoaderConfig) -> PatchResult<LoaderReport> {
    let mut run = PatchRun::load(&config.input)?;
    let report = run.hook_entry(config)?;
    run.save(&config.output)?;

    Ok(report.with_paths(config.input.clone(), config.output.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding;
    use crate::fixtures::{elf64_loader, elf64_with_interp, FIXTURE_ENTRY};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    const CAVE: u64 = 0x2000;

    fn fixture_config() -> LoaderConfig {
        LoaderConfig {
            entry_vaddr: FIXTURE_ENTRY,
            cave_offset: CAVE,
            call_target: Some(0x1800),
            ..Default::default()
        }
    }

    fn loader_run() -> PatchRun {
        PatchRun::from_image(BinaryImage::from_bytes(elf64_loader(0x3000)))
    }

    #[test]
    fn test_hook_entry() {
        let mut run = loader_run();
        let report = run.hook_entry(&fixture_config()).unwrap();

        assert_eq!(run.stage(), Stage::HookWritten);
        assert_eq!(report.hook, "e9fb0f0000");
        assert_eq!(report.return_vaddr, 0x1008);
        assert!(report.warnings.is_empty());
        assert!(report.original_entry.starts_with("4889e7e8f8070000"));
        assert!(report.patched_entry.starts_with("e9fb0f0000070000"));

        let image = run.image();
        assert_eq!(image.len(), 0x3000);
        assert_eq!(image.read(0x1000, 5).unwrap(), &[0xE9, 0xFB, 0x0F, 0x00, 0x00]);
    }

    #[test]
    fn test_cave_transfers_land_on_targets() {
        let config = fixture_config();
        let mut run = loader_run();
        let report = run.hook_entry(&config).unwrap();
        let image = run.image().as_bytes();

        for ph in &report.placeholders {
            let at = CAVE as usize + ph.position;
            let disp = encoding::read_i32(image, at).unwrap();
            let next_ip = CAVE + ph.position as u64 + 4;
            assert_eq!(encoding::rel32_target(next_ip, disp), ph.target, "{}", ph.kind);
        }

        let kinds: Vec<&str> = report.placeholders.iter().map(|p| p.kind.as_str()).collect();
        assert_eq!(kinds, ["data:path", "data:message", "call-target", "return-site"]);
        assert_eq!(report.placeholders[2].target, 0x1800);
        assert_eq!(report.placeholders[3].target, 0x1008);

        // The path literal sits where the lea points
        let path_at = report.placeholders[0].target as usize;
        let path = &image[path_at..path_at + config.marker_path.len() + 1];
        assert_eq!(&path[..path.len() - 1], config.marker_path.as_bytes());
        assert_eq!(path[path.len() - 1], 0);
    }

    #[test]
    fn test_replayed_bytes_precede_call() {
        let mut run = loader_run();
        let report = run.hook_entry(&fixture_config()).unwrap();
        let call_slot = report.placeholders[2].position;
        let start = CAVE as usize + call_slot - 4;

        assert_eq!(
            run.image().read(start as u64, 4).unwrap(),
            &[0x48, 0x89, 0xE7, 0xE8]
        );
    }

    #[test]
    fn test_entry_mismatch_is_reported() {
        let config = LoaderConfig {
            entry_vaddr: 0x1010,
            ..fixture_config()
        };
        let mut run = loader_run();
        let report = run.hook_entry(&config).unwrap();
        assert_eq!(report.header_entry, FIXTURE_ENTRY);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_miscounted_displacement_is_reported() {
        let config = LoaderConfig {
            displaced_len: 9,
            ..fixture_config()
        };
        let mut run = loader_run();
        let report = run.hook_entry(&config).unwrap();
        assert_eq!(report.return_vaddr, 0x1009);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("displaced_len is 9"));
    }

    #[test]
    fn test_cave_at_top_of_address_space() {
        let config = LoaderConfig {
            cave_vaddr: Some(u64::MAX - 0x10),
            ..fixture_config()
        };
        let mut run = loader_run();
        let before = run.image().clone();

        assert!(matches!(
            run.hook_entry(&config),
            Err(PatchError::DisplacementOutOfRange { .. })
        ));
        assert_eq!(run.stage(), Stage::Failed);
        assert_eq!(run.image(), &before);
    }

    #[test]
    fn test_strict_dirty_cave_fails_run() {
        let mut data = elf64_loader(0x3000);
        data[CAVE as usize + 7] = 0x90;
        let mut run = PatchRun::from_image(BinaryImage::from_bytes(data));

        let config = LoaderConfig {
            cave_policy: crate::inject::CavePolicy::Strict,
            ..fixture_config()
        };
        assert!(matches!(
            run.hook_entry(&config),
            Err(PatchError::CaveNotEmpty { non_zero: 1, .. })
        ));
        assert_eq!(run.stage(), Stage::Failed);

        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        assert!(matches!(
            run.save(&out),
            Err(PatchError::InvalidStageTransition { .. })
        ));
        assert!(!out.exists());
    }

    #[test]
    fn test_unpatched_run_refuses_save() {
        let dir = tempdir().unwrap();
        let mut run = loader_run();
        assert!(run.save(dir.path().join("out")).is_err());
        assert_eq!(run.stage(), Stage::Loaded);
    }

    #[test]
    fn test_patch_loader_end_to_end() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("ld-evil.so.2");
        let output = dir.path().join("ld-trojanized.so.2");
        fs::write(&input, elf64_loader(0x3000)).unwrap();

        let config = LoaderConfig {
            input: input.clone(),
            output: output.clone(),
            ..fixture_config()
        };
        let report = patch_loader(&config).unwrap();
        assert_eq!(report.output, output);

        let written = fs::read(&output).unwrap();
        assert_eq!(written.len(), 0x3000);
        assert_eq!(written[0x1000], 0xE9);
        let mode = fs::metadata(&output).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        // Everything outside the hook and the cave is untouched
        let original = elf64_loader(0x3000);
        assert_eq!(&written[..0x1000], &original[..0x1000]);
        assert_eq!(&written[0x1005..0x2000], &original[0x1005..0x2000]);

        let elf = goblin::elf::Elf::parse(&written).unwrap();
        assert_eq!(elf.entry, FIXTURE_ENTRY);
    }

    #[test]
    fn test_failed_loader_writes_nothing() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        fs::write(&input, elf64_loader(0x3000)).unwrap();

        let config = LoaderConfig {
            input,
            output: output.clone(),
            call_target: Some(0x2_0000_0000),
            ..fixture_config()
        };
        assert!(matches!(
            patch_loader(&config),
            Err(PatchError::DisplacementOutOfRange { .. })
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_patch_interpreter_end_to_end() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("hello");
        let output = dir.path().join("hello.patched");
        fs::write(&input, elf64_with_interp(0x100, 20, b"/lib/old\0", 0x200)).unwrap();

        let report = patch_interpreter(&input, &output, "/new").unwrap();
        assert_eq!(report.previous, "/lib/old");
        assert_eq!(report.padding, 15);

        let written = fs::read(&output).unwrap();
        assert_eq!(&written[0x100..0x105], b"/new\0");
        assert!(written[0x105..0x114].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_patch_interpreter_failures_write_nothing() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("hello");
        let output = dir.path().join("hello.patched");
        fs::write(&input, elf64_with_interp(0x100, 20, b"/lib/old\0", 0x200)).unwrap();

        assert!(matches!(
            patch_interpreter(&input, &output, "/tmp/a/very/long/loaderx"),
            Err(PatchError::FieldTooLarge { required: 25, capacity: 20 })
        ));
        assert!(!output.exists());

        assert!(matches!(
            patch_interpreter(&dir.path().join("missing"), &output, "/new"),
            Err(PatchError::InputNotFound(_))
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_malformed_input() {
        let mut run = PatchRun::from_image(BinaryImage::from_bytes(b"#!/bin/sh\n".to_vec()));
        assert!(matches!(
            run.patch_interpreter("/new"),
            Err(PatchError::MalformedHeader(_))
        ));
        assert_eq!(run.stage(), Stage::Failed);
    }
}
