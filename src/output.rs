//! Report rendering for the command-line tools

use std::io::{self, Write};

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use crate::report::{InterpReport, LoaderReport};

/// Supported output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Human-readable rendering of a report
pub trait Render {
    fn render_text(&self) -> String;
}

impl Render for InterpReport {
    fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{} PT_INTERP: phdr[{}] offset 0x{:x}, {} bytes\n",
            "[*]".blue(),
            self.segment.index,
            self.segment.offset,
            self.segment.capacity
        ));
        out.push_str(&format!("{} Old interpreter: {}\n", "[*]".blue(), self.previous));
        out.push_str(&format!(
            "{} New interpreter: {} ({} bytes + {} padding)\n",
            "[+]".green(),
            self.current.bold(),
            self.written,
            self.padding
        ));
        out.push_str(&format!("{} Wrote {}\n", "[+]".green(), self.output.display()));
        out
    }
}

fn address_line(label: &str, value: u64, mapped: Option<u64>) -> String {
    match mapped {
        Some(offset) => format!("    {:<14} 0x{:x} (file offset 0x{:x})\n", label, value, offset),
        None => format!("    {:<14} 0x{:x} (not in a PT_LOAD segment)\n", label, value),
    }
}

impl Render for LoaderReport {
    fn render_text(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!("{} Addresses:\n", "[*]".blue()));
        out.push_str(&address_line("entry", self.entry_vaddr, self.mapped_entry_offset));
        out.push_str(&format!("    {:<14} 0x{:x}\n", "e_entry", self.header_entry));
        out.push_str(&address_line("cave", self.site.vaddr, self.mapped_cave_offset));
        out.push_str(&format!("    {:<14} 0x{:x}\n", "resume", self.return_vaddr));

        out.push_str(&format!(
            "{} Payload: {} bytes ({} code, {} data)\n",
            "[*]".blue(),
            self.fragment_len,
            self.code_len,
            self.data_len
        ));
        for ph in &self.placeholders {
            out.push_str(&format!(
                "    +0x{:03x} {:<13} -> 0x{:x} (rel32 {})\n",
                ph.position, ph.kind, ph.target, ph.displacement
            ));
        }

        out.push_str(&format!("{} Original entry: {}\n", "[*]".blue(), self.original_entry));
        out.push_str(&format!(
            "{} Patched entry:  {}\n",
            "[+]".green(),
            self.patched_entry.bold()
        ));

        for warning in &self.warnings {
            out.push_str(&format!("{} {}\n", "[!]".yellow(), warning));
        }

        out.push_str(&format!("{} Wrote {}\n", "[+]".green(), self.output.display()));
        out
    }
}

/// Render a report in the requested format
pub fn format_report<T: Serialize + Render>(report: &T, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(report.render_text()),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)? + "\n"),
    }
}

/// Write a report to stdout
pub fn write_report<T: Serialize + Render>(report: &T, format: OutputFormat) -> Result<()> {
    let formatted = format_report(report, format)?;
    io::stdout().write_all(formatted.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::InjectionSite;
    use crate::interp::{InterpPatch, InterpSegment};
    use std::path::PathBuf;

    fn interp_report() -> InterpReport {
        InterpReport::new(
            InterpSegment { index: 1, offset: 0x318, capacity: 28 },
            InterpPatch {
                previous: "/lib64/ld-linux-x86-64.so.2".into(),
                current: "/tmp/ld".into(),
                written: 8,
                padding: 20,
            },
        )
        .with_paths(PathBuf::from("hello"), PathBuf::from("hello.patched"))
    }

    #[test]
    fn test_interp_text() {
        let text = format_report(&interp_report(), OutputFormat::Text).unwrap();
        assert!(text.contains("0x318"));
        assert!(text.contains("/lib64/ld-linux-x86-64.so.2"));
        assert!(text.contains("hello.patched"));
    }

    #[test]
    fn test_interp_json() {
        let json = format_report(&interp_report(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["segment"]["capacity"], 28);
        assert_eq!(value["current"], "/tmp/ld");
    }

    #[test]
    fn test_loader_text_lists_warnings() {
        let mut report = LoaderReport::new(
            0x1f540,
            0x1f540,
            0x1f540,
            0x1f548,
            InjectionSite { offset: 0x2b1a0, vaddr: 0x2b1a0 },
        );
        report.warn("code cave held 3 non-zero bytes before injection".into());

        let text = format_report(&report, OutputFormat::Text).unwrap();
        assert!(text.contains("0x1f540"));
        assert!(text.contains("not in a PT_LOAD segment"));
        assert!(text.contains("code cave held 3 non-zero bytes"));
    }
}
