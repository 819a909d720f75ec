//! # patch-interp
//!
//! Replace the dynamic linker path of an ELF binary.
//!
//! ```text
//! patch-interp ./hello ./hello.patched /tmp/ld-evil.so.2
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use log::{error, info};

use elf_hijack::output::{self, OutputFormat};
use elf_hijack::patch_interpreter;

/// Rewrite the PT_INTERP path of an ELF binary
#[derive(Parser)]
#[command(name = "patch-interp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Binary to read
    input: PathBuf,

    /// Where to write the patched binary
    output: PathBuf,

    /// New interpreter path (must fit the existing field)
    new_interpreter: String,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_secs()
        .init();

    if cli.format == OutputFormat::Text {
        println!(
            "{} Patching interpreter of {}",
            "[*]".blue(),
            cli.input.display()
        );
    }

    match patch_interpreter(&cli.input, &cli.output, &cli.new_interpreter) {
        Ok(report) => {
            output::write_report(&report, cli.format)?;
            info!("Interpreter patch complete");
        }
        Err(e) => {
            error!("Interpreter patch failed: {}", e);
            eprintln!("{} {}", "[-] Error:".red().bold(), e);
            if let Some(hint) = e.suggestion() {
                eprintln!("    {}", hint.dimmed());
            }
            std::process::exit(1);
        }
    }

    Ok(())
}
