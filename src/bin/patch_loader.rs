//! # patch-loader
//!
//! Inject a marker-file payload into a code cave of a dynamic linker and
//! divert its entry point there. Runs against the built-in target with no
//! arguments; `--config` points it at another binary.
//!
//! ```text
//! patch-loader --print-config > target.toml
//! patch-loader --config target.toml -v
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use log::{debug, error, info};

use elf_hijack::output::{self, OutputFormat};
use elf_hijack::{patch_loader, CavePolicy, LoaderConfig};

/// Hook the entry point of an ELF loader through a code cave
#[derive(Parser)]
#[command(name = "patch-loader")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML, or JSON by extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the input binary
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Override the output binary
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Fail instead of overwriting a cave that is not all zeros
    #[arg(long)]
    strict_cave: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,
}

fn load_config(cli: &Cli) -> Result<LoaderConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            debug!("Loading config from {:?}", path);
            LoaderConfig::load(path).context("Failed to load configuration")?
        }
        None => LoaderConfig::default(),
    };

    if let Some(input) = &cli.input {
        config.input = input.clone();
    }
    if let Some(output) = &cli.output {
        config.output = output.clone();
    }
    if cli.strict_cave {
        config.cave_policy = CavePolicy::Strict;
    }

    Ok(config)
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

    let config = load_config(&cli)?;

    if cli.print_config {
        print!(
            "{}",
            toml::to_string_pretty(&config).context("Failed to render configuration")?
        );
        return Ok(());
    }

    if cli.format == OutputFormat::Text {
        println!(
            "{} Trojanizing {} -> {}",
            "[*]".blue(),
            config.input.display(),
            config.output.display()
        );
        println!(
            "{} Hook 0x{:x} -> cave 0x{:x}",
            "[*]".blue(),
            config.entry_vaddr,
            config.cave_vaddr()
        );
    }

    match patch_loader(&config) {
        Ok(report) => {
            output::write_report(&report, cli.format)?;
            info!("Loader patch complete");
        }
        Err(e) => {
            error!("Loader patch failed: {}", e);
            eprintln!("{} {}", "[-] Error:".red().bold(), e);
            if let Some(hint) = e.suggestion() {
                eprintln!("    {}", hint.dimmed());
            }
            std::process::exit(1);
        }
    }

    Ok(())
}
