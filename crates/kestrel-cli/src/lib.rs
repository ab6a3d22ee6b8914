//! Offline tooling for save-state files.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kestrel_savestate::{
    inspect, parse_blob, read_archive, slot_file_name, write_archive, Compression, SaveStateInfo,
    NUM_SAVE_SLOTS,
};

#[derive(Debug, Parser)]
#[command(name = "kestrel-state", about = "Inspect and verify emulator save-state files")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the sections stored in a save-state file.
    Inspect {
        path: PathBuf,
        /// Print machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Check that a save-state file decodes completely.
    Verify { path: PathBuf },
    /// Rewrite a save-state file with different compression.
    Recompress {
        input: PathBuf,
        output: PathBuf,
        /// Store the blob uncompressed.
        #[arg(long)]
        raw: bool,
    },
    /// Print the file name used for a title's save slot.
    SlotName {
        serial: String,
        /// Content CRC, in hex.
        #[arg(value_parser = parse_crc)]
        crc: u32,
        slot: u8,
    },
}

fn parse_crc(s: &str) -> std::result::Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|err| format!("invalid CRC `{s}`: {err}"))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn info_json(info: &SaveStateInfo) -> serde_json::Value {
    let sections: Vec<_> = info
        .sections
        .iter()
        .map(|s| {
            serde_json::json!({
                "tag": s.tag.to_string(),
                "version": s.version,
                "len": s.len,
            })
        })
        .collect();
    serde_json::json!({
        "compression": format!("{:?}", info.compression).to_lowercase(),
        "archive_len": info.archive_len,
        "blob_len": info.blob_len,
        "sections": sections,
    })
}

pub fn run(cli: Cli, out: &mut dyn Write) -> Result<()> {
    match cli.command {
        Command::Inspect { path, json } => {
            let info = inspect(&read_file(&path)?)
                .with_context(|| format!("{} is not a valid save state", path.display()))?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&info_json(&info))?)?;
            } else {
                writeln!(
                    out,
                    "{}: {:?}, {} bytes on disk, {} bytes uncompressed",
                    path.display(),
                    info.compression,
                    info.archive_len,
                    info.blob_len
                )?;
                for section in &info.sections {
                    writeln!(
                        out,
                        "  {:<8} v{:<3} {:>10} bytes",
                        section.tag.to_string(),
                        section.version,
                        section.len
                    )?;
                }
            }
        }
        Command::Verify { path } => {
            let blob = read_archive(&read_file(&path)?)
                .with_context(|| format!("failed to decode {}", path.display()))?;
            let sections = parse_blob(&blob)
                .with_context(|| format!("failed to parse sections of {}", path.display()))?;
            if sections.is_empty() {
                bail!("{} contains no sections", path.display());
            }
            tracing::debug!(sections = sections.len(), "verified save state");
            writeln!(out, "{}: OK ({} sections)", path.display(), sections.len())?;
        }
        Command::Recompress { input, output, raw } => {
            let blob = read_archive(&read_file(&input)?)
                .with_context(|| format!("failed to decode {}", input.display()))?;
            let compression = if raw { Compression::None } else { Compression::Lz4 };
            let archive = write_archive(&blob, compression)?;
            std::fs::write(&output, &archive)
                .with_context(|| format!("failed to write {}", output.display()))?;
            writeln!(out, "{} -> {} ({} bytes)", input.display(), output.display(), archive.len())?;
        }
        Command::SlotName { serial, crc, slot } => {
            if slot >= NUM_SAVE_SLOTS {
                bail!("slot {slot} is out of range (0..{NUM_SAVE_SLOTS})");
            }
            writeln!(out, "{}", slot_file_name(&serial, crc, slot))?;
        }
    }
    Ok(())
}
