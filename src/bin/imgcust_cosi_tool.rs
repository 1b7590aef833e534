//! Reads and validates a COSI file produced by this engine.
//!
//! This is a diagnostic companion tool, not the external CLI/config layer
//! spec.md excludes: it exercises the same invariants `imgcust::cosi` packs
//! by, checking that `metadata.json` is the first tar member, that every
//! `images[]` entry references a member that exists, that each member's
//! SHA-384 matches `metadata.json`, and that every `.raw.zst` member's
//! skippable frame carries the image UUID `metadata.json` declares.

use std::{fs::File, io::Read, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use sha2::{Digest, Sha384};

use imgcust_api::model::{CosiMetadata, ImageUuid};
use osutils::zstd_frame;

/// Reads and validates a COSI file.
#[derive(Parser, Debug)]
#[command(name = "imgcust-cosi-tool")]
#[command(about = "Reads and validates a COSI archive", long_about = None)]
struct Args {
    /// Path to the .cosi file to validate.
    #[arg(value_name = "COSI_FILE")]
    cosi_path: PathBuf,

    /// Verbosity level (e.g., info, debug).
    #[arg(short, long, default_value = "info")]
    verbosity: LevelFilter,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.verbosity)
        .init();

    info!("Reading COSI file from: {}", args.cosi_path.display());

    let file = File::open(&args.cosi_path)
        .context(format!("Failed to open '{}'", args.cosi_path.display()))?;
    let mut archive = tar::Archive::new(file);

    let mut entries = archive
        .entries()
        .context("Failed to read COSI tar entries")?;

    let first = entries
        .next()
        .context("COSI archive is empty")?
        .context("Failed to read first COSI tar entry")?;
    let first_path = first.path().context("Invalid path in first entry")?.into_owned();
    if first_path.to_string_lossy() != "metadata.json" {
        bail!(
            "Expected 'metadata.json' as the first COSI member, found '{}'",
            first_path.display()
        );
    }

    let metadata: CosiMetadata =
        serde_json::from_reader(first).context("Failed to parse 'metadata.json'")?;
    if metadata.version != "1.0" {
        bail!("Unsupported COSI metadata version '{}'", metadata.version);
    }
    info!(
        "metadata.json: id={}, osArch={:?}, {} image(s)",
        metadata.id.to_hex(),
        metadata.os_arch,
        metadata.images.len()
    );

    let mut seen: Vec<String> = Vec::new();
    for entry in entries {
        let mut entry = entry.context("Failed to read COSI tar entry")?;
        let path = entry.path().context("Invalid path in COSI entry")?.into_owned();
        let path_str = path.to_string_lossy().to_string();

        let mode = entry.header().mode().context("Missing mode in tar header")?;
        if mode != 0o400 {
            warn!("Member '{path_str}' has mode 0o{mode:o}, expected 0o400");
        }

        let mut hasher = Sha384::new();
        let mut buf = [0u8; 1 << 20];
        let mut prefix: Vec<u8> = Vec::new();
        loop {
            let n = entry.read(&mut buf).context(format!(
                "Failed to read COSI member '{path_str}'"
            ))?;
            if n == 0 {
                break;
            }
            if prefix.len() < 24 {
                prefix.extend_from_slice(&buf[..n.min(24 - prefix.len())]);
            }
            hasher.update(&buf[..n]);
        }
        let digest = format!("{:x}", hasher.finalize());

        let entry_meta = metadata
            .images
            .iter()
            .find(|e| e.image.path == path_str)
            .or_else(|| {
                metadata.images.iter().find(|e| {
                    e.verity
                        .as_ref()
                        .map(|v| v.image.path == path_str)
                        .unwrap_or(false)
                })
            })
            .context(format!(
                "COSI member '{path_str}' is not referenced by metadata.json"
            ))?;

        let expected_sha384 = if entry_meta.image.path == path_str {
            &entry_meta.image.sha384
        } else {
            &entry_meta.verity.as_ref().unwrap().image.sha384
        };
        if expected_sha384 != &digest {
            bail!(
                "SHA-384 mismatch for '{path_str}': metadata says '{expected_sha384}', archive has '{digest}'"
            );
        }

        if path_str.ends_with(".raw.zst") {
            let mut cursor = std::io::Cursor::new(prefix);
            let frame_uuid = zstd_frame::read_frame(&mut cursor).context(format!(
                "'{path_str}' is missing the expected skippable frame"
            ))?;
            if ImageUuid::new(frame_uuid) != metadata.id {
                bail!(
                    "'{path_str}' skippable frame UUID does not match metadata.json's 'id'"
                );
            }
        }

        seen.push(path_str);
    }

    for entry in &metadata.images {
        if !seen.contains(&entry.image.path) {
            bail!(
                "metadata.json references '{}' but no such member exists in the archive",
                entry.image.path
            );
        }
        if let Some(verity) = &entry.verity {
            if !seen.contains(&verity.image.path) {
                bail!(
                    "metadata.json references verity image '{}' but no such member exists",
                    verity.image.path
                );
            }
        }
    }

    info!("COSI file '{}' verified successfully!", args.cosi_path.display());
    println!("{}", metadata.id.to_hex());

    Ok(())
}
