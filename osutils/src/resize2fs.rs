use anyhow::{bail, Context, Error};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{path::Path, process::Command};

use crate::exe::RunAndCheck;

/// `resize2fs` prints `... to <blocks> (<N><unit>) ...` on the line
/// reporting the filesystem's new size after a resize.
static RESIZE_TO_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"to\s+(\d+)\s+\((\d+)([kK])\)").expect("valid regex"));

/// The outcome of a `resize2fs -M` shrink-to-minimum invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkResult {
    /// The filesystem was already at its minimum size; no change was made.
    NoOp,
    /// The filesystem was shrunk; carries the new size in bytes.
    Resized { new_size_bytes: u64 },
}

/// Shrinks an ext2/3/4 filesystem to its minimum possible size, serialized
/// against other partition-table-affecting operations on the same disk via
/// `flock`. Returns the resulting size so the caller can follow up with a
/// matching partition-table resize.
pub fn shrink_to_minimum(block_device_path: &Path, lock_device_path: &Path) -> Result<ShrinkResult, Error> {
    let output = Command::new("flock")
        .arg("--timeout")
        .arg("5")
        .arg(lock_device_path)
        .arg("resize2fs")
        .arg("-M")
        .arg(block_device_path)
        .raw_output_and_check()
        .context("Failed to execute resize2fs -M")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if stderr.contains("Nothing to do!") || stdout.contains("Nothing to do!") {
        return Ok(ShrinkResult::NoOp);
    }

    parse_resize_output(&stdout)
}

fn parse_resize_output(stdout: &str) -> Result<ShrinkResult, Error> {
    let caps = RESIZE_TO_PATTERN
        .captures(stdout)
        .context("Failed to find new filesystem size in resize2fs output")?;

    let block_size_kib: u64 = caps[2].parse().context("Failed to parse resize2fs block size")?;
    let blocks: u64 = caps[1].parse().context("Failed to parse resize2fs block count")?;

    let new_size_bytes = blocks
        .checked_mul(block_size_kib * 1024)
        .ok_or_else(|| Error::msg("Overflow computing resized filesystem size"))?;

    if new_size_bytes == 0 {
        bail!("resize2fs reported a zero-byte filesystem size");
    }

    Ok(ShrinkResult::Resized { new_size_bytes })
}

/// Grows an ext2/3/4 filesystem to fill the entire block device. Used after
/// the partition itself has been grown (e.g. when writing a customized image
/// to a larger target disk).
pub fn grow_to_fill(block_device_path: &Path) -> Result<(), Error> {
    Command::new("resize2fs")
        .arg(block_device_path)
        .run_and_check()
        .context("Failed to execute resize2fs")
}


#[cfg(feature = "functional-test")]
#[cfg_attr(not(test), allow(unused_imports, dead_code))]
mod functional_test {
    use super::*;

    #[test]
    fn test_resize2fs_run_negative() {
        let block_device_path_nonexistent = Path::new("/dev/nonexistent");
        assert!(grow_to_fill(block_device_path_nonexistent).is_err());
    }
}
