use anyhow::{Context, Error};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{path::Path, process::Command};
use uuid::Uuid;

use crate::exe::RunAndCheck;

/// Sets the UUID of an ext2/3/4 filesystem already on disk. `tune2fs` rewrites
/// the superblock(s) in place; the partition's own PARTUUID is a separate
/// GPT-table field handled by `sfdisk::set_part_uuid`.
pub fn set_uuid(block_device_path: &Path, uuid: Uuid) -> Result<(), Error> {
    Command::new("tune2fs")
        .arg("-U")
        .arg(uuid.to_string())
        .arg(block_device_path)
        .run_and_check()
        .context(format!(
            "Failed to set UUID on ext filesystem '{}'",
            block_device_path.display()
        ))
}

static BLOCK_COUNT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Block count:\s*(\d+)\s*$").expect("valid regex"));
static BLOCK_SIZE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Block size:\s*(\d+)\s*$").expect("valid regex"));

/// Filesystem size as `tune2fs -l` reports it: `Block count * Block size`.
/// Used by the shrink coverage guard to tell whether an image that wasn't
/// produced by this tool already fills its partition exactly.
pub fn filesystem_size_bytes(block_device_path: &Path) -> Result<u64, Error> {
    let output = Command::new("tune2fs")
        .arg("-l")
        .arg(block_device_path)
        .output_and_check()
        .context(format!(
            "Failed to read superblock of '{}'",
            block_device_path.display()
        ))?;

    parse_filesystem_size(&output)
}

fn parse_filesystem_size(tune2fs_l_output: &str) -> Result<u64, Error> {
    let block_count: u64 = BLOCK_COUNT_PATTERN
        .captures(tune2fs_l_output)
        .context("Failed to find 'Block count' in tune2fs -l output")?[1]
        .parse()
        .context("Failed to parse tune2fs block count")?;

    let block_size: u64 = BLOCK_SIZE_PATTERN
        .captures(tune2fs_l_output)
        .context("Failed to find 'Block size' in tune2fs -l output")?[1]
        .parse()
        .context("Failed to parse tune2fs block size")?;

    block_count
        .checked_mul(block_size)
        .context("Overflow computing filesystem size from tune2fs -l output")
}


#[cfg(feature = "functional-test")]
#[cfg_attr(not(test), allow(unused_imports, dead_code))]
mod functional_test {
    use super::*;

    #[test]
    fn test_set_uuid_negative() {
        assert!(set_uuid(Path::new("/dev/nonexistent"), Uuid::new_v4()).is_err());
    }
}
