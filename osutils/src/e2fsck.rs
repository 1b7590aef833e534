use anyhow::{Context, Error};
use std::{path::Path, process::Command};

use crate::exe::RunAndCheck;

/// Runs a forced, read-only integrity check on an ext2/3/4 filesystem.
/// Used before a shrink or a UUID reset, where any on-disk corruption should
/// abort the operation rather than be silently fixed.
pub fn check(block_device_path: &Path) -> Result<(), Error> {
    Command::new("e2fsck")
        .arg("-f")
        .arg("-n")
        .arg(block_device_path)
        .run_and_check()
        .context("Failed to run read-only e2fsck check")
}

/// Runs e2fsck in fix mode ("-f -y") on the file system on the block device.
/// Required by `resize2fs` before a shrink: it refuses to operate on a
/// filesystem that hasn't been freshly checked.
pub fn fix(block_device_path: &Path) -> Result<(), Error> {
    Command::new("e2fsck")
        .arg("-f")
        .arg("-y")
        .arg(block_device_path)
        .run_and_check()
        .context("Failed to execute e2fsck")
}

#[cfg(feature = "functional-test")]
#[cfg_attr(not(test), allow(unused_imports, dead_code))]
mod functional_test {
    use super::*;

    /// Validates that check()/fix() correctly handle negative cases.
    #[test]
    fn test_e2fsck_run_negative() {
        let block_device_path_nonexistent = Path::new("/dev/nonexistent");
        assert!(check(block_device_path_nonexistent).is_err());
        assert!(fix(block_device_path_nonexistent).is_err());
    }
}
