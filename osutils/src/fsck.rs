use anyhow::{Context, Error};
use std::{path::Path, process::Command};

use crate::exe::RunAndCheck;

/// Runs a read-only integrity check via the generic `fsck` dispatcher, for
/// filesystem types that don't have a dedicated tool wrapped elsewhere in
/// this crate (`e2fsck`, `xfs_repair`, `btrfs check`).
pub fn check(block_device_path: &Path) -> Result<(), Error> {
    Command::new("fsck")
        .arg("-n")
        .arg(block_device_path)
        .run_and_check()
        .context("Failed to run read-only fsck check")
}

#[cfg(feature = "functional-test")]
#[cfg_attr(not(test), allow(unused_imports, dead_code))]
mod functional_test {
    use super::*;

    #[test]
    fn test_fsck_negative() {
        assert!(check(Path::new("/dev/nonexistent")).is_err());
    }
}
