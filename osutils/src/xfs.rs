use anyhow::{Context, Error};
use std::{path::Path, process::Command};
use uuid::Uuid;

use crate::exe::RunAndCheck;

/// Runs a read-only integrity check on an XFS filesystem.
pub fn check(block_device_path: &Path) -> Result<(), Error> {
    Command::new("xfs_repair")
        .arg("-n")
        .arg(block_device_path)
        .run_and_check()
        .context("Failed to run read-only xfs_repair check")
}

/// Sets the UUID of an XFS filesystem. `-U generate` would mint a random one
/// internally; this crate always passes an explicit UUID so the result is
/// reproducible and can be cross-checked against the partition table.
pub fn set_uuid(block_device_path: &Path, uuid: Uuid) -> Result<(), Error> {
    Command::new("xfs_admin")
        .arg("-U")
        .arg(uuid.to_string())
        .arg(block_device_path)
        .run_and_check()
        .context(format!(
            "Failed to set UUID on xfs filesystem '{}'",
            block_device_path.display()
        ))
}

#[cfg(feature = "functional-test")]
#[cfg_attr(not(test), allow(unused_imports, dead_code))]
mod functional_test {
    use super::*;

    #[test]
    fn test_xfs_negative() {
        assert!(check(Path::new("/dev/nonexistent")).is_err());
        assert!(set_uuid(Path::new("/dev/nonexistent"), Uuid::new_v4()).is_err());
    }
}
