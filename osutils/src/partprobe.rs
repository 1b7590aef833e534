use std::path::Path;

use anyhow::{Context, Error};
use duct::cmd;

/// Asks the kernel to re-read a disk's partition table, serialized against
/// other partition-table-affecting tools on the same disk via `flock`. Used
/// after `sfdisk` edits before the new partition device nodes are expected
/// to appear.
pub fn probe(disk_device_path: &Path) -> Result<(), Error> {
    cmd!(
        "flock",
        "--timeout",
        "5",
        disk_device_path,
        "partprobe",
        disk_device_path
    )
    .run()
    .context(format!(
        "Failed to probe partition table on '{}'",
        disk_device_path.display()
    ))?;
    Ok(())
}

#[cfg(feature = "functional-test")]
#[cfg_attr(not(test), allow(unused_imports, dead_code))]
mod functional_test {
    use super::*;

    #[test]
    fn test_probe_negative() {
        assert!(probe(Path::new("/dev/nonexistent")).is_err());
    }
}
