use anyhow::{Context, Error};
use rand::RngCore;
use std::{path::Path, process::Command};

use crate::exe::RunAndCheck;

/// Generates a fresh VFAT volume ID: four random bytes, rendered as
/// `dosfstools` expects them (`XXXX-XXXX`, uppercase hex).
pub fn generate_volume_id() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    format!(
        "{:02X}{:02X}-{:02X}{:02X}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

/// Sets the volume ID of a VFAT filesystem. `volume_id` must be in
/// `XXXX-XXXX` form, as produced by `generate_volume_id`.
pub fn set_volume_id(block_device_path: &Path, volume_id: &str) -> Result<(), Error> {
    Command::new("fatlabel")
        .arg("--volume-id")
        .arg(block_device_path)
        .arg(volume_id)
        .run_and_check()
        .context(format!(
            "Failed to set volume ID on vfat filesystem '{}'",
            block_device_path.display()
        ))
}


#[cfg(feature = "functional-test")]
#[cfg_attr(not(test), allow(unused_imports, dead_code))]
mod functional_test {
    use super::*;

    #[test]
    fn test_set_volume_id_negative() {
        assert!(set_volume_id(Path::new("/dev/nonexistent"), "ABCD-1234").is_err());
    }
}
