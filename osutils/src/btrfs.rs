use anyhow::{Context, Error};
use std::{path::Path, process::Command};
use uuid::Uuid;

use crate::exe::RunAndCheck;

/// Runs a read-only integrity check on a btrfs filesystem.
pub fn check(block_device_path: &Path) -> Result<(), Error> {
    Command::new("btrfs")
        .arg("check")
        .arg("--readonly")
        .arg(block_device_path)
        .run_and_check()
        .context("Failed to run read-only btrfs check")
}

/// Sets the UUID of a btrfs filesystem. The filesystem must be unmounted;
/// `btrfstune` refuses to run otherwise.
pub fn set_uuid(block_device_path: &Path, uuid: Uuid) -> Result<(), Error> {
    Command::new("btrfstune")
        .arg("-U")
        .arg(uuid.to_string())
        .arg(block_device_path)
        .run_and_check()
        .context(format!(
            "Failed to set UUID on btrfs filesystem '{}'",
            block_device_path.display()
        ))
}

/// One entry from `btrfs subvolume list -a`, used so the orchestrator can
/// tell whether a btrfs filesystem has subvolumes fstab entries depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subvolume {
    pub id: u64,
    pub path: String,
}

pub fn list_subvolumes(mount_point: &Path) -> Result<Vec<Subvolume>, Error> {
    let output = Command::new("btrfs")
        .arg("subvolume")
        .arg("list")
        .arg("-a")
        .arg(mount_point)
        .output_and_check()
        .context("Failed to list btrfs subvolumes")?;
    parse_subvolume_list(&output)
}

fn parse_subvolume_list(output: &str) -> Result<Vec<Subvolume>, Error> {
    // Each line: "ID 256 gen 7 top level 5 path <subvol>"
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let id = fields
                .iter()
                .position(|f| *f == "ID")
                .and_then(|i| fields.get(i + 1))
                .context("Missing subvolume ID field")?
                .parse()
                .context("Failed to parse subvolume ID")?;
            let path = fields
                .iter()
                .position(|f| *f == "path")
                .and_then(|i| fields.get(i + 1))
                .context("Missing subvolume path field")?
                .to_string();
            Ok(Subvolume { id, path })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subvolume_list() {
        let output = "ID 256 gen 7 top level 5 path @\nID 257 gen 7 top level 256 path @/var\n";
        let subvols = parse_subvolume_list(output).unwrap();
        assert_eq!(
            subvols,
            vec![
                Subvolume {
                    id: 256,
                    path: "@".into()
                },
                Subvolume {
                    id: 257,
                    path: "@/var".into()
                },
            ]
        );
    }

    #[test]
    fn test_parse_subvolume_list_empty() {
        assert_eq!(parse_subvolume_list("").unwrap(), Vec::new());
    }
}

#[cfg(feature = "functional-test")]
#[cfg_attr(not(test), allow(unused_imports, dead_code))]
mod functional_test {
    use super::*;

    #[test]
    fn test_btrfs_negative() {
        assert!(check(Path::new("/dev/nonexistent")).is_err());
        assert!(set_uuid(Path::new("/dev/nonexistent"), Uuid::new_v4()).is_err());
    }
}
