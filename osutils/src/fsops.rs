//! Per-filesystem-type dispatch for the three operations the filesystem ops
//! component performs: a read-only integrity check, a shrink-eligibility
//! test, and a UUID reset. `FsType` is the closed dispatch tag (`api::model`);
//! each case here picks the tool wrapper that already exists in this crate.

use std::path::Path;

use anyhow::{bail, Error};
use imgcust_api::model::FsType;
use uuid::Uuid;

use crate::{btrfs, e2fsck, fatlabel, fsck, tune2fs, xfs};

/// Runs the read-only check appropriate for `fs_type`. A blank `fs_type` or
/// a dm-verity hash device is never checked this way (hash devices are
/// verified by `veritysetup`, not a filesystem-level fsck).
pub fn check_ro(fs_type: &FsType, block_device_path: &Path) -> Result<(), Error> {
    match fs_type {
        FsType::Other(s) if s.is_empty() => Ok(()),
        FsType::DmVerityHash => Ok(()),
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => e2fsck::check(block_device_path),
        FsType::Xfs => xfs::check(block_device_path),
        FsType::Btrfs => btrfs::check(block_device_path),
        FsType::Vfat | FsType::Other(_) => fsck::check(block_device_path),
    }
}

/// Whether `fs_type` supports the shrink-to-minimum protocol. Only
/// ext2/3/4 filesystems can be shrunk by this engine.
pub fn can_shrink(fs_type: &FsType) -> bool {
    fs_type.is_ext()
}

/// Resets the on-disk UUID of `fs_type` at `block_device_path`, returning the
/// new identifier as it should appear in a rewritten `fstab` entry. Refuses
/// dm-verity hash filesystems and unrecognized types outright.
pub fn reset_uuid(fs_type: &FsType, block_device_path: &Path) -> Result<String, Error> {
    match fs_type {
        FsType::Btrfs => {
            let uuid = Uuid::new_v4();
            btrfs::set_uuid(block_device_path, uuid)?;
            Ok(uuid.to_string())
        }
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
            e2fsck::fix(block_device_path)?;
            let uuid = Uuid::new_v4();
            tune2fs::set_uuid(block_device_path, uuid)?;
            Ok(uuid.to_string())
        }
        FsType::Xfs => {
            let uuid = Uuid::new_v4();
            xfs::set_uuid(block_device_path, uuid)?;
            Ok(uuid.to_string())
        }
        FsType::Vfat => {
            let id = fatlabel::generate_volume_id();
            fatlabel::set_volume_id(block_device_path, &id)?;
            Ok(id)
        }
        FsType::DmVerityHash => {
            bail!("Resetting the UUID of a dm-verity hash filesystem is not implemented")
        }
        FsType::Other(s) => bail!("Unsupported filesystem type '{s}' for UUID reset"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_shrink() {
        assert!(can_shrink(&FsType::Ext4));
        assert!(!can_shrink(&FsType::Xfs));
        assert!(!can_shrink(&FsType::Btrfs));
        assert!(!can_shrink(&FsType::DmVerityHash));
    }

    #[test]
    fn test_check_ro_skips_empty_and_verity() {
        let nonexistent = Path::new("/dev/nonexistent-fsops-test");
        assert!(check_ro(&FsType::Other(String::new()), nonexistent).is_ok());
        assert!(check_ro(&FsType::DmVerityHash, nonexistent).is_ok());
    }

    #[test]
    fn test_reset_uuid_refuses_verity_and_unknown() {
        let nonexistent = Path::new("/dev/nonexistent-fsops-test");
        let err = reset_uuid(&FsType::DmVerityHash, nonexistent).unwrap_err();
        assert!(err.to_string().contains("not implemented"));
        assert!(reset_uuid(&FsType::Other("zfs".into()), nonexistent).is_err());
    }
}
