//! Shrink orchestration (C6 over C3): shrinks an ext2/3/4 filesystem to its
//! minimum size and resizes its partition-table entry to match, then
//! re-snapshots the disk so callers see up-to-date sizes.

use std::path::Path;

use anyhow::Context;
use anyhow::Error;
use imgcust_api::model::{FsType, PartitionInfo};

use osutils::{
    e2fsck, lsblk, resize2fs,
    resize2fs::ShrinkResult,
    sfdisk, tune2fs,
};

/// The logical sector size `sfdisk -N` resizes are expressed in.
const SECTOR_BYTES: u64 = 512;

/// Whether shrinking `partition` should proceed. `produced_by_tool`
/// distinguishes images this engine itself built ("native" mode, where the
/// filesystem is known to already fill its partition tightly) from images
/// imported from elsewhere ("convert" mode), where the coverage guard skips
/// partitions whose filesystem doesn't already span the whole partition —
/// shrinking those would rely on an assumption this engine never made.
pub fn should_shrink(
    fs_type: &FsType,
    partition: &PartitionInfo,
    block_device_path: &Path,
    produced_by_tool: bool,
) -> Result<bool, Error> {
    if !fs_type.is_ext() {
        return Ok(false);
    }
    if produced_by_tool {
        return Ok(true);
    }

    let fs_bytes = tune2fs::filesystem_size_bytes(block_device_path)
        .context("Failed to read filesystem size for shrink coverage guard")?;
    Ok(fs_bytes == partition.size.bytes())
}

/// Shrinks the ext2/3/4 filesystem at `block_device_path` to its minimum
/// size, then resizes partition `partition_num` on `disk_device_path` to
/// match, re-snapshotting the disk so the caller's next partition list
/// reflects the new size. Idempotent: a filesystem already at its minimum
/// size (`resize2fs` reports "Nothing to do!") makes this a no-op and skips
/// the partition-table resize entirely.
pub fn shrink_partition(
    disk_device_path: &Path,
    block_device_path: &Path,
    partition_num: u32,
    expected_partitions: usize,
) -> Result<ShrinkResult, Error> {
    e2fsck::fix(block_device_path).context("Failed to run e2fsck before shrink")?;

    let result = resize2fs::shrink_to_minimum(block_device_path, disk_device_path)
        .context("Failed to shrink filesystem to minimum size")?;

    let new_size_bytes = match result {
        ShrinkResult::NoOp => return Ok(result),
        ShrinkResult::Resized { new_size_bytes } => new_size_bytes,
    };

    let size_sectors = (new_size_bytes + SECTOR_BYTES - 1) / SECTOR_BYTES;
    sfdisk::resize_partition(disk_device_path, partition_num, size_sectors)
        .context("Failed to resize partition table entry after shrink")?;

    lsblk::refresh(disk_device_path, expected_partitions)
        .context("Failed to wait for partition table to settle after shrink")?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgcust_api::{model::PartitionKind, primitives::ByteCount};

    fn sample_partition() -> PartitionInfo {
        PartitionInfo {
            device_path: "/dev/loop0p2".into(),
            kind: PartitionKind::Partition,
            part_type_uuid: None,
            fs_type: "ext4".into(),
            fs_uuid: None,
            part_uuid: None,
            part_label: None,
            size: ByteCount::from(1 << 30),
            mount_point: None,
        }
    }

    #[test]
    fn test_should_shrink_skips_non_ext() {
        let partition = sample_partition();
        assert!(!should_shrink(&FsType::Xfs, &partition, Path::new("/dev/null"), true).unwrap());
    }

    #[test]
    fn test_should_shrink_native_mode_always_ext() {
        let partition = sample_partition();
        assert!(should_shrink(&FsType::Ext4, &partition, Path::new("/dev/null"), true).unwrap());
    }
}
