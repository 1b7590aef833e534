//! Topology Resolver (C5): locates the ESP/BIOS-boot partition, the `/boot`
//! partition, the rootfs partition (including a btrfs subvolume layout), and
//! resolves every non-pseudo `fstab` entry's source to a concrete partition
//! in a `PartitionInfo` snapshot, producing a `VerityDevice` record for any
//! `/dev` source the kernel cmdline describes as dm-verity protected.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use imgcust_api::model::{
    FstabEntry, GrubArg, MountSource, PartitionInfo, VerityDevice, VerityIdType,
};
use osutils::{
    btrfs, filesystems::MountFileSystemType, grub, mount::Mount,
    partition_types::{DiscoverablePartitionType, BIOS_BOOT_TYPE_UUID},
};

/// Filesystem types this resolver will mount looking for `/etc/fstab` when
/// searching for the root filesystem.
const ROOTFS_CANDIDATE_TYPES: &[&str] = &["ext2", "ext3", "ext4", "xfs", "btrfs"];

/// `grub.cfg`'s `search -n -u <uuid> -s` stanza, used to recover the fs-UUID
/// of the `/boot` partition when it's split from the ESP.
static SEARCH_UUID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"search\s+-n\s+-u\s+([0-9a-fA-F-]+)\s+-s").expect("valid regex"));

/// One fstab entry resolved against a partition snapshot.
#[derive(Debug)]
pub struct ResolvedMount<'a> {
    pub entry: &'a FstabEntry,
    pub partition: &'a PartitionInfo,
    pub verity: Option<VerityDevice>,
}

/// Finds the single ESP or BIOS-boot partition in `partitions`. Zero or
/// multiple matches is always a fatal error (spec.md §8 invariant 7).
pub fn find_system_boot(partitions: &[PartitionInfo]) -> Result<&PartitionInfo, Error> {
    let esp_uuid = DiscoverablePartitionType::Esp.to_uuid();
    let matches: Vec<&PartitionInfo> = partitions
        .iter()
        .filter(|p| p.is_partition())
        .filter(|p| {
            p.part_type_uuid == Some(esp_uuid) || p.part_type_uuid == Some(BIOS_BOOT_TYPE_UUID)
        })
        .collect();

    match matches.as_slice() {
        [single] => Ok(single),
        [] => bail!("No ESP or BIOS boot partition found among the disk's partitions"),
        multiple => bail!(
            "Found {} candidate ESP/BIOS boot partitions, expected exactly one",
            multiple.len()
        ),
    }
}

/// Given an already RO-mounted ESP, reads `grub2/grub.cfg` and recovers the
/// `/boot` partition from the fs-UUID embedded in its `search -n -u <uuid>
/// -s` stanza.
pub fn find_boot_from_esp<'a>(
    esp_mount_point: &Path,
    partitions: &'a [PartitionInfo],
) -> Result<&'a PartitionInfo, Error> {
    let grub_cfg_path = esp_mount_point.join("grub2/grub.cfg");
    let contents = std::fs::read_to_string(&grub_cfg_path)
        .context(format!("Failed to read '{}'", grub_cfg_path.display()))?;

    let uuid_str = SEARCH_UUID_PATTERN
        .captures(&contents)
        .context(format!(
            "No 'search -n -u <uuid> -s' stanza found in '{}'",
            grub_cfg_path.display()
        ))?
        .get(1)
        .unwrap()
        .as_str();

    let uuid = Uuid::parse_str(uuid_str).context(format!(
        "Failed to parse UUID '{uuid_str}' from '{}'",
        grub_cfg_path.display()
    ))?;

    partitions
        .iter()
        .find(|p| {
            p.fs_uuid
                .as_ref()
                .map(|fs_uuid| fs_uuid.match_uuid(&uuid))
                .unwrap_or(false)
        })
        .context(format!(
            "No partition with filesystem UUID '{uuid}' found for the /boot partition referenced by '{}'",
            grub_cfg_path.display()
        ))
}

/// Finds the root filesystem partition: exactly one candidate among
/// ext2/3/4, xfs and btrfs partitions must contain `/etc/fstab`, either at
/// its top level or, for btrfs, inside one of its subvolumes. Returns the
/// partition plus the subvolume path when the hit was inside one.
pub fn find_rootfs(partitions: &[PartitionInfo]) -> Result<(&PartitionInfo, Option<String>), Error> {
    let mut hits = Vec::new();
    for partition in partitions.iter().filter(|p| p.is_partition()) {
        if !ROOTFS_CANDIDATE_TYPES.contains(&partition.fs_type.as_str()) {
            continue;
        }
        if let Some(subvolume) = probe_fstab_candidate(partition)? {
            hits.push((partition, subvolume));
        }
    }

    match hits.len() {
        1 => Ok(hits.into_iter().next().unwrap()),
        0 => bail!("No partition containing '/etc/fstab' found among root filesystem candidates"),
        n => bail!("Found {n} partitions containing '/etc/fstab', expected exactly one root filesystem"),
    }
}

/// Mounts `partition` read-only into a scratch directory and checks for
/// `/etc/fstab`, first at the mount's own root and then, for btrfs, by
/// remounting at the top of the subvolume tree (`subvolid=5`) and checking
/// every subvolume in turn.
fn probe_fstab_candidate(partition: &PartitionInfo) -> Result<Option<Option<String>>, Error> {
    let fs_type = MountFileSystemType::from_fs_type(&imgcust_api::model::FsType::parse(
        &partition.fs_type,
    ))?;
    let scratch = tempfile::tempdir().context("Failed to create scratch mount directory")?;

    {
        let mount = Mount::new(
            &partition.device_path,
            scratch.path(),
            fs_type,
            &["ro".to_string()],
            false,
        )
        .context(format!(
            "Failed to mount '{}' while searching for the root filesystem",
            partition.device_path.display()
        ))?;
        let found = scratch.path().join("etc/fstab").exists();
        mount.clean_close()?;
        if found {
            return Ok(Some(None));
        }
    }

    if partition.fs_type != "btrfs" {
        return Ok(None);
    }

    let mount = Mount::new(
        &partition.device_path,
        scratch.path(),
        fs_type,
        &["ro".to_string(), "subvolid=5".to_string()],
        false,
    )
    .context(format!(
        "Failed to mount btrfs top level of '{}'",
        partition.device_path.display()
    ))?;
    let hit = btrfs::list_subvolumes(scratch.path())?
        .into_iter()
        .find(|subvolume| scratch.path().join(&subvolume.path).join("etc/fstab").exists());
    mount.clean_close()?;

    Ok(hit.map(|subvolume| Some(subvolume.path)))
}

/// Resolves every non-pseudo fstab entry against `partitions`. `/dev` sources
/// lazily invoke `get_kernel_cmdline` (only once topology actually needs the
/// boot configuration) and are interpreted as dm-verity devices when the
/// cmdline carries the matching `systemd.verity_{root,usr}_data=` argument.
pub fn discover_layout<'a>(
    fstab_entries: &'a [FstabEntry],
    partitions: &'a [PartitionInfo],
    mut get_kernel_cmdline: impl FnMut() -> Result<Vec<GrubArg>, Error>,
) -> Result<Vec<ResolvedMount<'a>>, Error> {
    let mut resolved = Vec::with_capacity(fstab_entries.len());
    for entry in fstab_entries.iter().filter(|e| !e.is_pseudo()) {
        let (partition, verity) =
            resolve_source(&entry.source, partitions, &mut get_kernel_cmdline).context(
                format!("Failed to resolve fstab entry for '{}'", entry.target.display()),
            )?;
        resolved.push(ResolvedMount {
            entry,
            partition,
            verity,
        });
    }
    Ok(resolved)
}

fn resolve_source<'a>(
    source: &MountSource,
    partitions: &'a [PartitionInfo],
    get_kernel_cmdline: &mut impl FnMut() -> Result<Vec<GrubArg>, Error>,
) -> Result<(&'a PartitionInfo, Option<VerityDevice>), Error> {
    match source {
        MountSource::Uuid(uuid) => {
            let matches: Vec<&PartitionInfo> = partitions
                .iter()
                .filter(|p| {
                    p.fs_uuid
                        .as_ref()
                        .map(|fs_uuid| fs_uuid.to_string().eq_ignore_ascii_case(uuid))
                        .unwrap_or(false)
                })
                .collect();
            unique_match(matches, &format!("UUID={uuid}")).map(|p| (p, None))
        }
        MountSource::PartUuid(part_uuid) => {
            let uuid = Uuid::parse_str(part_uuid)
                .context(format!("Invalid PARTUUID '{part_uuid}' in fstab"))?;
            let matches: Vec<&PartitionInfo> = partitions
                .iter()
                .filter(|p| p.part_uuid == Some(uuid))
                .collect();
            unique_match(matches, &format!("PARTUUID={part_uuid}")).map(|p| (p, None))
        }
        MountSource::PartLabel(label) => {
            let matches: Vec<&PartitionInfo> = partitions
                .iter()
                .filter(|p| p.part_label.as_deref() == Some(label.as_str()))
                .collect();
            unique_match(matches, &format!("PARTLABEL={label}")).map(|p| (p, None))
        }
        MountSource::DevPath(path) => resolve_dev_path(path, partitions, get_kernel_cmdline),
    }
}

fn resolve_dev_path<'a>(
    path: &Path,
    partitions: &'a [PartitionInfo],
    get_kernel_cmdline: &mut impl FnMut() -> Result<Vec<GrubArg>, Error>,
) -> Result<(&'a PartitionInfo, Option<VerityDevice>), Error> {
    let cmdline = get_kernel_cmdline()?;
    if let Some(verity) = parse_verity_device(path, &cmdline)? {
        let data_partition = find_by_verity_id(partitions, &verity.data_partuuid, verity.data_id_type)
            .context("Verity data partition referenced by kernel cmdline not found")?;
        find_by_verity_id(partitions, &verity.hash_partuuid, verity.hash_id_type)
            .context("Verity hash partition referenced by kernel cmdline not found")?;
        return Ok((data_partition, Some(verity)));
    }

    let matches: Vec<&PartitionInfo> = partitions
        .iter()
        .filter(|p| p.device_path == path)
        .collect();
    unique_match(matches, &path.display().to_string()).map(|p| (p, None))
}

fn find_by_verity_id<'a>(
    partitions: &'a [PartitionInfo],
    id: &str,
    id_type: VerityIdType,
) -> Option<&'a PartitionInfo> {
    match id_type {
        VerityIdType::PartUuid => {
            let uuid = Uuid::parse_str(id).ok()?;
            partitions.iter().find(|p| p.part_uuid == Some(uuid))
        }
        VerityIdType::DevPath => partitions.iter().find(|p| p.device_path == PathBuf::from(id)),
    }
}

/// Interprets a `/dev/mapper/<name>` fstab source as a dm-verity device by
/// reading the matching `systemd.verity_root_*`/`systemd.verity_usr_*`
/// arguments and the corresponding `roothash`/`usrhash` value off the kernel
/// command line. Returns `None` when neither namespace is present, meaning
/// the `/dev` source is a plain device path rather than a verity mapping.
fn parse_verity_device(path: &Path, cmdline: &[GrubArg]) -> Result<Option<VerityDevice>, Error> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    for (namespace, roothash_key) in [("root", "roothash"), ("usr", "usrhash")] {
        let data_key = format!("systemd.verity_{namespace}_data");
        let Some(data_value) = grub::find_arg_value(cmdline, &data_key)? else {
            continue;
        };

        let hash_key = format!("systemd.verity_{namespace}_hash");
        let hash_value = grub::find_arg_value(cmdline, &hash_key)?.context(format!(
            "Kernel cmdline has '{data_key}' but no '{hash_key}'"
        ))?;

        let root_hash = grub::find_arg_value(cmdline, roothash_key)?
            .context(format!(
                "Kernel cmdline has '{data_key}' but no '{roothash_key}'"
            ))?
            .to_string();

        let options_key = format!("systemd.verity_{namespace}_options");
        let corruption_option = grub::find_arg_value(cmdline, &options_key)?.map(str::to_string);

        let (data_partuuid, data_id_type) = parse_verity_id(data_value)?;
        let (hash_partuuid, hash_id_type) = parse_verity_id(hash_value)?;

        return Ok(Some(VerityDevice {
            name,
            root_hash,
            data_partuuid,
            hash_partuuid,
            data_id_type,
            hash_id_type,
            corruption_option,
            hash_signature_path: None,
        }));
    }

    Ok(None)
}

fn parse_verity_id(value: &str) -> Result<(String, VerityIdType), Error> {
    if let Some(rest) = value.strip_prefix("PARTUUID=") {
        Ok((rest.to_string(), VerityIdType::PartUuid))
    } else if value.starts_with("/dev/") {
        Ok((value.to_string(), VerityIdType::DevPath))
    } else {
        bail!("Unrecognized verity device identifier form '{value}'")
    }
}

fn unique_match<'a>(matches: Vec<&'a PartitionInfo>, source_desc: &str) -> Result<&'a PartitionInfo, Error> {
    match matches.as_slice() {
        [single] => Ok(single),
        [] => bail!("fstab source '{source_desc}' does not resolve to any partition"),
        multiple => bail!(
            "fstab source '{source_desc}' resolves to {} partitions, expected exactly one",
            multiple.len()
        ),
    }
}
