//! Customization Orchestrator (C10): drives the full pipeline described by
//! spec §4.10 — attach, discover topology, mount and chroot, apply
//! customizations (delegated to the caller), unmount, reset identifiers,
//! rewrite fstab, optionally shrink, recompute a verity root hash if one was
//! found, extract and package the result, detach.
//!
//! Instrumented with `tracing::instrument` around each numbered stage,
//! grounded on the `#[tracing::instrument(name = "...", skip_all)]` usage in
//! the teacher's `src/engine/newroot.rs` and elsewhere under `src/engine/`.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use tracing::instrument;
use uuid::Uuid;

use imgcust_api::{
    error::{
        FilesystemOperationError, ImageConversionError, ImageCustomizerError,
        ImageCustomizerResultExt, InternalSystemError, ReportError,
    },
    model::{FstabEntry, FsType, ImageUuid, MountSource, PartitionInfo, VerityDevice},
};
use osutils::{
    bootloader::{self, BootConfig},
    chroot,
    filesystems::MountFileSystemType,
    fsops,
    loopback::Loopback,
    lsblk,
    partition_types::DiscoverablePartitionType,
    qemu_img::{self, QemuImgFormat},
    sfdisk,
    tabfile::TabFile,
    veritysetup,
};
use sysdefs::arch::SystemArchitecture;

use crate::{
    cosi::{self, CosiPartition},
    extract::{self, Encoding},
    shrink,
    topology::{self, ResolvedMount},
};

/// The artifact the pipeline's final stage should produce.
pub enum OutputRequest {
    /// A COSI archive: `metadata.json` plus each partition blob, packed as a
    /// PAX tar (C9).
    Cosi { path: PathBuf, encoding: Encoding },
    /// The same per-partition blobs and metadata document C9 would pack,
    /// written loose into a directory instead of a tar.
    BareMetalImage {
        directory: PathBuf,
        encoding: Encoding,
    },
    /// Re-encode the (possibly customized) raw disk image into another
    /// container format via `qemu-img`.
    Convert { path: PathBuf, format: QemuImgFormat },
}

/// One pipeline invocation's input. `apply_customizations` runs while the
/// process is chrooted into the mounted root; this engine never inspects or
/// drives package installation or script hooks itself (both are out of
/// scope per spec §1), so the caller supplies whatever it needs as a single
/// closure invoked at the right point in the state machine.
pub struct CustomizeRequest<'a> {
    pub image_path: &'a Path,
    pub work_dir: &'a Path,
    pub reset_identifiers: bool,
    pub shrink: bool,
    /// Whether `image_path` was itself produced by this engine ("native"
    /// mode) rather than imported from elsewhere ("convert" mode). Native
    /// images are known to already have their filesystems sized tightly to
    /// their partitions, so [`shrink_stage`] can skip the coverage guard
    /// that otherwise protects foreign images from an unsafe shrink.
    pub produced_by_tool: bool,
    pub output: OutputRequest,
}

/// One fstab entry resolved to a concrete partition, detached from the
/// borrowed [`ResolvedMount`] so it can outlive the partition snapshot that
/// produced it across the pipeline's re-snapshot points.
struct OwnedResolvedMount {
    target: PathBuf,
    vfs_flags: Vec<String>,
    fs_options: Vec<String>,
    partition_index: usize,
    verity: Option<VerityDevice>,
}

/// Runs the full customization pipeline against `request.image_path`,
/// invoking `apply_customizations` once the image's root filesystem is
/// mounted and chrooted into. Returns once the requested output artifact has
/// been written; the loopback attachment is always detached before
/// returning, success or failure, via RAII.
#[instrument(name = "customize", skip_all)]
pub fn customize(
    request: CustomizeRequest,
    apply_customizations: impl FnOnce() -> Result<(), Error>,
) -> Result<(), ImageCustomizerError> {
    run(request, apply_customizations).message("Image customization pipeline failed")
}

fn run(
    request: CustomizeRequest,
    apply_customizations: impl FnOnce() -> Result<(), Error>,
) -> Result<(), ImageCustomizerError> {
    let loopback = attach(request.image_path)?;
    let disk_device_path = loopback.device_path().to_owned();

    let mut partitions = snapshot(&disk_device_path)?;

    let (boot_config, fstab_text, _root_partition_index, root_subvolume, os_release) =
        discover_boot_and_root(request.work_dir, &partitions)?;

    let fstab_entries = parse_fstab(&fstab_text)?;
    let cmdline: Result<Vec<imgcust_api::model::GrubArg>, String> = boot_config
        .single_command_line()
        .map(<[_]>::to_vec)
        .map_err(|e| format!("{e:#}"));
    let mut get_cmdline = || -> Result<Vec<imgcust_api::model::GrubArg>, Error> {
        cmdline
            .clone()
            .map_err(anyhow::Error::msg)
            .context("No kernel command line available to resolve a /dev mount source")
    };

    let resolved = topology::discover_layout(&fstab_entries, &partitions, &mut get_cmdline)
        .structured(FilesystemOperationError::TopologyResolution)?;
    let owned_resolved = own_resolved_mounts(&partitions, &resolved);
    drop(resolved);

    let has_verity = owned_resolved.iter().any(|m| m.verity.is_some());
    if has_verity && request.reset_identifiers {
        return Err(ImageCustomizerError::new(InternalSystemError::NotImplemented {
            reason: "resetting partition identifiers on a verity-protected image is not implemented".into(),
        }));
    }

    let image_uuid = ImageUuid::generate();

    apply_customizations_stage(
        request.work_dir,
        &partitions,
        root_subvolume.as_deref(),
        &owned_resolved,
        &image_uuid,
        apply_customizations,
    )?;

    if request.reset_identifiers {
        reset_identifiers_stage(&disk_device_path, &mut partitions, request.work_dir)?;
    }

    if request.shrink {
        shrink_stage(&disk_device_path, &mut partitions, request.produced_by_tool)?;
    }

    let verity_root_hashes = recompute_verity_stage(&partitions, &owned_resolved)?;

    package_stage(
        request.image_path,
        request.work_dir,
        &partitions,
        &owned_resolved,
        &verity_root_hashes,
        &os_release,
        &image_uuid,
        request.output,
    )?;

    loopback
        .clean_close()
        .structured(ImageConversionError::LoopbackDetach {
            device: disk_device_path.display().to_string(),
        })?;

    Ok(())
}

#[instrument(skip_all)]
fn attach(image_path: &Path) -> Result<Loopback, ImageCustomizerError> {
    Loopback::attach(image_path).structured(ImageConversionError::LoopbackAttach {
        path: image_path.display().to_string(),
    })
}

#[instrument(skip_all)]
fn snapshot(disk_device_path: &Path) -> Result<Vec<PartitionInfo>, ImageCustomizerError> {
    lsblk::list_partitions(disk_device_path).structured(InternalSystemError::Internal(
        "failed to list partitions on attached disk",
    ))
}

/// Mounts the ESP and boot partitions read-only long enough to recover the
/// active bootloader configuration and, via a read-only mount of the root
/// filesystem candidate, the inherited `/etc/fstab` and `/etc/os-release`.
/// Each scratch mount is released before this function returns.
#[instrument(skip_all)]
fn discover_boot_and_root(
    work_dir: &Path,
    partitions: &[PartitionInfo],
) -> Result<(BootConfig, String, usize, Option<String>, String), ImageCustomizerError> {
    let esp = topology::find_system_boot(partitions).structured(
        imgcust_api::error::InvalidInputError::UnknownPartition {
            id: "esp-or-bios-boot".into(),
        },
    )?;

    let esp_scratch = work_dir.join("mnt/esp");
    let esp_mount = mount_ro(&esp.device_path, &esp.fs_type, &esp_scratch)?;

    let boot_partition = topology::find_boot_from_esp(esp_mount.target(), partitions)
        .unwrap_or(esp)
        .clone();
    esp_mount
        .clean_close()
        .structured(FilesystemOperationError::Unmount {
            mount_point: esp_scratch.display().to_string(),
        })?;

    let boot_scratch = work_dir.join("mnt/boot");
    let boot_mount = mount_ro(&boot_partition.device_path, &boot_partition.fs_type, &boot_scratch)?;
    let boot_config = bootloader::discover(boot_mount.target()).structured(
        FilesystemOperationError::Mount {
            device: boot_partition.device_path.display().to_string(),
            mount_point: boot_scratch.display().to_string(),
        },
    )?;
    boot_mount
        .clean_close()
        .structured(FilesystemOperationError::Unmount {
            mount_point: boot_scratch.display().to_string(),
        })?;

    let (root_partition, subvolume) = topology::find_rootfs(partitions).structured(
        imgcust_api::error::InvalidInputError::UnknownPartition {
            id: "rootfs".into(),
        },
    )?;
    let root_index = partitions
        .iter()
        .position(|p| p == root_partition)
        .context("Resolved root partition vanished from its own snapshot")
        .structured(InternalSystemError::Internal("root partition index lookup failed"))?;

    let root_scratch = work_dir.join("mnt/rootfs-discovery");
    let mut options = vec![];
    if let Some(subvolume) = &subvolume {
        options.push(format!("subvol={subvolume}"));
    }
    let root_mount = osutils::mount::Mount::new(
        &root_partition.device_path,
        &root_scratch,
        MountFileSystemType::from_fs_type(&FsType::parse(&root_partition.fs_type))
            .structured(InternalSystemError::Internal("unsupported root filesystem type"))?,
        &options,
        true,
    )
    .structured(FilesystemOperationError::Mount {
        device: root_partition.device_path.display().to_string(),
        mount_point: root_scratch.display().to_string(),
    })?;

    let fstab_text = std::fs::read_to_string(root_mount.target().join("etc/fstab"))
        .structured(InternalSystemError::Internal("failed to read /etc/fstab"))?;
    let os_release =
        std::fs::read_to_string(root_mount.target().join("etc/os-release")).unwrap_or_default();

    root_mount
        .clean_close()
        .structured(FilesystemOperationError::Unmount {
            mount_point: root_scratch.display().to_string(),
        })?;

    Ok((boot_config, fstab_text, root_index, subvolume, os_release))
}

fn mount_ro(
    device_path: &Path,
    fs_type: &str,
    target: &Path,
) -> Result<osutils::mount::Mount, ImageCustomizerError> {
    osutils::mount::Mount::new(
        device_path,
        target,
        MountFileSystemType::from_fs_type(&FsType::parse(fs_type))
            .structured(InternalSystemError::Internal("unsupported filesystem type"))?,
        &["ro".to_string()],
        true,
    )
    .structured(FilesystemOperationError::Mount {
        device: device_path.display().to_string(),
        mount_point: target.display().to_string(),
    })
}

fn parse_fstab(fstab_text: &str) -> Result<Vec<FstabEntry>, ImageCustomizerError> {
    let tab = TabFile::parse(fstab_text)
        .structured(imgcust_api::error::InvalidInputError::UnknownMountPoint {
            path: "/etc/fstab".into(),
        })?;
    Ok(tab.entries().cloned().collect())
}

/// Converts the borrowed resolver output into an owned form keyed by index
/// into `partitions`, so it survives the re-snapshots later pipeline stages
/// perform.
fn own_resolved_mounts(
    partitions: &[PartitionInfo],
    resolved: &[ResolvedMount<'_>],
) -> Vec<OwnedResolvedMount> {
    resolved
        .iter()
        .filter_map(|mount| {
            let partition_index = partitions.iter().position(|p| p == mount.partition)?;
            Some(OwnedResolvedMount {
                target: mount.entry.target.clone(),
                vfs_flags: mount.entry.vfs_flags.clone(),
                fs_options: mount.entry.fs_options.clone(),
                partition_index,
                verity: mount.verity.clone(),
            })
        })
        .collect()
}

/// Mounts every resolved entry read-write under `work_dir/root`, shallowest
/// target first so parent directories exist before their children are
/// mounted onto them, enters a chroot, runs `apply_customizations`, then
/// unmounts everything in reverse order.
#[instrument(skip_all)]
fn apply_customizations_stage(
    work_dir: &Path,
    partitions: &[PartitionInfo],
    root_subvolume: Option<&str>,
    resolved: &[OwnedResolvedMount],
    image_uuid: &ImageUuid,
    apply_customizations: impl FnOnce() -> Result<(), Error>,
) -> Result<(), ImageCustomizerError> {
    let root_dir = work_dir.join("root");

    let mut ordered: Vec<&OwnedResolvedMount> = resolved.iter().collect();
    ordered.sort_by_key(|m| m.target.components().count());

    let mut mounts = Vec::new();
    for entry in &ordered {
        let partition = &partitions[entry.partition_index];
        let target = target_under(&root_dir, &entry.target);
        let mut options = rw_mount_options(entry);
        if entry.target == Path::new("/") {
            if let Some(subvolume) = root_subvolume {
                options.push(format!("subvol={subvolume}"));
            }
        }

        let mount = osutils::mount::Mount::new(
            &partition.device_path,
            &target,
            MountFileSystemType::from_fs_type(&FsType::parse(&partition.fs_type))
                .structured(InternalSystemError::Internal("unsupported filesystem type"))?,
            &options,
            true,
        )
        .structured(FilesystemOperationError::Mount {
            device: partition.device_path.display().to_string(),
            mount_point: target.display().to_string(),
        })?;
        mounts.push(mount);
    }

    let chroot = chroot::enter_update_chroot(&root_dir).structured(
        FilesystemOperationError::ChrootEnter {
            path: root_dir.display().to_string(),
        },
    )?;

    let customization_result = apply_customizations();

    chroot
        .clean_close()
        .structured(FilesystemOperationError::ChrootExit)?;

    customization_result.structured(FilesystemOperationError::Mount {
        device: "customizations".into(),
        mount_point: root_dir.display().to_string(),
    })?;

    write_release_file(&root_dir, image_uuid)?;

    for mount in mounts.into_iter().rev() {
        let target = mount.target().to_owned();
        mount
            .clean_close()
            .structured(FilesystemOperationError::Unmount {
                mount_point: target.display().to_string(),
            })?;
    }

    Ok(())
}

/// Writes `/etc/image-customizer-release` into the mounted root (spec §6),
/// stamping this pipeline run's tool version, build timestamp, and image
/// UUID so it can be correlated with the UUID carried by the COSI
/// metadata/skippable frame when one is produced.
fn write_release_file(root_dir: &Path, image_uuid: &ImageUuid) -> Result<(), ImageCustomizerError> {
    let contents = format!(
        "TOOL_VERSION=\"{}\"\nBUILD_DATE=\"{}\"\nIMAGE_UUID=\"{}\"\n",
        env!("CARGO_PKG_VERSION"),
        chrono::Utc::now().to_rfc3339(),
        image_uuid.to_hex(),
    );
    std::fs::write(root_dir.join("etc/image-customizer-release"), contents).structured(
        InternalSystemError::Internal("failed to write /etc/image-customizer-release"),
    )
}

fn target_under(root: &Path, target: &Path) -> PathBuf {
    match target.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(target),
    }
}

/// Strips `ro` (always) and `noexec` (root only) from `entry.vfs_flags` —
/// the generic VFS flags the spec's read-write remount (§4.5) needs dropped —
/// and passes every filesystem-specific option in `entry.fs_options` through
/// untouched.
fn rw_mount_options(entry: &OwnedResolvedMount) -> Vec<String> {
    entry
        .vfs_flags
        .iter()
        .filter(|o| o.as_str() != "ro" && !(entry.target == Path::new("/") && o.as_str() == "noexec"))
        .cloned()
        .chain(entry.fs_options.iter().cloned())
        .collect()
}

/// Resets every formatted partition's fs-UUID and PART-UUID (spec §4.6),
/// then rewrites `/etc/fstab` with the new identifiers and re-snapshots so
/// later stages see up-to-date values.
#[instrument(skip_all)]
fn reset_identifiers_stage(
    disk_device_path: &Path,
    partitions: &mut Vec<PartitionInfo>,
    work_dir: &Path,
) -> Result<(), ImageCustomizerError> {
    let mut new_fs_uuids: HashMap<String, String> = HashMap::new();
    let mut new_part_uuids: HashMap<String, String> = HashMap::new();
    let mut root_partition_index = None;

    for (index, partition) in partitions.iter().enumerate() {
        if !partition.is_partition() || partition.fs_type.is_empty() {
            continue;
        }
        if partition.mount_point.as_deref() == Some(Path::new("/")) {
            root_partition_index = Some(index);
        }

        let fs_type = FsType::parse(&partition.fs_type);
        let new_uuid = fsops::reset_uuid(&fs_type, &partition.device_path).structured(
            FilesystemOperationError::ResetFilesystemUuid {
                device: partition.device_path.display().to_string(),
            },
        )?;
        if let Some(old) = &partition.fs_uuid {
            new_fs_uuids.insert(old.to_string().to_lowercase(), new_uuid);
        }

        let partition_num = partition_number(disk_device_path, &partition.device_path)
            .structured(InternalSystemError::Internal("failed to determine partition number"))?;
        let new_part_uuid = Uuid::new_v4();
        sfdisk::set_part_uuid(disk_device_path, partition_num, new_part_uuid).structured(
            FilesystemOperationError::ResetPartitionUuid {
                device: partition.device_path.display().to_string(),
            },
        )?;
        if let Some(old) = partition.part_uuid {
            new_part_uuids.insert(old.to_string().to_lowercase(), new_part_uuid.to_string());
        }
    }

    let expected_partitions = partitions.iter().filter(|p| p.is_partition()).count();
    lsblk::refresh(disk_device_path, expected_partitions).structured(
        InternalSystemError::Internal("partition table did not settle after UUID reset"),
    )?;
    *partitions = snapshot(disk_device_path)?;

    if let Some(root_index) = root_partition_index {
        rewrite_fstab(
            work_dir,
            &partitions[root_index],
            &new_fs_uuids,
            &new_part_uuids,
        )?;
    }

    Ok(())
}

fn rewrite_fstab(
    work_dir: &Path,
    root_partition: &PartitionInfo,
    new_fs_uuids: &HashMap<String, String>,
    new_part_uuids: &HashMap<String, String>,
) -> Result<(), ImageCustomizerError> {
    let scratch = work_dir.join("mnt/rootfs-fstab-rewrite");
    let mount = mount_ro(&root_partition.device_path, &root_partition.fs_type, &scratch)?;
    let fstab_path = mount.target().join("etc/fstab");

    let mut tab = TabFile::read(&fstab_path)
        .structured(imgcust_api::error::InvalidInputError::UnknownMountPoint {
            path: fstab_path.display().to_string(),
        })?;
    tab.rewrite_sources(|source| match source {
        MountSource::Uuid(old) => new_fs_uuids
            .get(&old.to_lowercase())
            .map(|new| MountSource::Uuid(new.clone())),
        MountSource::PartUuid(old) => new_part_uuids
            .get(&old.to_lowercase())
            .map(|new| MountSource::PartUuid(new.clone())),
        MountSource::PartLabel(_) | MountSource::DevPath(_) => None,
    });
    tab.write(&fstab_path)
        .structured(FilesystemOperationError::RewriteFstab {
            mount_point: fstab_path.display().to_string(),
        })?;

    mount
        .clean_close()
        .structured(FilesystemOperationError::Unmount {
            mount_point: scratch.display().to_string(),
        })
}

#[instrument(skip_all)]
fn shrink_stage(
    disk_device_path: &Path,
    partitions: &mut Vec<PartitionInfo>,
    produced_by_tool: bool,
) -> Result<(), ImageCustomizerError> {
    let expected_partitions = partitions.iter().filter(|p| p.is_partition()).count();

    for partition in partitions.iter() {
        if !partition.is_partition() {
            continue;
        }
        let fs_type = FsType::parse(&partition.fs_type);
        if !fsops::can_shrink(&fs_type) {
            continue;
        }
        let should_shrink = shrink::should_shrink(
            &fs_type,
            partition,
            &partition.device_path,
            produced_by_tool,
        )
        .structured(FilesystemOperationError::Shrink {
            device: partition.device_path.display().to_string(),
        })?;
        if !should_shrink {
            continue;
        }

        let partition_num = partition_number(disk_device_path, &partition.device_path)
            .structured(InternalSystemError::Internal("failed to determine partition number"))?;
        shrink::shrink_partition(
            disk_device_path,
            &partition.device_path,
            partition_num,
            expected_partitions,
        )
        .structured(FilesystemOperationError::Shrink {
            device: partition.device_path.display().to_string(),
        })?;
    }

    *partitions = snapshot(disk_device_path)?;
    Ok(())
}

/// For every resolved mount carrying verity metadata, recomputes the root
/// hash against the current (possibly reset/shrunk) data and hash
/// partitions and returns it keyed by the data partition's device path, for
/// the packaging stage to attach to the matching COSI entry.
#[instrument(skip_all)]
fn recompute_verity_stage(
    partitions: &[PartitionInfo],
    resolved: &[OwnedResolvedMount],
) -> Result<HashMap<PathBuf, String>, ImageCustomizerError> {
    let mut root_hashes = HashMap::new();
    for entry in resolved {
        let Some(verity) = &entry.verity else {
            continue;
        };
        let data_partition = &partitions[entry.partition_index];
        let hash_partition = find_verity_hash_partition(partitions, verity).structured(
            FilesystemOperationError::ResetFilesystemUuid {
                device: data_partition.device_path.display().to_string(),
            },
        )?;

        let root_hash = veritysetup::format(&data_partition.device_path, &hash_partition.device_path)
            .structured(FilesystemOperationError::ResetFilesystemUuid {
                device: hash_partition.device_path.display().to_string(),
            })?;
        root_hashes.insert(data_partition.device_path.clone(), root_hash);
    }
    Ok(root_hashes)
}

fn find_verity_hash_partition<'a>(
    partitions: &'a [PartitionInfo],
    verity: &VerityDevice,
) -> Result<&'a PartitionInfo, Error> {
    partitions
        .iter()
        .find(|p| {
            p.part_uuid
                .map(|u| u.to_string().eq_ignore_ascii_case(&verity.hash_partuuid))
                .unwrap_or(false)
                || p.device_path == PathBuf::from(&verity.hash_partuuid)
        })
        .context("Verity hash partition referenced by cmdline no longer present in snapshot")
}

/// Extracts every partition carrying a resolved mount, builds the requested
/// output artifact, and removes intermediate raw blobs on success.
#[instrument(skip_all)]
fn package_stage(
    work_dir: &Path,
    partitions: &[PartitionInfo],
    resolved: &[OwnedResolvedMount],
    verity_root_hashes: &HashMap<PathBuf, String>,
    os_release: &str,
    image_uuid: &ImageUuid,
    output: OutputRequest,
) -> Result<(), ImageCustomizerError> {
    match output {
        OutputRequest::Convert { path, format } => {
            // Convert reads straight from the attached image's backing file;
            // no per-partition extraction is needed for this output kind.
            let _ = (partitions, resolved, verity_root_hashes, os_release, work_dir, image_uuid);
            return qemu_img::convert(&path, &path, format).structured(
                ImageConversionError::Convert {
                    format: format_name(format),
                },
            );
        }
        OutputRequest::Cosi { path, encoding } => {
            let extract_dir = work_dir.join("extract");
            std::fs::create_dir_all(&extract_dir)
                .structured(InternalSystemError::Internal("failed to create extraction scratch directory"))?;

            let cosi_partitions = build_cosi_partitions(
                &extract_dir,
                partitions,
                resolved,
                verity_root_hashes,
                encoding,
                image_uuid,
            )?;
            let images = cosi::build_entries(&cosi_partitions);
            let metadata = imgcust_api::model::CosiMetadata::new(
                *image_uuid,
                SystemArchitecture::current(),
                os_release.to_string(),
                Vec::new(),
                images,
            );
            cosi::pack(&path, &metadata, &cosi_partitions).structured(ImageConversionError::CosiPack)?;
            std::fs::remove_dir_all(&extract_dir).ok();
        }
        OutputRequest::BareMetalImage { directory, encoding } => {
            std::fs::create_dir_all(&directory)
                .structured(InternalSystemError::Internal("failed to create bare-metal-image output directory"))?;

            let cosi_partitions = build_cosi_partitions(
                &directory,
                partitions,
                resolved,
                verity_root_hashes,
                encoding,
                image_uuid,
            )?;
            let images = cosi::build_entries(&cosi_partitions);
            let metadata = imgcust_api::model::CosiMetadata::new(
                *image_uuid,
                SystemArchitecture::current(),
                os_release.to_string(),
                Vec::new(),
                images,
            );
            let metadata_path = directory.join("metadata.json");
            let metadata_json = serde_json::to_vec_pretty(&metadata)
                .structured(InternalSystemError::Internal("failed to serialize bare-metal-image metadata"))?;
            std::fs::write(&metadata_path, metadata_json).structured(InternalSystemError::Internal(
                "failed to write bare-metal-image metadata.json",
            ))?;
        }
    }
    Ok(())
}

/// COSI's `part_type` field names a discoverable partition type when one
/// applies, falling back to the raw type UUID hex-encoded otherwise.
fn part_type_name(uuid: &Uuid) -> String {
    let discovered = DiscoverablePartitionType::from_uuid(uuid);
    if discovered.is_unknown() {
        hex::encode(uuid.as_bytes())
    } else {
        discovered.to_str().to_string()
    }
}

fn format_name(format: QemuImgFormat) -> String {
    match format {
        QemuImgFormat::Raw => "raw",
        QemuImgFormat::Qcow2 => "qcow2",
        QemuImgFormat::Vpc => "vhd",
        QemuImgFormat::VhdxDynamic => "vhdx",
    }
    .to_string()
}

fn build_cosi_partitions(
    out_dir: &Path,
    partitions: &[PartitionInfo],
    resolved: &[OwnedResolvedMount],
    verity_root_hashes: &HashMap<PathBuf, String>,
    encoding: Encoding,
    image_uuid: &ImageUuid,
) -> Result<Vec<CosiPartition>, ImageCustomizerError> {
    let mut out = Vec::with_capacity(resolved.len());
    for (i, entry) in resolved.iter().enumerate() {
        let partition = &partitions[entry.partition_index];
        let fs_type = FsType::parse(&partition.fs_type);
        let stem = format!("part{i}");

        let blob = extract::extract_partition(
            &partition.device_path,
            &fs_type,
            out_dir,
            &stem,
            encoding,
            image_uuid,
        )
        .structured(ImageConversionError::ExtractPartition { index: i as u32 })?;

        let verity = match verity_root_hashes.get(&partition.device_path) {
            Some(root_hash) => {
                let hash_partition = entry
                    .verity
                    .as_ref()
                    .and_then(|v| find_verity_hash_partition(partitions, v).ok())
                    .context("Verity metadata present without a resolvable hash partition")
                    .structured(ImageConversionError::ExtractPartition { index: i as u32 })?;
                let hash_blob = extract::extract_partition(
                    &hash_partition.device_path,
                    &FsType::DmVerityHash,
                    out_dir,
                    &format!("{stem}-hash"),
                    encoding,
                    image_uuid,
                )
                .structured(ImageConversionError::ExtractPartition { index: i as u32 })?;
                Some((root_hash.clone(), hash_blob))
            }
            None => None,
        };

        out.push(CosiPartition {
            blob,
            mount_point: entry.target.clone(),
            fs_type: partition.fs_type.clone(),
            fs_uuid: partition.fs_uuid.as_ref().map(|u| u.to_string()),
            part_type: partition
                .part_type_uuid
                .map(|uuid| part_type_name(&uuid))
                .unwrap_or_else(|| "unknown".to_string()),
            verity,
        });
    }
    Ok(out)
}

/// Derives a partition's table index (the `N` in `sfdisk -N`) from its
/// kernel device-node name, which is always `<disk><sep>p<N>` for a loop
/// device's partition children.
fn partition_number(disk_device_path: &Path, partition_device_path: &Path) -> Result<u32, Error> {
    let disk = disk_device_path.display().to_string();
    let partition = partition_device_path.display().to_string();
    let suffix = partition
        .strip_prefix(&disk)
        .context(format!("'{partition}' is not a child of disk '{disk}'"))?;
    let digits = suffix
        .strip_prefix('p')
        .context(format!("'{partition}' does not use the expected '<disk>p<N>' naming"))?;
    digits
        .parse()
        .context(format!("'{partition}' has a non-numeric partition suffix"))
}
