//! Shared data model for the image customization engine: partition snapshots,
//! fstab entries, verity devices, bootloader tokens and the output metadata
//! produced by the extractor. These types are the contract between the
//! disk inspector, topology resolver, filesystem ops and the orchestrator.

use std::path::PathBuf;

use serde::{Deserialize, Serialize, Serializer};
use sysdefs::{arch::SystemArchitecture, osuuid::OsUuid};
use uuid::Uuid;

use crate::primitives::{ByteCount, Sha384Hash};

/// One discovered partition, as reported by the disk inspector (C3) for a
/// single point-in-time snapshot of a block device's partition table.
///
/// No two snapshots of the same disk are valid at once: any partition-table
/// or filesystem mutation invalidates the snapshot it was taken from, and
/// the orchestrator must re-inspect before trusting indices/UUIDs again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub device_path: PathBuf,
    pub kind: PartitionKind,
    pub part_type_uuid: Option<Uuid>,
    /// Empty when the partition is unformatted.
    pub fs_type: String,
    pub fs_uuid: Option<OsUuid>,
    pub part_uuid: Option<Uuid>,
    pub part_label: Option<String>,
    pub size: ByteCount,
    pub mount_point: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Partition,
    Disk,
}

impl PartitionInfo {
    pub fn is_partition(&self) -> bool {
        self.kind == PartitionKind::Partition
    }
}

/// A single `/etc/fstab` line, decomposed into its six canonical fields.
/// The options column is split in two: `vfs_flags` holds the generic,
/// filesystem-independent flags `mount(8)` itself interprets (`ro`,
/// `noexec`, `defaults`, ...), while `fs_options` holds whatever is left —
/// options a specific filesystem driver interprets (`subvol=`,
/// `data=ordered`, ...). The split is what lets the orchestrator strip
/// `MS_RDONLY`/`MS_NOEXEC` (§4.5) by editing `vfs_flags` alone, leaving
/// filesystem-specific options untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub source: MountSource,
    pub target: PathBuf,
    pub fs_type: String,
    pub vfs_flags: Vec<String>,
    pub fs_options: Vec<String>,
    pub dump: u32,
    pub pass: u32,
}

/// Pseudo-filesystems that never resolve to a real partition and must be
/// filtered out before topology resolution runs.
pub const PSEUDO_FILESYSTEMS: &[&str] = &["devtmpfs", "proc", "sysfs", "devpts", "tmpfs"];

impl FstabEntry {
    pub fn is_pseudo(&self) -> bool {
        PSEUDO_FILESYSTEMS.contains(&self.fs_type.as_str())
    }
}

/// The tagged form an fstab `source` field can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Uuid(String),
    PartUuid(String),
    PartLabel(String),
    DevPath(PathBuf),
}

impl MountSource {
    /// Parses a raw fstab source column into its tagged form. Any string
    /// that isn't a recognized `KEY=value` prefix is treated as a device
    /// path, matching how `mount(8)` itself falls back.
    pub fn parse(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix("UUID=") {
            MountSource::Uuid(rest.to_string())
        } else if let Some(rest) = raw.strip_prefix("PARTUUID=") {
            MountSource::PartUuid(rest.to_string())
        } else if let Some(rest) = raw.strip_prefix("PARTLABEL=") {
            MountSource::PartLabel(rest.to_string())
        } else {
            MountSource::DevPath(PathBuf::from(raw))
        }
    }

    pub fn render(&self) -> String {
        match self {
            MountSource::Uuid(s) => format!("UUID={s}"),
            MountSource::PartUuid(s) => format!("PARTUUID={s}"),
            MountSource::PartLabel(s) => format!("PARTLABEL={s}"),
            MountSource::DevPath(p) => p.display().to_string(),
        }
    }
}

/// A dm-verity device resolved from a `/dev/mapper/<name>` fstab source plus
/// the kernel cmdline arguments that describe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityDevice {
    pub name: String,
    pub root_hash: String,
    pub data_partuuid: String,
    pub hash_partuuid: String,
    pub data_id_type: VerityIdType,
    pub hash_id_type: VerityIdType,
    pub corruption_option: Option<String>,
    pub hash_signature_path: Option<PathBuf>,
}

/// Whether a verity cmdline argument identified its device by `PARTUUID=` or
/// a bare device path. Both forms are seen in practice; the resolver records
/// which one it parsed so error messages can cite the original token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerityIdType {
    PartUuid,
    DevPath,
}

/// A single token from a tokenized kernel/GRUB command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrubArg {
    pub key: String,
    pub value: Option<String>,
    pub raw_token: String,
}

/// Metadata about a partition as it was extracted to an output artifact.
/// Populated by the artifact extractor (C8) after a successful copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPartitionMetadata {
    pub partition_num: u32,
    pub filename: String,
    pub part_label: Option<String>,
    pub fs_type: String,
    pub part_type_uuid: Option<Uuid>,
    pub fs_uuid: Option<String>,
    pub part_uuid: Option<Uuid>,
    pub mountpoint: Option<PathBuf>,
    pub uncompressed_size: u64,
}

/// A 16-byte identifier used both as the Zstd skippable-frame payload of
/// every extracted partition blob and, hex-encoded, as a COSI's `id` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageUuid([u8; 16]);

impl ImageUuid {
    pub fn new(bytes: [u8; 16]) -> Self {
        ImageUuid(bytes)
    }

    pub fn generate() -> Self {
        ImageUuid(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes: Vec<u8> = hex::decode(s)?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(ImageUuid(arr))
    }
}

impl Serialize for ImageUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ImageUuid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ImageUuid::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The closed set of filesystem types that C6 operations dispatch on. Each
/// case implements check_ro / can_shrink / reset_uuid in `osutils`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Vfat,
    DmVerityHash,
    Other(String),
}

impl FsType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "" => FsType::Other(String::new()),
            "ext2" => FsType::Ext2,
            "ext3" => FsType::Ext3,
            "ext4" => FsType::Ext4,
            "xfs" => FsType::Xfs,
            "btrfs" => FsType::Btrfs,
            "vfat" => FsType::Vfat,
            "DM_verity_hash" => FsType::DmVerityHash,
            other => FsType::Other(other.to_string()),
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, FsType::Ext2 | FsType::Ext3 | FsType::Ext4)
    }
}

/// The fixed COSI metadata schema version this engine produces. Readers that
/// understand a different `version` must refuse the file rather than guess.
pub const COSI_METADATA_VERSION: &str = "1.0";

/// One compressed partition blob inside a COSI archive: its tar path, its
/// size before and after compression, and the SHA-384 of the bytes actually
/// written to the tar (the compressed blob, skippable frame included).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageFile {
    pub path: String,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub sha384: Sha384Hash,
}

/// dm-verity metadata attached to a COSI partition entry: the root hash and
/// the hash-tree image, referenced the same way as the data image itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerityMetadata {
    pub roothash: String,
    pub image: ImageFile,
}

/// One partition entry in a COSI manifest's `images` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemEntry {
    pub image: ImageFile,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub fs_uuid: Option<String>,
    /// The discoverable partition type this blob was tagged with, or the raw
    /// type UUID hex-encoded when no discoverable type name applies.
    pub part_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub verity: Option<VerityMetadata>,
}

/// One package recorded in `osPackages`; `release` and `arch` round out the
/// name/version pair the original distillation carried, matching what a
/// package manager's own query tooling reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsPackage {
    pub name: String,
    pub version: String,
    pub release: String,
    pub arch: String,
}

/// The top-level `metadata.json` document packed as the first member of a
/// COSI archive. `id` is the same 16-byte identifier carried in every
/// `.raw.zst` member's skippable frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CosiMetadata {
    pub version: String,
    pub os_arch: SystemArchitecture,
    pub id: ImageUuid,
    pub os_release: String,
    pub os_packages: Vec<OsPackage>,
    pub images: Vec<FileSystemEntry>,
}

impl CosiMetadata {
    pub fn new(
        id: ImageUuid,
        os_arch: SystemArchitecture,
        os_release: String,
        os_packages: Vec<OsPackage>,
        images: Vec<FileSystemEntry>,
    ) -> Self {
        CosiMetadata {
            version: COSI_METADATA_VERSION.to_string(),
            os_arch,
            id,
            os_release,
            os_packages,
            images,
        }
    }
}
