use anyhow::bail;
use imgcust_api::model::FsType;

/// File system types accepted by `mount(2)`/`sys_mount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountFileSystemType {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Vfat,
    Iso9660,
    Tmpfs,
    Auto,
    Overlay,
}

/// File system types recognized in an `/etc/fstab` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabFileSystemType {
    Auto,
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Vfat,
    Iso9660,
    Tmpfs,
    Swap,
    Overlay,
}

impl MountFileSystemType {
    pub fn name(self) -> &'static str {
        match self {
            MountFileSystemType::Ext2 => "ext2",
            MountFileSystemType::Ext3 => "ext3",
            MountFileSystemType::Ext4 => "ext4",
            MountFileSystemType::Xfs => "xfs",
            MountFileSystemType::Btrfs => "btrfs",
            MountFileSystemType::Vfat => "vfat",
            MountFileSystemType::Iso9660 => "iso9660",
            MountFileSystemType::Tmpfs => "tmpfs",
            MountFileSystemType::Auto => "auto",
            MountFileSystemType::Overlay => "overlay",
        }
    }

    pub fn from_fs_type(fs_type: &FsType) -> Result<Self, anyhow::Error> {
        Ok(match fs_type {
            FsType::Ext2 => MountFileSystemType::Ext2,
            FsType::Ext3 => MountFileSystemType::Ext3,
            FsType::Ext4 => MountFileSystemType::Ext4,
            FsType::Xfs => MountFileSystemType::Xfs,
            FsType::Btrfs => MountFileSystemType::Btrfs,
            FsType::Vfat => MountFileSystemType::Vfat,
            FsType::DmVerityHash => bail!("'DM_verity_hash' device is not mountable"),
            FsType::Other(other) => bail!("Unsupported file system type for mounting: '{other}'"),
        })
    }
}

impl std::fmt::Display for MountFileSystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Provides a conversion from `MountFileSystemType` to `sys_mount::FilesystemType`
impl From<MountFileSystemType> for sys_mount::FilesystemType<'static> {
    fn from(s: MountFileSystemType) -> Self {
        sys_mount::FilesystemType::Manual(s.name())
    }
}

impl TabFileSystemType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Ext2 => "ext2",
            Self::Ext3 => "ext3",
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
            Self::Btrfs => "btrfs",
            Self::Vfat => "vfat",
            Self::Iso9660 => "iso9660",
            Self::Tmpfs => "tmpfs",
            Self::Overlay => "overlay",
            Self::Swap => "swap",
        }
    }

    pub fn from_fs_type(fs_type: &FsType) -> Self {
        match fs_type {
            FsType::Ext2 => Self::Ext2,
            FsType::Ext3 => Self::Ext3,
            FsType::Ext4 => Self::Ext4,
            FsType::Xfs => Self::Xfs,
            FsType::Btrfs => Self::Btrfs,
            FsType::Vfat => Self::Vfat,
            FsType::DmVerityHash => Self::Auto,
            FsType::Other(_) => Self::Auto,
        }
    }
}
