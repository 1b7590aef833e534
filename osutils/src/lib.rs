pub mod bootloader;
pub mod btrfs;
pub mod chroot;
pub mod e2fsck;
pub mod errors;
pub mod exe;
pub mod fatlabel;
pub mod files;
pub mod filesystems;
pub mod fsck;
pub mod fsops;
pub mod grub;
pub mod hashing_reader;
pub mod image_streamer;
pub mod loopback;
pub mod lsblk;
pub mod lsof;
pub mod mount;
pub mod partition_types;
pub mod partprobe;
pub mod path;
pub mod qemu_img;
pub mod resize2fs;
pub mod sfdisk;
pub mod tabfile;
pub mod tune2fs;
pub mod uki;
pub mod veritysetup;
pub mod xfs;
pub mod zstd_frame;

pub(crate) mod crate_private {
    pub trait Sealed {}
}
