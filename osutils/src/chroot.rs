use std::{
    cell::Cell,
    fs,
    os::{
        fd::{IntoRawFd, RawFd},
        unix,
    },
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::{info, warn};
use sys_mount::{Mount, MountFlags, Unmount, UnmountFlags};

thread_local! {
    /// Chroots cannot be nested: entering one while already inside another
    /// leaves the outer `rootfd` impossible to restore to cleanly.
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// A scoped chroot environment. Entering mounts `/dev`, `/proc`, `/sys` and
/// `/tmp` (when `mount_special_dirs` is set) under the new root, then changes
/// the process root. Dropping without a prior `clean_close()` logs a warning
/// and still attempts to unwind back to the original root on a best-effort
/// basis, matching the scoped-resource release policy used for `Mount` and
/// `Loopback`.
pub struct Chroot {
    rootfd: RawFd,
    root_dir: PathBuf,
    mounts: Vec<Mount>,
    closed: bool,
}

impl Chroot {
    fn enter(path: &Path, mount_special_dirs: bool) -> Result<Self, Error> {
        if ACTIVE.with(|a| a.get()) {
            bail!("Refusing to enter nested chroot at '{}'", path.display());
        }

        let mounts = if mount_special_dirs {
            info!("Mounting special directories for chroot at {}", path.display());
            vec![
                Mount::builder()
                    .fstype("devtmpfs")
                    .flags(MountFlags::RDONLY)
                    .mount("devtmpfs", path.join("dev"))
                    .context("Failed to mount '/dev' for chroot")?,
                Mount::builder()
                    .fstype("proc")
                    .flags(MountFlags::RDONLY)
                    .mount("proc", path.join("proc"))
                    .context("Failed to mount '/proc' for chroot")?,
                Mount::builder()
                    .fstype("sysfs")
                    .flags(MountFlags::RDONLY)
                    .mount("sysfs", path.join("sys"))
                    .context("Failed to mount '/sys' for chroot")?,
                Mount::builder()
                    .fstype("tmpfs")
                    .flags(MountFlags::empty())
                    .mount("tmpfs", path.join("tmp"))
                    .context("Failed to mount '/tmp' for chroot")?,
            ]
        } else {
            Vec::new()
        };

        info!("Entering chroot at {}", path.display());
        let rootfd = fs::File::open("/")
            .context("Failed to open '/'")?
            .into_raw_fd();
        unix::fs::chroot(path).context("Failed to enter chroot")?;
        std::env::set_current_dir("/")
            .context("Failed to set current directory to be inside chroot")?;
        ACTIVE.with(|a| a.set(true));

        Ok(Self {
            rootfd,
            root_dir: path.to_owned(),
            mounts,
            closed: false,
        })
    }

    /// Exits the chroot and unmounts the special directories, consuming
    /// `self` so `Drop` becomes a no-op.
    pub fn clean_close(mut self) -> Result<(), Error> {
        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        nix::unistd::fchdir(self.rootfd).context("Failed to exit chroot")?;
        unix::fs::chroot(".").context("Failed to set current directory out of chroot")?;
        info!("Exited chroot at {}", self.root_dir.display());

        for mount in self.mounts.drain(..) {
            mount
                .unmount(UnmountFlags::empty())
                .context("Failed to unmount chroot special directory")?;
        }
        self.closed = true;
        ACTIVE.with(|a| a.set(false));
        Ok(())
    }
}

impl Drop for Chroot {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(
            "Chroot at '{}' dropped without clean_close(); releasing now",
            self.root_dir.display()
        );
        if let Err(e) = self.release() {
            warn!("Failed to release chroot on drop: {e:#}");
        }
    }
}

pub fn enter_update_chroot(root_mount_path: &Path) -> Result<Chroot, Error> {
    Chroot::enter(root_mount_path, true).context("Failed to enter updated OS chroot")
}

pub fn enter_host_chroot(root_mount_path: &Path) -> Result<Chroot, Error> {
    Chroot::enter(root_mount_path, false).context("Failed to enter host chroot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_chroot_rejected() {
        ACTIVE.with(|a| a.set(true));
        let result = Chroot::enter(Path::new("/tmp"), false);
        ACTIVE.with(|a| a.set(false));
        assert!(result.is_err());
    }
}
