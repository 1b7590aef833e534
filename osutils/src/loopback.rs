use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Error};
use log::warn;

use crate::exe::RunAndCheck;

/// A scoped loopback device attachment. `new()` attaches `image_path` via
/// `losetup --show -f -P` (partition scanning enabled so kernel device nodes
/// for each partition appear under `/dev/loopNp*`) and records the assigned
/// device path. `clean_close()` detaches it; dropping without a prior
/// `clean_close()` logs a warning and detaches on a best-effort basis.
pub struct Loopback {
    device_path: PathBuf,
    closed: bool,
}

impl Loopback {
    pub fn attach(image_path: &Path) -> Result<Self, Error> {
        let output = Command::new("losetup")
            .arg("--show")
            .arg("-f")
            .arg("-P")
            .arg(image_path)
            .output_and_check()
            .context(format!(
                "Failed to attach loopback device for '{}'",
                image_path.display()
            ))?;

        let device_path = PathBuf::from(output.trim());
        Ok(Self {
            device_path,
            closed: false,
        })
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub fn clean_close(mut self) -> Result<(), Error> {
        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        Command::new("losetup")
            .arg("-d")
            .arg(&self.device_path)
            .run_and_check()
            .context(format!(
                "Failed to detach loopback device '{}'",
                self.device_path.display()
            ))?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(
            "Loopback device '{}' dropped without clean_close(); detaching now",
            self.device_path.display()
        );
        if let Err(e) = self.release() {
            warn!(
                "Failed to detach loopback device '{}' on drop: {e:#}",
                self.device_path.display()
            );
        }
    }
}

/// Waits for the partition device nodes under a just-attached loopback device
/// to reappear in `/dev`, by polling `partx`'s view of the table until it
/// reports the expected partition count or the retry budget is exhausted.
pub fn wait_for_partitions(device_path: &Path, expected_partitions: usize) -> Result<(), Error> {
    const RETRIES: u32 = 20;
    const DELAY: std::time::Duration = std::time::Duration::from_millis(100);

    for attempt in 0..RETRIES {
        let count = (1..=expected_partitions)
            .filter(|n| partition_node(device_path, *n).exists())
            .count();
        if count == expected_partitions {
            return Ok(());
        }
        if attempt + 1 < RETRIES {
            std::thread::sleep(DELAY);
        }
    }

    Err(Error::msg(format!(
        "Timed out waiting for {expected_partitions} partition device nodes under '{}'",
        device_path.display()
    )))
}

/// Computes the kernel device node path for partition `n` of a loop device,
/// e.g. `/dev/loop0` + 1 -> `/dev/loop0p1`.
pub fn partition_node(device_path: &Path, n: usize) -> PathBuf {
    PathBuf::from(format!("{}p{n}", device_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_node() {
        assert_eq!(
            partition_node(Path::new("/dev/loop0"), 1),
            PathBuf::from("/dev/loop0p1")
        );
        assert_eq!(
            partition_node(Path::new("/dev/loop12"), 3),
            PathBuf::from("/dev/loop12p3")
        );
    }
}
