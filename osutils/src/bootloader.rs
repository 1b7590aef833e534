use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use imgcust_api::model::GrubArg;

use crate::{grub::GrubConfig, uki};

/// Where this system's kernel command line was found. Either a GRUB config
/// with one entry per kernel, or a single Unified Kernel Image whose
/// `.cmdline` section is the whole command line.
#[derive(Debug)]
pub enum BootConfig {
    Grub { kernel_command_lines: Vec<(String, Vec<GrubArg>)> },
    Uki { path: PathBuf, args: Vec<GrubArg> },
}

impl BootConfig {
    /// Flattens to one argument list when the system has exactly one kernel
    /// entry, which is the common case this crate is built around.
    pub fn single_command_line(&self) -> Result<&[GrubArg], Error> {
        match self {
            BootConfig::Grub {
                kernel_command_lines,
            } => match kernel_command_lines.as_slice() {
                [(_, args)] => Ok(args),
                [] => anyhow::bail!("No kernel command lines found"),
                _ => anyhow::bail!("Multiple kernel command lines found, expected one"),
            },
            BootConfig::Uki { args, .. } => Ok(args),
        }
    }
}

/// Locates and parses this system's boot configuration, preferring a GRUB
/// config (`boot/grub2/grub.cfg` or `boot/grub/grub.cfg`) when present, and
/// falling back to a single UKI under `boot/EFI/Linux/*.efi` otherwise.
/// Errors if neither is found, since the engine has no third way to learn
/// the kernel command line.
pub fn discover(boot_mount: &Path) -> Result<BootConfig, Error> {
    if let Some(grub_cfg_path) = find_grub_cfg(boot_mount) {
        let config = GrubConfig::read(&grub_cfg_path)?;
        let lines = config.kernel_command_lines()?;
        return Ok(BootConfig::Grub {
            kernel_command_lines: lines.into_iter().collect(),
        });
    }

    if let Some(uki_path) = find_uki(boot_mount)? {
        let cmdline = uki::read_cmdline(&uki_path)?;
        let args = cmdline
            .split_whitespace()
            .map(|token| match token.split_once('=') {
                Some((key, value)) => GrubArg {
                    key: key.to_string(),
                    value: Some(value.to_string()),
                    raw_token: token.to_string(),
                },
                None => GrubArg {
                    key: token.to_string(),
                    value: None,
                    raw_token: token.to_string(),
                },
            })
            .collect();
        return Ok(BootConfig::Uki {
            path: uki_path,
            args,
        });
    }

    anyhow::bail!(
        "Found neither a GRUB config nor a Unified Kernel Image under '{}'",
        boot_mount.display()
    )
}

fn find_grub_cfg(boot_mount: &Path) -> Option<PathBuf> {
    for candidate in ["grub2/grub.cfg", "grub/grub.cfg"] {
        let path = boot_mount.join(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Returns the single UKI under `EFI/Linux/` matching the `vmlinuz-*.efi`
/// glob, erroring if more than one is present since there would be no way to
/// tell which one is active. Other `.efi` files in the directory (e.g. an
/// unrelated boot stub) are not candidates and are ignored.
fn find_uki(boot_mount: &Path) -> Result<Option<PathBuf>, Error> {
    let dir = boot_mount.join("EFI/Linux");
    if !dir.exists() {
        return Ok(None);
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(&dir).context(format!("Failed to read '{}'", dir.display()))? {
        let entry = entry?;
        if let Some(name) = entry.path().file_name().and_then(|n| n.to_str()) {
            if name.starts_with("vmlinuz-") && name.ends_with(".efi") {
                found.push(entry.path());
            }
        }
    }

    match found.as_slice() {
        [] => Ok(None),
        [single] => Ok(Some(single.clone())),
        _ => anyhow::bail!(
            "Multiple Unified Kernel Images found under '{}', expected one",
            dir.display()
        ),
    }
}
