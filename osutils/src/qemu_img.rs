use std::path::Path;
use std::process::Command;

use anyhow::{Context, Error};

use crate::exe::RunAndCheck;

/// Output image formats `qemu-img convert -O <format>` understands that this
/// engine's packaging step ever asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QemuImgFormat {
    Raw,
    Qcow2,
    Vpc,
    VhdxDynamic,
}

impl QemuImgFormat {
    fn as_str(self) -> &'static str {
        match self {
            QemuImgFormat::Raw => "raw",
            QemuImgFormat::Qcow2 => "qcow2",
            // qemu-img's VHD driver is named "vpc" for historical reasons.
            QemuImgFormat::Vpc => "vpc",
            QemuImgFormat::VhdxDynamic => "vhdx",
        }
    }
}

/// Converts `source_path` (always raw on-disk) to `format` at `dest_path`.
/// Fixed-size VHD is requested with `subformat=fixed`; every other format
/// uses `qemu-img`'s own default subformat.
pub fn convert(source_path: &Path, dest_path: &Path, format: QemuImgFormat) -> Result<(), Error> {
    let mut command = Command::new("qemu-img");
    command
        .arg("convert")
        .arg("-O")
        .arg(format.as_str());

    if format == QemuImgFormat::Vpc {
        command.arg("-o").arg("subformat=fixed");
    }

    command
        .arg(source_path)
        .arg(dest_path)
        .run_and_check()
        .context(format!(
            "Failed to convert '{}' to '{}'",
            source_path.display(),
            dest_path.display()
        ))
}


#[cfg(feature = "functional-test")]
#[cfg_attr(not(test), allow(unused_imports, dead_code))]
mod functional_test {
    use super::*;

    #[test]
    fn test_convert_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = convert(
            Path::new("/nonexistent/source.raw"),
            &dir.path().join("out.qcow2"),
            QemuImgFormat::Qcow2,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Failed to convert"));
    }
}
